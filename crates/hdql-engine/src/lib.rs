//! HDQL query engine.
//!
//! Query text flows through four stages:
//!
//! ```text
//! text --parse--> Query --compile--> ExecutionPlan --execute--> QueryResult
//!                             ^                  ^
//!                             +---- Snapshot ----+
//! ```
//!
//! The compiler and executor both take the store snapshot explicitly; a
//! [`QueryEngine`] acquires one per query from its [`EmbeddingStore`] so
//! reloads never disturb queries in flight.
//!
//! Errors are layered: [`ParseError`] and [`CompileError`] surface before any
//! entity is touched, [`ExecutionError`] aborts only the current query, and
//! identifiers that match nothing produce an empty result plus a trace note.
//!
//! [`EmbeddingStore`]: hdql_store::EmbeddingStore
//! [`ParseError`]: hdql_dsl::ParseError

mod analysis;
pub mod compiler;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod matchset;
pub mod optimize;
pub mod plan;
pub mod predicate;
pub mod results;

pub use compiler::compile;
pub use config::{CompilerConfig, ConfigError, EngineConfig, ExecutorConfig};
pub use engine::{QueryEngine, QueryOptions};
pub use error::{CompileError, ExecutionError, QueryError};
pub use executor::{AnalogySolver, Deadline, Execution, Executor, OffsetAnalogy};
pub use matchset::MatchSet;
pub use plan::{ExecutionPlan, IndexHint, OpKind, Operation, ResultShape};
pub use results::{
    AnalysisResult, EntityMatch, EntitySummary, Gap, MatchResult, Opportunity, QueryResult,
    ReasoningTrace, Recommendation, RecommendationResult, Severity, TraceStep, TradeOffAnalysis,
};
