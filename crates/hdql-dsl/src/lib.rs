//! HDQL: the hyperdimensional query language.
//!
//! This crate owns the surface syntax only: a hand-written lexer, a
//! recursive-descent parser and the typed AST it produces. It knows nothing
//! about stores or embeddings; resolving entity types, relations and fields is
//! the compiler's job (`hdql-engine`).
//!
//! The seven AST node kinds cover the six query shapes (lookup, relational,
//! logical, similarity, analogy, optimization) plus metadata comparisons.
//! `Display` on [`Query`] yields a canonical form that re-parses to an equal
//! AST.

pub mod ast;
pub mod error;
pub mod lexer;
pub mod parser;

pub use ast::{
    Analogy, Atomic, CmpOp, Comparison, Direction, Literal, Logical, LogicalOp, Objective,
    ObjectiveTerm, Optimization, Query, Relational, Similarity,
};
pub use error::{ParseError, Position};
pub use parser::parse_query;
