use crate::results::ReasoningTrace;
use hdql_dsl::ParseError;
use hdql_store::StoreError;
use thiserror::Error;

/// Semantic errors detected while lowering an AST, before any store access
/// by the executor.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompileError {
    #[error("unknown entity type `{name}` (known types: {})", known.join(", "))]
    UnknownEntityType { name: String, known: Vec<String> },

    #[error("no relation{} between `{source_type}` and `{target_type}`", relation.as_ref().map(|r| format!(" `{r}`")).unwrap_or_default())]
    UnknownRelation {
        source_type: String,
        relation: Option<String>,
        target_type: String,
    },

    #[error("ambiguous relation between `{source_type}` and `{target_type}`: candidates {}", candidates.join(", "))]
    AmbiguousRelation {
        source_type: String,
        target_type: String,
        candidates: Vec<String>,
    },

    #[error("unknown metadata field `{field}`")]
    UnknownField { field: String },

    #[error("cannot infer an analogy target type from {}; name one with `type(?)`", types.join(", "))]
    AmbiguousTargetType { types: Vec<String> },

    #[error("invalid parameter `{name}`: {message}")]
    InvalidParameter { name: String, message: String },
}

/// Fatal failures while interpreting a plan. They abort the current query
/// only; the snapshot is never touched.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExecutionError {
    #[error("numerical error: {0}")]
    Numerical(String),

    #[error("index corruption: {0}")]
    IndexCorruption(String),

    #[error("plan references unbound variable `{0}`")]
    UnboundVariable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for ExecutionError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ZeroNorm | StoreError::QueryDimension { .. } => {
                ExecutionError::Numerical(err.to_string())
            }
            StoreError::IndexCorruption(msg) => ExecutionError::IndexCorruption(msg),
            other => ExecutionError::Internal(other.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("compile error: {0}")]
    Compile(#[from] CompileError),

    #[error("execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("query timed out after {elapsed_ms} ms (budget {budget_ms} ms)")]
    Timeout {
        elapsed_ms: u64,
        budget_ms: u64,
        trace: ReasoningTrace,
    },
}

impl QueryError {
    /// Process exit code for the CLI: 1 parse, 2 compile, 3 execution or
    /// timeout.
    pub fn exit_code(&self) -> i32 {
        match self {
            QueryError::Parse(_) => 1,
            QueryError::Compile(_) => 2,
            QueryError::Execution(_) | QueryError::Timeout { .. } => 3,
        }
    }

    /// The trace built before a timeout fired.
    pub fn partial_trace(&self) -> Option<&ReasoningTrace> {
        match self {
            QueryError::Timeout { trace, .. } => Some(trace),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_by_category() {
        let parse = hdql_dsl::parse_query("command(").unwrap_err();
        assert_eq!(QueryError::from(parse).exit_code(), 1);
        let compile = CompileError::UnknownField {
            field: "nope".into(),
        };
        assert_eq!(QueryError::from(compile).exit_code(), 2);
        let exec = ExecutionError::Numerical("zero norm".into());
        assert_eq!(QueryError::from(exec).exit_code(), 3);
        let timeout = QueryError::Timeout {
            elapsed_ms: 5,
            budget_ms: 1,
            trace: ReasoningTrace::default(),
        };
        assert_eq!(timeout.exit_code(), 3);
        assert!(timeout.partial_trace().is_some());
    }

    #[test]
    fn unknown_type_names_the_type() {
        let err = CompileError::UnknownEntityType {
            name: "widget".into(),
            known: vec!["command".into(), "job".into()],
        };
        assert!(err.to_string().contains("`widget`"));
    }

    #[test]
    fn store_errors_map_to_execution_categories() {
        assert!(matches!(
            ExecutionError::from(StoreError::ZeroNorm),
            ExecutionError::Numerical(_)
        ));
        assert!(matches!(
            ExecutionError::from(StoreError::IndexCorruption("bad id".into())),
            ExecutionError::IndexCorruption(_)
        ));
    }
}
