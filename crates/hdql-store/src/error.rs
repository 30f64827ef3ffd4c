use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode snapshot: {0}")]
    Encode(#[source] bincode::Error),

    #[error("failed to decode snapshot: {0}")]
    Decode(#[source] bincode::Error),

    #[error("invalid ingestion bundle: {0}")]
    Bundle(#[from] serde_json::Error),

    #[error("not an HDQL snapshot file (bad magic)")]
    BadMagic,

    #[error("unsupported snapshot version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("snapshot file truncated: {0}")]
    Truncated(&'static str),

    #[error("duplicate entity {entity_type}(\"{id}\")")]
    DuplicateEntity { entity_type: String, id: String },

    #[error("{what} dimension mismatch for {key}: expected {expected}, found {found}")]
    DimensionMismatch {
        what: &'static str,
        key: String,
        expected: usize,
        found: usize,
    },

    #[error("dense vector of {key} is not unit-normalized (norm {norm})")]
    NotNormalized { key: String, norm: f32 },

    #[error("vector of {key} contains a non-finite component")]
    NonFinite { key: String },

    #[error("checksum mismatch for {key}")]
    ChecksumMismatch { key: String },

    #[error("invalid relation {key}: {message}")]
    InvalidRelation { key: String, message: String },

    #[error("query vector has zero norm")]
    ZeroNorm,

    #[error("query vector has dimension {found}, store expects {expected}")]
    QueryDimension { expected: usize, found: usize },

    #[error("index corruption: {0}")]
    IndexCorruption(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;
