//! HDQL embedding store.
//!
//! Holds entities (dense + symbolic vectors, ordered metadata) and learned
//! relationship embeddings as immutable, indexed [`Snapshot`]s behind an
//! [`EmbeddingStore`] handle that swaps snapshots copy-on-write.
//!
//! Design goals:
//! - readers never block on writers beyond an `Arc` clone
//! - deterministic ranking (ties broken by insertion ordinal)
//! - explicit, checksummed persistence; indexes are rebuilt on restore
//!
//! Non-goals: computing embeddings, mutating a snapshot in place, multi-node
//! replication.

pub mod ann;
pub mod entity;
pub mod error;
pub mod fuzzy;
pub mod persist;
pub mod snapshot;
pub mod stats;
pub mod store;
pub mod vector;

pub use entity::{
    Entity, EntityKey, IngestBundle, MetaValue, RelationEmbedding, RelationKey, RelationOperator,
    VectorSpace,
};
pub use error::{Result, StoreError};
pub use fuzzy::{BoundedEditDistance, FuzzyMatcher, Glob};
pub use snapshot::{Neighbor, SearchMode, Snapshot, StoreConfig};
pub use stats::FieldStats;
pub use store::EmbeddingStore;
