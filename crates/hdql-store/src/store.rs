//! Shared store handle with copy-on-write snapshot swaps.
//!
//! Readers call [`EmbeddingStore::snapshot`] and keep the returned `Arc` for
//! the lifetime of a query; the read lock is held only long enough to clone
//! the pointer. Writers serialize on a dedicated mutex, build the next
//! snapshot without blocking readers, then swap it in.

use crate::entity::{Entity, EntityKey, RelationEmbedding};
use crate::error::Result;
use crate::snapshot::{Snapshot, StoreConfig};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

pub struct EmbeddingStore {
    config: StoreConfig,
    current: RwLock<Arc<Snapshot>>,
    writer: Mutex<()>,
}

impl std::fmt::Debug for EmbeddingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("EmbeddingStore")
            .field("generation", &snapshot.generation())
            .field("entities", &snapshot.len())
            .finish()
    }
}

impl Default for EmbeddingStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

impl EmbeddingStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            current: RwLock::new(Arc::new(Snapshot::empty())),
            writer: Mutex::new(()),
        }
    }

    pub fn from_snapshot(snapshot: Snapshot, config: StoreConfig) -> Self {
        Self {
            config,
            current: RwLock::new(Arc::new(snapshot)),
            writer: Mutex::new(()),
        }
    }

    pub fn restore(path: &Path, config: StoreConfig) -> Result<Self> {
        let snapshot = Snapshot::restore(path, &config)?;
        Ok(Self::from_snapshot(snapshot, config))
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// The current snapshot. Later reloads never affect the returned value.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.current.read().clone()
    }

    /// Upsert entities and relationship embeddings into a new snapshot and
    /// swap it in. Entities are keyed by `(type, id)`; relations by
    /// `(source_type, relation, target_type)`. On error the current snapshot
    /// is left untouched.
    pub fn load(
        &self,
        entities: Vec<Entity>,
        relations: Vec<RelationEmbedding>,
    ) -> Result<Arc<Snapshot>> {
        let _guard = self.writer.lock();
        let base = self.snapshot();

        let mut merged: BTreeMap<EntityKey, Entity> = base
            .entities()
            .iter()
            .map(|e| (e.key(), e.clone()))
            .collect();
        let mut order: Vec<EntityKey> = base.entities().iter().map(Entity::key).collect();
        let incoming = entities.len();
        for entity in entities {
            let key = entity.key();
            if merged.insert(key.clone(), entity).is_none() {
                order.push(key);
            }
        }
        let entities: Vec<Entity> = order
            .into_iter()
            .filter_map(|key| merged.remove(&key))
            .collect();

        let mut rel_map: BTreeMap<_, RelationEmbedding> = base
            .relation_embeddings()
            .into_iter()
            .map(|r| (r.key(), r))
            .collect();
        for rel in relations {
            rel_map.insert(rel.key(), rel);
        }

        let generation = base.generation() + 1;
        let next = Arc::new(Snapshot::build(
            entities,
            rel_map.into_values().collect(),
            &self.config,
            generation,
        )?);
        *self.current.write() = next.clone();

        tracing::info!(
            generation,
            incoming,
            entities = next.len(),
            relations = next.relations().count(),
            "swapped in new snapshot"
        );
        Ok(next)
    }

    /// Replace the current snapshot wholesale (e.g. after restoring a file).
    pub fn replace(&self, snapshot: Snapshot) -> Arc<Snapshot> {
        let _guard = self.writer.lock();
        let next = Arc::new(snapshot);
        *self.current.write() = next.clone();
        tracing::info!(
            generation = next.generation(),
            entities = next.len(),
            "replaced snapshot"
        );
        next
    }

    pub fn persist(&self, path: &Path) -> Result<()> {
        self.snapshot().persist(path)
    }
}
