//! Durable snapshot files.
//!
//! Layout:
//!
//! ```text
//! b"HDQS" | u32 LE format version | u64 LE body length | bincode body
//! ```
//!
//! The body carries entities, relationship embeddings, the creation time and a
//! SHA-256 checksum of every entity's vectors. Restoring verifies the
//! checksums and rebuilds all indexes; indexes themselves are never persisted.

use crate::entity::{Entity, MetaValue, RelationEmbedding};
use crate::error::{Result, StoreError};
use crate::snapshot::{Snapshot, StoreConfig};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;

pub const SNAPSHOT_MAGIC: &[u8; 4] = b"HDQS";
pub const SNAPSHOT_VERSION: u32 = 1;

/// SHA-256 over an entity's key and both vectors.
pub fn entity_checksum(entity: &Entity) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(entity.entity_type.as_bytes());
    hasher.update([0u8]);
    hasher.update(entity.id.as_bytes());
    hasher.update([0u8]);
    for x in &entity.dense {
        hasher.update(x.to_le_bytes());
    }
    hasher.update([0u8]);
    for x in &entity.symbolic {
        hasher.update(x.to_le_bytes());
    }
    hasher.finalize().into()
}

// bincode cannot decode untagged enums, so metadata goes through a tagged
// mirror.
#[derive(Serialize, Deserialize)]
enum StoredValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

#[derive(Serialize, Deserialize)]
struct StoredEntity {
    entity_type: String,
    id: String,
    display_name: String,
    dense: Vec<f32>,
    symbolic: Vec<f32>,
    metadata: Vec<(String, StoredValue)>,
}

#[derive(Serialize, Deserialize)]
struct SnapshotBodyV1 {
    generation: u64,
    created_at: DateTime<Utc>,
    entities: Vec<StoredEntity>,
    relations: Vec<RelationEmbedding>,
    checksums: Vec<[u8; 32]>,
}

impl From<&Entity> for StoredEntity {
    fn from(e: &Entity) -> Self {
        Self {
            entity_type: e.entity_type.clone(),
            id: e.id.clone(),
            display_name: e.display_name.clone(),
            dense: e.dense.clone(),
            symbolic: e.symbolic.clone(),
            metadata: e
                .metadata
                .iter()
                .map(|(k, v)| {
                    let stored = match v {
                        MetaValue::Bool(b) => StoredValue::Bool(*b),
                        MetaValue::Number(n) => StoredValue::Number(*n),
                        MetaValue::Text(s) => StoredValue::Text(s.clone()),
                    };
                    (k.clone(), stored)
                })
                .collect(),
        }
    }
}

impl From<StoredEntity> for Entity {
    fn from(e: StoredEntity) -> Self {
        let metadata: BTreeMap<String, MetaValue> = e
            .metadata
            .into_iter()
            .map(|(k, v)| {
                let value = match v {
                    StoredValue::Bool(b) => MetaValue::Bool(b),
                    StoredValue::Number(n) => MetaValue::Number(n),
                    StoredValue::Text(s) => MetaValue::Text(s),
                };
                (k, value)
            })
            .collect();
        Entity {
            entity_type: e.entity_type,
            id: e.id,
            display_name: e.display_name,
            dense: e.dense,
            symbolic: e.symbolic,
            metadata,
        }
    }
}

impl Snapshot {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let body = SnapshotBodyV1 {
            generation: self.generation(),
            created_at: self.created_at(),
            entities: self.entities().iter().map(StoredEntity::from).collect(),
            relations: self.relation_embeddings(),
            checksums: self.checksums().to_vec(),
        };
        let body_bytes = bincode::serialize(&body).map_err(StoreError::Encode)?;

        let mut out = Vec::with_capacity(16 + body_bytes.len());
        out.extend_from_slice(SNAPSHOT_MAGIC);
        out.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
        out.extend_from_slice(&(body_bytes.len() as u64).to_le_bytes());
        out.extend_from_slice(&body_bytes);
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8], config: &StoreConfig) -> Result<Self> {
        if bytes.len() < 8 || &bytes[0..4] != SNAPSHOT_MAGIC {
            return Err(StoreError::BadMagic);
        }
        let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if version != SNAPSHOT_VERSION {
            return Err(StoreError::UnsupportedVersion {
                found: version,
                expected: SNAPSHOT_VERSION,
            });
        }

        let len_bytes: [u8; 8] = bytes
            .get(8..16)
            .and_then(|s| s.try_into().ok())
            .ok_or(StoreError::Truncated("body length"))?;
        let len = usize::try_from(u64::from_le_bytes(len_bytes))
            .map_err(|_| StoreError::Truncated("body length"))?;
        let body_bytes = bytes
            .get(16..16usize.saturating_add(len))
            .ok_or(StoreError::Truncated("body"))?;

        let body: SnapshotBodyV1 = bincode::deserialize(body_bytes).map_err(StoreError::Decode)?;
        let entities: Vec<Entity> = body.entities.into_iter().map(Entity::from).collect();

        let snapshot = Snapshot::build_at(
            entities,
            body.relations,
            config,
            body.generation,
            body.created_at,
        )?
        .with_recorded_checksums(body.checksums)?;
        snapshot.verify_checksums()?;
        Ok(snapshot)
    }

    /// Write the snapshot to `path` atomically (temp file + rename).
    pub fn persist(&self, path: &Path) -> Result<()> {
        let bytes = self.to_bytes()?;
        let tmp = path.with_extension("hdqs.tmp");
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(&tmp, path)?;
        tracing::info!(
            path = %path.display(),
            entities = self.len(),
            bytes = bytes.len(),
            "persisted snapshot"
        );
        Ok(())
    }

    pub fn restore(path: &Path, config: &StoreConfig) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let snapshot = Self::from_bytes(&bytes, config)?;
        tracing::info!(
            path = %path.display(),
            entities = snapshot.len(),
            generation = snapshot.generation(),
            "restored snapshot"
        );
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::RelationOperator;

    fn sample() -> Snapshot {
        let entities = vec![
            Entity::new("feature", "cache", vec![0.6, 0.8])
                .with_symbolic(vec![1.0, -1.0, 1.0])
                .with_meta("effort", MetaValue::Number(4.0))
                .with_meta("label", MetaValue::Text("fast".into())),
            Entity::new("job", "ship", vec![1.0, 0.0]).with_symbolic(vec![1.0, 1.0, -1.0]),
        ];
        let relations = vec![RelationEmbedding {
            source_type: "feature".into(),
            relation: "enables".into(),
            target_type: "job".into(),
            operator: RelationOperator::Composition(vec![1.0, -1.0, -1.0]),
        }];
        Snapshot::build(entities, relations, &StoreConfig::default(), 7).unwrap()
    }

    #[test]
    fn bytes_round_trip() {
        let s = sample();
        let restored = Snapshot::from_bytes(&s.to_bytes().unwrap(), &StoreConfig::default()).unwrap();
        assert_eq!(restored.entities(), s.entities());
        assert_eq!(restored.generation(), 7);
        assert_eq!(restored.created_at(), s.created_at());
        assert_eq!(restored.relations().count(), 1);
        assert_eq!(restored.checksums(), s.checksums());
    }

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.hdqs");
        let s = sample();
        s.persist(&path).unwrap();
        let restored = Snapshot::restore(&path, &StoreConfig::default()).unwrap();
        assert_eq!(restored.get("feature", "cache"), s.get("feature", "cache"));
    }

    #[test]
    fn rejects_bad_headers() {
        let cfg = StoreConfig::default();
        assert!(matches!(
            Snapshot::from_bytes(b"nope", &cfg),
            Err(StoreError::BadMagic)
        ));
        let mut bytes = sample().to_bytes().unwrap();
        bytes[4] = 9;
        assert!(matches!(
            Snapshot::from_bytes(&bytes, &cfg),
            Err(StoreError::UnsupportedVersion { found: 9, .. })
        ));
        let bytes = sample().to_bytes().unwrap();
        assert!(matches!(
            Snapshot::from_bytes(&bytes[..bytes.len() - 3], &cfg),
            Err(StoreError::Truncated(_))
        ));
    }

    #[test]
    fn detects_corrupted_vectors() {
        let s = sample();
        let mut bytes = s.to_bytes().unwrap();
        // Flip the sign bit of a symbolic component: the vector stays valid
        // but no longer matches its checksum.
        let needle: Vec<u8> = (-1.0f32).to_le_bytes().to_vec();
        let at = bytes
            .windows(4)
            .position(|w| w == needle.as_slice())
            .unwrap();
        bytes[at + 3] ^= 0x80;
        assert!(matches!(
            Snapshot::from_bytes(&bytes, &StoreConfig::default()),
            Err(StoreError::ChecksumMismatch { .. })
        ));
    }
}
