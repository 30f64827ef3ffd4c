//! Immutable, indexed view of the store.
//!
//! A `Snapshot` is built once from validated entities and relationship
//! embeddings and never mutated afterwards. Queries hold an `Arc<Snapshot>`
//! for their whole lifetime; reloads build a new one.
//!
//! Indexes:
//! - hash index `(type, id) -> ordinal` for exact lookups
//! - type index `type -> RoaringBitmap` of ordinals
//! - optional per-type HNSW over dense vectors (types above `ann_threshold`)
//! - per-field metadata statistics for selectivity estimates

use crate::ann::{AnnIndex, HnswParams};
use crate::entity::{Entity, EntityKey, RelationEmbedding, RelationKey, RelationOperator, VectorSpace};
use crate::error::{Result, StoreError};
use crate::persist::entity_checksum;
use crate::stats::FieldStats;
use crate::vector;
use ahash::AHashMap;
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// Brute-force scans switch to rayon above this many candidates.
const PARALLEL_SCAN_MIN: u64 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Types with more entities than this get an HNSW index.
    pub ann_threshold: usize,
    pub hnsw_max_connections: usize,
    pub hnsw_ef_construction: usize,
    /// Accepted deviation of `‖dense‖` from 1.
    pub norm_tolerance: f32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let hnsw = HnswParams::default();
        Self {
            ann_threshold: 1000,
            hnsw_max_connections: hnsw.max_connections,
            hnsw_ef_construction: hnsw.ef_construction,
            norm_tolerance: 1e-3,
        }
    }
}

#[derive(Debug, Default)]
pub struct TypeIndex {
    pub members: RoaringBitmap,
    by_id: AHashMap<String, u32>,
}

/// A scored nearest-neighbor hit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub ordinal: u32,
    pub similarity: f32,
}

/// How `nearest` should search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Exact,
    /// Use the type's HNSW index if one exists (exact otherwise). `oversample`
    /// multiplies the requested `k` before exact re-scoring.
    Indexed { ef_search: usize, oversample: usize },
}

#[derive(Debug)]
pub struct Snapshot {
    generation: u64,
    created_at: DateTime<Utc>,
    dense_dim: usize,
    symbolic_dim: usize,
    entities: Vec<Entity>,
    checksums: Vec<[u8; 32]>,
    types: BTreeMap<String, TypeIndex>,
    relations: BTreeMap<RelationKey, RelationOperator>,
    field_stats: BTreeMap<String, FieldStats>,
    ann: BTreeMap<String, AnnIndex>,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self {
            generation: 0,
            created_at: Utc::now(),
            dense_dim: 0,
            symbolic_dim: 0,
            entities: Vec::new(),
            checksums: Vec::new(),
            types: BTreeMap::new(),
            relations: BTreeMap::new(),
            field_stats: BTreeMap::new(),
            ann: BTreeMap::new(),
        }
    }

    /// Validate and index. Later entities with an already-seen key are
    /// rejected; use [`crate::EmbeddingStore::load`] for upserts.
    pub fn build(
        entities: Vec<Entity>,
        relations: Vec<RelationEmbedding>,
        config: &StoreConfig,
        generation: u64,
    ) -> Result<Self> {
        Self::build_at(entities, relations, config, generation, Utc::now())
    }

    pub(crate) fn build_at(
        mut entities: Vec<Entity>,
        relations: Vec<RelationEmbedding>,
        config: &StoreConfig,
        generation: u64,
        created_at: DateTime<Utc>,
    ) -> Result<Self> {
        let dense_dim = entities.first().map_or(0, |e| e.dense.len());
        let symbolic_dim = entities
            .iter()
            .map(|e| e.symbolic.len())
            .find(|len| *len > 0)
            .unwrap_or(0);

        let mut types: BTreeMap<String, TypeIndex> = BTreeMap::new();
        let mut field_stats: BTreeMap<String, FieldStats> = BTreeMap::new();

        for (ordinal, entity) in entities.iter_mut().enumerate() {
            validate_entity(entity, dense_dim, symbolic_dim, config.norm_tolerance)
                .map_err(|e| e.with_key(entity_label(&entity.entity_type, &entity.id)))?;
            if entity.display_name.is_empty() {
                entity.display_name = entity.id.clone();
            }

            let ordinal = u32::try_from(ordinal)
                .map_err(|_| StoreError::IndexCorruption("more than u32::MAX entities".into()))?;
            let index = types.entry(entity.entity_type.clone()).or_default();
            if index.by_id.insert(entity.id.clone(), ordinal).is_some() {
                return Err(StoreError::DuplicateEntity {
                    entity_type: entity.entity_type.clone(),
                    id: entity.id.clone(),
                });
            }
            index.members.insert(ordinal);

            for (field, value) in &entity.metadata {
                field_stats.entry(field.clone()).or_default().observe(value);
            }
        }

        let mut relation_map = BTreeMap::new();
        for rel in relations {
            let key = rel.key();
            let expected = match rel.operator.space() {
                VectorSpace::Dense => dense_dim,
                VectorSpace::Symbolic => symbolic_dim,
            };
            if expected == 0 || rel.operator.dim() != expected {
                return Err(StoreError::InvalidRelation {
                    key: key.to_string(),
                    message: format!(
                        "operator has dimension {}, {:?} space has {expected}",
                        rel.operator.dim(),
                        rel.operator.space()
                    ),
                });
            }
            let v = match &rel.operator {
                RelationOperator::Offset(v) | RelationOperator::Composition(v) => v,
            };
            if !vector::is_finite(v) {
                return Err(StoreError::InvalidRelation {
                    key: key.to_string(),
                    message: "operator has a non-finite component".into(),
                });
            }
            relation_map.insert(key, rel.operator);
        }

        let checksums = entities.iter().map(entity_checksum).collect();

        let params = HnswParams {
            max_connections: config.hnsw_max_connections,
            ef_construction: config.hnsw_ef_construction,
        };
        let mut ann = BTreeMap::new();
        for (name, index) in &types {
            if (index.members.len() as usize) <= config.ann_threshold {
                continue;
            }
            let points = index
                .members
                .iter()
                .map(|o| (o, entities[o as usize].dense.as_slice()));
            if let Some(built) = AnnIndex::build(points, params) {
                tracing::debug!(entity_type = %name, points = built.len(), "built HNSW index");
                ann.insert(name.clone(), built);
            }
        }

        Ok(Self {
            generation,
            created_at,
            dense_dim,
            symbolic_dim,
            entities,
            checksums,
            types,
            relations: relation_map,
            field_stats,
            ann,
        })
    }

    // ------------------------------------------------------------------------
    // Catalogue
    // ------------------------------------------------------------------------

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn dense_dim(&self) -> usize {
        self.dense_dim
    }

    pub fn symbolic_dim(&self) -> usize {
        self.symbolic_dim
    }

    pub fn entity_types(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }

    pub fn has_type(&self, entity_type: &str) -> bool {
        self.types.contains_key(entity_type)
    }

    pub fn type_len(&self, entity_type: &str) -> usize {
        self.types
            .get(entity_type)
            .map_or(0, |t| t.members.len() as usize)
    }

    pub fn has_ann(&self, entity_type: &str) -> bool {
        self.ann.contains_key(entity_type)
    }

    pub fn relations(&self) -> impl Iterator<Item = (&RelationKey, &RelationOperator)> {
        self.relations.iter()
    }

    pub fn relation(&self, key: &RelationKey) -> Option<&RelationOperator> {
        self.relations.get(key)
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.field_stats.keys().map(String::as_str)
    }

    pub fn field_stats(&self, field: &str) -> Option<&FieldStats> {
        self.field_stats.get(field)
    }

    // ------------------------------------------------------------------------
    // Entity access
    // ------------------------------------------------------------------------

    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    pub fn entity(&self, ordinal: u32) -> Option<&Entity> {
        self.entities.get(ordinal as usize)
    }

    pub fn ordinal(&self, entity_type: &str, id: &str) -> Option<u32> {
        self.types.get(entity_type)?.by_id.get(id).copied()
    }

    pub fn get(&self, entity_type: &str, id: &str) -> Option<&Entity> {
        self.ordinal(entity_type, id).and_then(|o| self.entity(o))
    }

    pub fn get_key(&self, key: &EntityKey) -> Option<&Entity> {
        self.get(&key.entity_type, &key.id)
    }

    pub fn members(&self, entity_type: &str) -> Option<&RoaringBitmap> {
        self.types.get(entity_type).map(|t| &t.members)
    }

    /// Entities of `entity_type` in ordinal order.
    pub fn list(&self, entity_type: &str) -> Vec<(u32, &Entity)> {
        let Some(members) = self.members(entity_type) else {
            return Vec::new();
        };
        members
            .iter()
            .filter_map(|o| self.entity(o).map(|e| (o, e)))
            .collect()
    }

    /// Union of the given types' members; every entity when `types` is empty.
    pub fn universe<'a>(&self, types: impl IntoIterator<Item = &'a str>) -> RoaringBitmap {
        let mut out = RoaringBitmap::new();
        let mut any = false;
        for t in types {
            any = true;
            if let Some(m) = self.members(t) {
                out |= m;
            }
        }
        if !any {
            out.insert_range(0..self.entities.len() as u32);
        }
        out
    }

    // ------------------------------------------------------------------------
    // Nearest neighbors
    // ------------------------------------------------------------------------

    /// Nearest entities of `entity_type` to `query` by cosine similarity,
    /// sorted descending (ties by ordinal). `threshold` is a maximum cosine
    /// distance.
    pub fn nearest(
        &self,
        query: &[f32],
        entity_type: &str,
        k: Option<usize>,
        threshold: Option<f32>,
    ) -> Result<Vec<Neighbor>> {
        let mode = if self.has_ann(entity_type) {
            SearchMode::Indexed {
                ef_search: 64,
                oversample: 4,
            }
        } else {
            SearchMode::Exact
        };
        self.nearest_with(query, entity_type, k, threshold, mode)
    }

    pub fn nearest_with(
        &self,
        query: &[f32],
        entity_type: &str,
        k: Option<usize>,
        threshold: Option<f32>,
        mode: SearchMode,
    ) -> Result<Vec<Neighbor>> {
        let Some(members) = self.members(entity_type) else {
            return Ok(Vec::new());
        };
        match (mode, self.ann.get(entity_type)) {
            (
                SearchMode::Indexed {
                    ef_search,
                    oversample,
                },
                Some(index),
            ) => {
                self.check_query(query)?;
                let want = k.unwrap_or(index.len()).saturating_mul(oversample.max(1));
                let pool = index.search(query, want, ef_search).map_err(|id| {
                    StoreError::IndexCorruption(format!(
                        "HNSW returned unknown data id {id} for type `{entity_type}`"
                    ))
                })?;
                let pool: RoaringBitmap = pool.into_iter().collect();
                self.nearest_among(query, &pool, k, threshold)
            }
            _ => self.nearest_among(query, members, k, threshold),
        }
    }

    /// Exact cosine scan over `candidates`.
    pub fn nearest_among(
        &self,
        query: &[f32],
        candidates: &RoaringBitmap,
        k: Option<usize>,
        threshold: Option<f32>,
    ) -> Result<Vec<Neighbor>> {
        self.check_query(query)?;
        let query_norm = vector::norm(query);
        let score = |ordinal: u32| -> Option<Neighbor> {
            let entity = self.entity(ordinal)?;
            let entity_norm = vector::norm(&entity.dense);
            if !(entity_norm > 0.0) {
                return None;
            }
            let similarity =
                (vector::dot(query, &entity.dense) / (query_norm * entity_norm)).clamp(-1.0, 1.0);
            if let Some(max_distance) = threshold {
                if 1.0 - similarity > max_distance + f32::EPSILON {
                    return None;
                }
            }
            Some(Neighbor {
                ordinal,
                similarity,
            })
        };

        let mut hits: Vec<Neighbor> = if candidates.len() >= PARALLEL_SCAN_MIN {
            let ordinals: Vec<u32> = candidates.iter().collect();
            ordinals.par_iter().filter_map(|o| score(*o)).collect()
        } else {
            candidates.iter().filter_map(score).collect()
        };

        sort_neighbors(&mut hits);
        if let Some(k) = k {
            hits.truncate(k);
        }
        Ok(hits)
    }

    fn check_query(&self, query: &[f32]) -> Result<()> {
        if query.len() != self.dense_dim {
            return Err(StoreError::QueryDimension {
                expected: self.dense_dim,
                found: query.len(),
            });
        }
        if !(vector::norm(query) > 0.0) {
            return Err(StoreError::ZeroNorm);
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Integrity
    // ------------------------------------------------------------------------

    pub fn checksums(&self) -> &[[u8; 32]] {
        &self.checksums
    }

    /// Recompute every entity's vector checksum and compare with the recorded
    /// one.
    pub fn verify_checksums(&self) -> Result<()> {
        for (entity, recorded) in self.entities.iter().zip(&self.checksums) {
            if entity_checksum(entity) != *recorded {
                return Err(StoreError::ChecksumMismatch {
                    key: entity.key().to_string(),
                });
            }
        }
        Ok(())
    }

    pub(crate) fn with_recorded_checksums(mut self, recorded: Vec<[u8; 32]>) -> Result<Self> {
        if recorded.len() != self.entities.len() {
            return Err(StoreError::Truncated("checksum table"));
        }
        self.checksums = recorded;
        Ok(self)
    }

    pub(crate) fn relation_embeddings(&self) -> Vec<RelationEmbedding> {
        self.relations
            .iter()
            .map(|(k, op)| RelationEmbedding {
                source_type: k.source_type.clone(),
                relation: k.relation.clone(),
                target_type: k.target_type.clone(),
                operator: op.clone(),
            })
            .collect()
    }
}

/// Descending similarity, ties broken by ordinal so results are stable.
pub fn sort_neighbors(hits: &mut [Neighbor]) {
    hits.sort_by(|a, b| {
        b.similarity
            .total_cmp(&a.similarity)
            .then_with(|| a.ordinal.cmp(&b.ordinal))
    });
}

fn entity_label(entity_type: &str, id: &str) -> String {
    format!("{entity_type}(\"{id}\")")
}

fn validate_entity(
    entity: &Entity,
    dense_dim: usize,
    symbolic_dim: usize,
    tolerance: f32,
) -> Result<()> {
    if entity.dense.len() != dense_dim {
        return Err(StoreError::DimensionMismatch {
            what: "dense",
            key: String::new(),
            expected: dense_dim,
            found: entity.dense.len(),
        });
    }
    if !entity.symbolic.is_empty() && entity.symbolic.len() != symbolic_dim {
        return Err(StoreError::DimensionMismatch {
            what: "symbolic",
            key: String::new(),
            expected: symbolic_dim,
            found: entity.symbolic.len(),
        });
    }
    if !vector::is_finite(&entity.dense) || !vector::is_finite(&entity.symbolic) {
        return Err(StoreError::NonFinite { key: String::new() });
    }
    let norm = vector::norm(&entity.dense);
    if (norm - 1.0).abs() > tolerance {
        return Err(StoreError::NotNormalized {
            key: String::new(),
            norm,
        });
    }
    Ok(())
}

impl StoreError {
    fn with_key(self, label: String) -> Self {
        match self {
            StoreError::DimensionMismatch {
                what,
                expected,
                found,
                ..
            } => StoreError::DimensionMismatch {
                what,
                key: label,
                expected,
                found,
            },
            StoreError::NonFinite { .. } => StoreError::NonFinite { key: label },
            StoreError::NotNormalized { norm, .. } => StoreError::NotNormalized { key: label, norm },
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::MetaValue;
    use approx::assert_relative_eq;

    fn unit(x: f32, y: f32) -> Vec<f32> {
        let mut v = vec![x, y];
        vector::normalize_in_place(&mut v);
        v
    }

    fn sample() -> Snapshot {
        let entities = vec![
            Entity::new("command", "deps", unit(1.0, 0.0))
                .with_meta("uses", MetaValue::Number(10.0)),
            Entity::new("command", "build", unit(0.9, 0.1)),
            Entity::new("command", "lint", unit(0.0, 1.0)),
            Entity::new("job", "ship", unit(1.0, 1.0)).with_meta("uses", MetaValue::Number(2.0)),
        ];
        Snapshot::build(entities, Vec::new(), &StoreConfig::default(), 1).unwrap()
    }

    #[test]
    fn hash_and_type_indexes() {
        let s = sample();
        assert_eq!(s.len(), 4);
        assert_eq!(s.get("command", "lint").unwrap().id, "lint");
        assert!(s.get("command", "ship").is_none());
        assert_eq!(s.type_len("command"), 3);
        let ids: Vec<&str> = s.list("command").iter().map(|(_, e)| e.id.as_str()).collect();
        assert_eq!(ids, vec!["deps", "build", "lint"]);
        assert_eq!(s.entity_types().collect::<Vec<_>>(), vec!["command", "job"]);
        assert_eq!(s.field_stats("uses").unwrap().count, 2);
        assert_eq!(s.universe(["job"]).len(), 1);
        assert_eq!(s.universe(std::iter::empty()).len(), 4);
    }

    #[test]
    fn display_name_defaults_to_id() {
        let mut e = Entity::new("command", "deps", unit(1.0, 0.0));
        e.display_name.clear();
        let s = Snapshot::build(vec![e], Vec::new(), &StoreConfig::default(), 1).unwrap();
        assert_eq!(s.get("command", "deps").unwrap().display_name, "deps");
    }

    #[test]
    fn nearest_is_sorted_and_thresholded() {
        let s = sample();
        let q = s.get("command", "deps").unwrap().dense.clone();
        let hits = s.nearest(&q, "command", None, Some(0.2)).unwrap();
        let ids: Vec<&str> = hits
            .iter()
            .map(|h| s.entity(h.ordinal).unwrap().id.as_str())
            .collect();
        assert_eq!(ids, vec!["deps", "build"]);
        assert_relative_eq!(hits[0].similarity, 1.0, epsilon = 1e-6);
        assert_eq!(s.nearest(&q, "command", Some(1), None).unwrap().len(), 1);
    }

    #[test]
    fn zero_norm_query_is_an_error() {
        let s = sample();
        assert!(matches!(
            s.nearest(&[0.0, 0.0], "command", None, None),
            Err(StoreError::ZeroNorm)
        ));
        assert!(matches!(
            s.nearest(&[1.0], "command", None, None),
            Err(StoreError::QueryDimension { .. })
        ));
    }

    #[test]
    fn rejects_invalid_entities() {
        let cfg = StoreConfig::default();
        let dup = vec![
            Entity::new("command", "deps", unit(1.0, 0.0)),
            Entity::new("command", "deps", unit(0.0, 1.0)),
        ];
        assert!(matches!(
            Snapshot::build(dup, Vec::new(), &cfg, 1),
            Err(StoreError::DuplicateEntity { .. })
        ));

        let unnormalized = vec![Entity::new("command", "deps", vec![3.0, 4.0])];
        let err = Snapshot::build(unnormalized, Vec::new(), &cfg, 1).unwrap_err();
        assert!(matches!(err, StoreError::NotNormalized { ref key, .. } if key == "command(\"deps\")"));

        let ragged = vec![
            Entity::new("command", "a", unit(1.0, 0.0)),
            Entity::new("command", "b", vec![1.0, 0.0, 0.0]),
        ];
        assert!(matches!(
            Snapshot::build(ragged, Vec::new(), &cfg, 1),
            Err(StoreError::DimensionMismatch { what: "dense", .. })
        ));
    }

    #[test]
    fn rejects_relation_of_wrong_dimension() {
        let rel = RelationEmbedding {
            source_type: "command".into(),
            relation: "serves".into(),
            target_type: "job".into(),
            operator: RelationOperator::Offset(vec![0.0; 3]),
        };
        let entities = vec![Entity::new("command", "deps", unit(1.0, 0.0))];
        assert!(matches!(
            Snapshot::build(entities, vec![rel], &StoreConfig::default(), 1),
            Err(StoreError::InvalidRelation { .. })
        ));
    }

    #[test]
    fn indexed_search_agrees_with_exact_on_large_types() {
        let config = StoreConfig {
            ann_threshold: 50,
            ..StoreConfig::default()
        };
        let entities: Vec<Entity> = (0..300)
            .map(|i| {
                let angle = i as f32 * 0.02;
                Entity::new("feature", format!("f{i}"), unit(angle.cos(), angle.sin()))
            })
            .collect();
        let s = Snapshot::build(entities, Vec::new(), &config, 1).unwrap();
        assert!(s.has_ann("feature"));
        let q = s.get("feature", "f100").unwrap().dense.clone();
        let exact = s
            .nearest_with(&q, "feature", Some(3), None, SearchMode::Exact)
            .unwrap();
        let indexed = s.nearest(&q, "feature", Some(3), None).unwrap();
        assert_eq!(exact[0].ordinal, indexed[0].ordinal);
        assert_eq!(indexed.len(), 3);
    }

    #[test]
    fn checksums_detect_tampering() {
        let s = sample();
        s.verify_checksums().unwrap();
        let mut tampered = s.checksums().to_vec();
        tampered[0][0] ^= 0xff;
        let s = s.with_recorded_checksums(tampered).unwrap();
        assert!(matches!(
            s.verify_checksums(),
            Err(StoreError::ChecksumMismatch { .. })
        ));
    }
}
