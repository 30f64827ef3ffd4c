//! Entities, metadata values and relationship embeddings.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// A scalar metadata value.
///
/// Deserialized untagged so ingestion bundles can write plain JSON scalars.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl MetaValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetaValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            MetaValue::Bool(_) => "bool",
            MetaValue::Number(_) => "number",
            MetaValue::Text(_) => "text",
        }
    }

    /// Ordering between values of the same kind; `None` across kinds.
    pub fn partial_cmp_same_kind(&self, other: &MetaValue) -> Option<Ordering> {
        match (self, other) {
            (MetaValue::Bool(a), MetaValue::Bool(b)) => Some(a.cmp(b)),
            (MetaValue::Number(a), MetaValue::Number(b)) => a.partial_cmp(b),
            (MetaValue::Text(a), MetaValue::Text(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl fmt::Display for MetaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetaValue::Bool(b) => write!(f, "{b}"),
            MetaValue::Number(n) => write!(f, "{n}"),
            MetaValue::Text(s) => f.write_str(s),
        }
    }
}

/// A domain object with its embeddings.
///
/// `(entity_type, id)` is unique within a snapshot and `dense` is
/// unit-normalized. `symbolic` may be empty when a store carries no
/// composition relations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub entity_type: String,
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    pub dense: Vec<f32>,
    #[serde(default)]
    pub symbolic: Vec<f32>,
    #[serde(default)]
    pub metadata: BTreeMap<String, MetaValue>,
}

impl Entity {
    pub fn new(entity_type: impl Into<String>, id: impl Into<String>, dense: Vec<f32>) -> Self {
        let id = id.into();
        Self {
            entity_type: entity_type.into(),
            display_name: id.clone(),
            id,
            dense,
            symbolic: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    pub fn with_symbolic(mut self, symbolic: Vec<f32>) -> Self {
        self.symbolic = symbolic;
        self
    }

    pub fn with_meta(mut self, field: impl Into<String>, value: MetaValue) -> Self {
        self.metadata.insert(field.into(), value);
        self
    }

    pub fn key(&self) -> EntityKey {
        EntityKey {
            entity_type: self.entity_type.clone(),
            id: self.id.clone(),
        }
    }

    pub fn number(&self, field: &str) -> Option<f64> {
        self.metadata.get(field).and_then(MetaValue::as_f64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub entity_type: String,
    pub id: String,
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(\"{}\")", self.entity_type, self.id)
    }
}

// ============================================================================
// Relationship embeddings
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelationKey {
    pub source_type: String,
    pub relation: String,
    pub target_type: String,
}

impl fmt::Display for RelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -[{}]-> {}",
            self.source_type, self.relation, self.target_type
        )
    }
}

/// A learned operator that predicts a related entity's vector.
///
/// `Offset` works in the dense space (`dense(source) + offset`);
/// `Composition` binds the source's symbolic vector with a role vector
/// element-wise (`symbolic(source) ⊙ role`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationOperator {
    Offset(Vec<f32>),
    Composition(Vec<f32>),
}

impl RelationOperator {
    pub fn space(&self) -> VectorSpace {
        match self {
            RelationOperator::Offset(_) => VectorSpace::Dense,
            RelationOperator::Composition(_) => VectorSpace::Symbolic,
        }
    }

    pub fn dim(&self) -> usize {
        match self {
            RelationOperator::Offset(v) | RelationOperator::Composition(v) => v.len(),
        }
    }

    /// Predicted vector of the related target for `source`, in the operator's
    /// space.
    pub fn apply(&self, source: &Entity) -> Vec<f32> {
        match self {
            RelationOperator::Offset(offset) => crate::vector::add(&source.dense, offset),
            RelationOperator::Composition(role) => crate::vector::bind(&source.symbolic, role),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VectorSpace {
    Dense,
    Symbolic,
}

impl VectorSpace {
    pub fn of<'a>(&self, entity: &'a Entity) -> &'a [f32] {
        match self {
            VectorSpace::Dense => &entity.dense,
            VectorSpace::Symbolic => &entity.symbolic,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationEmbedding {
    pub source_type: String,
    pub relation: String,
    pub target_type: String,
    pub operator: RelationOperator,
}

impl RelationEmbedding {
    pub fn key(&self) -> RelationKey {
        RelationKey {
            source_type: self.source_type.clone(),
            relation: self.relation.clone(),
            target_type: self.target_type.clone(),
        }
    }
}

/// The ingestion collaborator's hand-off format.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestBundle {
    pub entities: Vec<Entity>,
    #[serde(default)]
    pub relations: Vec<RelationEmbedding>,
}

impl IngestBundle {
    pub fn from_json(text: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_json_path(path: &std::path::Path) -> crate::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundle_accepts_plain_metadata_scalars() {
        let bundle = IngestBundle::from_json(
            r#"{
                "entities": [
                    {"entity_type": "feature", "id": "cache", "dense": [1.0, 0.0],
                     "metadata": {"effort": 4, "label": "fast", "done": false}}
                ],
                "relations": [
                    {"source_type": "command", "relation": "serves", "target_type": "job",
                     "operator": {"offset": [0.1, 0.2]}}
                ]
            }"#,
        )
        .unwrap();
        let e = &bundle.entities[0];
        assert_eq!(e.number("effort"), Some(4.0));
        assert_eq!(e.metadata["label"], MetaValue::Text("fast".into()));
        assert_eq!(e.metadata["done"], MetaValue::Bool(false));
        assert_eq!(bundle.relations[0].operator, RelationOperator::Offset(vec![0.1, 0.2]));
    }

    #[test]
    fn values_of_different_kinds_are_incomparable() {
        let n = MetaValue::Number(1.0);
        assert_eq!(n.partial_cmp_same_kind(&MetaValue::Text("1".into())), None);
        assert_eq!(
            n.partial_cmp_same_kind(&MetaValue::Number(2.0)),
            Some(Ordering::Less)
        );
    }
}
