//! Engine configuration.
//!
//! Every field has a default, so a config file only needs the keys it
//! changes:
//!
//! ```toml
//! [compiler]
//! pushdown_selectivity = 0.3
//!
//! [executor]
//! optimize_exact_threshold = 24
//!
//! [store]
//! ann_threshold = 5000
//! ```

use hdql_store::StoreConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub compiler: CompilerConfig,
    pub executor: ExecutorConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    /// Similarity and analogy use an HNSW index once the candidate set is
    /// larger than this (and the store built one).
    pub ann_threshold: usize,
    /// A comparison is pushed below a similarity or relational step when its
    /// estimated selectivity is below this fraction.
    pub pushdown_selectivity: f64,
    /// Cosine distance used when `similar_to` has no `distance=`.
    pub default_distance: f64,
    /// Neighbors returned by an analogy.
    pub analogy_top_k: usize,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            ann_threshold: 1000,
            pushdown_selectivity: 0.5,
            default_distance: 0.3,
            analogy_top_k: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub fuzzy_max_distance: usize,
    /// Minimum predicted-vector similarity for a relational match.
    pub relation_min_score: f32,
    /// Budgeted optimization is solved exactly up to this many candidates and
    /// greedily above it.
    pub optimize_exact_threshold: usize,
    pub max_alternatives: usize,
    /// Run parallel-eligible plan branches on the rayon pool.
    pub parallel: bool,
    pub ann_oversample: usize,
    pub ann_ef_search: usize,
    /// Metadata field used as the value of an improvement opportunity.
    pub value_field: String,
    /// Metadata field used as the effort of an improvement opportunity.
    pub effort_field: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            fuzzy_max_distance: 2,
            relation_min_score: 0.5,
            optimize_exact_threshold: 20,
            max_alternatives: 3,
            parallel: true,
            ann_oversample: 4,
            ann_ef_search: 64,
            value_field: "importance".to_string(),
            effort_field: "effort".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Like [`EngineConfig::load`], but a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "config file not found; using defaults");
            return Ok(Self::default());
        }
        Self::load(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg = EngineConfig::from_toml(
            r#"
            [compiler]
            pushdown_selectivity = 0.25

            [executor]
            parallel = false

            [store]
            ann_threshold = 10
            "#,
        )
        .unwrap();
        assert_eq!(cfg.compiler.pushdown_selectivity, 0.25);
        assert_eq!(cfg.compiler.default_distance, 0.3);
        assert!(!cfg.executor.parallel);
        assert_eq!(cfg.executor.optimize_exact_threshold, 20);
        assert_eq!(cfg.store.ann_threshold, 10);
    }

    #[test]
    fn missing_file_means_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = EngineConfig::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(cfg, EngineConfig::default());
    }

    #[test]
    fn malformed_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[compiler\n").unwrap();
        assert!(matches!(
            EngineConfig::load(&path),
            Err(ConfigError::Parse { .. })
        ));
    }
}
