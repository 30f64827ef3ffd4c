//! Opening a store from the command line: ingestion bundles or snapshot files.

use anyhow::{Context, Result};
use hdql_engine::EngineConfig;
use hdql_store::{EmbeddingStore, IngestBundle};
use std::path::Path;
use std::sync::Arc;

/// `.json` paths are ingestion bundles; anything else is a snapshot file.
/// No path gives an empty store.
pub fn open_store(path: Option<&Path>, config: &EngineConfig) -> Result<Arc<EmbeddingStore>> {
    let Some(path) = path else {
        tracing::warn!("no --store given; starting with an empty store");
        return Ok(Arc::new(EmbeddingStore::new(config.store)));
    };

    let is_bundle = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let store = if is_bundle {
        let bundle = IngestBundle::from_json_path(path)
            .with_context(|| format!("failed to read ingestion bundle {}", path.display()))?;
        let store = EmbeddingStore::new(config.store);
        store
            .load(bundle.entities, bundle.relations)
            .with_context(|| format!("failed to load {}", path.display()))?;
        store
    } else {
        EmbeddingStore::restore(path, config.store)
            .with_context(|| format!("failed to restore snapshot {}", path.display()))?
    };
    Ok(Arc::new(store))
}

#[cfg(test)]
mod tests {
    use super::*;

    const BUNDLE: &str = r#"{
        "entities": [
            {"entity_type": "command", "id": "deps", "dense": [1.0, 0.0]},
            {"entity_type": "job", "id": "ship", "dense": [0.0, 1.0]}
        ]
    }"#;

    #[test]
    fn opens_bundles_and_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = dir.path().join("bundle.json");
        std::fs::write(&bundle, BUNDLE).unwrap();

        let config = EngineConfig::default();
        let store = open_store(Some(&bundle), &config).unwrap();
        assert_eq!(store.snapshot().len(), 2);

        let snapshot = dir.path().join("store.hdqs");
        store.persist(&snapshot).unwrap();
        let restored = open_store(Some(&snapshot), &config).unwrap();
        assert_eq!(restored.snapshot().len(), 2);
        assert!(restored.snapshot().get("job", "ship").is_some());
    }

    #[test]
    fn rejects_garbage_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.hdqs");
        std::fs::write(&path, b"nope").unwrap();
        let err = open_store(Some(&path), &EngineConfig::default()).unwrap_err();
        assert!(err.to_string().contains("failed to restore snapshot"));
    }
}
