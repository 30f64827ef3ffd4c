//! Integration tests for the complete HDQL pipeline
//!
//! These tests verify end-to-end functionality across crates:
//! - query text → parser → compiler → executor → results
//! - store load → persist → restore → query
//! - concurrent queries during snapshot reloads
//!
//! Run with: cargo test --test integration_tests

use approx::assert_relative_eq;
use hdql_engine::{EngineConfig, QueryEngine, QueryError, QueryOptions, QueryResult};
use hdql_store::vector::{cosine_distance, normalize_in_place};
use hdql_store::{
    EmbeddingStore, Entity, IngestBundle, MetaValue, RelationEmbedding, RelationOperator,
    StoreConfig,
};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::tempdir;

fn unit(raw: &[f32]) -> Vec<f32> {
    let mut v = raw.to_vec();
    assert!(normalize_in_place(&mut v));
    v
}

fn commands() -> Vec<Entity> {
    vec![
        Entity::new("command", "deps", unit(&[1.0, 0.0, 0.0])).with_display_name("Dependencies"),
        Entity::new("command", "build", unit(&[0.95, 0.2, 0.0])),
        Entity::new("command", "bench", unit(&[0.7, 0.7, 0.0])),
        Entity::new("command", "lint", unit(&[0.1, 0.0, 1.0])),
        Entity::new("job", "ship", unit(&[1.0, 0.1, 0.0])),
        Entity::new("job", "tidy", unit(&[0.0, 0.1, 1.0])),
        Entity::new("job", "audit", unit(&[0.0, -1.0, 0.0])),
    ]
}

fn serves() -> RelationEmbedding {
    RelationEmbedding {
        source_type: "command".into(),
        relation: "serves".into(),
        target_type: "job".into(),
        operator: RelationOperator::Offset(vec![0.0, 0.0, 0.0]),
    }
}

fn engine_with(entities: Vec<Entity>, relations: Vec<RelationEmbedding>) -> QueryEngine {
    let store = EmbeddingStore::new(StoreConfig::default());
    store.load(entities, relations).expect("load");
    QueryEngine::new(Arc::new(store), EngineConfig::default())
}

fn ids(result: &QueryResult) -> Vec<String> {
    result
        .as_match()
        .expect("match result")
        .matches
        .iter()
        .map(|m| m.entity.id.clone())
        .collect()
}

// ============================================================================
// Scenarios
// ============================================================================

#[test]
fn test_exact_lookup_scores_one() {
    let engine = engine_with(
        vec![Entity::new("command", "deps", unit(&[1.0, 0.0]))],
        Vec::new(),
    );
    let result = engine
        .execute(r#"command("deps")"#, QueryOptions::default())
        .unwrap();
    let matches = &result.as_match().unwrap().matches;
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].entity.id, "deps");
    assert_relative_eq!(matches[0].score, 1.0, epsilon = 1e-6);
}

#[test]
fn test_similarity_threshold_is_exact() {
    let entities = commands();
    let engine = engine_with(entities.clone(), Vec::new());
    let result = engine
        .execute(
            r#"similar_to(command("deps"), distance=0.2)"#,
            QueryOptions::default(),
        )
        .unwrap();

    let deps = &entities[0].dense;
    let mut expected: Vec<(f32, String)> = entities
        .iter()
        .filter(|e| e.entity_type == "command")
        .filter_map(|e| {
            let d = cosine_distance(deps, &e.dense)?;
            (d <= 0.2).then(|| (d, e.id.clone()))
        })
        .collect();
    expected.sort_by(|a, b| a.0.total_cmp(&b.0));
    let expected: Vec<String> = expected.into_iter().map(|(_, id)| id).collect();

    assert_eq!(ids(&result), expected);
    let scores: Vec<f32> = result
        .as_match()
        .unwrap()
        .matches
        .iter()
        .map(|m| m.score)
        .collect();
    assert!(scores.windows(2).all(|w| w[0] >= w[1]));
}

#[test]
fn test_unknown_type_is_compile_error() {
    let engine = engine_with(commands(), Vec::new());
    let err = engine
        .execute(r#"widget("x")"#, QueryOptions::default())
        .unwrap_err();
    assert!(matches!(err, QueryError::Compile(_)));
    assert!(err.to_string().contains("widget"));
    assert_eq!(err.exit_code(), 2);
}

fn features() -> Vec<Entity> {
    [("a", 4.0, 0.5), ("b", 5.0, 0.6), ("c", 6.0, 0.9)]
        .into_iter()
        .enumerate()
        .map(|(i, (id, effort, coverage))| {
            let mut raw = [0.1f32; 3];
            raw[i] = 1.0;
            Entity::new("feature", id, unit(&raw))
                .with_meta("effort", MetaValue::Number(effort))
                .with_meta("coverage", MetaValue::Number(coverage))
        })
        .collect()
}

#[test]
fn test_budgeted_optimization_finds_the_optimum() {
    let engine = engine_with(features(), Vec::new());

    // 4 + 6 = 10 fits an inclusive budget of 10 and beats 4 + 5.
    let result = engine
        .execute(
            "maximize(coverage) subject_to(effort <= 10)",
            QueryOptions::default(),
        )
        .unwrap();
    let r = result.as_recommendation().unwrap();
    let mut selected = r.selected_ids();
    selected.sort();
    assert_eq!(selected, vec!["a", "c"]);
    assert_relative_eq!(r.objective_value, 1.4, epsilon = 1e-9);
    assert!(r.feasible);

    // A strict budget excludes the pair summing to exactly 10.
    let result = engine
        .execute(
            "maximize(coverage) subject_to(effort < 10)",
            QueryOptions::default(),
        )
        .unwrap();
    let r = result.as_recommendation().unwrap();
    let mut selected = r.selected_ids();
    selected.sort();
    assert_eq!(selected, vec!["a", "b"]);
    assert_relative_eq!(r.objective_value, 1.1, epsilon = 1e-9);
    let used: f64 = r.recommendations.iter().map(|x| x.metrics["effort"]).sum();
    assert_relative_eq!(used, 9.0);
}

#[test]
fn test_infeasible_budget_is_relaxed_with_warning() {
    let engine = engine_with(features(), Vec::new());
    let result = engine
        .execute(
            "maximize(coverage) subject_to(effort <= 1)",
            QueryOptions::default(),
        )
        .unwrap();
    let r = result.as_recommendation().unwrap();
    assert!(!r.feasible);
    assert!(!r.recommendations.is_empty());
    assert!(!r.trace.warnings.is_empty());
}

// ============================================================================
// Query shapes end to end
// ============================================================================

#[test]
fn test_relational_query_uses_relation_embedding() {
    let engine = engine_with(commands(), vec![serves()]);
    let result = engine
        .execute(r#"command("*") -[serves]-> job("ship")"#, QueryOptions::default())
        .unwrap();
    let found = ids(&result);
    assert!(found.contains(&"deps".to_string()));
    assert!(!found.contains(&"lint".to_string()));
}

#[test]
fn test_not_found_is_a_note_not_an_error() {
    let engine = engine_with(commands(), Vec::new());
    let result = engine
        .execute(r#"command("nope")"#, QueryOptions::default())
        .unwrap();
    assert!(ids(&result).is_empty());
    assert!(result
        .trace()
        .notes
        .iter()
        .any(|n| n.contains("not found")));
}

#[test]
fn test_and_with_metadata_filter() {
    let mut entities = commands();
    for e in entities.iter_mut() {
        let uses = if e.id.starts_with('b') { 10.0 } else { 1.0 };
        e.metadata.insert("uses".into(), MetaValue::Number(uses));
    }
    let engine = engine_with(entities, Vec::new());
    let result = engine
        .execute(
            r#"similar_to(command("deps"), distance=0.5) AND uses > 5"#,
            QueryOptions::default(),
        )
        .unwrap();
    let mut found = ids(&result);
    found.sort();
    assert_eq!(found, vec!["bench", "build"]);
}

#[test]
fn test_analysis_reports_unserved_jobs() {
    let engine = engine_with(commands(), vec![serves()]);
    let analysis = engine
        .analyze(r#"command("*") -[serves]-> job("*")"#, QueryOptions::default())
        .unwrap();
    let gap_ids: Vec<&str> = analysis.gaps.iter().map(|g| g.entity.id.as_str()).collect();
    assert!(gap_ids.contains(&"audit"));
    assert!(!gap_ids.contains(&"ship"));
    assert_eq!(analysis.opportunities.len(), analysis.gaps.len());
}

// ============================================================================
// Errors and exit codes
// ============================================================================

#[test]
fn test_exit_codes_by_error_category() {
    let engine = engine_with(commands(), Vec::new());
    let parse = engine
        .execute(r#"command("deps""#, QueryOptions::default())
        .unwrap_err();
    assert_eq!(parse.exit_code(), 1);

    let compile = engine
        .execute(r#"command("deps") -[owns]-> job("*")"#, QueryOptions::default())
        .unwrap_err();
    assert_eq!(compile.exit_code(), 2);

    let timeout = engine
        .execute(
            r#"command("*")"#,
            QueryOptions::default().with_timeout(Duration::ZERO),
        )
        .unwrap_err();
    assert!(matches!(timeout, QueryError::Timeout { .. }));
    assert_eq!(timeout.exit_code(), 3);
    assert!(timeout.partial_trace().is_some());
}

// ============================================================================
// Determinism, persistence and snapshot isolation
// ============================================================================

#[test]
fn test_repeated_execution_is_byte_identical() {
    let engine = engine_with(commands(), vec![serves()]);
    let query = r#"similar_to(command("deps"), distance=1.0) OR command("*") -> job("tidy")"#;
    let first = engine.execute(query, QueryOptions::default()).unwrap();
    let second = engine.execute(query, QueryOptions::default()).unwrap();
    let a = serde_json::to_string(&first.as_match().unwrap().matches).unwrap();
    let b = serde_json::to_string(&second.as_match().unwrap().matches).unwrap();
    assert_eq!(a, b);
}

#[test]
fn test_persist_restore_preserves_results() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("store.hdqs");
    let engine = engine_with(commands(), vec![serves()]);
    engine.store().persist(&path).unwrap();

    let restored = EmbeddingStore::restore(&path, StoreConfig::default()).unwrap();
    let restored = QueryEngine::new(Arc::new(restored), EngineConfig::default());
    let query = r#"similar_to(command("build"), distance=0.5)"#;
    let before = engine.execute(query, QueryOptions::default()).unwrap();
    let after = restored.execute(query, QueryOptions::default()).unwrap();
    assert_eq!(
        before.as_match().unwrap().ranking(),
        after.as_match().unwrap().ranking()
    );
}

#[test]
fn test_ingest_bundle_round_trip() {
    let bundle = IngestBundle::from_json(
        r#"{
            "entities": [
                {"entity_type": "command", "id": "deps", "display_name": "Dependencies",
                 "dense": [1.0, 0.0], "metadata": {"uses": 3}},
                {"entity_type": "command", "id": "docs", "dense": [0.0, 1.0]}
            ]
        }"#,
    )
    .unwrap();
    let engine = engine_with(bundle.entities, bundle.relations);
    let result = engine
        .execute(r#"command("Dependncies"~)"#, QueryOptions::default())
        .unwrap();
    assert_eq!(ids(&result), vec!["deps"]);
}

#[test]
fn test_queries_keep_their_snapshot_during_reloads() {
    let base = commands();
    let store = Arc::new(EmbeddingStore::new(StoreConfig::default()));
    store.load(base.clone(), Vec::new()).unwrap();
    let engine = QueryEngine::new(store.clone(), EngineConfig::default());

    let pinned = store.snapshot();
    let writer = {
        let store = store.clone();
        thread::spawn(move || {
            for i in 0..20 {
                let extra = Entity::new("command", format!("extra{i}"), unit(&[0.0, 1.0, 1.0]));
                store.load(vec![extra], Vec::new()).unwrap();
            }
        })
    };

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let engine = engine.clone();
            let pinned = pinned.clone();
            thread::spawn(move || {
                for _ in 0..20 {
                    let old = engine
                        .execute_on(&pinned, r#"command("*")"#, QueryOptions::default())
                        .unwrap();
                    assert_eq!(old.as_match().unwrap().len(), 4);

                    let snapshot = engine.store().snapshot();
                    let expected = snapshot.type_len("command");
                    let now = engine
                        .execute_on(&snapshot, r#"command("*")"#, QueryOptions::default())
                        .unwrap();
                    assert_eq!(now.as_match().unwrap().len(), expected);
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for r in readers {
        r.join().unwrap();
    }
    assert_eq!(store.snapshot().type_len("command"), 24);
    assert_eq!(pinned.type_len("command"), 4);
}
