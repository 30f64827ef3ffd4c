//! The query API: parse, compile and execute against the store's current
//! snapshot.

use crate::analysis;
use crate::compiler::compile;
use crate::config::EngineConfig;
use crate::error::QueryError;
use crate::executor::{AnalogySolver, Deadline, Execution, Executor, OffsetAnalogy};
use crate::optimize::OptimizeOutcome;
use crate::plan::{ExecutionPlan, LookupMode, OpKind, ResultShape};
use crate::results::{
    Alternative, AnalysisResult, EntityMatch, EntitySummary, MatchResult, QueryResult,
    Recommendation, RecommendationResult, TradeOffAnalysis,
};
use hdql_dsl::{parse_query, Query};
use hdql_store::{BoundedEditDistance, EmbeddingStore, FuzzyMatcher, Snapshot};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Per-call knobs.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryOptions {
    /// Truncate the final result to this many entries.
    pub limit: Option<usize>,
    /// Abort with [`QueryError::Timeout`] once exceeded.
    pub timeout: Option<Duration>,
}

impl QueryOptions {
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Entry point for callers. Cheap to clone; every query acquires the store's
/// current snapshot once and runs against it to completion, so a concurrent
/// reload never changes a query's view.
#[derive(Clone)]
pub struct QueryEngine {
    store: Arc<EmbeddingStore>,
    config: EngineConfig,
    fuzzy: Arc<dyn FuzzyMatcher>,
    analogy: Arc<dyn AnalogySolver>,
}

impl std::fmt::Debug for QueryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryEngine")
            .field("generation", &self.store.snapshot().generation())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl QueryEngine {
    pub fn new(store: Arc<EmbeddingStore>, config: EngineConfig) -> Self {
        let fuzzy = BoundedEditDistance {
            max_distance: config.executor.fuzzy_max_distance,
        };
        Self {
            store,
            config,
            fuzzy: Arc::new(fuzzy),
            analogy: Arc::new(OffsetAnalogy),
        }
    }

    pub fn with_fuzzy_matcher(mut self, fuzzy: Arc<dyn FuzzyMatcher>) -> Self {
        self.fuzzy = fuzzy;
        self
    }

    pub fn with_analogy_solver(mut self, analogy: Arc<dyn AnalogySolver>) -> Self {
        self.analogy = analogy;
        self
    }

    pub fn store(&self) -> &Arc<EmbeddingStore> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn parse(&self, text: &str) -> Result<Query, QueryError> {
        Ok(parse_query(text)?)
    }

    /// Parse and compile against the current snapshot without executing.
    pub fn compile(&self, text: &str, limit: Option<usize>) -> Result<ExecutionPlan, QueryError> {
        let query = self.parse(text)?;
        let snapshot = self.store.snapshot();
        Ok(compile(&snapshot, &self.config, &query, limit)?)
    }

    /// The rendered plan, as printed by `hdql explain`.
    pub fn explain(&self, text: &str) -> Result<String, QueryError> {
        Ok(self.compile(text, None)?.explain())
    }

    pub fn execute(&self, text: &str, options: QueryOptions) -> Result<QueryResult, QueryError> {
        let snapshot = self.store.snapshot();
        self.execute_on(&snapshot, text, options)
    }

    /// Run against an explicit snapshot, e.g. one acquired before a reload.
    pub fn execute_on(
        &self,
        snapshot: &Snapshot,
        text: &str,
        options: QueryOptions,
    ) -> Result<QueryResult, QueryError> {
        let started = Instant::now();
        let (plan, execution) = self.run(snapshot, text, options, started)?;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        let result = match (plan.shape, execution.outcome.as_ref()) {
            (ResultShape::Recommendation, Some(outcome)) => QueryResult::Recommendation(
                recommendation_result(snapshot, &plan, &execution, outcome, options.limit, elapsed_ms),
            ),
            _ => QueryResult::Match(match_result(snapshot, &plan, &execution, elapsed_ms)),
        };
        tracing::info!(
            query = %plan.query,
            generation = snapshot.generation(),
            elapsed_ms,
            summary = %result.summary(),
            "query executed"
        );
        Ok(result)
    }

    /// Execute and derive coverage gaps and improvement opportunities.
    pub fn analyze(&self, text: &str, options: QueryOptions) -> Result<AnalysisResult, QueryError> {
        let snapshot = self.store.snapshot();
        let started = Instant::now();
        let (plan, execution) = self.run(&snapshot, text, options, started)?;
        let mut result = analysis::analyze(&snapshot, &plan, &execution, &self.config.executor)?;
        result.execution_time_ms = started.elapsed().as_secs_f64() * 1000.0;
        tracing::info!(
            query = %plan.query,
            gaps = result.gaps.len(),
            elapsed_ms = result.execution_time_ms,
            "query analyzed"
        );
        Ok(result)
    }

    fn run(
        &self,
        snapshot: &Snapshot,
        text: &str,
        options: QueryOptions,
        started: Instant,
    ) -> Result<(ExecutionPlan, Execution), QueryError> {
        let query = parse_query(text)?;
        let plan = compile(snapshot, &self.config, &query, options.limit)?;
        let deadline = options.timeout.map(|t| Deadline::starting_at(started, t));
        let executor = Executor::new(
            snapshot,
            &self.config.executor,
            self.fuzzy.as_ref(),
            self.analogy.as_ref(),
        );
        let execution = executor.run(&plan, deadline.as_ref())?;
        Ok((plan, execution))
    }
}

fn match_result(
    snapshot: &Snapshot,
    plan: &ExecutionPlan,
    execution: &Execution,
    elapsed_ms: f64,
) -> MatchResult {
    let root = plan
        .operation(&plan.result)
        .and_then(|collect| collect.inputs.first())
        .and_then(|v| plan.operation(v))
        .map(|op| &op.kind);

    let matches: Vec<EntityMatch> = execution
        .result
        .ranked()
        .into_iter()
        .filter_map(|(ordinal, score)| {
            let entity = snapshot.entity(ordinal)?;
            Some(EntityMatch {
                entity: EntitySummary::from(entity),
                score,
                distance: 1.0 - score,
                confidence: score.clamp(0.0, 1.0),
                explanation: explain_match(root, score),
            })
        })
        .collect();
    let mean_confidence = if matches.is_empty() {
        0.0
    } else {
        matches.iter().map(|m| m.confidence).sum::<f32>() / matches.len() as f32
    };

    MatchResult {
        query: plan.query.clone(),
        matches,
        mean_confidence,
        trace: execution.trace.clone(),
        execution_time_ms: elapsed_ms,
    }
}

fn explain_match(root: Option<&OpKind>, score: f32) -> String {
    match root {
        Some(OpKind::Lookup { mode, .. }) => match mode {
            LookupMode::Exact => "exact identifier match".to_string(),
            LookupMode::Wildcard => "member of the requested type".to_string(),
            LookupMode::Glob => "identifier matches the pattern".to_string(),
            LookupMode::Fuzzy => format!("fuzzy name match ({score:.3})"),
        },
        Some(OpKind::Similarity { .. }) => {
            format!("cosine similarity {score:.3} (distance {:.3})", 1.0 - score)
        }
        Some(OpKind::BindRelation { .. }) => format!("relation score {score:.3}"),
        Some(OpKind::Analogy { .. }) => format!("similarity to the analogy prediction {score:.3}"),
        Some(OpKind::And) => format!("weakest operand score {score:.3}"),
        Some(OpKind::Or) => format!("strongest operand score {score:.3}"),
        Some(OpKind::Not) => "outside the excluded set".to_string(),
        Some(OpKind::Filter { comparison }) => format!("satisfies {comparison}"),
        Some(OpKind::Scan { .. }) => "member of the queried universe".to_string(),
        _ => format!("score {score:.3}"),
    }
}

fn recommendation_result(
    snapshot: &Snapshot,
    plan: &ExecutionPlan,
    execution: &Execution,
    outcome: &OptimizeOutcome,
    limit: Option<usize>,
    elapsed_ms: f64,
) -> RecommendationResult {
    let mut fields: Vec<String> = Vec::new();
    for op in &plan.operations {
        if let OpKind::Optimize {
            objective, budgets, ..
        } = &op.kind
        {
            fields.extend(objective.terms.iter().map(|t| t.field.clone()));
            fields.extend(budgets.iter().map(|b| b.field.clone()));
        }
    }
    fields.sort();
    fields.dedup();

    let summary = |ordinal: u32| snapshot.entity(ordinal).map(EntitySummary::from);
    let metrics = |ordinal: u32| -> BTreeMap<String, f64> {
        snapshot
            .entity(ordinal)
            .map(|e| {
                fields
                    .iter()
                    .filter_map(|f| e.number(f).map(|v| (f.clone(), v)))
                    .collect()
            })
            .unwrap_or_default()
    };

    let keep = limit.unwrap_or(usize::MAX);
    let recommendations: Vec<Recommendation> = outcome
        .selected
        .iter()
        .take(keep)
        .filter_map(|o| {
            let entity = summary(*o)?;
            let objective = outcome.objective.get(o).copied().unwrap_or(0.0);
            let share = if outcome.objective_value.abs() > f64::EPSILON {
                100.0 * objective / outcome.objective_value
            } else {
                0.0
            };
            Some((entity, objective, share, metrics(*o)))
        })
        .enumerate()
        .map(|(i, (entity, objective, share, metrics))| Recommendation {
            rank: i + 1,
            rationale: format!(
                "contributes {objective:.3} ({share:.0}% of the objective)"
            ),
            entity,
            objective,
            metrics,
        })
        .collect();

    let alternatives: Vec<Alternative> = outcome
        .alternatives
        .iter()
        .filter_map(|a| {
            Some(Alternative {
                entity: summary(a.ordinal)?,
                objective: a.objective,
                trade_off: a.trade_off.clone(),
            })
        })
        .collect();

    let budget_text: Vec<String> = outcome
        .budgets
        .iter()
        .map(|b| {
            format!(
                "{} {:.2} of {}{:.2}",
                b.field,
                b.used,
                if b.strict { "<" } else { "<=" },
                b.limit
            )
        })
        .collect();
    let summary_text = format!(
        "{} solver selected {} of {} candidates; objective {:.3}{}{}",
        outcome.solver,
        outcome.selected.len(),
        outcome.candidate_count,
        outcome.objective_value,
        if budget_text.is_empty() {
            String::new()
        } else {
            format!("; {}", budget_text.join(", "))
        },
        if outcome.feasible { "" } else { " (relaxed)" }
    );

    RecommendationResult {
        query: plan.query.clone(),
        recommendations,
        trade_offs: TradeOffAnalysis {
            summary: summary_text,
            dimensions: outcome.dimensions.clone(),
            pareto_frontier: outcome.frontier.iter().filter_map(|o| summary(*o)).collect(),
            dominated: outcome.dominated.iter().filter_map(|o| summary(*o)).collect(),
            budgets: outcome.budgets.clone(),
        },
        alternatives,
        objective_value: outcome.objective_value,
        feasible: outcome.feasible,
        solver: outcome.solver.to_string(),
        trace: execution.trace.clone(),
        execution_time_ms: elapsed_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use hdql_store::{vector, Entity, MetaValue, StoreConfig};

    fn unit(x: f32, y: f32) -> Vec<f32> {
        let mut v = vec![x, y];
        vector::normalize_in_place(&mut v);
        v
    }

    fn engine() -> QueryEngine {
        let store = EmbeddingStore::new(StoreConfig::default());
        let feature = |id: &str, effort: f64, coverage: f64, v: Vec<f32>| {
            Entity::new("feature", id, v)
                .with_meta("effort", MetaValue::Number(effort))
                .with_meta("coverage", MetaValue::Number(coverage))
        };
        store
            .load(
                vec![
                    Entity::new("command", "deps", unit(1.0, 0.0)).with_display_name("Dependencies"),
                    Entity::new("command", "build", unit(0.9, 0.1)),
                    feature("a", 4.0, 0.5, unit(0.2, 1.0)),
                    feature("b", 5.0, 0.6, unit(0.3, 1.0)),
                    feature("c", 6.0, 0.9, unit(0.4, 1.0)),
                ],
                Vec::new(),
            )
            .unwrap();
        QueryEngine::new(Arc::new(store), EngineConfig::default())
    }

    #[test]
    fn exact_lookup_scores_one() {
        let result = engine()
            .execute(r#"command("deps")"#, QueryOptions::default())
            .unwrap();
        let m = result.as_match().unwrap();
        assert_eq!(m.len(), 1);
        assert_relative_eq!(m.matches[0].score, 1.0);
        assert_eq!(m.matches[0].explanation, "exact identifier match");
        assert_relative_eq!(m.mean_confidence, 1.0);
    }

    #[test]
    fn optimization_yields_recommendations() {
        let result = engine()
            .execute(
                "maximize(coverage) subject_to(effort <= 10)",
                QueryOptions::default(),
            )
            .unwrap();
        let r = result.as_recommendation().unwrap();
        assert_eq!(r.selected_ids(), vec!["c", "a"]);
        assert_relative_eq!(r.objective_value, 1.4, epsilon = 1e-9);
        assert!(r.feasible);
        assert_eq!(r.solver, "exact");
        assert_eq!(r.recommendations[0].rank, 1);
        assert_eq!(r.recommendations[0].metrics["effort"], 6.0);
        assert_eq!(r.trade_offs.budgets[0].used, 10.0);
    }

    #[test]
    fn limit_truncates_matches() {
        let result = engine()
            .execute(r#"command("*")"#, QueryOptions::default().with_limit(1))
            .unwrap();
        assert_eq!(result.as_match().unwrap().len(), 1);
    }

    #[test]
    fn errors_keep_their_category() {
        let e = engine();
        let parse = e.execute("command(", QueryOptions::default()).unwrap_err();
        assert_eq!(parse.exit_code(), 1);
        let compile = e.execute(r#"widget("x")"#, QueryOptions::default()).unwrap_err();
        assert_eq!(compile.exit_code(), 2);
        assert!(compile.to_string().contains("widget"));
    }

    #[test]
    fn explain_renders_plan() {
        let text = engine().explain(r#"command("deps")"#).unwrap();
        assert!(text.contains("Query Execution Plan"));
        assert!(text.contains("lookup"));
    }

    #[test]
    fn analyze_reports_unmatched() {
        let a = engine()
            .analyze(r#"command("deps")"#, QueryOptions::default())
            .unwrap();
        assert_eq!(a.gaps.len(), 1);
        assert_eq!(a.gaps[0].entity.id, "build");
        assert!(a.execution_time_ms >= 0.0);
    }

    #[test]
    fn snapshot_survives_reload() {
        let e = engine();
        let before = e.store().snapshot();
        e.store()
            .load(vec![Entity::new("command", "lint", unit(0.0, 1.0))], Vec::new())
            .unwrap();
        let old = e
            .execute_on(&before, r#"command("*")"#, QueryOptions::default())
            .unwrap();
        let new = e.execute(r#"command("*")"#, QueryOptions::default()).unwrap();
        assert_eq!(old.as_match().unwrap().len(), 2);
        assert_eq!(new.as_match().unwrap().len(), 3);
    }
}
