//! Plan interpretation.
//!
//! The executor walks a plan level by level (see
//! [`ExecutionPlan::levels`]). Operations within a level are independent;
//! those the compiler marked parallel run on rayon's pool when
//! `ExecutorConfig::parallel` is set. Results are committed to the binding
//! environment in plan order, so parallel runs produce the same trace and
//! scores as sequential ones.

use crate::config::ExecutorConfig;
use crate::error::{ExecutionError, QueryError};
use crate::matchset::MatchSet;
use crate::optimize::{optimize, OptimizeOutcome, OptimizeRequest};
use crate::plan::{ExecutionPlan, IndexHint, LookupMode, OpKind, Operation, RelationBinding, Var};
use crate::predicate::holds;
use crate::results::{ReasoningTrace, TraceStep};
use ahash::AHashMap;
use hdql_dsl::Comparison;
use hdql_store::snapshot::sort_neighbors;
use hdql_store::{vector, FuzzyMatcher, Glob, Neighbor, SearchMode, Snapshot};
use rayon::prelude::*;
use roaring::RoaringBitmap;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Predicts the fourth term of `a : b :: c : ?`.
pub trait AnalogySolver: Send + Sync {
    fn predict(&self, a: &[f32], b: &[f32], c: &[f32]) -> Vec<f32>;
}

/// `b - a + c` in the dense space.
#[derive(Debug, Clone, Copy, Default)]
pub struct OffsetAnalogy;

impl AnalogySolver for OffsetAnalogy {
    fn predict(&self, a: &[f32], b: &[f32], c: &[f32]) -> Vec<f32> {
        vector::add(&vector::sub(b, a), c)
    }
}

/// Caller-supplied time budget, checked before every operation.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn new(budget: Duration) -> Self {
        Self::starting_at(Instant::now(), budget)
    }

    pub fn starting_at(started: Instant, budget: Duration) -> Self {
        Self { started, budget }
    }

    pub fn expired(&self) -> bool {
        self.started.elapsed() > self.budget
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn budget_ms(&self) -> u64 {
        u64::try_from(self.budget.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Everything a finished plan produced.
#[derive(Debug, Clone)]
pub struct Execution {
    pub result: MatchSet,
    pub bindings: BTreeMap<Var, MatchSet>,
    pub outcome: Option<OptimizeOutcome>,
    pub trace: ReasoningTrace,
}

#[derive(Debug, Default)]
struct StepOutput {
    set: MatchSet,
    notes: Vec<String>,
    warnings: Vec<String>,
    outcome: Option<OptimizeOutcome>,
}

impl StepOutput {
    fn set(set: MatchSet) -> Self {
        Self {
            set,
            ..Self::default()
        }
    }

    fn empty_with_note(note: String) -> Self {
        tracing::warn!(%note, "empty intermediate result");
        Self {
            notes: vec![note],
            ..Self::default()
        }
    }
}

enum Interrupt {
    Deadline,
    Failed(ExecutionError),
}

impl From<ExecutionError> for Interrupt {
    fn from(err: ExecutionError) -> Self {
        Interrupt::Failed(err)
    }
}

pub struct Executor<'a> {
    snapshot: &'a Snapshot,
    config: &'a ExecutorConfig,
    fuzzy: &'a dyn FuzzyMatcher,
    analogy: &'a dyn AnalogySolver,
}

impl<'a> Executor<'a> {
    pub fn new(
        snapshot: &'a Snapshot,
        config: &'a ExecutorConfig,
        fuzzy: &'a dyn FuzzyMatcher,
        analogy: &'a dyn AnalogySolver,
    ) -> Self {
        Self {
            snapshot,
            config,
            fuzzy,
            analogy,
        }
    }

    pub fn run(
        &self,
        plan: &ExecutionPlan,
        deadline: Option<&Deadline>,
    ) -> Result<Execution, QueryError> {
        let mut env: BTreeMap<Var, MatchSet> = BTreeMap::new();
        let mut outcomes: BTreeMap<Var, OptimizeOutcome> = BTreeMap::new();
        let mut steps: Vec<Option<TraceStep>> = vec![None; plan.operations.len()];
        let mut trace = ReasoningTrace::default();

        for level in plan.levels() {
            let (parallel, mut sequential): (Vec<usize>, Vec<usize>) = level
                .into_iter()
                .partition(|i| self.config.parallel && plan.operations[*i].parallel);

            let mut results: Vec<(usize, Result<(StepOutput, u64), Interrupt>)> = Vec::new();
            if parallel.len() > 1 {
                results = parallel
                    .par_iter()
                    .map(|i| (*i, self.timed(&plan.operations[*i], &env, deadline)))
                    .collect();
            } else {
                sequential.extend(parallel);
                sequential.sort_unstable();
            }
            for i in sequential {
                results.push((i, self.timed(&plan.operations[i], &env, deadline)));
            }
            results.sort_by_key(|(i, _)| *i);

            for (i, result) in results {
                let op = &plan.operations[i];
                let (out, elapsed_us) = match result {
                    Ok(done) => done,
                    Err(Interrupt::Failed(err)) => return Err(err.into()),
                    Err(Interrupt::Deadline) => {
                        trace.steps = steps.into_iter().flatten().collect();
                        trace.warnings.push(format!(
                            "deadline reached before {} = {}",
                            op.output,
                            op.call()
                        ));
                        // Deadline is always present when the interrupt fires.
                        let (elapsed_ms, budget_ms) =
                            deadline.map_or((0, 0), |d| (d.elapsed_ms(), d.budget_ms()));
                        tracing::warn!(elapsed_ms, budget_ms, "query timed out");
                        return Err(QueryError::Timeout {
                            elapsed_ms,
                            budget_ms,
                            trace,
                        });
                    }
                };
                steps[i] = Some(TraceStep {
                    step: i + 1,
                    operation: op.call(),
                    output: op.output.clone(),
                    result_size: out.set.len(),
                    elapsed_us,
                });
                trace.notes.extend(out.notes);
                trace.warnings.extend(out.warnings);
                if let Some(outcome) = out.outcome {
                    outcomes.insert(op.output.clone(), outcome);
                }
                env.insert(op.output.clone(), out.set);
            }
        }

        trace.steps = steps.into_iter().flatten().collect();
        let result = env
            .get(&plan.result)
            .cloned()
            .ok_or_else(|| ExecutionError::UnboundVariable(plan.result.clone()))?;
        // Recommendation plans end in collect(optimize(..)); surface its outcome.
        let outcome = plan
            .operation(&plan.result)
            .and_then(|collect| collect.inputs.first())
            .and_then(|v| outcomes.remove(v));
        Ok(Execution {
            result,
            bindings: env,
            outcome,
            trace,
        })
    }

    fn timed(
        &self,
        op: &Operation,
        env: &BTreeMap<Var, MatchSet>,
        deadline: Option<&Deadline>,
    ) -> Result<(StepOutput, u64), Interrupt> {
        if deadline.is_some_and(Deadline::expired) {
            return Err(Interrupt::Deadline);
        }
        let started = Instant::now();
        let out = self.step(op, env)?;
        let elapsed_us = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);
        tracing::debug!(
            op = op.kind.name(),
            output = %op.output,
            size = out.set.len(),
            elapsed_us,
            "executed operation"
        );
        Ok((out, elapsed_us))
    }

    fn step(&self, op: &Operation, env: &BTreeMap<Var, MatchSet>) -> Result<StepOutput, ExecutionError> {
        let input = |n: usize| bound_input(op, env, n);

        match &op.kind {
            OpKind::Lookup {
                entity_type,
                identifier,
                mode,
            } => self.lookup(entity_type, identifier, *mode),
            OpKind::Scan { types } => Ok(StepOutput::set(MatchSet::uniform(
                &self.snapshot.universe(types.iter().map(String::as_str)),
                1.0,
            ))),
            OpKind::Filter { comparison } => Ok(StepOutput::set(self.filter(input(0)?, comparison))),
            OpKind::BindRelation {
                bindings,
                min_score,
            } => self.bind_relation(input(0)?, input(1)?, bindings, *min_score),
            OpKind::Similarity {
                max_distance,
                top_k,
                target_types,
            } => {
                let candidates = if op.inputs.len() > 1 {
                    Some(input(1)?)
                } else {
                    None
                };
                self.similarity(
                    input(0)?,
                    candidates,
                    *max_distance,
                    *top_k,
                    target_types,
                    op.index_hint,
                )
            }
            OpKind::And => Ok(StepOutput::set(input(0)?.and(input(1)?))),
            OpKind::Or => Ok(StepOutput::set(input(0)?.or(input(1)?))),
            OpKind::Not => Ok(StepOutput::set(input(0)?.complement(input(1)?.members()))),
            OpKind::Analogy { target_type, top_k } => self.analogy(
                [input(0)?, input(1)?, input(2)?],
                target_type,
                *top_k,
                op.index_hint,
            ),
            OpKind::Optimize {
                direction,
                objective,
                filters,
                budgets,
            } => {
                let request = OptimizeRequest {
                    direction: *direction,
                    objective,
                    filters,
                    budgets,
                };
                let outcome = optimize(self.snapshot, input(0)?, &request, self.config);
                let set = outcome
                    .selected
                    .iter()
                    .map(|o| {
                        let raw = outcome.objective.get(o).copied().unwrap_or(0.0);
                        let score = match direction {
                            hdql_dsl::Direction::Maximize => raw,
                            hdql_dsl::Direction::Minimize => -raw,
                        };
                        (*o, score as f32)
                    })
                    .collect();
                Ok(StepOutput {
                    set,
                    notes: vec![format!(
                        "optimize: {} solver selected {} of {} candidates",
                        outcome.solver,
                        outcome.selected.len(),
                        outcome.candidate_count
                    )],
                    warnings: outcome.warnings.clone(),
                    outcome: Some(outcome),
                })
            }
            OpKind::Collect { top_k } => {
                let set = input(0)?;
                Ok(StepOutput::set(match top_k {
                    Some(k) => set.top(*k),
                    None => set.clone(),
                }))
            }
        }
    }

    // ------------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------------

    fn lookup(
        &self,
        entity_type: &str,
        identifier: &str,
        mode: LookupMode,
    ) -> Result<StepOutput, ExecutionError> {
        let not_found = || format!("not found: {entity_type}(\"{identifier}\")");
        let set: MatchSet = match mode {
            LookupMode::Exact => match self.snapshot.ordinal(entity_type, identifier) {
                Some(o) => [(o, 1.0)].into_iter().collect(),
                None => return Ok(StepOutput::empty_with_note(not_found())),
            },
            LookupMode::Wildcard => self
                .snapshot
                .members(entity_type)
                .map(|m| MatchSet::uniform(m, 1.0))
                .unwrap_or_default(),
            LookupMode::Glob => {
                let glob = Glob::new(identifier)
                    .map_err(|e| ExecutionError::Internal(format!("bad glob `{identifier}`: {e}")))?;
                self.snapshot
                    .list(entity_type)
                    .into_iter()
                    .filter(|(_, e)| glob.is_match(&e.id) || glob.is_match(&e.display_name))
                    .map(|(o, _)| (o, 1.0))
                    .collect()
            }
            LookupMode::Fuzzy => self
                .snapshot
                .list(entity_type)
                .into_iter()
                .filter_map(|(o, e)| {
                    let by_name = self.fuzzy.score(&e.display_name, identifier);
                    let by_id = self.fuzzy.score(&e.id, identifier);
                    let best = match (by_name, by_id) {
                        (Some(a), Some(b)) => Some(a.max(b)),
                        (a, b) => a.or(b),
                    };
                    best.map(|s| (o, s))
                })
                .collect(),
        };
        if set.is_empty() {
            return Ok(StepOutput::empty_with_note(not_found()));
        }
        Ok(StepOutput::set(set))
    }

    fn filter(&self, input: &MatchSet, comparison: &Comparison) -> MatchSet {
        let mut out = input.clone();
        out.retain(|o| {
            self.snapshot
                .entity(o)
                .is_some_and(|e| holds(e, comparison))
        });
        out
    }

    fn bind_relation(
        &self,
        left: &MatchSet,
        right: &MatchSet,
        bindings: &[RelationBinding],
        min_score: f32,
    ) -> Result<StepOutput, ExecutionError> {
        let scores = relation_scores(self.snapshot, bindings, left, right)?;
        let set: MatchSet = scores
            .left
            .iter()
            .filter(|(_, best)| **best >= min_score)
            .map(|(o, best)| (*o, left.score(*o).unwrap_or(1.0).min(*best)))
            .collect();
        if set.is_empty() && !left.is_empty() && !right.is_empty() {
            return Ok(StepOutput::empty_with_note(format!(
                "no entity relates to the right-hand side with score >= {min_score}"
            )));
        }
        Ok(StepOutput::set(set))
    }

    fn similarity(
        &self,
        target: &MatchSet,
        candidates: Option<&MatchSet>,
        max_distance: f32,
        top_k: Option<usize>,
        target_types: &[String],
        hint: IndexHint,
    ) -> Result<StepOutput, ExecutionError> {
        if target.is_empty() {
            return Ok(StepOutput::empty_with_note(
                "similarity target matched nothing".to_string(),
            ));
        }
        let query = self.query_vector(target)?;
        let threshold = Some(max_distance);

        let hits: Vec<Neighbor> = match candidates {
            Some(c) => self
                .snapshot
                .nearest_among(&query, c.members(), top_k, threshold)?,
            None if target_types.is_empty() => {
                let all = self.snapshot.universe(std::iter::empty());
                self.snapshot.nearest_among(&query, &all, top_k, threshold)?
            }
            None => {
                let mode = self.search_mode(hint);
                let mut hits = Vec::new();
                for t in target_types {
                    hits.extend(self.snapshot.nearest_with(&query, t, top_k, threshold, mode)?);
                }
                sort_neighbors(&mut hits);
                if let Some(k) = top_k {
                    hits.truncate(k);
                }
                hits
            }
        };
        Ok(StepOutput::set(
            hits.into_iter().map(|n| (n.ordinal, n.similarity)).collect(),
        ))
    }

    /// The single target's dense vector, or the normalized centroid of a set.
    fn query_vector(&self, target: &MatchSet) -> Result<Vec<f32>, ExecutionError> {
        let vectors: Vec<&[f32]> = target
            .members()
            .iter()
            .filter_map(|o| self.snapshot.entity(o))
            .map(|e| e.dense.as_slice())
            .collect();
        if let [single] = vectors.as_slice() {
            return Ok(single.to_vec());
        }
        vector::centroid(vectors).ok_or_else(|| {
            ExecutionError::Numerical(format!(
                "centroid of {} target entities has zero norm",
                target.len()
            ))
        })
    }

    fn search_mode(&self, hint: IndexHint) -> SearchMode {
        match hint {
            IndexHint::Ann => SearchMode::Indexed {
                ef_search: self.config.ann_ef_search,
                oversample: self.config.ann_oversample,
            },
            _ => SearchMode::Exact,
        }
    }

    fn analogy(
        &self,
        [a, b, c]: [&MatchSet; 3],
        target_type: &str,
        top_k: usize,
        hint: IndexHint,
    ) -> Result<StepOutput, ExecutionError> {
        let (Some((oa, _)), Some((ob, _)), Some((oc, _))) = (a.best(), b.best(), c.best()) else {
            return Ok(StepOutput::empty_with_note(
                "analogy operand matched nothing".to_string(),
            ));
        };
        let vector_of = |o: u32| {
            self.snapshot
                .entity(o)
                .map(|e| e.dense.as_slice())
                .ok_or_else(|| ExecutionError::IndexCorruption(format!("ordinal {o} out of range")))
        };
        let predicted = self
            .analogy
            .predict(vector_of(oa)?, vector_of(ob)?, vector_of(oc)?);
        if !(vector::norm(&predicted) > 0.0) {
            return Err(ExecutionError::Numerical(
                "analogy prediction b - a + c has zero norm".to_string(),
            ));
        }

        let exclude = [oa, ob, oc];
        let hits = self.snapshot.nearest_with(
            &predicted,
            target_type,
            Some(top_k + exclude.len()),
            None,
            self.search_mode(hint),
        )?;
        Ok(StepOutput::set(
            hits.into_iter()
                .filter(|n| !exclude.contains(&n.ordinal))
                .take(top_k)
                .map(|n| (n.ordinal, n.similarity))
                .collect(),
        ))
    }
}

fn bound_input<'e>(
    op: &Operation,
    env: &'e BTreeMap<Var, MatchSet>,
    n: usize,
) -> Result<&'e MatchSet, ExecutionError> {
    let var = op.inputs.get(n).ok_or_else(|| {
        ExecutionError::Internal(format!("{} is missing input {n}", op.kind.name()))
    })?;
    env.get(var)
        .ok_or_else(|| ExecutionError::UnboundVariable(var.clone()))
}

/// Best relation score per left entity and per right entity.
#[derive(Debug, Default)]
pub(crate) struct RelationScores {
    pub left: AHashMap<u32, f32>,
    pub right: AHashMap<u32, f32>,
}

impl RelationScores {
    fn record(&mut self, l: u32, r: u32, score: f32) {
        let left = self.left.entry(l).or_insert(f32::NEG_INFINITY);
        *left = left.max(score);
        let right = self.right.entry(r).or_insert(f32::NEG_INFINITY);
        *right = right.max(score);
    }
}

/// Scores every `(left, right)` pair under the resolved relation operators:
/// the cosine between the operator's prediction for one side and the other
/// side's vector in the operator's space.
pub(crate) fn relation_scores(
    snapshot: &Snapshot,
    bindings: &[RelationBinding],
    left: &MatchSet,
    right: &MatchSet,
) -> Result<RelationScores, ExecutionError> {
    let of_type = |set: &MatchSet, t: &str| -> RoaringBitmap {
        match snapshot.members(t) {
            Some(m) => set.members() & m,
            None => RoaringBitmap::new(),
        }
    };

    let mut scores = RelationScores::default();
    for binding in bindings {
        let operator = snapshot.relation(&binding.key).ok_or_else(|| {
            ExecutionError::IndexCorruption(format!("relation {} vanished", binding.key))
        })?;
        let space = operator.space();
        let lefts = of_type(left, &binding.left_type);
        let rights = of_type(right, &binding.right_type);

        let (sources, targets) = if binding.reversed {
            (&rights, &lefts)
        } else {
            (&lefts, &rights)
        };
        for s in sources {
            let Some(source) = snapshot.entity(s) else {
                continue;
            };
            let predicted = operator.apply(source);
            if !(vector::norm(&predicted) > 0.0) {
                return Err(ExecutionError::Numerical(format!(
                    "relation {} maps {} to a zero-norm vector",
                    binding.key,
                    source.key()
                )));
            }
            for t in targets {
                let Some(target) = snapshot.entity(t) else {
                    continue;
                };
                let Some(score) = vector::cosine(&predicted, space.of(target)) else {
                    continue;
                };
                if binding.reversed {
                    scores.record(t, s, score);
                } else {
                    scores.record(s, t, score);
                }
            }
        }
    }
    Ok(scores)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;
    use crate::config::EngineConfig;
    use approx::assert_relative_eq;
    use hdql_dsl::parse_query;
    use hdql_store::{BoundedEditDistance, Entity, MetaValue, RelationEmbedding, RelationOperator, StoreConfig};

    fn unit(x: f32, y: f32) -> Vec<f32> {
        let mut v = vec![x, y];
        vector::normalize_in_place(&mut v);
        v
    }

    fn snapshot() -> Snapshot {
        let entities = vec![
            Entity::new("command", "deps", unit(1.0, 0.0))
                .with_display_name("Dependencies")
                .with_meta("uses", MetaValue::Number(9.0)),
            Entity::new("command", "build", unit(0.95, 0.05)).with_meta("uses", MetaValue::Number(5.0)),
            Entity::new("command", "lint", unit(0.0, 1.0)).with_meta("uses", MetaValue::Number(1.0)),
            Entity::new("job", "ship", unit(1.0, 0.2)),
            Entity::new("job", "review", unit(0.0, 1.0)),
        ];
        let relations = vec![RelationEmbedding {
            source_type: "command".into(),
            relation: "serves".into(),
            target_type: "job".into(),
            operator: RelationOperator::Offset(vec![0.0, 0.0]),
        }];
        Snapshot::build(entities, relations, &StoreConfig::default(), 1).unwrap()
    }

    fn run(s: &Snapshot, text: &str) -> Result<Execution, QueryError> {
        let config = EngineConfig::default();
        let plan = compile(s, &config, &parse_query(text).unwrap(), None)?;
        let fuzzy = BoundedEditDistance::default();
        Executor::new(s, &config.executor, &fuzzy, &OffsetAnalogy).run(&plan, None)
    }

    fn ids(s: &Snapshot, set: &MatchSet) -> Vec<String> {
        set.ranked()
            .into_iter()
            .map(|(o, _)| s.entity(o).unwrap().id.clone())
            .collect()
    }

    #[test]
    fn missing_identifier_is_a_note_not_an_error() {
        let s = snapshot();
        let out = run(&s, r#"command("nope")"#).unwrap();
        assert!(out.result.is_empty());
        assert_eq!(out.trace.notes, vec![r#"not found: command("nope")"#.to_string()]);
    }

    #[test]
    fn fuzzy_matches_display_names_and_ids() {
        let s = snapshot();
        let out = run(&s, r#"command("dpes"~)"#).unwrap();
        assert_eq!(ids(&s, &out.result), vec!["deps"]);
        let out = run(&s, r#"command("Dependencie"~)"#).unwrap();
        assert_eq!(ids(&s, &out.result), vec!["deps"]);
    }

    #[test]
    fn glob_lookup() {
        let s = snapshot();
        let out = run(&s, r#"command("*l*")"#).unwrap();
        assert_eq!(ids(&s, &out.result), vec!["build", "lint"]);
    }

    #[test]
    fn similarity_is_thresholded_and_sorted() {
        let s = snapshot();
        let out = run(&s, r#"similar_to(command("deps"), distance=0.2)"#).unwrap();
        assert_eq!(ids(&s, &out.result), vec!["deps", "build"]);
        assert_relative_eq!(out.result.best().unwrap().1, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn relational_keeps_left_entities_that_serve_the_right() {
        let s = snapshot();
        let out = run(&s, r#"command("*") -> job("ship")"#).unwrap();
        assert_eq!(ids(&s, &out.result), vec!["build", "deps"]);
        let out = run(&s, r#"job("*") -[serves]-> command("lint")"#).unwrap();
        assert_eq!(ids(&s, &out.result), vec!["review"]);
    }

    #[test]
    fn logical_operators() {
        let s = snapshot();
        let out = run(&s, r#"NOT command("deps")"#).unwrap();
        assert_eq!(ids(&s, &out.result), vec!["build", "lint"]);
        let out = run(&s, r#"command("*") AND uses >= 5"#).unwrap();
        assert_eq!(ids(&s, &out.result), vec!["deps", "build"]);
        let out = run(&s, r#"command("deps") OR job("ship")"#).unwrap();
        assert_eq!(out.result.len(), 2);
        let out = run(&s, "uses < 2").unwrap();
        assert_eq!(ids(&s, &out.result), vec!["lint"]);
    }

    #[test]
    fn analogy_excludes_operands() {
        let s = snapshot();
        let out = run(
            &s,
            r#"command("lint") is_to job("review") as command("deps") is_to ?"#,
        )
        .unwrap();
        let found = ids(&s, &out.result);
        assert_eq!(found.first().map(String::as_str), Some("ship"));
        assert!(!found.contains(&"review".to_string()));
    }

    struct Cancelling;

    impl AnalogySolver for Cancelling {
        fn predict(&self, a: &[f32], _b: &[f32], _c: &[f32]) -> Vec<f32> {
            vec![0.0; a.len()]
        }
    }

    #[test]
    fn zero_norm_analogy_is_numerical_error() {
        let s = snapshot();
        let config = EngineConfig::default();
        let text = r#"command("lint") is_to job("review") as command("deps") is_to ?"#;
        let plan = compile(&s, &config, &parse_query(text).unwrap(), None).unwrap();
        let fuzzy = BoundedEditDistance::default();
        let err = Executor::new(&s, &config.executor, &fuzzy, &Cancelling)
            .run(&plan, None)
            .unwrap_err();
        assert!(matches!(
            err,
            QueryError::Execution(ExecutionError::Numerical(_))
        ));
    }

    #[test]
    fn relation_cancelling_its_source_is_numerical_error() {
        let entities = vec![
            Entity::new("command", "deps", unit(1.0, 0.0)),
            Entity::new("job", "ship", unit(1.0, 0.0)),
        ];
        let relations = vec![RelationEmbedding {
            source_type: "command".into(),
            relation: "serves".into(),
            target_type: "job".into(),
            operator: RelationOperator::Offset(vec![-1.0, 0.0]),
        }];
        let s = Snapshot::build(entities, relations, &StoreConfig::default(), 1).unwrap();
        let err = run(&s, r#"command("deps") -> job("ship")"#).unwrap_err();
        assert!(matches!(
            err,
            QueryError::Execution(ExecutionError::Numerical(_))
        ));
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn expired_deadline_returns_partial_trace() {
        let s = snapshot();
        let config = EngineConfig::default();
        let plan = compile(&s, &config, &parse_query(r#"command("deps")"#).unwrap(), None).unwrap();
        let fuzzy = BoundedEditDistance::default();
        let started = Instant::now()
            .checked_sub(Duration::from_millis(50))
            .unwrap_or_else(Instant::now);
        let deadline = Deadline::starting_at(started, Duration::ZERO);
        let err = Executor::new(&s, &config.executor, &fuzzy, &OffsetAnalogy)
            .run(&plan, Some(&deadline))
            .unwrap_err();
        assert_eq!(err.exit_code(), 3);
        assert!(err.partial_trace().unwrap().steps.is_empty());
    }

    #[test]
    fn parallel_and_sequential_runs_agree() {
        let s = snapshot();
        let text = r#"(similar_to(command("deps")) AND command("*")) OR NOT job("ship")"#;
        let mut config = EngineConfig::default();
        let plan = compile(&s, &config, &parse_query(text).unwrap(), None).unwrap();
        let fuzzy = BoundedEditDistance::default();
        let parallel = Executor::new(&s, &config.executor, &fuzzy, &OffsetAnalogy)
            .run(&plan, None)
            .unwrap();
        config.executor.parallel = false;
        let sequential = Executor::new(&s, &config.executor, &fuzzy, &OffsetAnalogy)
            .run(&plan, None)
            .unwrap();
        assert_eq!(parallel.result.ranked(), sequential.result.ranked());
        assert_eq!(
            parallel.trace.steps.iter().map(|t| &t.operation).collect::<Vec<_>>(),
            sequential.trace.steps.iter().map(|t| &t.operation).collect::<Vec<_>>()
        );
    }
}
