//! Coverage analysis over an executed query.
//!
//! For relational queries a gap is a right-hand entity that no left entity
//! relates to strongly enough ("which jobs does no command serve?"). For
//! everything else a gap is an entity of the queried types the query did not
//! match. Every gap becomes an improvement opportunity ranked by return on
//! effort.

use crate::config::ExecutorConfig;
use crate::error::ExecutionError;
use crate::executor::{relation_scores, Execution};
use crate::plan::{ExecutionPlan, OpKind};
use crate::results::{AnalysisResult, EntitySummary, Gap, Opportunity, Severity};
use hdql_store::{vector, Snapshot};
use rayon::prelude::*;
use std::collections::BTreeMap;

struct GapCandidate {
    ordinal: u32,
    best: f32,
    threshold: f32,
    gap_type: &'static str,
    description: String,
}

pub(crate) fn analyze(
    snapshot: &Snapshot,
    plan: &ExecutionPlan,
    execution: &Execution,
    config: &ExecutorConfig,
) -> Result<AnalysisResult, ExecutionError> {
    let universe = snapshot.universe(plan.result_types.iter().map(String::as_str));

    // Gaps and coverage are measured against the set before the result limit.
    let collect = plan.operation(&plan.result);
    let limit = collect.and_then(|op| match op.kind {
        OpKind::Collect { top_k } => top_k,
        _ => None,
    });
    let root_var = collect.and_then(|op| op.inputs.first());
    let result = root_var
        .and_then(|v| execution.bindings.get(v))
        .unwrap_or(&execution.result);
    let root = root_var.and_then(|v| plan.operation(v));
    let relation = root.and_then(|op| match &op.kind {
        OpKind::BindRelation {
            bindings,
            min_score,
        } => Some((op, bindings, *min_score)),
        _ => None,
    });
    let candidates = match relation {
        Some((op, bindings, min_score)) => {
            let bound = |n: usize| {
                op.inputs
                    .get(n)
                    .and_then(|v| execution.bindings.get(v))
                    .ok_or_else(|| ExecutionError::UnboundVariable(format!("{}[{n}]", op.output)))
            };
            let (left, right) = (bound(0)?, bound(1)?);
            let scores = relation_scores(snapshot, bindings, left, right)?;
            right
                .members()
                .iter()
                .filter_map(|r| {
                    let best = scores.right.get(&r).copied().unwrap_or(0.0).max(0.0);
                    (best < min_score).then(|| GapCandidate {
                        ordinal: r,
                        best,
                        threshold: min_score,
                        gap_type: "unserved",
                        description: format!(
                            "no related entity reaches score {min_score:.2} (best {best:.3})"
                        ),
                    })
                })
                .collect::<Vec<_>>()
        }
        None => {
            let matched: Vec<&[f32]> = result
                .members()
                .iter()
                .filter_map(|o| snapshot.entity(o))
                .map(|e| e.dense.as_slice())
                .collect();
            let missing: Vec<u32> = (&universe - result.members()).iter().collect();
            missing
                .par_iter()
                .filter_map(|o| {
                    let entity = snapshot.entity(*o)?;
                    let best = matched
                        .iter()
                        .filter_map(|m| vector::cosine(&entity.dense, m))
                        .fold(0.0f32, f32::max);
                    Some(GapCandidate {
                        ordinal: *o,
                        best,
                        threshold: 1.0,
                        gap_type: "unmatched",
                        description: format!(
                            "not matched by the query (closest match similarity {best:.3})"
                        ),
                    })
                })
                .collect()
        }
    };

    let mut gaps: Vec<(u32, Gap)> = candidates
        .into_iter()
        .filter_map(|c| {
            let entity = snapshot.entity(c.ordinal)?;
            Some((
                c.ordinal,
                Gap {
                    gap_type: c.gap_type.to_string(),
                    entity: EntitySummary::from(entity),
                    description: c.description,
                    severity: Severity::from_support(c.best, c.threshold),
                    best_score: c.best,
                },
            ))
        })
        .collect();
    gaps.sort_by(|(oa, a), (ob, b)| {
        b.severity
            .cmp(&a.severity)
            .then_with(|| a.best_score.total_cmp(&b.best_score))
            .then_with(|| oa.cmp(ob))
    });

    let mut opportunities: Vec<(u32, Opportunity)> = gaps
        .iter()
        .filter_map(|(o, gap)| {
            let entity = snapshot.entity(*o)?;
            let weight = entity.number(&config.value_field).unwrap_or(1.0);
            let value = f64::from(1.0 - gap.best_score.clamp(0.0, 1.0)) * weight;
            let effort = entity
                .number(&config.effort_field)
                .filter(|e| *e > 0.0)
                .unwrap_or(1.0);
            let roi = value / effort;
            Some((
                *o,
                Opportunity {
                    entity: gap.entity.clone(),
                    description: format!(
                        "close the {} gap for {}: value {value:.2} at effort {effort:.2}",
                        gap.gap_type,
                        entity.key()
                    ),
                    value,
                    effort,
                    roi,
                },
            ))
        })
        .collect();
    opportunities.sort_by(|(oa, a), (ob, b)| b.roi.total_cmp(&a.roi).then_with(|| oa.cmp(ob)));

    let scores: Vec<f32> = result.iter().map(|(_, s)| s).collect();
    let count = scores.len();
    let universe_size = universe.len() as usize;
    let mut metrics = BTreeMap::new();
    metrics.insert("result_count".to_string(), count as f64);
    metrics.insert("universe_size".to_string(), universe_size as f64);
    metrics.insert(
        "coverage_ratio".to_string(),
        if universe_size == 0 {
            0.0
        } else {
            (count as f64 / universe_size as f64).min(1.0)
        },
    );
    let (mean, min, max) = if count == 0 {
        (0.0, 0.0, 0.0)
    } else {
        (
            scores.iter().map(|s| f64::from(*s)).sum::<f64>() / count as f64,
            f64::from(scores.iter().copied().fold(f32::INFINITY, f32::min)),
            f64::from(scores.iter().copied().fold(f32::NEG_INFINITY, f32::max)),
        )
    };
    metrics.insert("mean_score".to_string(), mean);
    metrics.insert("min_score".to_string(), min);
    metrics.insert("max_score".to_string(), max);
    metrics.insert("gap_count".to_string(), gaps.len() as f64);

    let insights = insights(count, universe_size, &gaps, &opportunities);
    let shown = limit.unwrap_or(usize::MAX);
    let gaps: Vec<Gap> = gaps.into_iter().take(shown).map(|(_, g)| g).collect();
    let opportunities: Vec<Opportunity> = opportunities
        .into_iter()
        .take(shown)
        .map(|(_, o)| o)
        .collect();

    Ok(AnalysisResult {
        query: plan.query.clone(),
        metrics,
        gaps,
        opportunities,
        insights,
        trace: execution.trace.clone(),
        execution_time_ms: 0.0,
    })
}

fn insights(
    count: usize,
    universe_size: usize,
    gaps: &[(u32, Gap)],
    opportunities: &[(u32, Opportunity)],
) -> Vec<String> {
    let mut out = Vec::new();
    if count == 0 {
        out.push("The query matched nothing; check identifiers or relax thresholds.".to_string());
    } else if universe_size > 0 {
        out.push(format!(
            "{count} of {universe_size} entities matched ({:.1}% coverage).",
            100.0 * (count as f64 / universe_size as f64).min(1.0)
        ));
    }
    if !gaps.is_empty() {
        let critical = gaps
            .iter()
            .filter(|(_, g)| g.severity == Severity::Critical)
            .count();
        out.push(format!("{} gap(s) found, {critical} critical.", gaps.len()));
    }
    if let Some((_, top)) = opportunities.first() {
        out.push(format!(
            "Highest-ROI opportunity: {} (roi {:.2}).",
            top.entity, top.roi
        ));
    }
    out
}
