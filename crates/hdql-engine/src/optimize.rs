//! Budgeted subset selection for `maximize` / `minimize` queries.
//!
//! Each candidate contributes the weighted sum of its objective fields.
//! `<=`/`<` constraints on numeric fields are budgets on the selection's
//! total, which makes the problem a multi-dimensional 0/1 knapsack. Small
//! pools are solved exactly by branch-and-bound; larger ones by a
//! ratio-greedy pass checked against the best single item.

use crate::config::ExecutorConfig;
use crate::matchset::MatchSet;
use crate::plan::Budget;
use crate::predicate::holds;
use crate::results::BudgetUsage;
use hdql_dsl::{Comparison, Direction, Objective};
use hdql_store::Snapshot;
use std::collections::BTreeMap;

const EPS: f64 = 1e-9;

pub struct OptimizeRequest<'a> {
    pub direction: Direction,
    pub objective: &'a Objective,
    pub filters: &'a [Comparison],
    pub budgets: &'a [Budget],
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlternativePick {
    pub ordinal: u32,
    pub objective: f64,
    pub trade_off: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OptimizeOutcome {
    /// Selected ordinals, best contribution first.
    pub selected: Vec<u32>,
    /// Raw objective value per candidate (before the direction is applied).
    pub objective: BTreeMap<u32, f64>,
    /// Sum of the raw objective over the selection.
    pub objective_value: f64,
    pub feasible: bool,
    pub warnings: Vec<String>,
    pub solver: &'static str,
    pub alternatives: Vec<AlternativePick>,
    /// `+field` for maximized and `-field` for minimized dimensions.
    pub dimensions: Vec<String>,
    pub frontier: Vec<u32>,
    pub dominated: Vec<u32>,
    pub budgets: Vec<BudgetUsage>,
    pub candidate_count: usize,
}

#[derive(Debug, Clone)]
struct Candidate {
    ordinal: u32,
    raw: f64,
    /// Raw value oriented so that larger is always better.
    score: f64,
    weights: Vec<f64>,
}

pub fn optimize(
    snapshot: &Snapshot,
    pool: &MatchSet,
    request: &OptimizeRequest<'_>,
    config: &ExecutorConfig,
) -> OptimizeOutcome {
    let sign = match request.direction {
        Direction::Maximize => 1.0,
        Direction::Minimize => -1.0,
    };
    let mut warnings = Vec::new();

    let numeric: Vec<(u32, Candidate)> = pool
        .members()
        .iter()
        .filter_map(|ordinal| {
            let entity = snapshot.entity(ordinal)?;
            let mut raw = 0.0;
            for term in &request.objective.terms {
                raw += term.weight * entity.number(&term.field)?;
            }
            let weights = request
                .budgets
                .iter()
                .map(|b| entity.number(&b.field))
                .collect::<Option<Vec<f64>>>()?;
            Some((
                ordinal,
                Candidate {
                    ordinal,
                    raw,
                    score: sign * raw,
                    weights,
                },
            ))
        })
        .collect();

    if numeric.is_empty() {
        warnings.push(format!(
            "no candidate carries numeric values for every field of `{}`",
            request.objective
        ));
        return OptimizeOutcome {
            feasible: false,
            warnings,
            solver: "none",
            budgets: usage(request.budgets, &[], &[]),
            ..OptimizeOutcome::default()
        };
    }

    let passes = |ordinal: u32| {
        snapshot
            .entity(ordinal)
            .is_some_and(|e| request.filters.iter().all(|c| holds(e, c)))
    };
    let mut candidates: Vec<Candidate> = numeric
        .iter()
        .filter(|(o, _)| passes(*o))
        .map(|(_, c)| c.clone())
        .collect();
    if candidates.is_empty() {
        for c in request.filters {
            let warning = format!("constraint `{c}` relaxed: no candidate satisfies it");
            tracing::warn!(%warning, "optimization infeasible");
            warnings.push(warning);
        }
        candidates = numeric.into_iter().map(|(_, c)| c).collect();
    }

    let mut budgets: Vec<Budget> = request.budgets.to_vec();
    for (j, budget) in budgets.iter_mut().enumerate() {
        let lightest = candidates
            .iter()
            .map(|c| c.weights[j])
            .fold(f64::INFINITY, f64::min);
        if !budget.admits(lightest) {
            let warning = format!(
                "constraint `{budget}` relaxed to {lightest}: no single candidate fits"
            );
            tracing::warn!(%warning, "optimization infeasible");
            warnings.push(warning);
            budget.limit = lightest;
            budget.strict = false;
        }
    }

    let nothing_used = vec![0.0; budgets.len()];
    if !candidates
        .iter()
        .any(|c| fits(&budgets, &nothing_used, &c.weights))
    {
        let lightest = candidates.iter().min_by(|a, b| {
            load(&budgets, &a.weights)
                .total_cmp(&load(&budgets, &b.weights))
                .then_with(|| a.ordinal.cmp(&b.ordinal))
        });
        if let Some(lightest) = lightest {
            for (budget, weight) in budgets.iter_mut().zip(&lightest.weights) {
                if !budget.admits(*weight) {
                    let warning = format!(
                        "constraint `{budget}` relaxed to {weight}: no candidate fits every budget"
                    );
                    tracing::warn!(%warning, "optimization infeasible");
                    warnings.push(warning);
                    budget.limit = *weight;
                    budget.strict = false;
                }
            }
        }
    }

    let (picked, solver) = if budgets.is_empty() {
        (select_unbudgeted(&candidates), "ranking")
    } else if candidates.len() <= config.optimize_exact_threshold {
        (solve_exact(&candidates, &budgets), "exact")
    } else {
        (solve_greedy(&candidates, &budgets), "greedy")
    };

    let mut selected: Vec<&Candidate> = picked.iter().map(|i| &candidates[*i]).collect();
    selected.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.ordinal.cmp(&b.ordinal))
    });
    let feasible = warnings.is_empty();

    let alternatives = if feasible {
        alternatives(snapshot, &candidates, &picked, &budgets, config.max_alternatives)
    } else {
        Vec::new()
    };
    let (dimensions, frontier, dominated) = pareto(snapshot, &candidates, request, sign);

    OptimizeOutcome {
        objective_value: selected.iter().map(|c| c.raw).sum(),
        objective: candidates.iter().map(|c| (c.ordinal, c.raw)).collect(),
        budgets: usage(&budgets, &candidates, &picked),
        selected: selected.iter().map(|c| c.ordinal).collect(),
        feasible,
        warnings,
        solver,
        alternatives,
        dimensions,
        frontier,
        dominated,
        candidate_count: candidates.len(),
    }
}

fn usage(budgets: &[Budget], candidates: &[Candidate], picked: &[usize]) -> Vec<BudgetUsage> {
    budgets
        .iter()
        .enumerate()
        .map(|(j, b)| BudgetUsage {
            field: b.field.clone(),
            limit: b.limit,
            strict: b.strict,
            used: picked.iter().map(|i| candidates[*i].weights[j]).sum(),
        })
        .collect()
}

fn fits(budgets: &[Budget], used: &[f64], weights: &[f64]) -> bool {
    budgets
        .iter()
        .zip(used.iter().zip(weights))
        .all(|(b, (u, w))| b.admits(u + w))
}

/// Normalized weight of a candidate against the budget limits.
fn load(budgets: &[Budget], weights: &[f64]) -> f64 {
    budgets
        .iter()
        .zip(weights)
        .map(|(b, w)| w / b.limit.abs().max(EPS))
        .sum()
}

/// Without budgets every positively contributing candidate is worth taking;
/// when none is, the single best one.
fn select_unbudgeted(candidates: &[Candidate]) -> Vec<usize> {
    let positive: Vec<usize> = (0..candidates.len())
        .filter(|i| candidates[*i].score > 0.0)
        .collect();
    if !positive.is_empty() {
        return positive;
    }
    best_index(candidates, |_| true).into_iter().collect()
}

fn best_index(candidates: &[Candidate], admit: impl Fn(&Candidate) -> bool) -> Option<usize> {
    (0..candidates.len())
        .filter(|i| admit(&candidates[*i]))
        .max_by(|a, b| {
            candidates[*a]
                .score
                .total_cmp(&candidates[*b].score)
                .then_with(|| candidates[*b].ordinal.cmp(&candidates[*a].ordinal))
        })
}

struct Search<'a> {
    candidates: &'a [Candidate],
    budgets: &'a [Budget],
    order: Vec<usize>,
    suffix: Vec<f64>,
    best: Vec<usize>,
    best_value: f64,
    best_load: f64,
}

impl Search<'_> {
    fn run(&mut self, pos: usize, current: &mut Vec<usize>, value: f64, used: &mut Vec<f64>) {
        let current_load: f64 = current
            .iter()
            .map(|i| load(self.budgets, &self.candidates[*i].weights))
            .sum();
        if value > self.best_value + EPS
            || ((value - self.best_value).abs() <= EPS && current_load < self.best_load - EPS)
        {
            self.best = current.clone();
            self.best_value = value;
            self.best_load = current_load;
        }
        if pos == self.order.len() || value + self.suffix[pos] < self.best_value - EPS {
            return;
        }

        let candidates = self.candidates;
        let i = self.order[pos];
        let item = &candidates[i];
        if fits(self.budgets, used, &item.weights) {
            for (u, w) in used.iter_mut().zip(&item.weights) {
                *u += w;
            }
            current.push(i);
            self.run(pos + 1, current, value + item.score, used);
            current.pop();
            for (u, w) in used.iter_mut().zip(&item.weights) {
                *u -= w;
            }
        }
        self.run(pos + 1, current, value, used);
    }
}

/// Branch-and-bound over positively contributing candidates. Ties on the
/// objective go to the lighter selection.
fn solve_exact(candidates: &[Candidate], budgets: &[Budget]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..candidates.len())
        .filter(|i| candidates[*i].score > 0.0)
        .collect();
    order.sort_by(|a, b| {
        candidates[*b]
            .score
            .total_cmp(&candidates[*a].score)
            .then_with(|| candidates[*a].ordinal.cmp(&candidates[*b].ordinal))
    });
    if order.is_empty() {
        return best_index(candidates, |c| fits(budgets, &vec![0.0; budgets.len()], &c.weights))
            .into_iter()
            .collect();
    }

    let mut suffix = vec![0.0; order.len() + 1];
    for pos in (0..order.len()).rev() {
        suffix[pos] = suffix[pos + 1] + candidates[order[pos]].score;
    }
    let mut search = Search {
        candidates,
        budgets,
        order,
        suffix,
        best: Vec::new(),
        best_value: 0.0,
        best_load: f64::INFINITY,
    };
    let mut used = vec![0.0; budgets.len()];
    search.run(0, &mut Vec::new(), 0.0, &mut used);
    search.best
}

/// Ratio-greedy by contribution per unit of normalized budget, compared with
/// the best single item that fits.
fn solve_greedy(candidates: &[Candidate], budgets: &[Budget]) -> Vec<usize> {
    let ratio = |c: &Candidate| {
        let l = load(budgets, &c.weights);
        if l > EPS {
            c.score / l
        } else {
            f64::INFINITY
        }
    };
    let mut order: Vec<usize> = (0..candidates.len())
        .filter(|i| candidates[*i].score > 0.0)
        .collect();
    order.sort_by(|a, b| {
        ratio(&candidates[*b])
            .total_cmp(&ratio(&candidates[*a]))
            .then_with(|| candidates[*a].ordinal.cmp(&candidates[*b].ordinal))
    });

    let mut used = vec![0.0; budgets.len()];
    let mut picked = Vec::new();
    let mut total = 0.0;
    for i in order {
        let item = &candidates[i];
        if fits(budgets, &used, &item.weights) {
            for (u, w) in used.iter_mut().zip(&item.weights) {
                *u += w;
            }
            total += item.score;
            picked.push(i);
        }
    }

    let zero = vec![0.0; budgets.len()];
    if let Some(single) = best_index(candidates, |c| fits(budgets, &zero, &c.weights)) {
        if candidates[single].score > total + EPS || picked.is_empty() {
            return vec![single];
        }
    }
    picked
}

fn alternatives(
    snapshot: &Snapshot,
    candidates: &[Candidate],
    picked: &[usize],
    budgets: &[Budget],
    max: usize,
) -> Vec<AlternativePick> {
    let mut rest: Vec<usize> = (0..candidates.len())
        .filter(|i| !picked.contains(i))
        .collect();
    rest.sort_by(|a, b| {
        candidates[*b]
            .score
            .total_cmp(&candidates[*a].score)
            .then_with(|| candidates[*a].ordinal.cmp(&candidates[*b].ordinal))
    });

    let used: Vec<f64> = (0..budgets.len())
        .map(|j| picked.iter().map(|i| candidates[*i].weights[j]).sum())
        .collect();
    let label = |ordinal: u32| {
        snapshot
            .entity(ordinal)
            .map_or_else(|| format!("#{ordinal}"), |e| e.key().to_string())
    };

    rest.into_iter()
        .take(max)
        .map(|a| {
            let alt = &candidates[a];
            let trade_off = if fits(budgets, &used, &alt.weights) {
                format!("fits alongside the selection: objective {:+.3}", alt.score)
            } else {
                let best_swap = picked
                    .iter()
                    .filter(|s| {
                        let freed: Vec<f64> = used
                            .iter()
                            .zip(&candidates[**s].weights)
                            .map(|(u, w)| u - w)
                            .collect();
                        fits(budgets, &freed, &alt.weights)
                    })
                    .map(|s| (*s, alt.score - candidates[*s].score))
                    .max_by(|(sa, da), (sb, db)| {
                        da.total_cmp(db)
                            .then_with(|| candidates[*sb].ordinal.cmp(&candidates[*sa].ordinal))
                    });
                match best_swap {
                    Some((s, delta)) => format!(
                        "swap for {}: objective {delta:+.3}",
                        label(candidates[s].ordinal)
                    ),
                    None => "does not fit the budgets, even as a swap".to_string(),
                }
            };
            AlternativePick {
                ordinal: alt.ordinal,
                objective: alt.raw,
                trade_off,
            }
        })
        .collect()
}

/// Pareto frontier over the objective fields (oriented by weight sign and
/// direction) and the budget fields (minimized).
fn pareto(
    snapshot: &Snapshot,
    candidates: &[Candidate],
    request: &OptimizeRequest<'_>,
    sign: f64,
) -> (Vec<String>, Vec<u32>, Vec<u32>) {
    let mut dims: Vec<(String, f64)> = Vec::new();
    for term in &request.objective.terms {
        if !dims.iter().any(|(f, _)| *f == term.field) {
            let orient = if sign * term.weight >= 0.0 { 1.0 } else { -1.0 };
            dims.push((term.field.clone(), orient));
        }
    }
    for budget in request.budgets {
        if !dims.iter().any(|(f, _)| *f == budget.field) {
            dims.push((budget.field.clone(), -1.0));
        }
    }

    let points: Vec<(u32, f64, Vec<f64>)> = candidates
        .iter()
        .filter_map(|c| {
            let entity = snapshot.entity(c.ordinal)?;
            let values = dims
                .iter()
                .map(|(field, orient)| entity.number(field).map(|v| v * orient))
                .collect::<Option<Vec<f64>>>()?;
            Some((c.ordinal, c.score, values))
        })
        .collect();

    let dominates = |a: &[f64], b: &[f64]| {
        a.iter().zip(b).all(|(x, y)| x >= y) && a.iter().zip(b).any(|(x, y)| x > y)
    };
    let mut ranked: Vec<&(u32, f64, Vec<f64>)> = points.iter().collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    let mut frontier = Vec::new();
    let mut dominated = Vec::new();
    for (ordinal, _, values) in &ranked {
        if points.iter().any(|(_, _, other)| dominates(other, values)) {
            dominated.push(*ordinal);
        } else {
            frontier.push(*ordinal);
        }
    }

    let dimensions = dims
        .into_iter()
        .map(|(field, orient)| format!("{}{field}", if orient > 0.0 { "+" } else { "-" }))
        .collect();
    (dimensions, frontier, dominated)
}
