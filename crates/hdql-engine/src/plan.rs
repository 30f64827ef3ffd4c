//! Execution plans.
//!
//! A plan is a flat, topologically ordered list of operations. Every
//! operation writes one fresh variable and reads only variables written by
//! earlier operations, so it can be evaluated in a single pass. Operations on
//! the same [`ExecutionPlan::levels`] entry are independent of each other.

use hdql_dsl::{Comparison, Direction, Objective};
use hdql_store::RelationKey;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

pub type Var = String;

pub(crate) fn var_name(n: usize) -> Var {
    format!("$v{n}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexHint {
    /// `(type, id)` hash index.
    Hash,
    /// Type bitmap scan.
    TypeScan,
    /// Per-type HNSW index.
    Ann,
    /// Exact cosine scan.
    BruteForce,
    /// Metadata only; no vector index.
    Metadata,
    /// Pure set algebra over bound variables.
    None,
}

impl IndexHint {
    pub fn as_str(self) -> &'static str {
        match self {
            IndexHint::Hash => "hash",
            IndexHint::TypeScan => "type-scan",
            IndexHint::Ann => "hnsw",
            IndexHint::BruteForce => "brute-force",
            IndexHint::Metadata => "metadata",
            IndexHint::None => "-",
        }
    }

    fn advice(self) -> Option<&'static str> {
        match self {
            IndexHint::Hash => Some("Use hash index for exact lookups"),
            IndexHint::TypeScan => Some("Use type bitmap index for scans"),
            IndexHint::Ann => Some("Use HNSW index for similarity search"),
            IndexHint::BruteForce => Some("Use exact cosine scan for small candidate sets"),
            IndexHint::Metadata => Some("Evaluate metadata predicates with field statistics"),
            IndexHint::None => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupMode {
    Exact,
    Wildcard,
    Glob,
    Fuzzy,
}

/// One resolved relationship embedding for a `(left_type, right_type)` pair.
/// `reversed` means the relation is registered from right to left and is
/// applied to the right-hand entities instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelationBinding {
    pub left_type: String,
    pub right_type: String,
    pub key: RelationKey,
    pub reversed: bool,
}

/// `field <= limit` (or `<` when `strict`) on the selection's total.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Budget {
    pub field: String,
    pub limit: f64,
    pub strict: bool,
}

impl Budget {
    pub fn admits(&self, total: f64) -> bool {
        if self.strict {
            total < self.limit - 1e-9
        } else {
            total <= self.limit + 1e-9
        }
    }
}

impl fmt::Display for Budget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = if self.strict { "<" } else { "<=" };
        write!(f, "sum({}) {op} {}", self.field, self.limit)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum OpKind {
    Lookup {
        entity_type: String,
        identifier: String,
        mode: LookupMode,
    },
    /// All entities of `types`; every entity when `types` is empty.
    Scan { types: Vec<String> },
    Filter { comparison: Comparison },
    /// inputs: `[left, right]`; yields scored left entities.
    BindRelation {
        bindings: Vec<RelationBinding>,
        min_score: f32,
    },
    /// inputs: `[target]` or `[target, candidates]`.
    Similarity {
        max_distance: f32,
        top_k: Option<usize>,
        target_types: Vec<String>,
    },
    And,
    Or,
    /// inputs: `[set, universe]`.
    Not,
    /// inputs: `[a, b, c]`.
    Analogy { target_type: String, top_k: usize },
    /// inputs: `[candidates]`.
    Optimize {
        direction: Direction,
        objective: Objective,
        filters: Vec<Comparison>,
        budgets: Vec<Budget>,
    },
    Collect { top_k: Option<usize> },
}

impl OpKind {
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Lookup { .. } => "lookup",
            OpKind::Scan { .. } => "scan",
            OpKind::Filter { .. } => "filter",
            OpKind::BindRelation { .. } => "bind_relation",
            OpKind::Similarity { .. } => "similarity",
            OpKind::And => "and",
            OpKind::Or => "or",
            OpKind::Not => "not",
            OpKind::Analogy { .. } => "analogy",
            OpKind::Optimize { .. } => "optimize",
            OpKind::Collect { .. } => "collect_results",
        }
    }

    fn params(&self) -> String {
        match self {
            OpKind::Lookup {
                entity_type,
                identifier,
                mode,
            } => match mode {
                LookupMode::Fuzzy => format!("{entity_type}, \"{identifier}\"~"),
                _ => format!("{entity_type}, \"{identifier}\""),
            },
            OpKind::Scan { types } if types.is_empty() => "*".to_string(),
            OpKind::Scan { types } => types.join(", "),
            OpKind::Filter { comparison } => comparison.to_string(),
            OpKind::BindRelation {
                bindings,
                min_score,
            } => {
                let rels: Vec<String> = bindings
                    .iter()
                    .map(|b| {
                        if b.reversed {
                            format!("{} (reversed)", b.key)
                        } else {
                            b.key.to_string()
                        }
                    })
                    .collect();
                format!("{}, min_score={min_score}", rels.join(" | "))
            }
            OpKind::Similarity {
                max_distance,
                top_k,
                target_types,
            } => {
                let mut s = format!("distance<={max_distance}");
                if let Some(k) = top_k {
                    s.push_str(&format!(", top_k={k}"));
                }
                if !target_types.is_empty() {
                    s.push_str(&format!(", in={}", target_types.join("|")));
                }
                s
            }
            OpKind::And | OpKind::Or | OpKind::Not => String::new(),
            OpKind::Analogy { target_type, top_k } => {
                format!("target={target_type}, top_k={top_k}")
            }
            OpKind::Optimize {
                direction,
                objective,
                filters,
                budgets,
            } => {
                let dir = match direction {
                    Direction::Maximize => "maximize",
                    Direction::Minimize => "minimize",
                };
                let mut s = format!("{dir} {objective}");
                for f in filters {
                    s.push_str(&format!(", {f}"));
                }
                for b in budgets {
                    s.push_str(&format!(", {b}"));
                }
                s
            }
            OpKind::Collect { top_k: Some(k) } => format!("top_k={k}"),
            OpKind::Collect { top_k: None } => String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Operation {
    #[serde(flatten)]
    pub kind: OpKind,
    pub inputs: Vec<Var>,
    pub output: Var,
    pub estimated_cost: f64,
    pub estimated_rows: f64,
    pub index_hint: IndexHint,
    pub parallel: bool,
}

impl Operation {
    /// `name(inputs, params)`, without the output or estimates.
    pub fn call(&self) -> String {
        let mut args: Vec<String> = self.inputs.clone();
        let params = self.kind.params();
        if !params.is_empty() {
            args.push(params);
        }
        format!("{}({})", self.kind.name(), args.join(", "))
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} = {} [cost={:.2}, rows~{:.0}, index={}]",
            self.output,
            self.call(),
            self.estimated_cost,
            self.estimated_rows,
            self.index_hint.as_str()
        )?;
        if self.parallel {
            f.write_str(" (parallel)")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultShape {
    Match,
    Recommendation,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionPlan {
    /// Canonical form of the compiled query.
    pub query: String,
    pub operations: Vec<Operation>,
    pub result: Var,
    pub shape: ResultShape,
    pub total_cost: f64,
    pub index_hints: Vec<String>,
    /// Rewrites applied while compiling (pushdown, shared subtrees, ...).
    pub optimizations: Vec<String>,
    /// Entity types the result can contain; empty means any.
    pub result_types: Vec<String>,
}

impl ExecutionPlan {
    pub(crate) fn finish(mut self) -> Self {
        self.total_cost = self.operations.iter().map(|op| op.estimated_cost).sum();
        let mut hints: Vec<IndexHint> = self.operations.iter().map(|op| op.index_hint).collect();
        hints.sort();
        hints.dedup();
        self.index_hints = hints
            .into_iter()
            .filter_map(IndexHint::advice)
            .map(str::to_string)
            .collect();
        self
    }

    pub fn operation(&self, output: &str) -> Option<&Operation> {
        self.operations.iter().find(|op| op.output == output)
    }

    /// Operation indexes grouped by dependency depth. Operations in one group
    /// only read variables produced by earlier groups.
    pub fn levels(&self) -> Vec<Vec<usize>> {
        let mut depth: BTreeMap<&str, usize> = BTreeMap::new();
        let mut levels: Vec<Vec<usize>> = Vec::new();
        for (i, op) in self.operations.iter().enumerate() {
            let d = op
                .inputs
                .iter()
                .filter_map(|v| depth.get(v.as_str()))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);
            depth.insert(op.output.as_str(), d);
            if levels.len() <= d {
                levels.resize_with(d + 1, Vec::new);
            }
            levels[d].push(i);
        }
        levels
    }

    /// Human-readable plan, as printed by `explain`.
    pub fn explain(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ExecutionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Query Execution Plan")?;
        writeln!(f, "{}", "=".repeat(80))?;
        writeln!(f, "Query: {}", self.query)?;
        writeln!(f)?;
        writeln!(f, "Estimated Cost: {:.2}", self.total_cost)?;
        writeln!(f, "Operations: {}", self.operations.len())?;
        writeln!(f)?;
        writeln!(f, "Execution Steps:")?;
        for (i, op) in self.operations.iter().enumerate() {
            writeln!(f, "{}. {op}", i + 1)?;
        }
        if !self.index_hints.is_empty() {
            writeln!(f)?;
            writeln!(f, "Index Hints:")?;
            for hint in &self.index_hints {
                writeln!(f, "  - {hint}")?;
            }
        }
        if !self.optimizations.is_empty() {
            writeln!(f)?;
            writeln!(f, "Optimizations:")?;
            for note in &self.optimizations {
                writeln!(f, "  - {note}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(kind: OpKind, inputs: &[&str], output: &str) -> Operation {
        Operation {
            kind,
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            output: output.to_string(),
            estimated_cost: 1.0,
            estimated_rows: 1.0,
            index_hint: IndexHint::None,
            parallel: false,
        }
    }

    #[test]
    fn levels_group_independent_operations() {
        let scan = || OpKind::Scan { types: Vec::new() };
        let plan = ExecutionPlan {
            query: String::new(),
            operations: vec![
                op(scan(), &[], "$v1"),
                op(scan(), &[], "$v2"),
                op(OpKind::And, &["$v1", "$v2"], "$v3"),
                op(OpKind::Collect { top_k: None }, &["$v3"], "$v4"),
            ],
            result: "$v4".into(),
            shape: ResultShape::Match,
            total_cost: 0.0,
            index_hints: Vec::new(),
            optimizations: Vec::new(),
            result_types: Vec::new(),
        }
        .finish();
        assert_eq!(plan.levels(), vec![vec![0, 1], vec![2], vec![3]]);
        assert_eq!(plan.total_cost, 4.0);
    }

    #[test]
    fn budgets_respect_strictness() {
        let le = Budget {
            field: "effort".into(),
            limit: 10.0,
            strict: false,
        };
        let lt = Budget {
            strict: true,
            ..le.clone()
        };
        assert!(le.admits(10.0));
        assert!(!lt.admits(10.0));
        assert!(lt.admits(9.0));
    }
}
