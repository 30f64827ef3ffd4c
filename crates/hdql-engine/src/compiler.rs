//! AST to execution plan lowering.
//!
//! The compiler resolves names against a snapshot's catalogue (entity types,
//! relations, metadata fields) so that everything it accepts can execute
//! without further name errors. It also:
//! - picks an index per operation (hash, type scan, HNSW or exact scan);
//! - estimates cost and cardinality with closed-form heuristics;
//! - pushes selective metadata filters below similarity and relational steps;
//! - collapses structurally identical subtrees into one variable;
//! - marks independent branches as parallel-eligible.

use crate::config::EngineConfig;
use crate::error::CompileError;
use crate::plan::{
    var_name, Budget, ExecutionPlan, IndexHint, LookupMode, OpKind, Operation, RelationBinding,
    ResultShape, Var,
};
use crate::predicate::{is_pseudo_field, literal_value};
use ahash::AHashMap;
use hdql_dsl::{
    Analogy, Atomic, CmpOp, Comparison, Literal, Logical, LogicalOp, Optimization, Query,
    Relational, Similarity,
};
use hdql_store::Snapshot;
use std::collections::BTreeSet;
use std::ops::Range;

/// Lower `query` to a plan against `snapshot`. `limit` becomes the final
/// `collect_results` truncation.
pub fn compile(
    snapshot: &Snapshot,
    config: &EngineConfig,
    query: &Query,
    limit: Option<usize>,
) -> Result<ExecutionPlan, CompileError> {
    let mut compiler = Compiler::new(snapshot, config);
    let root = compiler.node(query)?;

    let collect_rows = limit.map_or(root.rows, |k| root.rows.min(k as f64));
    let result = compiler.emit(
        OpKind::Collect { top_k: limit },
        vec![root.var],
        root.rows.max(1.0),
        collect_rows,
        IndexHint::None,
    );

    let shape = match query {
        Query::Optimization(_) => ResultShape::Recommendation,
        _ => ResultShape::Match,
    };
    let plan = ExecutionPlan {
        query: query.to_string(),
        operations: compiler.ops,
        result,
        shape,
        total_cost: 0.0,
        index_hints: Vec::new(),
        optimizations: compiler.optimizations,
        result_types: root.types.into_iter().collect(),
    }
    .finish();

    tracing::debug!(
        query = %plan.query,
        operations = plan.operations.len(),
        total_cost = plan.total_cost,
        "compiled plan"
    );
    Ok(plan)
}

#[derive(Debug, Clone)]
struct Compiled {
    var: Var,
    /// Entity types the variable can hold; empty means any.
    types: BTreeSet<String>,
    rows: f64,
}

struct Compiler<'a> {
    snapshot: &'a Snapshot,
    config: &'a EngineConfig,
    ops: Vec<Operation>,
    next_var: usize,
    memo: AHashMap<String, Compiled>,
    seen_types: BTreeSet<String>,
    optimizations: Vec<String>,
}

impl<'a> Compiler<'a> {
    fn new(snapshot: &'a Snapshot, config: &'a EngineConfig) -> Self {
        Self {
            snapshot,
            config,
            ops: Vec::new(),
            next_var: 0,
            memo: AHashMap::new(),
            seen_types: BTreeSet::new(),
            optimizations: Vec::new(),
        }
    }

    fn emit(
        &mut self,
        kind: OpKind,
        inputs: Vec<Var>,
        cost: f64,
        rows: f64,
        index_hint: IndexHint,
    ) -> Var {
        self.next_var += 1;
        let output = var_name(self.next_var);
        self.ops.push(Operation {
            kind,
            inputs,
            output: output.clone(),
            estimated_cost: cost,
            estimated_rows: rows.max(0.0),
            index_hint,
            parallel: false,
        });
        output
    }

    fn mark_parallel(&mut self, branches: &[Range<usize>]) {
        let non_empty = branches.iter().filter(|r| !r.is_empty()).count();
        if non_empty < 2 {
            return;
        }
        for range in branches {
            for op in &mut self.ops[range.clone()] {
                op.parallel = true;
            }
        }
    }

    // ------------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------------

    fn node(&mut self, query: &Query) -> Result<Compiled, CompileError> {
        // Comparisons, NOT and optimization read the types seen so far, so
        // their key carries that context.
        let key = if reads_seen_types(query) {
            format!("{query}|{}", join_types(&self.seen_types))
        } else {
            query.to_string()
        };
        if let Some(hit) = self.memo.get(&key).cloned() {
            self.optimizations
                .push(format!("shared subtree: `{query}` reuses {}", hit.var));
            self.seen_types.extend(hit.types.iter().cloned());
            return Ok(hit);
        }

        let compiled = match query {
            Query::Atomic(a) => self.atomic(a)?,
            Query::Relational(r) => self.relational(r, &[])?,
            Query::Logical(l) => self.logical(l)?,
            Query::Comparison(c) => self.bare_comparison(c)?,
            Query::Similarity(s) => self.similarity(s, &[])?,
            Query::Analogy(a) => self.analogy(a)?,
            Query::Optimization(o) => self.optimization(o)?,
        };
        self.memo.insert(key, compiled.clone());
        Ok(compiled)
    }

    fn check_type(&self, name: &str) -> Result<(), CompileError> {
        if self.snapshot.has_type(name) {
            return Ok(());
        }
        Err(CompileError::UnknownEntityType {
            name: name.to_string(),
            known: self.snapshot.entity_types().map(str::to_string).collect(),
        })
    }

    fn check_field(&self, field: &str) -> Result<(), CompileError> {
        if is_pseudo_field(field) || self.snapshot.field_stats(field).is_some() {
            return Ok(());
        }
        Err(CompileError::UnknownField {
            field: field.to_string(),
        })
    }

    fn population(&self, types: &BTreeSet<String>) -> f64 {
        if types.is_empty() {
            self.snapshot.len() as f64
        } else {
            types.iter().map(|t| self.snapshot.type_len(t)).sum::<usize>() as f64
        }
    }

    // ------------------------------------------------------------------------
    // Atomic
    // ------------------------------------------------------------------------

    fn atomic(&mut self, a: &Atomic) -> Result<Compiled, CompileError> {
        self.check_type(&a.entity_type)?;
        self.seen_types.insert(a.entity_type.clone());
        let n = self.snapshot.type_len(&a.entity_type) as f64;

        let mode = if a.is_wildcard() {
            LookupMode::Wildcard
        } else if a.fuzzy {
            LookupMode::Fuzzy
        } else if a.is_glob() {
            LookupMode::Glob
        } else {
            LookupMode::Exact
        };
        let (cost, rows, hint) = match mode {
            LookupMode::Exact => (1.0, 1.0, IndexHint::Hash),
            LookupMode::Wildcard => (n.max(1.0), n, IndexHint::TypeScan),
            LookupMode::Glob => (n.max(1.0), (n * 0.1).max(1.0), IndexHint::TypeScan),
            LookupMode::Fuzzy => (2.0 * n.max(1.0), (n * 0.05).max(1.0), IndexHint::TypeScan),
        };
        let var = self.emit(
            OpKind::Lookup {
                entity_type: a.entity_type.clone(),
                identifier: a.identifier.clone(),
                mode,
            },
            Vec::new(),
            cost,
            rows.min(n),
            hint,
        );
        Ok(Compiled {
            var,
            types: BTreeSet::from([a.entity_type.clone()]),
            rows: rows.min(n),
        })
    }

    // ------------------------------------------------------------------------
    // Comparisons
    // ------------------------------------------------------------------------

    /// Estimated fraction of the store satisfying `c`.
    fn selectivity(&self, c: &Comparison) -> f64 {
        let total = self.snapshot.len();
        if total == 0 {
            return 0.0;
        }
        let exact = |matching: f64| match c.op {
            CmpOp::Eq => matching,
            CmpOp::Ne => 1.0 - matching,
            _ => 0.5,
        };
        match (c.field.as_str(), &c.value) {
            ("entity_type", Literal::Text(t)) => {
                exact(self.snapshot.type_len(t) as f64 / total as f64)
            }
            ("id", _) => exact(1.0 / total as f64),
            (field, value) => self
                .snapshot
                .field_stats(field)
                .map_or(0.0, |s| s.selectivity(c.op.as_str(), &literal_value(value), total)),
        }
    }

    fn filter(&mut self, input: Compiled, c: &Comparison) -> Compiled {
        let selectivity = self.selectivity(c);
        let rows = input.rows * selectivity;
        let var = self.emit(
            OpKind::Filter {
                comparison: c.clone(),
            },
            vec![input.var],
            input.rows.max(1.0),
            rows,
            IndexHint::Metadata,
        );
        Compiled {
            var,
            types: input.types,
            rows,
        }
    }

    fn scan(&mut self, types: BTreeSet<String>) -> Compiled {
        let rows = self.population(&types);
        let var = self.emit(
            OpKind::Scan {
                types: types.iter().cloned().collect(),
            },
            Vec::new(),
            rows.max(1.0),
            rows,
            IndexHint::TypeScan,
        );
        Compiled { var, types, rows }
    }

    /// A comparison with nothing to filter evaluates over the types seen so
    /// far (every entity when none).
    fn bare_comparison(&mut self, c: &Comparison) -> Result<Compiled, CompileError> {
        self.check_field(&c.field)?;
        let universe = self.scan(self.seen_types.clone());
        Ok(self.filter(universe, c))
    }

    // ------------------------------------------------------------------------
    // Logical
    // ------------------------------------------------------------------------

    fn logical(&mut self, l: &Logical) -> Result<Compiled, CompileError> {
        match l.op {
            LogicalOp::And => self.and(&l.operands),
            LogicalOp::Or => self.or(&l.operands),
            LogicalOp::Not => self.not(&l.operands),
        }
    }

    fn and(&mut self, operands: &[Query]) -> Result<Compiled, CompileError> {
        let mut comparisons: Vec<&Comparison> = Vec::new();
        let mut others: Vec<&Query> = Vec::new();
        for operand in operands {
            match operand {
                Query::Comparison(c) => {
                    self.check_field(&c.field)?;
                    comparisons.push(c);
                }
                other => others.push(other),
            }
        }
        // Most selective filters first.
        comparisons.sort_by(|a, b| self.selectivity(a).total_cmp(&self.selectivity(b)));

        if others.is_empty() {
            let mut acc = self.scan(self.seen_types.clone());
            for c in comparisons {
                acc = self.filter(acc, c);
            }
            return Ok(acc);
        }

        // Pushdown target: the first expensive step a filter can run under
        // without changing the result.
        let target = others.iter().position(|q| match q {
            Query::Similarity(s) => s.top_k.is_none(),
            Query::Relational(_) => true,
            _ => false,
        });
        let threshold = self.config.compiler.pushdown_selectivity;
        let mut pushed: Vec<Comparison> = Vec::new();
        let mut remaining: Vec<&Comparison> = Vec::new();
        for c in comparisons {
            let selectivity = self.selectivity(c);
            match target {
                Some(t) if selectivity < threshold => {
                    self.optimizations.push(format!(
                        "predicate pushdown: `{c}` (selectivity {selectivity:.2}) runs before {}",
                        others[t].kind()
                    ));
                    pushed.push(c.clone());
                }
                _ => remaining.push(c),
            }
        }

        let mut branches = Vec::with_capacity(others.len());
        let mut compiled = Vec::with_capacity(others.len());
        for (i, q) in others.iter().enumerate() {
            let start = self.ops.len();
            let c = match (*q, target) {
                (Query::Similarity(s), Some(t)) if t == i && !pushed.is_empty() => {
                    self.similarity(s, &pushed)?
                }
                (Query::Relational(r), Some(t)) if t == i && !pushed.is_empty() => {
                    self.relational(r, &pushed)?
                }
                _ => self.node(q)?,
            };
            branches.push(start..self.ops.len());
            compiled.push(c);
        }
        self.mark_parallel(&branches);

        let mut iter = compiled.into_iter();
        let Some(mut acc) = iter.next() else {
            return Err(CompileError::InvalidParameter {
                name: "AND".into(),
                message: "no operands".into(),
            });
        };
        for next in iter {
            let rows = acc.rows.min(next.rows);
            let cost = acc.rows + next.rows;
            let types = intersect_types(&acc.types, &next.types);
            let var = self.emit(
                OpKind::And,
                vec![acc.var, next.var],
                cost.max(1.0),
                rows,
                IndexHint::None,
            );
            acc = Compiled { var, types, rows };
        }
        for c in remaining {
            acc = self.filter(acc, c);
        }
        Ok(acc)
    }

    fn or(&mut self, operands: &[Query]) -> Result<Compiled, CompileError> {
        let mut branches = Vec::with_capacity(operands.len());
        let mut compiled = Vec::with_capacity(operands.len());
        for q in operands {
            let start = self.ops.len();
            compiled.push(self.node(q)?);
            branches.push(start..self.ops.len());
        }
        self.mark_parallel(&branches);

        let mut iter = compiled.into_iter();
        let Some(mut acc) = iter.next() else {
            return Err(CompileError::InvalidParameter {
                name: "OR".into(),
                message: "no operands".into(),
            });
        };
        for next in iter {
            let rows = acc.rows + next.rows;
            let types = if acc.types.is_empty() || next.types.is_empty() {
                BTreeSet::new()
            } else {
                acc.types.union(&next.types).cloned().collect()
            };
            let var = self.emit(
                OpKind::Or,
                vec![acc.var, next.var],
                rows.max(1.0),
                rows,
                IndexHint::None,
            );
            acc = Compiled { var, types, rows };
        }
        Ok(acc)
    }

    fn not(&mut self, operands: &[Query]) -> Result<Compiled, CompileError> {
        let [operand] = operands else {
            return Err(CompileError::InvalidParameter {
                name: "NOT".into(),
                message: format!("expects one operand, got {}", operands.len()),
            });
        };
        let start = self.ops.len();
        let inner = self.node(operand)?;
        let mid = self.ops.len();
        let universe = self.scan(self.seen_types.clone());
        self.mark_parallel(&[start..mid, mid..self.ops.len()]);

        let rows = (universe.rows - inner.rows).max(0.0);
        let var = self.emit(
            OpKind::Not,
            vec![inner.var, universe.var],
            universe.rows.max(1.0),
            rows,
            IndexHint::None,
        );
        Ok(Compiled {
            var,
            types: universe.types,
            rows,
        })
    }

    // ------------------------------------------------------------------------
    // Relational
    // ------------------------------------------------------------------------

    fn relational(
        &mut self,
        r: &Relational,
        pushed: &[Comparison],
    ) -> Result<Compiled, CompileError> {
        let left_start = self.ops.len();
        let mut left = self.node(&r.left)?;
        for c in pushed {
            left = self.filter(left, c);
        }
        let right_start = self.ops.len();
        let right = self.node(&r.right)?;
        self.mark_parallel(&[left_start..right_start, right_start..self.ops.len()]);

        let bindings = self.resolve_relation(&left.types, r.relation.as_deref(), &right.types)?;
        let cost = (left.rows.max(1.0) * right.rows.max(1.0)).max(1.0);
        let rows = left.rows * 0.5;
        let var = self.emit(
            OpKind::BindRelation {
                bindings,
                min_score: self.config.executor.relation_min_score,
            },
            vec![left.var, right.var],
            cost,
            rows,
            IndexHint::BruteForce,
        );
        Ok(Compiled {
            var,
            types: left.types,
            rows,
        })
    }

    fn resolve_relation(
        &self,
        left: &BTreeSet<String>,
        relation: Option<&str>,
        right: &BTreeSet<String>,
    ) -> Result<Vec<RelationBinding>, CompileError> {
        let all: BTreeSet<String> = self.snapshot.entity_types().map(str::to_string).collect();
        let left = if left.is_empty() { &all } else { left };
        let right = if right.is_empty() { &all } else { right };

        let mut bindings = Vec::new();
        for l in left {
            for r in right {
                let matching = |source: &str, target: &str| -> Vec<_> {
                    self.snapshot
                        .relations()
                        .map(|(key, _)| key)
                        .filter(|key| {
                            key.source_type == source
                                && key.target_type == target
                                && relation.map_or(true, |name| key.relation == name)
                        })
                        .cloned()
                        .collect()
                };
                let (keys, reversed) = match matching(l, r) {
                    forward if !forward.is_empty() => (forward, false),
                    _ => (matching(r, l), true),
                };
                if keys.len() > 1 {
                    return Err(CompileError::AmbiguousRelation {
                        source_type: l.clone(),
                        target_type: r.clone(),
                        candidates: keys.iter().map(|k| k.relation.clone()).collect(),
                    });
                }
                if let Some(key) = keys.into_iter().next() {
                    bindings.push(RelationBinding {
                        left_type: l.clone(),
                        right_type: r.clone(),
                        key,
                        reversed,
                    });
                }
            }
        }
        if bindings.is_empty() {
            return Err(CompileError::UnknownRelation {
                source_type: join_types(left),
                relation: relation.map(str::to_string),
                target_type: join_types(right),
            });
        }
        Ok(bindings)
    }

    // ------------------------------------------------------------------------
    // Vector operations
    // ------------------------------------------------------------------------

    /// Index choice for a nearest-neighbor step over `types`.
    fn vector_index(&self, types: &BTreeSet<String>, n: f64) -> (IndexHint, f64) {
        let indexed = !types.is_empty()
            && n > self.config.compiler.ann_threshold as f64
            && types.iter().all(|t| self.snapshot.has_ann(t));
        if indexed {
            let oversample = self.config.executor.ann_oversample.max(1) as f64;
            (IndexHint::Ann, n.max(2.0).log2() * oversample)
        } else {
            (IndexHint::BruteForce, n.max(1.0))
        }
    }

    fn similarity(
        &mut self,
        s: &Similarity,
        pushed: &[Comparison],
    ) -> Result<Compiled, CompileError> {
        let target = self.node(&s.target)?;
        let types = match &s.target_type {
            Some(t) => {
                self.check_type(t)?;
                self.seen_types.insert(t.clone());
                BTreeSet::from([t.clone()])
            }
            None => target.types.clone(),
        };
        let max_distance = s.distance.unwrap_or(self.config.compiler.default_distance);
        if !(0.0..=2.0).contains(&max_distance) {
            return Err(CompileError::InvalidParameter {
                name: "distance".into(),
                message: format!("{max_distance} is outside [0, 2]"),
            });
        }
        let n = self.population(&types);

        let mut inputs = vec![target.var];
        let (hint, cost) = if pushed.is_empty() {
            self.vector_index(&types, n)
        } else {
            let mut candidates = self.scan(types.clone());
            for c in pushed {
                candidates = self.filter(candidates, c);
            }
            let cost = candidates.rows.max(1.0);
            inputs.push(candidates.var);
            (IndexHint::BruteForce, cost)
        };

        let spread = (n * max_distance / 2.0).max(1.0).min(n);
        let rows = s.top_k.map_or(spread, |k| spread.min(k as f64));
        let var = self.emit(
            OpKind::Similarity {
                max_distance: max_distance as f32,
                top_k: s.top_k,
                target_types: types.iter().cloned().collect(),
            },
            inputs,
            cost,
            rows,
            hint,
        );
        Ok(Compiled { var, types, rows })
    }

    fn analogy(&mut self, a: &Analogy) -> Result<Compiled, CompileError> {
        let mut branches = Vec::with_capacity(3);
        let mut parts = Vec::with_capacity(3);
        for q in [&a.a, &a.b, &a.c] {
            let start = self.ops.len();
            parts.push(self.node(q)?);
            branches.push(start..self.ops.len());
        }
        self.mark_parallel(&branches);

        let target_type = match &a.target_type {
            Some(t) => {
                self.check_type(t)?;
                t.clone()
            }
            None => match parts[1].types.iter().collect::<Vec<_>>().as_slice() {
                [single] => (*single).clone(),
                _ => {
                    let types = if parts[1].types.is_empty() {
                        self.snapshot.entity_types().map(str::to_string).collect()
                    } else {
                        parts[1].types.iter().cloned().collect()
                    };
                    return Err(CompileError::AmbiguousTargetType { types });
                }
            },
        };
        self.seen_types.insert(target_type.clone());

        let types = BTreeSet::from([target_type.clone()]);
        let (hint, cost) = self.vector_index(&types, self.population(&types));
        let top_k = self.config.compiler.analogy_top_k.max(1);
        let var = self.emit(
            OpKind::Analogy { target_type, top_k },
            parts.into_iter().map(|p| p.var).collect(),
            cost,
            top_k as f64,
            hint,
        );
        Ok(Compiled {
            var,
            types,
            rows: top_k as f64,
        })
    }

    // ------------------------------------------------------------------------
    // Optimization
    // ------------------------------------------------------------------------

    fn optimization(&mut self, o: &Optimization) -> Result<Compiled, CompileError> {
        for term in &o.objective.terms {
            if is_pseudo_field(&term.field) {
                return Err(CompileError::InvalidParameter {
                    name: term.field.clone(),
                    message: "objective terms must be numeric metadata fields".into(),
                });
            }
            self.check_field(&term.field)?;
            if !term.weight.is_finite() {
                return Err(CompileError::InvalidParameter {
                    name: term.field.clone(),
                    message: format!("weight {} is not finite", term.weight),
                });
            }
        }

        let mut filters = Vec::new();
        let mut budgets = Vec::new();
        for c in &o.constraints {
            self.check_field(&c.field)?;
            match (c.op, &c.value) {
                (CmpOp::Le | CmpOp::Lt, Literal::Number(limit)) if !is_pseudo_field(&c.field) => {
                    budgets.push(Budget {
                        field: c.field.clone(),
                        limit: *limit,
                        strict: c.op == CmpOp::Lt,
                    });
                }
                _ => filters.push(c.clone()),
            }
        }

        let candidates = self.scan(self.seen_types.clone());
        let k = (o.objective.terms.len() + o.constraints.len()).max(1) as f64;
        let n = candidates.rows;
        let exact = n <= self.config.executor.optimize_exact_threshold as f64;
        if !budgets.is_empty() {
            self.optimizations.push(format!(
                "optimize: {} solver over ~{n:.0} candidates",
                if exact { "exact" } else { "greedy" }
            ));
        }
        let rows = (n * 0.5).max(1.0).min(n);
        let var = self.emit(
            OpKind::Optimize {
                direction: o.direction,
                objective: o.objective.clone(),
                filters,
                budgets,
            },
            vec![candidates.var],
            (n * k).max(1.0),
            rows,
            IndexHint::Metadata,
        );
        Ok(Compiled {
            var,
            types: candidates.types,
            rows,
        })
    }
}

fn intersect_types(a: &BTreeSet<String>, b: &BTreeSet<String>) -> BTreeSet<String> {
    match (a.is_empty(), b.is_empty()) {
        (true, _) => b.clone(),
        (_, true) => a.clone(),
        _ => a.intersection(b).cloned().collect(),
    }
}

fn reads_seen_types(query: &Query) -> bool {
    match query {
        Query::Comparison(_) | Query::Optimization(_) => true,
        Query::Logical(l) if l.op == LogicalOp::Not => true,
        other => other.children().into_iter().any(reads_seen_types),
    }
}

fn join_types(types: &BTreeSet<String>) -> String {
    types.iter().cloned().collect::<Vec<_>>().join("|")
}
