//! Typed AST for HDQL queries.
//!
//! The AST is a closed sum type: every consumer matches exhaustively, so a new
//! query shape is a compile error everywhere it is not yet handled.
//!
//! `Display` renders the canonical surface form. Every compound node is fully
//! parenthesised so that printing and re-parsing yields an equal AST.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Query {
    Atomic(Atomic),
    Relational(Relational),
    Logical(Logical),
    Comparison(Comparison),
    Similarity(Similarity),
    Analogy(Analogy),
    Optimization(Optimization),
}

impl Query {
    pub fn kind(&self) -> &'static str {
        match self {
            Query::Atomic(_) => "atomic",
            Query::Relational(_) => "relational",
            Query::Logical(_) => "logical",
            Query::Comparison(_) => "comparison",
            Query::Similarity(_) => "similarity",
            Query::Analogy(_) => "analogy",
            Query::Optimization(_) => "optimization",
        }
    }

    /// Direct children, left to right.
    pub fn children(&self) -> Vec<&Query> {
        match self {
            Query::Atomic(_) | Query::Comparison(_) | Query::Optimization(_) => Vec::new(),
            Query::Relational(r) => vec![&r.left, &r.right],
            Query::Logical(l) => l.operands.iter().collect(),
            Query::Similarity(s) => vec![&s.target],
            Query::Analogy(a) => vec![&a.a, &a.b, &a.c],
        }
    }
}

/// `type("id")`, `type("*")`, `type("dep*")`, `type("dpes"~)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Atomic {
    pub entity_type: String,
    pub identifier: String,
    pub fuzzy: bool,
}

impl Atomic {
    pub const WILDCARD: &'static str = "*";

    pub fn is_wildcard(&self) -> bool {
        self.identifier == Self::WILDCARD
    }

    /// Glob characters inside an otherwise literal identifier.
    pub fn is_glob(&self) -> bool {
        !self.is_wildcard() && self.identifier.contains(['*', '?'])
    }
}

/// `left -> right` or `left -[relation]-> right`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relational {
    pub left: Box<Query>,
    pub relation: Option<String>,
    pub right: Box<Query>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogicalOp {
    And,
    Or,
    Not,
}

impl fmt::Display for LogicalOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogicalOp::And => "AND",
            LogicalOp::Or => "OR",
            LogicalOp::Not => "NOT",
        })
    }
}

/// `NOT` has exactly one operand; `AND`/`OR` have two or more.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Logical {
    pub op: LogicalOp,
    pub operands: Vec<Query>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CmpOp {
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
}

impl CmpOp {
    pub fn as_str(self) -> &'static str {
        match self {
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
        }
    }

    pub fn holds(self, ordering: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::*;
        match self {
            CmpOp::Lt => ordering == Less,
            CmpOp::Le => ordering != Greater,
            CmpOp::Gt => ordering == Greater,
            CmpOp::Ge => ordering != Less,
            CmpOp::Eq => ordering == Equal,
            CmpOp::Ne => ordering != Equal,
        }
    }
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Literal {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Bool(b) => write!(f, "{b}"),
            Literal::Number(n) => write!(f, "{n}"),
            Literal::Text(s) => write_quoted(f, s),
        }
    }
}

/// `field op literal`, a metadata filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    pub field: String,
    pub op: CmpOp,
    pub value: Literal,
}

/// `similar_to(target, distance=0.2, top_k=5, type="job")`.
///
/// `distance` and `top_k` are optional; the compiler fills in configured
/// defaults. `target_type` searches another type's space instead of the
/// target's own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Similarity {
    pub target: Box<Query>,
    pub distance: Option<f64>,
    pub top_k: Option<usize>,
    pub target_type: Option<String>,
}

/// `a is_to b as c is_to ?` or `... is_to feature(?)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analogy {
    pub a: Box<Query>,
    pub b: Box<Query>,
    pub c: Box<Query>,
    pub target_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Maximize,
    Minimize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectiveTerm {
    pub field: String,
    pub weight: f64,
}

/// A weighted linear objective over numeric metadata fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Objective {
    pub terms: Vec<ObjectiveTerm>,
}

/// `maximize(objective) subject_to(constraint, ...)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Optimization {
    pub direction: Direction,
    pub objective: Objective,
    pub constraints: Vec<Comparison>,
}

// ============================================================================
// Canonical printing
// ============================================================================

fn write_quoted(f: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
    f.write_str("\"")?;
    for c in s.chars() {
        match c {
            '"' => f.write_str("\\\"")?,
            '\\' => f.write_str("\\\\")?,
            '\n' => f.write_str("\\n")?,
            '\t' => f.write_str("\\t")?,
            c => write!(f, "{c}")?,
        }
    }
    f.write_str("\"")
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Query::Atomic(a) => a.fmt(f),
            Query::Relational(r) => r.fmt(f),
            Query::Logical(l) => l.fmt(f),
            Query::Comparison(c) => c.fmt(f),
            Query::Similarity(s) => s.fmt(f),
            Query::Analogy(a) => a.fmt(f),
            Query::Optimization(o) => o.fmt(f),
        }
    }
}

impl fmt::Display for Atomic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.entity_type)?;
        write_quoted(f, &self.identifier)?;
        if self.fuzzy {
            f.write_str("~")?;
        }
        f.write_str(")")
    }
}

impl fmt::Display for Relational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.relation {
            Some(rel) => write!(f, "({} -[{rel}]-> {})", self.left, self.right),
            None => write!(f, "({} -> {})", self.left, self.right),
        }
    }
}

impl fmt::Display for Logical {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        if self.op == LogicalOp::Not {
            f.write_str("NOT ")?;
            for operand in &self.operands {
                operand.fmt(f)?;
            }
        } else {
            for (i, operand) in self.operands.iter().enumerate() {
                if i > 0 {
                    write!(f, " {} ", self.op)?;
                }
                operand.fmt(f)?;
            }
        }
        f.write_str(")")
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.field, self.op, self.value)
    }
}

impl fmt::Display for Similarity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "similar_to({}", self.target)?;
        if let Some(d) = self.distance {
            write!(f, ", distance={d}")?;
        }
        if let Some(k) = self.top_k {
            write!(f, ", top_k={k}")?;
        }
        if let Some(t) = &self.target_type {
            f.write_str(", type=")?;
            write_quoted(f, t)?;
        }
        f.write_str(")")
    }
}

impl fmt::Display for Analogy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({} is_to {} as {} is_to ", self.a, self.b, self.c)?;
        match &self.target_type {
            Some(t) => write!(f, "{t}(?))"),
            None => f.write_str("?)"),
        }
    }
}

impl fmt::Display for Objective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, term) in self.terms.iter().enumerate() {
            let magnitude = term.weight.abs();
            let negative = term.weight.is_sign_negative();
            match (i, negative) {
                (0, false) => {}
                (0, true) => f.write_str("-")?,
                (_, false) => f.write_str(" + ")?,
                (_, true) => f.write_str(" - ")?,
            }
            if magnitude == 1.0 {
                f.write_str(&term.field)?;
            } else {
                write!(f, "{magnitude} * {}", term.field)?;
            }
        }
        Ok(())
    }
}

impl fmt::Display for Optimization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.direction {
            Direction::Maximize => "maximize",
            Direction::Minimize => "minimize",
        };
        write!(f, "{name}({})", self.objective)?;
        if !self.constraints.is_empty() {
            f.write_str(" subject_to(")?;
            for (i, c) in self.constraints.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                c.fmt(f)?;
            }
            f.write_str(")")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_prints_quoted_with_fuzzy_marker() {
        let q = Query::Atomic(Atomic {
            entity_type: "command".into(),
            identifier: "de\"ps".into(),
            fuzzy: true,
        });
        assert_eq!(q.to_string(), r#"command("de\"ps"~)"#);
    }

    #[test]
    fn objective_signs() {
        let o = Objective {
            terms: vec![
                ObjectiveTerm {
                    field: "coverage".into(),
                    weight: 1.0,
                },
                ObjectiveTerm {
                    field: "effort".into(),
                    weight: -0.3,
                },
            ],
        };
        assert_eq!(o.to_string(), "coverage - 0.3 * effort");
    }

    #[test]
    fn cmp_op_semantics() {
        use std::cmp::Ordering;
        assert!(CmpOp::Le.holds(Ordering::Equal));
        assert!(!CmpOp::Lt.holds(Ordering::Equal));
        assert!(CmpOp::Ne.holds(Ordering::Less));
    }
}
