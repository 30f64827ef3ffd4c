//! Query results.
//!
//! Results own copies of everything they report; nothing here borrows from
//! the snapshot a query ran against. All shapes serialize with serde for the
//! presentation layer (JSON, CBOR, ...).

use hdql_store::{Entity, MetaValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// One executed plan operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceStep {
    pub step: usize,
    pub operation: String,
    pub output: String,
    pub result_size: usize,
    pub elapsed_us: u64,
}

impl fmt::Display for TraceStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}. {} = {} -> {} entities ({} us)",
            self.step, self.output, self.operation, self.result_size, self.elapsed_us
        )
    }
}

/// Ordered, human-readable account of how a result was produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReasoningTrace {
    pub steps: Vec<TraceStep>,
    /// Non-fatal observations, e.g. identifiers that matched nothing.
    pub notes: Vec<String>,
    pub warnings: Vec<String>,
}

impl ReasoningTrace {
    pub fn lines(&self) -> Vec<String> {
        let mut out: Vec<String> = self.steps.iter().map(ToString::to_string).collect();
        out.extend(self.notes.iter().map(|n| format!("note: {n}")));
        out.extend(self.warnings.iter().map(|w| format!("warning: {w}")));
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySummary {
    pub entity_type: String,
    pub id: String,
    pub display_name: String,
    pub metadata: BTreeMap<String, MetaValue>,
}

impl From<&Entity> for EntitySummary {
    fn from(e: &Entity) -> Self {
        Self {
            entity_type: e.entity_type.clone(),
            id: e.id.clone(),
            display_name: e.display_name.clone(),
            metadata: e.metadata.clone(),
        }
    }
}

impl fmt::Display for EntitySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(\"{}\")", self.entity_type, self.id)
    }
}

// ============================================================================
// Match results
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMatch {
    pub entity: EntitySummary,
    pub score: f32,
    /// `1 - score`, the cosine distance for similarity-derived scores.
    pub distance: f32,
    /// `score` clamped to `[0, 1]`.
    pub confidence: f32,
    pub explanation: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub query: String,
    pub matches: Vec<EntityMatch>,
    pub mean_confidence: f32,
    pub trace: ReasoningTrace,
    pub execution_time_ms: f64,
}

impl MatchResult {
    pub fn len(&self) -> usize {
        self.matches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }

    /// `(type, id, score)` triples; handy for comparing runs.
    pub fn ranking(&self) -> Vec<(String, String, f32)> {
        self.matches
            .iter()
            .map(|m| (m.entity.entity_type.clone(), m.entity.id.clone(), m.score))
            .collect()
    }
}

// ============================================================================
// Recommendation results
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub rank: usize,
    pub entity: EntitySummary,
    pub objective: f64,
    pub rationale: String,
    pub metrics: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alternative {
    pub entity: EntitySummary,
    pub objective: f64,
    pub trade_off: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetUsage {
    pub field: String,
    pub limit: f64,
    pub strict: bool,
    pub used: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeOffAnalysis {
    pub summary: String,
    /// Fields the frontier was computed over, with `+` for maximized and `-`
    /// for minimized dimensions.
    pub dimensions: Vec<String>,
    pub pareto_frontier: Vec<EntitySummary>,
    pub dominated: Vec<EntitySummary>,
    pub budgets: Vec<BudgetUsage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendationResult {
    pub query: String,
    pub recommendations: Vec<Recommendation>,
    pub trade_offs: TradeOffAnalysis,
    pub alternatives: Vec<Alternative>,
    pub objective_value: f64,
    pub feasible: bool,
    pub solver: String,
    pub trace: ReasoningTrace,
    pub execution_time_ms: f64,
}

impl RecommendationResult {
    pub fn selected_ids(&self) -> Vec<String> {
        self.recommendations
            .iter()
            .map(|r| r.entity.id.clone())
            .collect()
    }
}

// ============================================================================
// Analysis results
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Severity of a gap whose best supporting score is `best`, relative to
    /// the acceptance threshold.
    pub fn from_support(best: f32, threshold: f32) -> Self {
        let ratio = if threshold > 0.0 { best / threshold } else { 1.0 };
        if ratio < 0.25 {
            Severity::Critical
        } else if ratio < 0.5 {
            Severity::High
        } else if ratio < 0.75 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gap {
    pub gap_type: String,
    pub entity: EntitySummary,
    pub description: String,
    pub severity: Severity,
    pub best_score: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub entity: EntitySummary,
    pub description: String,
    pub value: f64,
    pub effort: f64,
    pub roi: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub query: String,
    pub metrics: BTreeMap<String, f64>,
    pub gaps: Vec<Gap>,
    pub opportunities: Vec<Opportunity>,
    pub insights: Vec<String>,
    pub trace: ReasoningTrace,
    pub execution_time_ms: f64,
}

// ============================================================================
// Envelope
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueryResult {
    Match(MatchResult),
    Recommendation(RecommendationResult),
    Analysis(AnalysisResult),
}

impl QueryResult {
    pub fn trace(&self) -> &ReasoningTrace {
        match self {
            QueryResult::Match(r) => &r.trace,
            QueryResult::Recommendation(r) => &r.trace,
            QueryResult::Analysis(r) => &r.trace,
        }
    }

    pub fn execution_time_ms(&self) -> f64 {
        match self {
            QueryResult::Match(r) => r.execution_time_ms,
            QueryResult::Recommendation(r) => r.execution_time_ms,
            QueryResult::Analysis(r) => r.execution_time_ms,
        }
    }

    /// One-line description for logs and the REPL status line.
    pub fn summary(&self) -> String {
        match self {
            QueryResult::Match(r) => format!(
                "{} match(es), mean confidence {:.3}",
                r.matches.len(),
                r.mean_confidence
            ),
            QueryResult::Recommendation(r) => format!(
                "{} recommendation(s), objective {:.3}{}",
                r.recommendations.len(),
                r.objective_value,
                if r.feasible { "" } else { " (relaxed)" }
            ),
            QueryResult::Analysis(r) => format!(
                "{} gap(s), {} opportunit(ies)",
                r.gaps.len(),
                r.opportunities.len()
            ),
        }
    }

    pub fn as_match(&self) -> Option<&MatchResult> {
        match self {
            QueryResult::Match(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_recommendation(&self) -> Option<&RecommendationResult> {
        match self {
            QueryResult::Recommendation(r) => Some(r),
            _ => None,
        }
    }
}
