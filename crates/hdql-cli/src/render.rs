//! Result presentation: colored text for terminals, JSON and CBOR for tools.

use anyhow::{anyhow, Result};
use clap::ValueEnum;
use colored::Colorize;
use hdql_engine::{
    AnalysisResult, MatchResult, QueryResult, ReasoningTrace, RecommendationResult, Severity,
};
use std::fmt::Write as _;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
    Cbor,
}

/// Encode `result` in `format`. Text is terminated by a newline.
pub fn encode(result: &QueryResult, format: OutputFormat) -> Result<Vec<u8>> {
    match format {
        OutputFormat::Text => Ok(text(result).into_bytes()),
        OutputFormat::Json => {
            let mut bytes = serde_json::to_vec_pretty(result)?;
            bytes.push(b'\n');
            Ok(bytes)
        }
        OutputFormat::Cbor => {
            let mut bytes = Vec::new();
            ciborium::into_writer(result, &mut bytes)
                .map_err(|e| anyhow!("failed to encode CBOR: {e}"))?;
            Ok(bytes)
        }
    }
}

pub fn text(result: &QueryResult) -> String {
    let mut out = String::new();
    match result {
        QueryResult::Match(r) => match_text(&mut out, r),
        QueryResult::Recommendation(r) => recommendation_text(&mut out, r),
        QueryResult::Analysis(r) => analysis_text(&mut out, r),
    }
    trace_text(&mut out, result.trace());
    let _ = writeln!(
        out,
        "{}",
        format!("({:.2} ms)", result.execution_time_ms()).dimmed()
    );
    out
}

fn match_text(out: &mut String, r: &MatchResult) {
    let _ = writeln!(out, "{} {}", "query:".bold(), r.query);
    if r.matches.is_empty() {
        let _ = writeln!(out, "{}", "no matches".yellow());
        return;
    }
    for (i, m) in r.matches.iter().enumerate() {
        let _ = writeln!(
            out,
            "{:>3}. {:<32} score {:.3}  {}",
            i + 1,
            m.entity.to_string().cyan(),
            m.score,
            m.explanation.dimmed()
        );
    }
    let _ = writeln!(
        out,
        "{} match(es), mean confidence {:.3}",
        r.matches.len(),
        r.mean_confidence
    );
}

fn recommendation_text(out: &mut String, r: &RecommendationResult) {
    let _ = writeln!(out, "{} {}", "query:".bold(), r.query);
    if !r.feasible {
        let _ = writeln!(
            out,
            "{}",
            "constraints were relaxed; see warnings".yellow().bold()
        );
    }
    for rec in &r.recommendations {
        let metrics: Vec<String> = rec
            .metrics
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        let _ = writeln!(
            out,
            "{:>3}. {:<32} {}  [{}]",
            rec.rank,
            rec.entity.to_string().cyan(),
            rec.rationale,
            metrics.join(", ")
        );
    }
    let _ = writeln!(
        out,
        "{} {:.3} ({} solver)",
        "objective:".bold(),
        r.objective_value,
        r.solver
    );
    let _ = writeln!(out, "{} {}", "trade-offs:".bold(), r.trade_offs.summary);
    if !r.trade_offs.pareto_frontier.is_empty() {
        let frontier: Vec<String> = r
            .trade_offs
            .pareto_frontier
            .iter()
            .map(ToString::to_string)
            .collect();
        let _ = writeln!(
            out,
            "  pareto frontier over {}: {}",
            r.trade_offs.dimensions.join(" "),
            frontier.join(", ")
        );
    }
    if !r.alternatives.is_empty() {
        let _ = writeln!(out, "{}", "alternatives:".bold());
        for alt in &r.alternatives {
            let _ = writeln!(
                out,
                "  - {} ({:.3}): {}",
                alt.entity, alt.objective, alt.trade_off
            );
        }
    }
}

fn analysis_text(out: &mut String, r: &AnalysisResult) {
    let _ = writeln!(out, "{} {}", "query:".bold(), r.query);
    let _ = writeln!(out, "{}", "metrics:".bold());
    for (name, value) in &r.metrics {
        let _ = writeln!(out, "  {name:<16} {value:.3}");
    }
    if !r.gaps.is_empty() {
        let _ = writeln!(out, "{}", "gaps:".bold());
        for gap in &r.gaps {
            let severity = format!("{:?}", gap.severity).to_lowercase();
            let severity = match gap.severity {
                Severity::Critical => severity.red().bold(),
                Severity::High => severity.red(),
                Severity::Medium => severity.yellow(),
                Severity::Low => severity.normal(),
            };
            let _ = writeln!(out, "  [{severity}] {}: {}", gap.entity, gap.description);
        }
    }
    if !r.opportunities.is_empty() {
        let _ = writeln!(out, "{}", "opportunities:".bold());
        for (i, o) in r.opportunities.iter().enumerate() {
            let _ = writeln!(out, "{:>3}. roi {:.2}  {}", i + 1, o.roi, o.description);
        }
    }
    for insight in &r.insights {
        let _ = writeln!(out, "{} {insight}", "*".green());
    }
}

pub fn trace_text(out: &mut String, trace: &ReasoningTrace) {
    if trace.steps.is_empty() && trace.notes.is_empty() && trace.warnings.is_empty() {
        return;
    }
    let _ = writeln!(out, "{}", "trace:".bold());
    for step in &trace.steps {
        let _ = writeln!(out, "  {step}");
    }
    for note in &trace.notes {
        let _ = writeln!(out, "  {} {note}", "note:".blue());
    }
    for warning in &trace.warnings {
        let _ = writeln!(out, "  {} {warning}", "warning:".yellow().bold());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hdql_engine::{EntityMatch, EntitySummary};

    fn result() -> QueryResult {
        QueryResult::Match(MatchResult {
            query: "command(\"deps\")".into(),
            matches: vec![EntityMatch {
                entity: EntitySummary {
                    entity_type: "command".into(),
                    id: "deps".into(),
                    display_name: String::new(),
                    metadata: Default::default(),
                },
                score: 1.0,
                distance: 0.0,
                confidence: 1.0,
                explanation: "exact identifier match".into(),
            }],
            mean_confidence: 1.0,
            trace: ReasoningTrace {
                notes: vec!["not found: command(\"x\")".into()],
                ..Default::default()
            },
            execution_time_ms: 0.5,
        })
    }

    #[test]
    fn text_lists_matches_and_notes() {
        colored::control::set_override(false);
        let text = text(&result());
        assert!(text.contains("command(\"deps\")"));
        assert!(text.contains("score 1.000"));
        assert!(text.contains("note: not found"));
    }

    #[test]
    fn json_is_tagged() {
        let bytes = encode(&result(), OutputFormat::Json).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["kind"], "match");
        assert_eq!(value["matches"][0]["entity"]["id"], "deps");
    }

    #[test]
    fn cbor_decodes_back() {
        let bytes = encode(&result(), OutputFormat::Cbor).unwrap();
        let back: QueryResult = ciborium::from_reader(bytes.as_slice()).unwrap();
        assert_eq!(back, result());
    }
}
