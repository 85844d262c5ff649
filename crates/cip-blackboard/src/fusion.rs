use cip_core::{Alternative, BlackboardState, FailurePattern, ProbeReport, Recommendation};
use std::collections::HashMap;

const EPSILON: f64 = 1e-6;

/// Collapse a blackboard snapshot into a ranked failure model. Returns
/// `None` when no suspects were ever seeded.
pub fn fuse(snapshot: &BlackboardState) -> Option<FailurePattern> {
    let mut ranked = snapshot.suspects.clone();
    ranked.sort_by(|a, b| {
        b.suspicion
            .partial_cmp(&a.suspicion)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.hop.cmp(&b.hop))
            .then_with(|| a.id.cmp(&b.id))
    });
    let primary = ranked.first()?;

    let alternatives: Vec<Alternative> = ranked
        .iter()
        .skip(1)
        .take(3)
        .map(|suspect| Alternative {
            span: suspect.span.clone(),
            why: top_observation(&snapshot.reports, &suspect.id)
                .unwrap_or_else(|| format!("suspicion {:.2}", suspect.suspicion)),
        })
        .collect();

    let mut invariants = snapshot.invariants.clone();
    for report in &snapshot.reports {
        if report.recommendation == Recommendation::LikelyCause
            && let Some(confirmed) = report.observations.get("invariant").and_then(|v| v.as_str())
            && !invariants.iter().any(|known| known == confirmed)
        {
            invariants.push(confirmed.to_string());
        }
    }

    let gain_all: f64 = snapshot.reports.iter().map(|r| r.info_gain).sum();
    let gain_likely: f64 = snapshot
        .reports
        .iter()
        .filter(|r| r.recommendation == Recommendation::LikelyCause)
        .map(|r| r.info_gain)
        .sum();
    let confidence = (gain_likely / (gain_all + EPSILON)).clamp(0.0, 1.0);

    let subject = primary
        .span
        .symbol
        .clone()
        .unwrap_or_else(|| format!("{}:{}", primary.span.file, primary.span.start_line));
    let summary = format!(
        "suspected fault in {subject}; dominant observation: {}",
        dominant_observation_kind(&snapshot.reports).unwrap_or_else(|| "none".to_string())
    );

    let assumptions_to_check = collect_strings(&snapshot.reports, "assumption");
    let temporary_props = collect_strings(&snapshot.reports, "prop");

    Some(FailurePattern {
        summary,
        primary_location: primary.span.clone(),
        alternatives,
        invariants,
        confidence,
        assumptions_to_check,
        temporary_props,
    })
}

/// One-line justification drawn from the first observation attached to
/// the suspect's reports.
fn top_observation(reports: &[ProbeReport], suspect_id: &str) -> Option<String> {
    reports
        .iter()
        .filter(|r| r.suspect_id == suspect_id)
        .flat_map(|r| r.observations.iter())
        .next()
        .map(|(key, value)| match value.as_str() {
            Some(text) => format!("{key}: {text}"),
            None => format!("{key}: {value}"),
        })
}

fn dominant_observation_kind(reports: &[ProbeReport]) -> Option<String> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for report in reports {
        for key in report.observations.keys() {
            *counts.entry(key.as_str()).or_default() += 1;
        }
    }
    counts
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(a.0)))
        .map(|(kind, _)| kind.to_string())
}

fn collect_strings(reports: &[ProbeReport], key: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for report in reports {
        if let Some(text) = report.observations.get(key).and_then(|v| v.as_str())
            && !out.iter().any(|known| known == text)
        {
            out.push(text.to_string());
        }
    }
    out
}
