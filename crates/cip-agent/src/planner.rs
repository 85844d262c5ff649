use crate::prompts;
use anyhow::Result;
use cip_core::{AgentError, Candidate, CheckKind, FailurePattern, Landmark, PlanStep, Understanding};
use cip_llm::CompletionClient;

/// Combine enriched candidates into one structured understanding.
pub fn synthesize(candidates: &[Candidate], llm: &dyn CompletionClient) -> Result<Understanding> {
    let hypotheses = candidates
        .iter()
        .map(|c| format!("- {}", c.hypothesis))
        .collect::<Vec<_>>()
        .join("\n");
    let prompt = prompts::render(prompts::SYNTHESIZE_PROMPT, &[("hypotheses", hypotheses.as_str())]);
    let response = llm.complete(&prompt)?;
    let understanding: Understanding = serde_json::from_str(&response)
        .map_err(|e| AgentError::External(format!("synthesize stage returned malformed JSON: {e}")))?;
    Ok(understanding)
}

/// Ask the planner for plain repair steps, truncated to `max_steps`.
pub fn plan_steps(
    understanding: &Understanding,
    max_steps: usize,
    llm: &dyn CompletionClient,
) -> Result<Vec<PlanStep>> {
    let invariants = understanding
        .invariants
        .iter()
        .map(|i| format!("- {i}"))
        .collect::<Vec<_>>()
        .join("\n");
    let prompt = prompts::render(prompts::PLAN_PROMPT, &[
        ("summary", understanding.summary.as_str()),
        ("invariants", invariants.as_str()),
    ]);
    let response = llm.complete(&prompt)?;
    let mut steps: Vec<PlanStep> = serde_json::from_str(&response)
        .map_err(|e| AgentError::External(format!("plan stage returned malformed JSON: {e}")))?;
    steps.truncate(max_steps);
    for (idx, step) in steps.iter_mut().enumerate() {
        if step.id.is_empty() {
            step.id = format!("step-{}", idx + 1);
        }
    }
    Ok(steps)
}

/// Landmark planning path: derive annotated landmarks from the fused
/// failure model.
pub fn plan_landmarks(
    pattern: &FailurePattern,
    max_landmarks: usize,
    llm: &dyn CompletionClient,
) -> Result<Vec<Landmark>> {
    let invariants = pattern
        .invariants
        .iter()
        .map(|i| format!("- {i}"))
        .collect::<Vec<_>>()
        .join("\n");
    let primary = format!(
        "{}:{}-{}",
        pattern.primary_location.file, pattern.primary_location.start_line, pattern.primary_location.end_line
    );
    let confidence = format!("{:.2}", pattern.confidence);
    let prompt = prompts::render(prompts::LANDMARK_PROMPT, &[
        ("summary", pattern.summary.as_str()),
        ("primary", primary.as_str()),
        ("confidence", confidence.as_str()),
        ("invariants", invariants.as_str()),
    ]);
    let response = llm.complete(&prompt)?;
    let mut landmarks: Vec<Landmark> = serde_json::from_str(&response)
        .map_err(|e| AgentError::External(format!("landmark stage returned malformed JSON: {e}")))?;
    landmarks.truncate(max_landmarks);
    for (idx, landmark) in landmarks.iter_mut().enumerate() {
        if landmark.id.is_empty() {
            landmark.id = format!("landmark-{}", idx + 1);
        }
    }
    Ok(landmarks)
}

/// Lower landmarks onto executable plan steps. The landmark test and
/// rollback triggers travel along as constraints so the executor's logs
/// can surface them.
pub fn landmarks_to_steps(landmarks: &[Landmark]) -> Vec<PlanStep> {
    landmarks
        .iter()
        .map(|landmark| {
            let mut constraints = landmark.constraints.clone();
            if !landmark.landmark_test.is_empty() {
                constraints.push(format!("verify with: {}", landmark.landmark_test));
            }
            for trigger in &landmark.rollback_on {
                constraints.push(format!("roll back on: {trigger}"));
            }
            PlanStep {
                id: landmark.id.clone(),
                intent: landmark.intent.clone(),
                target_spans: landmark.target_spans.clone(),
                constraints,
                ideal_outcome: landmark.landmark_test.clone(),
                check: CheckKind::Tests,
            }
        })
        .collect()
}
