use crate::prompts;
use anyhow::Result;
use cip_core::{AgentError, DiffProposal, PlanStep};
use cip_llm::CompletionClient;

/// Ask the proposer for up to `k` unified diff candidates for one step.
/// `context` carries the numbered slice per target file.
pub fn propose(
    step: &PlanStep,
    context: &[(String, String)],
    k: usize,
    llm: &dyn CompletionClient,
) -> Result<Vec<DiffProposal>> {
    let mut context_block = String::new();
    for (file, window) in context {
        context_block.push_str(&format!("FILE: {file}\n{window}\n"));
    }
    let constraints = step
        .constraints
        .iter()
        .map(|c| format!("- {c}"))
        .collect::<Vec<_>>()
        .join("\n");
    let k_text = k.to_string();
    let prompt = prompts::render(prompts::PROPOSE_PROMPT, &[
        ("k", k_text.as_str()),
        ("intent", step.intent.as_str()),
        ("constraints", constraints.as_str()),
        ("context", context_block.as_str()),
    ]);
    let response = llm.complete(&prompt)?;
    let mut proposals: Vec<DiffProposal> = serde_json::from_str(&response)
        .map_err(|e| AgentError::External(format!("propose stage returned malformed JSON: {e}")))?;
    proposals.truncate(k);
    for proposal in &mut proposals {
        if proposal.step_id.is_empty() {
            proposal.step_id = step.id.clone();
        }
    }
    Ok(proposals)
}
