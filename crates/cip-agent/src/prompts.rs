//! Prompt templates for the external completion stages. Each render
//! helper substitutes the named placeholders; templates stay embedded so
//! runs have no prompt files to locate.

pub const RECALL_PROMPT: &str = "\
You are localizing the fault behind failing tests in a Python repository.
Instance: {instance_id}
Failing tests:
{failing_tests}
Known symbols:
{symbol_hints}

Respond with JSON only: a list of candidates, each
{\"id\", \"hypothesis\", \"spans\": [{\"file\", \"start_line\", \"end_line\", \"node_type\", \"symbol\"}], \"evidence\": {}}.
Use repo-relative paths and 1-based line numbers.";

pub const PROBE_PROMPT: &str = "\
You are probing one fault candidate.
Instance: {instance_id}
Candidate: {candidate_id}
Hypothesis: {hypothesis}

Respond with JSON only: {\"notes\": str, \"assumptions\": [str]}.";

pub const SYNTHESIZE_PROMPT: &str = "\
Combine the candidate hypotheses below into one understanding of the fault.
Hypotheses:
{hypotheses}

Respond with JSON only: {\"summary\": str, \"invariants\": [str], \"dependencies\": [str]}.";

pub const PLAN_PROMPT: &str = "\
Derive minimal repair steps from this understanding of the fault.
Summary: {summary}
Invariants:
{invariants}

Respond with JSON only: a list of steps, each
{\"id\", \"intent\", \"target_spans\": [{\"file\", \"start_line\", \"end_line\", \"node_type\"}], \"constraints\": [str], \"ideal_outcome\": str, \"check\": \"tests\"}.
Keep edits small and scoped to the spans.";

pub const LANDMARK_PROMPT: &str = "\
Derive repair landmarks from this fused failure model.
Summary: {summary}
Primary location: {primary}
Confidence: {confidence}
Invariants:
{invariants}

Respond with JSON only: a list of landmarks, each
{\"id\", \"intent\", \"target_spans\": [{\"file\", \"start_line\", \"end_line\", \"node_type\"}], \"constraints\": [str], \"landmark_test\": str, \"rollback_on\": [str], \"risk\": str, \"confidence\": float}.";

pub const PROPOSE_PROMPT: &str = "\
Produce up to {k} unified diff candidates for this repair step.
Intent: {intent}
Constraints:
{constraints}
Numbered context:
{context}

Respond with JSON only: a list of
{\"step_id\", \"unified_diff\", \"rationale\"}.
Each diff must start with 'diff --git', use the numbered lines for hunk
positions, and change as few lines as possible.";

pub fn render(template: &str, substitutions: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (key, value) in substitutions {
        out = out.replace(&format!("{{{key}}}"), value);
    }
    out
}
