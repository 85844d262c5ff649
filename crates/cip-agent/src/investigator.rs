use crate::prompts;
use anyhow::Result;
use cip_core::{AgentError, Candidate, TaskContext};
use cip_index::AstIndex;
use cip_llm::CompletionClient;
use serde::Deserialize;

/// Recall output arrives either as a bare list or wrapped in a
/// `candidates` object; anything else is rejected whole.
#[derive(Deserialize)]
#[serde(untagged)]
enum RecallPayload {
    List(Vec<Candidate>),
    Wrapped { candidates: Vec<Candidate> },
}

/// Ask the recall stage for fault candidates, grounded in the symbol
/// index. Malformed completions surface as external errors and are not
/// retried here.
pub fn recall_candidates(
    ctx: &TaskContext,
    index: &AstIndex,
    llm: &dyn CompletionClient,
) -> Result<Vec<Candidate>> {
    let failing = ctx
        .failing_tests
        .iter()
        .map(|t| format!("- {t}"))
        .collect::<Vec<_>>()
        .join("\n");
    let hints = symbol_hints(ctx, index);
    let prompt = prompts::render(prompts::RECALL_PROMPT, &[
        ("instance_id", ctx.instance_id.as_str()),
        ("failing_tests", failing.as_str()),
        ("symbol_hints", hints.as_str()),
    ]);
    let response = llm.complete(&prompt)?;
    let payload: RecallPayload = serde_json::from_str(&response)
        .map_err(|e| AgentError::External(format!("recall stage returned non-JSON candidates: {e}")))?;
    let mut candidates = match payload {
        RecallPayload::List(list) | RecallPayload::Wrapped { candidates: list } => list,
    };
    for (idx, candidate) in candidates.iter_mut().enumerate() {
        if candidate.id.is_empty() {
            candidate.id = format!("cand-{}", idx + 1);
        }
    }
    Ok(candidates)
}

/// Run the probe prompt per candidate and attach the response under the
/// candidate's `probe` evidence key.
pub fn probe_candidates(
    ctx: &TaskContext,
    mut candidates: Vec<Candidate>,
    llm: &dyn CompletionClient,
) -> Result<Vec<Candidate>> {
    for candidate in &mut candidates {
        let prompt = prompts::render(prompts::PROBE_PROMPT, &[
            ("instance_id", ctx.instance_id.as_str()),
            ("candidate_id", candidate.id.as_str()),
            ("hypothesis", candidate.hypothesis.as_str()),
        ]);
        let response = llm.complete(&prompt)?;
        let notes: serde_json::Value = serde_json::from_str(&response)
            .map_err(|e| AgentError::External(format!("probe stage returned non-JSON notes: {e}")))?;
        candidate.evidence.entry("probe".to_string()).or_insert(notes);
    }
    Ok(candidates)
}

/// Hints for the recall prompt: the symbols defined in files the failing
/// tests name, falling back to nothing when no overlap exists.
fn symbol_hints(ctx: &TaskContext, index: &AstIndex) -> String {
    let mut hints: Vec<String> = Vec::new();
    for test in &ctx.failing_tests {
        let Some(path) = test.split("::").next() else {
            continue;
        };
        let stem = path.rsplit('/').next().unwrap_or(path).trim_start_matches("test_");
        for candidate_file in [stem.replace(".py", ""), stem.to_string()] {
            if candidate_file.is_empty() {
                continue;
            }
            for span in index.lookup_symbol(&candidate_file) {
                hints.push(format!("{}:{}", span.file, span.start_line));
            }
        }
    }
    if hints.is_empty() {
        hints.push("(no symbol overlap with failing tests)".to_string());
    }
    hints.sort();
    hints.dedup();
    hints.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use cip_testkit::ScriptedClient;
    use serde_json::json;

    fn ctx(repo: &std::path::Path) -> TaskContext {
        TaskContext {
            repo_path: repo.to_path_buf(),
            failing_tests: vec!["tests/test_mod.py::test_add".to_string()],
            test_cmd: "pytest -q".to_string(),
            targeted_expr: None,
            instance_id: "example-1".to_string(),
            metadata: serde_json::Map::new(),
        }
    }

    fn empty_index() -> (tempfile::TempDir, AstIndex) {
        let dir = tempfile::tempdir().expect("tempdir");
        let index = AstIndex::build(dir.path()).expect("index");
        (dir, index)
    }

    #[test]
    fn recall_parses_bare_list_output() {
        let (dir, index) = empty_index();
        let response = json!([{
            "id": "cand-1",
            "hypothesis": "add subtracts",
            "spans": [{"file": "mod.py", "start_line": 1, "end_line": 2, "node_type": "FunctionDef", "symbol": "add"}],
        }])
        .to_string();
        let client = ScriptedClient::new(vec![&response]);
        let candidates = recall_candidates(&ctx(dir.path()), &index, &client).expect("recall");
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].spans[0].file, "mod.py");
        let prompt = client.prompts.lock().expect("prompts")[0].clone();
        assert!(prompt.contains("tests/test_mod.py::test_add"));
    }

    #[test]
    fn recall_parses_wrapped_object_output() {
        let (dir, index) = empty_index();
        let response = json!({"candidates": [{
            "id": "",
            "hypothesis": "h",
            "spans": [],
        }]})
        .to_string();
        let client = ScriptedClient::new(vec![&response]);
        let candidates = recall_candidates(&ctx(dir.path()), &index, &client).expect("recall");
        assert_eq!(candidates[0].id, "cand-1", "empty ids are backfilled");
    }

    #[test]
    fn recall_rejects_malformed_output_as_external_error() {
        let (dir, index) = empty_index();
        let client = ScriptedClient::new(vec!["not json at all"]);
        let err = recall_candidates(&ctx(dir.path()), &index, &client).expect_err("must fail");
        assert!(err.to_string().contains("non-JSON"));
        let client = ScriptedClient::new(vec!["{\"wrong\": 1}"]);
        assert!(recall_candidates(&ctx(dir.path()), &index, &client).is_err());
    }

    #[test]
    fn probe_attaches_notes_without_clobbering() {
        let (dir, _index) = empty_index();
        let mut candidate = Candidate {
            id: "cand-1".to_string(),
            hypothesis: "add subtracts".to_string(),
            spans: vec![],
            evidence: serde_json::Map::new(),
        };
        candidate
            .evidence
            .insert("probe".to_string(), json!({"notes": "existing"}));
        let fresh = Candidate {
            id: "cand-2".to_string(),
            hypothesis: "caller at fault".to_string(),
            spans: vec![],
            evidence: serde_json::Map::new(),
        };
        let response = json!({"notes": "subtraction confirmed", "assumptions": ["ints"]}).to_string();
        let client = ScriptedClient::new(vec![&response, &response]);
        let enriched = probe_candidates(&ctx(dir.path()), vec![candidate, fresh], &client).expect("probe");
        assert_eq!(enriched[0].evidence["probe"]["notes"], "existing");
        assert_eq!(enriched[1].evidence["probe"]["notes"], "subtraction confirmed");
    }
}
