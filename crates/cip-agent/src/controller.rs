use crate::{investigator, planner, probes, proposer};
use anyhow::Result;
use cip_blackboard::{Blackboard, fuse, suspects_from_candidates};
use cip_core::{
    Config, DiffProposal, FailurePattern, PlanStep, ProbeBudget, RECOVERABLE_MARKERS, TaskContext,
    TransactionResult, Understanding,
};
use cip_index::AstIndex;
use cip_llm::CompletionClient;
use cip_observe::RunLogger;
use cip_tnr::txn_patch;
use cip_vcs::GitGateway;
use serde_json::json;

#[derive(Debug, Default)]
pub struct ControllerResult {
    pub final_patch: String,
    pub transactions: Vec<TransactionResult>,
    pub understanding: Understanding,
    pub plan: Vec<PlanStep>,
    pub failure_pattern: Option<FailurePattern>,
}

/// Reduce failing-test node ids (`<path>::<name>`) to a narrowed pytest
/// invocation over the deduplicated, sorted trailing names. Falls back
/// to the task's own command when there is nothing to narrow by.
pub fn narrow_test_cmd(failing_tests: &[String], fallback: &str) -> String {
    let mut names: Vec<&str> = failing_tests
        .iter()
        .filter_map(|test| test.rsplit("::").next())
        .filter(|name| !name.is_empty())
        .collect();
    names.sort_unstable();
    names.dedup();
    if names.is_empty() {
        return fallback.to_string();
    }
    format!("pytest -q -k \"{}\"", names.join(" or "))
}

/// Orchestrate one repair run: seed suspects, optionally investigate and
/// fuse, plan, then land steps through gated transactions, accumulating
/// the cumulative diff from the pre-run checkpoint.
pub fn run_controller(
    ctx: &TaskContext,
    config: &Config,
    llm: &dyn CompletionClient,
    logger: &RunLogger,
) -> Result<ControllerResult> {
    let vcs = GitGateway::new(&ctx.repo_path);
    let baseline = vcs.checkpoint()?;
    logger.log_event(
        "run.start",
        json!({"instance_id": ctx.instance_id, "baseline": baseline}),
    )?;

    let index = AstIndex::build(&ctx.repo_path)?;
    let candidates = investigator::recall_candidates(ctx, &index, llm)?;
    let candidates = investigator::probe_candidates(ctx, candidates, llm)?;
    logger.log_json("candidates", &candidates)?;

    let board = Blackboard::new();
    board.publish_suspects(suspects_from_candidates(&candidates));

    let targeted_cmd = if config.gates.targeted_tests {
        narrow_test_cmd(&ctx.failing_tests, &ctx.test_cmd)
    } else {
        ctx.test_cmd.clone()
    };

    let mut failure_pattern = None;
    if config.search.investigations_enabled {
        probes::run_investigation(ctx, &board, &index, &targeted_cmd, &ProbeBudget::default())?;
        let snapshot = board.snapshot();
        logger.log_json("blackboard", &snapshot)?;
        failure_pattern = fuse(&snapshot);
        if let Some(pattern) = &failure_pattern {
            logger.log_json("failure_pattern", pattern)?;
        }
    }

    let understanding = planner::synthesize(&candidates, llm)?;
    logger.log_json("understanding", &understanding)?;

    let plan: Vec<PlanStep> = if config.search.use_landmarks && let Some(pattern) = &failure_pattern {
        let landmarks = planner::plan_landmarks(pattern, config.search.max_steps, llm)?;
        logger.log_json("landmarks", &landmarks)?;
        let mut steps = planner::landmarks_to_steps(&landmarks);
        steps.truncate(config.search.max_steps);
        steps
    } else {
        planner::plan_steps(&understanding, config.search.max_steps, llm)?
    };
    logger.log_json("plan", &plan)?;

    let mut transactions: Vec<TransactionResult> = Vec::new();
    'steps: for step in &plan {
        let mut attempts_left = config.search.retries_per_step + 1;
        while attempts_left > 0 {
            attempts_left -= 1;
            let context = context_windows(&index, step, config.limits.slice_padding_lines);
            let proposals = proposer::propose(step, &context, config.search.diffs_per_step, llm)?;
            let shortlist: Vec<DiffProposal> =
                proposals.into_iter().take(config.search.finalists).collect();
            logger.log_event(
                "txn.attempt",
                json!({"step_id": step.id, "finalists": shortlist.len()}),
            )?;

            let result = txn_patch(&vcs, step, &shortlist, &targeted_cmd, config)?;
            let stats = result
                .applied_diff
                .as_ref()
                .map(|diff| cip_diff::diff_stats(&diff.unified_diff));
            logger.log_event(
                "txn.result",
                json!({
                    "step_id": step.id,
                    "committed": result.committed,
                    "mu_pre": result.mu_pre,
                    "mu_post": result.mu_post,
                    "loc_delta": stats.map(|s| s.loc_delta),
                    "touched_files": stats.map(|s| s.touched_files),
                }),
            )?;
            let committed = result.committed;
            let recoverable = result
                .logs
                .iter()
                .any(|log| RECOVERABLE_MARKERS.iter().any(|marker| log.contains(marker)));
            transactions.push(result);
            if committed {
                break 'steps;
            }
            if !recoverable {
                break;
            }
        }
    }

    logger.log_json("transactions", &transactions)?;
    let mut final_patch = vcs.diff_between(&baseline, "HEAD")?;
    if final_patch.trim().is_empty()
        && let Some(applied) = transactions.iter().rev().find_map(|t| t.applied_diff.as_ref())
    {
        final_patch = applied.unified_diff.clone();
    }
    logger.log_text("final_patch", &final_patch)?;
    logger.log_event(
        "run.finish",
        json!({"committed": transactions.iter().any(|t| t.committed)}),
    )?;

    Ok(ControllerResult {
        final_patch,
        transactions,
        understanding,
        plan,
        failure_pattern,
    })
}

/// One numbered context window per target span, deduplicated by file and
/// start line.
fn context_windows(index: &AstIndex, step: &PlanStep, padding: usize) -> Vec<(String, String)> {
    let mut windows: Vec<(String, String)> = Vec::new();
    let mut seen: Vec<(String, usize)> = Vec::new();
    for span in &step.target_spans {
        let key = (span.file.clone(), span.start_line);
        if seen.contains(&key) {
            continue;
        }
        if let Some(numbered) =
            index.numbered_slice(&span.file, span.start_line, span.end_line, padding)
        {
            windows.push((span.file.clone(), numbered));
            seen.push(key);
        }
    }
    windows
}

#[cfg(test)]
mod tests {
    use super::*;
    use cip_testkit::{ScriptedClient, buggy_add_repo_with_check, git};
    use serde_json::json;

    const FIX_DIFF: &str = "diff --git a/mod.py b/mod.py\n@@ -1,2 +1,2 @@\n def add(x, y):\n-    return x - y\n+    return x + y\n";
    const USELESS_DIFF: &str = "diff --git a/mod.py b/mod.py\n@@ -1,2 +1,2 @@\n def add(x, y):\n-    return x - y\n+    return y - x\n";

    fn task(repo: &std::path::Path) -> TaskContext {
        TaskContext {
            repo_path: repo.to_path_buf(),
            // Empty node ids keep the targeted command on the task's own
            // check script instead of a narrowed pytest expression.
            failing_tests: vec![],
            test_cmd: "python3 check_add.py".to_string(),
            targeted_expr: None,
            instance_id: "example-1".to_string(),
            metadata: serde_json::Map::new(),
        }
    }

    fn recall_response() -> String {
        json!([{
            "id": "cand-1",
            "hypothesis": "add subtracts",
            "spans": [{"file": "mod.py", "start_line": 1, "end_line": 2, "node_type": "FunctionDef", "symbol": "add"}],
        }])
        .to_string()
    }

    fn plan_response() -> String {
        json!([{
            "id": "step-1",
            "intent": "make add sum",
            "target_spans": [{"file": "mod.py", "start_line": 1, "end_line": 2, "node_type": "FunctionDef"}],
            "constraints": [],
            "ideal_outcome": "check passes",
            "check": "tests",
        }])
        .to_string()
    }

    fn propose_response(diff: &str) -> String {
        json!([{"step_id": "step-1", "unified_diff": diff, "rationale": "swap operator"}]).to_string()
    }

    #[test]
    fn narrowed_command_joins_sorted_unique_names() {
        let cmd = narrow_test_cmd(
            &[
                "pkg/t_calc.py::test_sub".to_string(),
                "pkg/t_calc.py::test_add".to_string(),
                "pkg/t_calc.py::test_add".to_string(),
            ],
            "pytest -q",
        );
        assert_eq!(cmd, "pytest -q -k \"test_add or test_sub\"");
    }

    #[test]
    fn narrowed_command_falls_back_without_failing_tests() {
        assert_eq!(narrow_test_cmd(&[], "pytest -q"), "pytest -q");
    }

    #[test]
    fn run_lands_a_fix_and_accumulates_the_final_patch() {
        let repo = buggy_add_repo_with_check();
        let ctx = task(repo.path());
        let responses = vec![
            recall_response(),
            json!({"notes": "subtraction confirmed"}).to_string(),
            json!({"summary": "add subtracts", "invariants": [], "dependencies": []}).to_string(),
            plan_response(),
            propose_response(FIX_DIFF),
        ];
        let client = ScriptedClient::new(responses.iter().map(String::as_str).collect());
        let logs = tempfile::tempdir().expect("log dir");
        let logger = RunLogger::new(logs.path(), &ctx.instance_id, Some(false)).expect("logger");

        let result = run_controller(&ctx, &Config::default(), &client, &logger).expect("run");
        assert_eq!(result.transactions.len(), 1);
        assert!(result.transactions[0].committed);
        assert!(result.final_patch.contains("+    return x + y"));

        let content = std::fs::read_to_string(repo.path().join("mod.py")).expect("read");
        assert!(content.contains("return x + y"));
        let subject = git(repo.path(), &["log", "-1", "--pretty=%s"]).expect("log");
        assert_eq!(subject.trim(), "txn:step-1");

        let run_dir = logs.path().join("example-1");
        for artifact in ["candidates.json", "understanding.json", "plan.json", "transactions.json", "final_patch.txt"] {
            assert!(run_dir.join(artifact).exists(), "missing {artifact}");
        }
        let events = std::fs::read_to_string(run_dir.join("events.ndjson")).expect("events");
        assert!(events.contains("\"kind\":\"run.start\""));
        assert!(events.contains("\"kind\":\"txn.result\""));
    }

    #[test]
    fn recoverable_failure_is_retried_once_per_step() {
        let repo = buggy_add_repo_with_check();
        let ctx = task(repo.path());
        let responses = vec![
            recall_response(),
            json!({"notes": "subtraction confirmed"}).to_string(),
            json!({"summary": "add subtracts", "invariants": [], "dependencies": []}).to_string(),
            plan_response(),
            propose_response(USELESS_DIFF),
            propose_response(FIX_DIFF),
        ];
        let client = ScriptedClient::new(responses.iter().map(String::as_str).collect());
        let logs = tempfile::tempdir().expect("log dir");
        let logger = RunLogger::new(logs.path(), &ctx.instance_id, Some(false)).expect("logger");

        let result = run_controller(&ctx, &Config::default(), &client, &logger).expect("run");
        assert_eq!(result.transactions.len(), 2, "failed attempt plus retry");
        assert!(!result.transactions[0].committed);
        assert!(
            result.transactions[0]
                .logs
                .iter()
                .any(|l| l.contains("targeted tests failed"))
        );
        assert!(result.transactions[1].committed);
        assert!(result.final_patch.contains("+    return x + y"));
    }

    #[test]
    fn empty_plan_yields_an_empty_patch() {
        let repo = buggy_add_repo_with_check();
        let ctx = task(repo.path());
        let responses = vec![
            json!([]).to_string(),
            json!({"summary": "nothing found", "invariants": [], "dependencies": []}).to_string(),
            json!([]).to_string(),
        ];
        let client = ScriptedClient::new(responses.iter().map(String::as_str).collect());
        let logs = tempfile::tempdir().expect("log dir");
        let logger = RunLogger::new(logs.path(), &ctx.instance_id, Some(false)).expect("logger");

        let result = run_controller(&ctx, &Config::default(), &client, &logger).expect("run");
        assert!(result.transactions.is_empty());
        assert!(result.final_patch.is_empty());
        assert!(logs.path().join("example-1").join("final_patch.txt").exists());
    }

    #[test]
    fn investigation_feeds_a_fused_pattern_into_landmark_planning() {
        let repo = buggy_add_repo_with_check();
        let ctx = task(repo.path());
        let mut config = Config::default();
        config.search.investigations_enabled = true;
        config.search.use_landmarks = true;

        let landmark_response = json!([{
            "id": "landmark-1",
            "intent": "make add sum",
            "target_spans": [{"file": "mod.py", "start_line": 1, "end_line": 2, "node_type": "FunctionDef"}],
            "constraints": [],
            "landmark_test": "python3 check_add.py",
            "rollback_on": ["new failures"],
            "risk": "low",
            "confidence": 0.9,
        }])
        .to_string();
        let responses = vec![
            recall_response(),
            json!({"notes": "subtraction confirmed"}).to_string(),
            json!({"summary": "add subtracts", "invariants": [], "dependencies": []}).to_string(),
            landmark_response,
            propose_response(FIX_DIFF),
        ];
        let client = ScriptedClient::new(responses.iter().map(String::as_str).collect());
        let logs = tempfile::tempdir().expect("log dir");
        let logger = RunLogger::new(logs.path(), &ctx.instance_id, Some(false)).expect("logger");

        let result = run_controller(&ctx, &config, &client, &logger).expect("run");
        let pattern = result.failure_pattern.expect("fused pattern");
        assert_eq!(pattern.primary_location.file, "mod.py");
        assert_eq!(result.plan[0].id, "landmark-1");
        assert!(result.transactions[0].committed);

        let run_dir = logs.path().join("example-1");
        assert!(run_dir.join("blackboard.json").exists());
        assert!(run_dir.join("failure_pattern.json").exists());
        assert!(run_dir.join("landmarks.json").exists());
    }
}
