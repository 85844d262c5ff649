use anyhow::{Result, anyhow};
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;
use wait_timeout::ChildExt;
use walkdir::WalkDir;

/// Verdict of one gate run. Side effects live entirely in the workspace
/// the gate ran against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateOutcome {
    pub ok: bool,
    pub output: String,
    pub timed_out: bool,
}

impl GateOutcome {
    fn pass(output: impl Into<String>) -> Self {
        Self {
            ok: true,
            output: output.into(),
            timed_out: false,
        }
    }
}

/// Byte-compile every Python source under `repo`. Vacuously passes when
/// the tree holds no Python files.
pub fn run_static_checks(repo: &Path) -> Result<GateOutcome> {
    let mut py_files: Vec<String> = Vec::new();
    for entry in WalkDir::new(repo).into_iter().filter_entry(|e| e.file_name() != ".git") {
        let entry = entry?;
        if entry.file_type().is_file()
            && entry.path().extension().and_then(|s| s.to_str()) == Some("py")
        {
            py_files.push(entry.path().to_string_lossy().to_string());
        }
    }
    py_files.sort();
    if py_files.is_empty() {
        return Ok(GateOutcome::pass("no python files"));
    }

    let mut cmd = Command::new("python3");
    cmd.args(["-m", "py_compile"]).args(&py_files).current_dir(repo);
    run_gate_command(cmd, None)
}

/// Execute the targeted test command inside `repo`, optionally bounded by
/// `time_budget`. An empty command passes trivially; exceeding the budget
/// kills the child and reports a timed-out failure.
pub fn run_targeted_tests(test_cmd: &str, repo: &Path, time_budget: Option<Duration>) -> Result<GateOutcome> {
    if test_cmd.trim().is_empty() {
        return Ok(GateOutcome::pass("no tests configured"));
    }
    let words = shell_words::split(test_cmd).map_err(|e| anyhow!("unparseable test command: {e}"))?;
    let (program, args) = words
        .split_first()
        .ok_or_else(|| anyhow!("empty test command after parsing"))?;

    let mut cmd = Command::new(program);
    cmd.args(args).current_dir(repo);
    run_gate_command(cmd, time_budget)
}

fn run_gate_command(mut cmd: Command, time_budget: Option<Duration>) -> Result<GateOutcome> {
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped()).stdin(Stdio::null());
    let mut child = cmd.spawn().map_err(|e| anyhow!("failed to spawn gate command: {e}"))?;

    let mut timed_out = false;
    if let Some(budget) = time_budget {
        match child.wait_timeout(budget)? {
            Some(_) => {}
            None => {
                timed_out = true;
                child.kill()?;
            }
        }
    }
    let output = child.wait_with_output()?;
    let mut text = String::from_utf8_lossy(&output.stdout).to_string();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    if timed_out {
        return Ok(GateOutcome {
            ok: false,
            output: format!("timed out after {:?}\n{text}", time_budget.unwrap_or_default()),
            timed_out: true,
        });
    }
    Ok(GateOutcome {
        ok: output.status.success(),
        output: text,
        timed_out: false,
    })
}
