use cip_core::AgentError;
use cip_diff::{LineKind, Patch, normalize_diff};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Synchronous, fail-loud front over a git working tree. Owns no state
/// beyond per-call subprocesses.
#[derive(Debug, Clone)]
pub struct GitGateway {
    repo: PathBuf,
}

impl GitGateway {
    pub fn new(repo: impl Into<PathBuf>) -> Self {
        Self { repo: repo.into() }
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo
    }

    fn run_git(&self, args: &[&str], input: Option<&str>) -> Result<String, AgentError> {
        let mut cmd = Command::new("git");
        cmd.args(args)
            .current_dir(&self.repo)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if input.is_some() {
            cmd.stdin(Stdio::piped());
        }
        let mut child = cmd
            .spawn()
            .map_err(|e| AgentError::Vcs(format!("failed to run git {}: {e}", args.join(" "))))?;
        if let Some(text) = input
            && let Some(mut stdin) = child.stdin.take()
        {
            stdin
                .write_all(text.as_bytes())
                .map_err(|e| AgentError::Vcs(format!("failed writing git stdin: {e}")))?;
        }
        let output = child
            .wait_with_output()
            .map_err(|e| AgentError::Vcs(format!("git {} did not finish: {e}", args.join(" "))))?;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            let detail = if stderr.trim().is_empty() { stdout } else { stderr };
            return Err(AgentError::Vcs(format!("git {} failed: {detail}", args.join(" "))));
        }
        Ok(stdout)
    }

    /// Current HEAD commit hash.
    pub fn checkpoint(&self) -> Result<String, AgentError> {
        Ok(self.run_git(&["rev-parse", "HEAD"], None)?.trim().to_string())
    }

    /// Apply a unified diff to the working tree. Missing `---`/`+++`
    /// headers are normalized in first; if the native tool still rejects
    /// the bytes, a manual hunk-by-hunk reconstruction is attempted.
    pub fn apply_diff(&self, diff: &str) -> Result<(), AgentError> {
        let normalized = normalize_diff(diff);
        match self.run_git(&["apply", "-"], Some(&normalized)) {
            Ok(_) => Ok(()),
            Err(native_err) => self.manual_apply(&normalized).map_err(|manual_err| {
                AgentError::Apply(format!("{native_err}; manual fallback: {manual_err}"))
            }),
        }
    }

    /// Hard reset to `commit_id` and drop untracked files. The only
    /// rollback primitive the transaction executor uses.
    pub fn revert(&self, commit_id: &str) -> Result<(), AgentError> {
        self.run_git(&["reset", "--hard", commit_id], None)?;
        self.run_git(&["clean", "-fd"], None)?;
        Ok(())
    }

    pub fn stage_all(&self) -> Result<(), AgentError> {
        self.run_git(&["add", "-A"], None)?;
        Ok(())
    }

    /// Stage everything and create a commit; returns the new HEAD.
    pub fn commit(&self, message: &str) -> Result<String, AgentError> {
        self.stage_all()?;
        self.run_git(&["commit", "-m", message], None)?;
        self.checkpoint()
    }

    /// Diff between HEAD and the working tree.
    pub fn final_patch(&self) -> Result<String, AgentError> {
        self.run_git(&["diff", "HEAD"], None)
    }

    /// Cumulative committed diff from `base` to `head`; spans multiple
    /// transaction commits.
    pub fn diff_between(&self, base: &str, head: &str) -> Result<String, AgentError> {
        self.run_git(&["diff", &format!("{base}..{head}")], None)
    }

    /// Discard uncommitted changes.
    pub fn clean(&self) -> Result<(), AgentError> {
        self.run_git(&["reset", "--hard"], None)?;
        self.run_git(&["clean", "-fd"], None)?;
        Ok(())
    }

    /// Working-tree churn: the sum of `(added + deleted) / 2` over
    /// `git diff --numstat` rows.
    pub fn numstat_churn(&self) -> Result<u64, AgentError> {
        let stdout = self.run_git(&["diff", "--numstat"], None)?;
        let mut total = 0u64;
        for line in stdout.lines() {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() >= 3
                && let (Ok(added), Ok(deleted)) = (parts[0].parse::<u64>(), parts[1].parse::<u64>())
            {
                total += (added + deleted) / 2;
            }
        }
        Ok(total)
    }

    fn manual_apply(&self, diff: &str) -> Result<(), AgentError> {
        let patch = Patch::parse(diff).map_err(|e| AgentError::Apply(e.to_string()))?;
        if patch.files.is_empty() {
            return Err(AgentError::Apply("diff contains no file sections".to_string()));
        }
        for file in &patch.files {
            let path = self.repo.join(&file.new_path);
            let touches_existing = file
                .hunks
                .iter()
                .flat_map(|h| h.lines.iter())
                .any(|l| l.kind != LineKind::Added);
            if !path.exists() && touches_existing {
                return Err(AgentError::Apply(format!(
                    "{}: file does not exist",
                    file.new_path
                )));
            }
            let source = if path.exists() {
                fs::read_to_string(&path)
                    .map_err(|e| AgentError::Apply(format!("{}: {e}", file.new_path)))?
            } else {
                String::new()
            };
            // Keep each original line's own ending; a final line without a
            // newline must survive untouched.
            let original = split_keepends(&source);

            let mut output: Vec<String> = Vec::with_capacity(original.len());
            let mut pointer = 0usize;
            for hunk in &file.hunks {
                // Seek to the hunk's old-side start, carrying untouched lines.
                let target = hunk.old_start.saturating_sub(1);
                while pointer < target && pointer < original.len() {
                    output.push(original[pointer].clone());
                    pointer += 1;
                }
                for line in &hunk.lines {
                    match line.kind {
                        LineKind::Context | LineKind::Removed => {
                            let current = original.get(pointer).ok_or_else(|| {
                                AgentError::Apply(format!(
                                    "{}: hunk extends past end of file",
                                    file.new_path
                                ))
                            })?;
                            if current.strip_suffix('\n').unwrap_or(current) != line.text {
                                return Err(AgentError::Apply(format!(
                                    "{}: context mismatch near line {}",
                                    file.new_path,
                                    pointer + 1
                                )));
                            }
                            if line.kind == LineKind::Context {
                                output.push(current.clone());
                            }
                            pointer += 1;
                        }
                        LineKind::Added => {
                            let mut text = line.text.clone();
                            if !text.ends_with('\n') {
                                text.push('\n');
                            }
                            output.push(text);
                        }
                    }
                }
            }
            output.extend(original[pointer.min(original.len())..].iter().cloned());

            fs::write(&path, output.concat())
                .map_err(|e| AgentError::Apply(format!("{}: {e}", file.new_path)))?;
        }
        Ok(())
    }
}

fn split_keepends(text: &str) -> Vec<String> {
    let mut lines = Vec::new();
    let mut start = 0;
    for (idx, _) in text.match_indices('\n') {
        lines.push(text[start..=idx].to_string());
        start = idx + 1;
    }
    if start < text.len() {
        lines.push(text[start..].to_string());
    }
    lines
}
