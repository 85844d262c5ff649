use anyhow::{Result, anyhow};
use cip_llm::CompletionClient;
use std::path::Path;
use std::process::Command;
use std::sync::Mutex;
use tempfile::TempDir;

/// Run git in `repo` and return stdout, failing on non-zero exit.
pub fn git(repo: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo)
        .output()
        .map_err(|e| anyhow!("failed to run git {args:?}: {e}"))?;
    if !output.status.success() {
        return Err(anyhow!(
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Initialise a throwaway git repo containing `mod.py` whose `add`
/// subtracts. The canonical broken fixture for executor and controller
/// tests.
pub fn buggy_add_repo() -> TempDir {
    let dir = tempfile::tempdir().expect("fixture tempdir");
    init_git_repo(dir.path());
    std::fs::write(dir.path().join("mod.py"), "def add(x, y):\n    return x - y\n").expect("seed mod.py");
    git(dir.path(), &["add", "-A"]).expect("git add");
    git(dir.path(), &["commit", "-m", "init"]).expect("git commit");
    dir
}

/// Like [`buggy_add_repo`], with a committed `check_add.py` that exits 0
/// only once `add` sums. Stands in for a targeted pytest invocation
/// without requiring pytest on the machine.
pub fn buggy_add_repo_with_check() -> TempDir {
    let dir = tempfile::tempdir().expect("fixture tempdir");
    init_git_repo(dir.path());
    std::fs::write(dir.path().join("mod.py"), "def add(x, y):\n    return x - y\n").expect("seed mod.py");
    std::fs::write(
        dir.path().join("check_add.py"),
        "import sys\nfrom mod import add\nsys.exit(0 if add(2, 3) == 5 else 1)\n",
    )
    .expect("seed check_add.py");
    git(dir.path(), &["add", "-A"]).expect("git add");
    git(dir.path(), &["commit", "-m", "init"]).expect("git commit");
    dir
}

fn init_git_repo(path: &Path) {
    git(path, &["init"]).expect("git init");
    git(path, &["config", "user.email", "cip@example.test"]).expect("git config email");
    git(path, &["config", "user.name", "cip"]).expect("git config name");
}

/// Completion client that replays queued responses in order. Calls past
/// the end of the queue fail, which keeps tests honest about how many
/// completions a flow performs.
pub struct ScriptedClient {
    responses: Mutex<Vec<String>>,
    pub prompts: Mutex<Vec<String>>,
}

impl ScriptedClient {
    pub fn new(responses: Vec<&str>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().rev().map(str::to_string).collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }
}

impl CompletionClient for ScriptedClient {
    fn complete(&self, prompt: &str) -> Result<String> {
        self.prompts
            .lock()
            .expect("prompt log poisoned")
            .push(prompt.to_string());
        self.responses
            .lock()
            .expect("response queue poisoned")
            .pop()
            .ok_or_else(|| anyhow!("scripted client exhausted"))
    }
}
