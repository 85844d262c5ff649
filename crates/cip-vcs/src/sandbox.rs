use crate::GitGateway;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tempfile::TempDir;
use walkdir::WalkDir;

/// An ephemeral working copy of a repository, including its `.git`
/// directory. The backing temp directory is owned by the handle and
/// removed on drop, so cleanup happens on every exit path.
pub struct Sandbox {
    dir: TempDir,
    gateway: GitGateway,
}

impl Sandbox {
    pub fn create(repo_path: &Path) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("cip-sandbox-")
            .tempdir()
            .context("failed to create sandbox directory")?;
        copy_tree(repo_path, dir.path())?;
        let gateway = GitGateway::new(dir.path());
        Ok(Self { dir, gateway })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn gateway(&self) -> &GitGateway {
        &self.gateway
    }
}

fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    for entry in WalkDir::new(from) {
        let entry = entry?;
        let rel = entry
            .path()
            .strip_prefix(from)
            .context("walked path escaped source root")?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let dest = to.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&dest)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &dest)
                .with_context(|| format!("failed to copy {}", entry.path().display()))?;
        }
    }
    Ok(())
}
