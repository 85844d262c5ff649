use anyhow::{Context, Result};
use cip_agent::run_controller;
use cip_core::{Config, TaskContext};
use cip_observe::RunLogger;
use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "cip")]
#[command(about = "Autonomous test-repair agent: localize, patch, gate, commit", long_about = None)]
struct Cli {
    /// Path to the repository to repair.
    #[arg(long)]
    repo: PathBuf,

    /// Path to the task JSON (instance id, failing tests).
    #[arg(long)]
    task: PathBuf,

    /// Where the final unified diff is written.
    #[arg(long)]
    out: PathBuf,

    /// Fallback targeted test command.
    #[arg(long = "test-cmd")]
    test_cmd: String,

    /// Optional YAML configuration file (defaults to ./config.yaml).
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct TaskFile {
    #[serde(default = "default_instance_id")]
    instance_id: String,
    #[serde(default)]
    test_cmd: Option<String>,
    #[serde(default)]
    failing_tests: Vec<String>,
    #[serde(default)]
    targeted_expr: Option<String>,
    #[serde(default)]
    metadata: serde_json::Map<String, serde_json::Value>,
}

fn default_instance_id() -> String {
    "unknown".to_string()
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let raw_task = fs::read_to_string(&cli.task)
        .with_context(|| format!("failed to read task file {}", cli.task.display()))?;
    let task: TaskFile = serde_json::from_str(&raw_task)
        .with_context(|| format!("task file {} is not valid JSON", cli.task.display()))?;

    let test_cmd = if cli.test_cmd.trim().is_empty() {
        task.test_cmd.clone().unwrap_or_default()
    } else {
        cli.test_cmd.clone()
    };
    let ctx = TaskContext {
        repo_path: cli.repo.clone(),
        failing_tests: task.failing_tests,
        test_cmd,
        targeted_expr: task.targeted_expr,
        instance_id: task.instance_id,
        metadata: task.metadata,
    };

    let config = Config::load(cli.config.as_deref())?;
    let logger = RunLogger::new(Path::new(&config.logging.dir), &ctx.instance_id, config.logging.stream)?;

    // The patch file is written on every path, even when the run fails.
    let run = cip_llm::build_client(&config.model)
        .and_then(|llm| run_controller(&ctx, &config, llm.as_ref(), &logger));
    let patch = match &run {
        Ok(result) => result.final_patch.clone(),
        Err(_) => String::new(),
    };
    fs::write(&cli.out, &patch)
        .with_context(|| format!("failed to write patch file {}", cli.out.display()))?;

    // A produced patch file means exit 0; only argument and I/O failures
    // (all returned above) exit non-zero.
    if let Err(err) = run {
        eprintln!("cip: run failed, wrote empty patch: {err:#}");
    }
    Ok(())
}
