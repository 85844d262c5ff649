use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub type Result<T> = anyhow::Result<T>;

/// Largest number of changed lines a single investigative probe may carry.
pub const MAX_PROBE_LOC: usize = 3;

/// A half-open region of a text file located by the symbol index.
///
/// `file` is always repo-relative with forward slashes; lines are 1-based
/// and `start_line <= end_line`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AstSpan {
    pub file: String,
    pub start_line: usize,
    pub end_line: usize,
    pub node_type: String,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub score: Option<f64>,
}

impl AstSpan {
    pub fn new(file: impl Into<String>, start_line: usize, end_line: usize, node_type: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            start_line,
            end_line,
            node_type: node_type.into(),
            symbol: None,
            score: None,
        }
    }
}

/// A ranked program entity suspected of carrying the fault.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suspect {
    pub id: String,
    pub span: AstSpan,
    pub kind: String,
    pub hop: u32,
    pub in_stack: bool,
    pub suspicion: f64,
}

/// Canonical suspect id: `{origin}:{file}:{start}-{end}`, unique per run.
pub fn suspect_id(origin: &str, span: &AstSpan) -> String {
    format!("{}:{}:{}-{}", origin, span.file, span.start_line, span.end_line)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbePurpose {
    Instrument,
    Assert,
    Reduce,
}

/// A tiny read-only-intent edit applied exclusively inside sandboxes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbePatch {
    pub id: String,
    pub suspect_id: String,
    pub diff: String,
    pub purpose: ProbePurpose,
    pub loc_changed: usize,
    pub rationale: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeOutcome {
    Informative,
    Uninformative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    LikelyCause,
    Possible,
    Unlikely,
    Unknown,
}

/// Result of one probe execution, published back onto the blackboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeReport {
    pub id: String,
    pub suspect_id: String,
    pub result: ProbeOutcome,
    pub info_gain: f64,
    pub recommendation: Recommendation,
    #[serde(default)]
    pub observations: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub artifacts: Vec<String>,
}

/// Point-in-time view of the shared evidence store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlackboardState {
    pub suspects: Vec<Suspect>,
    pub observables: Vec<serde_json::Value>,
    pub probe_patches: Vec<ProbePatch>,
    pub invariants: Vec<String>,
    pub evidence: Vec<serde_json::Value>,
    pub reports: Vec<ProbeReport>,
}

/// A runner-up fault location with a one-line justification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alternative {
    pub span: AstSpan,
    pub why: String,
}

/// Fused view of the failure: one primary location plus ranked fallbacks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailurePattern {
    pub summary: String,
    pub primary_location: AstSpan,
    pub alternatives: Vec<Alternative>,
    pub invariants: Vec<String>,
    pub confidence: f64,
    pub assumptions_to_check: Vec<String>,
    pub temporary_props: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    Compile,
    Lint,
    #[default]
    Tests,
    Custom,
}

/// Atomic repair intent produced by the planner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: String,
    pub intent: String,
    pub target_spans: Vec<AstSpan>,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub ideal_outcome: String,
    #[serde(default)]
    pub check: CheckKind,
}

/// Candidate unified diff for one plan step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffProposal {
    pub step_id: String,
    pub unified_diff: String,
    #[serde(default)]
    pub rationale: Option<String>,
}

/// Outcome of one transactional patch attempt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransactionResult {
    pub committed: bool,
    pub applied_diff: Option<DiffProposal>,
    pub mu_pre: u64,
    pub mu_post: u64,
    pub logs: Vec<String>,
}

/// Investigation candidate returned from the recall stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    pub hypothesis: String,
    pub spans: Vec<AstSpan>,
    #[serde(default)]
    pub evidence: serde_json::Map<String, serde_json::Value>,
}

/// High-level understanding synthesized from enriched candidates.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Understanding {
    pub summary: String,
    #[serde(default)]
    pub invariants: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// A planned repair step annotated with its verification test and
/// rollback triggers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Landmark {
    pub id: String,
    pub intent: String,
    pub target_spans: Vec<AstSpan>,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub landmark_test: String,
    #[serde(default)]
    pub rollback_on: Vec<String>,
    #[serde(default)]
    pub risk: String,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub try_after: Option<String>,
}

/// Ambient data for one repair run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskContext {
    pub repo_path: PathBuf,
    pub failing_tests: Vec<String>,
    pub test_cmd: String,
    pub targeted_expr: Option<String>,
    pub instance_id: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Budget for one investigation phase. The deadline is wall-clock and
/// caller-supplied; the rest bound individual probes.
#[derive(Debug, Clone, Copy)]
pub struct ProbeBudget {
    pub max_probes: usize,
    pub quantum_ops: u32,
    pub time_budget_secs: u64,
    pub overall_timeout_secs: u64,
}

impl Default for ProbeBudget {
    fn default() -> Self {
        Self {
            max_probes: 8,
            quantum_ops: 2,
            time_budget_secs: 20,
            overall_timeout_secs: 120,
        }
    }
}

// --- Error taxonomy ---

/// A diff rejected by edit-scope policy before touching disk.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct ValidationError(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateKind {
    Static,
    Targeted,
}

impl GateKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Static => "static checks",
            Self::Targeted => "targeted tests",
        }
    }
}

impl std::fmt::Display for GateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified failure kinds for the repair loop. Recoverable variants are
/// recorded in transaction logs and never unwind past the executor; the
/// rest propagate to the CLI.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error("git apply failed: {0}")]
    Apply(String),
    #[error("{gate} failed: {output}")]
    Gate { gate: GateKind, output: String },
    #[error("mu worsened: pre={mu_pre} post={mu_post}")]
    Regression { mu_pre: u64, mu_post: u64 },
    #[error("external stage returned malformed output: {0}")]
    External(String),
    #[error("vcs failure: {0}")]
    Vcs(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl AgentError {
    /// Whether the executor may swallow this failure and move to the next
    /// proposal.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::Apply(_) | Self::Gate { .. } | Self::Regression { .. }
        )
    }
}

/// Log markers that allow the controller one re-entry per step.
pub const RECOVERABLE_MARKERS: [&str; 4] = [
    "validation failed",
    "git apply failed",
    "static checks failed",
    "targeted tests failed",
];

// --- Configuration ---

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub provider: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub max_steps: usize,
    pub diffs_per_step: usize,
    pub finalists: usize,
    pub retries_per_step: usize,
    pub investigations_enabled: bool,
    pub use_landmarks: bool,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_steps: 4,
            diffs_per_step: 3,
            finalists: 2,
            retries_per_step: 1,
            investigations_enabled: false,
            use_landmarks: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_loc_changes: usize,
    pub max_files_per_diff: usize,
    pub slice_padding_lines: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_loc_changes: 12,
            max_files_per_diff: 2,
            slice_padding_lines: 80,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TnrConfig {
    pub actions_per_txn: usize,
    pub require_mu_nonworsening: bool,
}

impl Default for TnrConfig {
    fn default() -> Self {
        Self {
            actions_per_txn: 3,
            require_mu_nonworsening: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    // `static` is a keyword; the YAML key keeps the plain spelling.
    #[serde(rename = "static")]
    pub static_: bool,
    pub targeted_tests: bool,
    pub smoke: bool,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            static_: true,
            targeted_tests: true,
            smoke: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub dir: String,
    pub stream: Option<bool>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: ".agent_runs".to_string(),
            stream: None,
        }
    }
}

/// Aggregated run configuration, loaded from YAML with every section and
/// key optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub model: ModelConfig,
    pub search: SearchConfig,
    pub limits: LimitsConfig,
    pub tnr: TnrConfig,
    pub gates: GateConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from `path` if given, else `./config.yaml`,
    /// falling back to defaults when the file does not exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("config.yaml"));
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(&path)?;
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(&raw)?)
    }
}
