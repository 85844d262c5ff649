use cip_core::{BlackboardState, Candidate, ProbePatch, ProbeReport, Suspect, suspect_id};
use std::sync::Mutex;

/// Shared evidence store for one investigation. Mutations are serialized
/// behind a single lock (one writer at a time); the store is append-only
/// apart from scheduler-driven suspicion feedback, and publishes are
/// observed in publish order.
#[derive(Debug, Default)]
pub struct Blackboard {
    inner: Mutex<BlackboardState>,
}

impl Blackboard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish_suspects(&self, suspects: Vec<Suspect>) {
        self.inner.lock().expect("blackboard poisoned").suspects.extend(suspects);
    }

    pub fn publish_observable(&self, observable: serde_json::Value) {
        self.inner
            .lock()
            .expect("blackboard poisoned")
            .observables
            .push(observable);
    }

    pub fn publish_probe_patch(&self, patch: ProbePatch) {
        self.inner
            .lock()
            .expect("blackboard poisoned")
            .probe_patches
            .push(patch);
    }

    pub fn publish_evidence(&self, evidence: serde_json::Value) {
        self.inner.lock().expect("blackboard poisoned").evidence.push(evidence);
    }

    /// Invariants are a deduplicated set; re-publishing a known string is
    /// a no-op.
    pub fn publish_invariant(&self, invariant: &str) {
        let mut state = self.inner.lock().expect("blackboard poisoned");
        if !state.invariants.iter().any(|known| known == invariant) {
            state.invariants.push(invariant.to_string());
        }
    }

    pub fn publish_report(&self, report: ProbeReport) {
        self.inner.lock().expect("blackboard poisoned").reports.push(report);
    }

    /// Scheduler feedback is the only mutation suspicion admits. The new
    /// value is clamped to `[0, 1]`.
    pub fn adjust_suspicion(&self, suspect_id: &str, delta: f64) {
        let mut state = self.inner.lock().expect("blackboard poisoned");
        if let Some(suspect) = state.suspects.iter_mut().find(|s| s.id == suspect_id) {
            suspect.suspicion = (suspect.suspicion + delta).clamp(0.0, 1.0);
        }
    }

    /// Deep, point-in-time copy. Writers after the snapshot cannot affect
    /// the returned value.
    pub fn snapshot(&self) -> BlackboardState {
        self.inner.lock().expect("blackboard poisoned").clone()
    }
}

/// Lower recall candidates onto seeded suspects. Suspicion starts from
/// the span score when the recall stage provided one.
pub fn suspects_from_candidates(candidates: &[Candidate]) -> Vec<Suspect> {
    let mut suspects = Vec::new();
    for candidate in candidates {
        for span in &candidate.spans {
            let id = suspect_id(&candidate.id, span);
            if suspects.iter().any(|s: &Suspect| s.id == id) {
                continue;
            }
            suspects.push(Suspect {
                id,
                kind: span.node_type.clone(),
                hop: 0,
                in_stack: false,
                suspicion: span.score.unwrap_or(0.5).clamp(0.0, 1.0),
                span: span.clone(),
            });
        }
    }
    suspects
}
