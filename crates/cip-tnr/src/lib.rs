use anyhow::Result;
use cip_core::{AgentError, Config, DiffProposal, GateKind, PlanStep, TransactionResult};
use cip_diff::{ValidationLimits, ensure_within_limits};
use cip_gates::{run_static_checks, run_targeted_tests};
use cip_vcs::GitGateway;
use std::collections::BTreeSet;

/// Attempt to land one of `proposals` as a single transaction.
///
/// Per attempt: validate against the step's padded target spans, apply,
/// run the enabled gates, check µ non-worsening, then commit
/// `txn:{step.id}`. Every non-commit path reverts to the pre-call HEAD,
/// so a `committed: false` return leaves the tree byte-identical to the
/// state at entry. Recoverable failures accumulate in the result's logs;
/// only VCS-fatal conditions escape as errors.
pub fn txn_patch(
    vcs: &GitGateway,
    step: &PlanStep,
    proposals: &[DiffProposal],
    test_cmd: &str,
    config: &Config,
) -> Result<TransactionResult> {
    let head = vcs.checkpoint()?;
    let mu_pre = if config.gates.targeted_tests {
        let baseline = run_targeted_tests(test_cmd, vcs.repo_path(), None)?;
        u64::from(!baseline.ok)
    } else {
        vcs.numstat_churn()?
    };

    let allowed_files: BTreeSet<String> = step.target_spans.iter().map(|s| s.file.clone()).collect();
    let limits = ValidationLimits {
        allowed_files: &allowed_files,
        max_loc: config.limits.max_loc_changes,
        max_files: config.limits.max_files_per_diff,
        target_spans: &step.target_spans,
        padding_lines: config.limits.slice_padding_lines,
        allow_api_change: false,
    };

    let mut logs: Vec<String> = Vec::new();
    for (attempt, proposal) in proposals.iter().enumerate() {
        if attempt >= config.tnr.actions_per_txn {
            logs.push(format!(
                "action budget exhausted after {} attempts",
                config.tnr.actions_per_txn
            ));
            break;
        }

        if let Err(err) = ensure_within_limits(&proposal.unified_diff, &limits) {
            log_failure(&mut logs, attempt, &AgentError::from(err));
            continue;
        }

        if let Err(err) = vcs.apply_diff(&proposal.unified_diff) {
            vcs.revert(&head)?;
            log_failure(&mut logs, attempt, &err);
            continue;
        }

        if config.gates.static_ {
            let outcome = run_static_checks(vcs.repo_path())?;
            if !outcome.ok {
                vcs.revert(&head)?;
                log_failure(
                    &mut logs,
                    attempt,
                    &AgentError::Gate {
                        gate: GateKind::Static,
                        output: outcome.output,
                    },
                );
                continue;
            }
        }

        let mu_post = if config.gates.targeted_tests {
            let outcome = run_targeted_tests(test_cmd, vcs.repo_path(), None)?;
            if !outcome.ok {
                vcs.revert(&head)?;
                log_failure(
                    &mut logs,
                    attempt,
                    &AgentError::Gate {
                        gate: GateKind::Targeted,
                        output: outcome.output,
                    },
                );
                continue;
            }
            0
        } else {
            vcs.numstat_churn()?
        };

        if config.tnr.require_mu_nonworsening && mu_post > mu_pre {
            vcs.revert(&head)?;
            log_failure(&mut logs, attempt, &AgentError::Regression { mu_pre, mu_post });
            continue;
        }

        vcs.commit(&format!("txn:{}", step.id))?;
        return Ok(TransactionResult {
            committed: true,
            applied_diff: Some(proposal.clone()),
            mu_pre,
            mu_post,
            logs,
        });
    }

    vcs.revert(&head)?;
    Ok(TransactionResult {
        committed: false,
        applied_diff: None,
        mu_pre,
        mu_post: mu_pre,
        logs,
    })
}

fn log_failure(logs: &mut Vec<String>, attempt: usize, err: &AgentError) {
    logs.push(format!("proposal {}: {err}", attempt + 1));
}
