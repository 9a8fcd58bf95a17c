//! Lifecycle & Triggers (§4.8): before-phase hooks and `on_task_completed` / `on_task_failed`
//! workflow-lifecycle hooks.
//!
//! Grounded on `descartes-v2/src/workflow/notify.rs`'s channel-dispatch shape (fire to every
//! configured target, log failures, never let a reaction-mode failure touch state) adapted from
//! notification channels to shell-command hooks, since this engine's triggers are commands/
//! agents rather than chat messages.

use std::collections::HashMap;
use std::process::Stdio;

use tokio::process::Command;
use tracing::{error, info, warn};

use crate::{Error, Result};

use super::config::{BeforePhaseTrigger, LifecycleEvent, LifecycleTrigger};

/// Result of running a before-phase trigger.
#[derive(Debug, Clone, Default)]
pub struct TriggerOutcome {
    pub approved: bool,
    pub updated_vars: HashMap<String, String>,
    pub reason: Option<String>,
}

async fn run_command(command: &str) -> Result<(bool, String)> {
    let parts = shell_words::split(command)
        .map_err(|e| Error::Config(format!("invalid trigger command: {}", e)))?;
    let Some((program, args)) = parts.split_first() else {
        return Ok((false, "empty trigger command".to_string()));
    };

    let output = Command::new(program)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| Error::TriggerInfra(format!("failed to spawn trigger \"{}\": {}", command, e)))?;

    let combined = format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    Ok((output.status.success(), combined))
}

/// Run a before-phase trigger. Non-gate-mode triggers always approve; any `updated_vars` a
/// trigger emits as JSON on stdout are merged into the variable map regardless of mode.
pub async fn run_before_phase(trigger: &BeforePhaseTrigger) -> Result<TriggerOutcome> {
    let (succeeded, output) = run_command(&trigger.agent_id).await?;

    let updated_vars: HashMap<String, String> = serde_json::from_str(output.trim())
        .ok()
        .unwrap_or_default();

    if !trigger.gate_mode {
        return Ok(TriggerOutcome { approved: true, updated_vars, reason: None });
    }

    if succeeded {
        Ok(TriggerOutcome { approved: true, updated_vars, reason: None })
    } else {
        Ok(TriggerOutcome {
            approved: false,
            updated_vars,
            reason: Some(format!("before-phase trigger rejected: {}", output.trim())),
        })
    }
}

/// Fire every trigger configured for `event`. Reaction-mode failures are logged and otherwise
/// ignored. A gate-mode trigger on `on_task_completed` that fails forces the caller to treat the
/// task as blocked.
pub async fn fire_lifecycle(triggers: &[LifecycleTrigger], event: LifecycleEvent) -> Result<()> {
    for trigger in triggers.iter().filter(|t| t.event == event) {
        match run_command(&trigger.command).await {
            Ok((true, _)) => info!("lifecycle trigger \"{}\" fired for {:?}", trigger.command, event),
            Ok((false, output)) => {
                if trigger.gate_mode && event == LifecycleEvent::OnTaskCompleted {
                    return Err(Error::TaskBlocked(format!(
                        "completion trigger \"{}\" rejected: {}",
                        trigger.command,
                        output.trim()
                    )));
                }
                warn!("lifecycle trigger \"{}\" failed: {}", trigger.command, output.trim());
            }
            Err(e) => {
                error!("lifecycle trigger \"{}\" infrastructure error: {}", trigger.command, e);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_non_gate_before_phase_always_approves() {
        let trigger = BeforePhaseTrigger { agent_id: "false".to_string(), gate_mode: false };
        let outcome = run_before_phase(&trigger).await.unwrap();
        assert!(outcome.approved);
    }

    #[tokio::test]
    async fn test_gate_mode_before_phase_rejects_on_failure() {
        let trigger = BeforePhaseTrigger { agent_id: "false".to_string(), gate_mode: true };
        let outcome = run_before_phase(&trigger).await.unwrap();
        assert!(!outcome.approved);
    }

    #[tokio::test]
    async fn test_gate_mode_before_phase_approves_on_success() {
        let trigger = BeforePhaseTrigger { agent_id: "true".to_string(), gate_mode: true };
        let outcome = run_before_phase(&trigger).await.unwrap();
        assert!(outcome.approved);
    }

    #[tokio::test]
    async fn test_reaction_mode_lifecycle_failure_is_swallowed() {
        let triggers = vec![LifecycleTrigger {
            event: LifecycleEvent::OnTaskFailed,
            command: "false".to_string(),
            gate_mode: false,
        }];
        assert!(fire_lifecycle(&triggers, LifecycleEvent::OnTaskFailed).await.is_ok());
    }

    #[tokio::test]
    async fn test_gate_mode_completion_failure_blocks() {
        let triggers = vec![LifecycleTrigger {
            event: LifecycleEvent::OnTaskCompleted,
            command: "false".to_string(),
            gate_mode: true,
        }];
        let err = fire_lifecycle(&triggers, LifecycleEvent::OnTaskCompleted).await.unwrap_err();
        assert!(matches!(err, Error::TaskBlocked(_)));
    }

    #[tokio::test]
    async fn test_unrelated_event_is_skipped() {
        let triggers = vec![LifecycleTrigger {
            event: LifecycleEvent::OnTaskFailed,
            command: "false".to_string(),
            gate_mode: true,
        }];
        assert!(fire_lifecycle(&triggers, LifecycleEvent::OnTaskCompleted).await.is_ok());
    }
}
