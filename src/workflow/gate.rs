//! Gate Evaluator (§4.7): decide whether a completed phase's output is approved, rejected (with
//! an optional retry target), or pending human input.
//!
//! Grounded on `descartes-v2/src/workflow/gate.rs`'s `GateController`/`GateResult` shape. The
//! teacher's `GateType::{Auto,Manual,Notify}` taxonomy is replaced by the spec's
//! `{auto,skip,ai,script,human}`; `CliGate::prompt()`'s stdin-based interactive flow is kept for
//! the `human` gate type.

use std::collections::HashMap;
use std::io::Write;
use std::process::Stdio;

use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{info, warn};

use crate::judge::{JudgeRequest, LlmJudge};
use crate::Result;

use super::config::GateType;

/// Gate Decision (§3): `{approved, pending, reason, retry_phase?, output_data?, output_var?}`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GateDecision {
    pub approved: bool,
    pub pending: bool,
    pub reason: String,
    pub retry_phase: Option<String>,
    pub output_data: Option<serde_json::Value>,
    pub output_var: Option<String>,
}

impl GateDecision {
    fn approved(reason: impl Into<String>) -> Self {
        Self { approved: true, reason: reason.into(), ..Default::default() }
    }

    fn rejected(reason: impl Into<String>, retry_phase: Option<String>) -> Self {
        Self { approved: false, reason: reason.into(), retry_phase, ..Default::default() }
    }

    fn pending(reason: impl Into<String>) -> Self {
        Self { pending: true, reason: reason.into(), ..Default::default() }
    }
}

/// Everything the evaluator needs about one phase's completed output, independent of how the
/// caller assembled it.
pub struct GateInput<'a> {
    pub gate_type: GateType,
    pub phase_output: &'a str,
    pub task_metadata: &'a HashMap<String, String>,
    /// CLI-wide `--skip-gates` override (§3 `Config::skip_gates`).
    pub skip_gates_override: bool,
    pub auto_approve_on_success: bool,
    pub ai_criteria: &'a [String],
    pub output_var: Option<&'a str>,
    /// Shell command for the `script` gate type; receives the assembled JSON on stdin.
    pub script: Option<&'a str>,
    /// Retry target resolution result (§4.7: explicit > config map > none), already resolved by
    /// the caller via `WorkflowConfig::retry_target`.
    pub retry_target: Option<&'a str>,
}

pub struct GateEvaluator;

impl GateEvaluator {
    /// Evaluate a gate. `judge` is only consulted for `GateType::Ai`.
    pub async fn evaluate(
        input: &GateInput<'_>,
        judge: Option<&dyn LlmJudge>,
    ) -> Result<GateDecision> {
        if input.skip_gates_override {
            return Ok(GateDecision::approved("skipped by configuration"));
        }

        match input.gate_type {
            GateType::Skip => Ok(GateDecision::approved("skipped by configuration")),
            GateType::Auto => {
                if input.auto_approve_on_success {
                    Ok(GateDecision::approved("auto-approved on success"))
                } else {
                    Ok(GateDecision::approved("auto gate with no further condition configured"))
                }
            }
            GateType::Human => {
                info!("gate pending human input");
                Ok(GateDecision::pending("awaiting human approval"))
            }
            GateType::Ai => Self::evaluate_ai(input, judge).await,
            GateType::Script => Self::evaluate_script(input).await,
        }
    }

    async fn evaluate_ai(input: &GateInput<'_>, judge: Option<&dyn LlmJudge>) -> Result<GateDecision> {
        let Some(judge) = judge else {
            warn!("ai gate configured with no judge available, passing through with a warning");
            return Ok(GateDecision::approved("no judge configured, approved with warning"));
        };

        let request = JudgeRequest {
            criteria: input.ai_criteria.to_vec(),
            context: format!("{:?}", input.task_metadata),
            phase_output: input.phase_output.to_string(),
        };
        let verdict = judge.evaluate(&request).await?;

        let output_data = serde_json::to_value(&verdict).ok();
        let mut decision = if verdict.passed {
            GateDecision::approved(verdict.reasoning)
        } else {
            GateDecision::rejected(verdict.reasoning, input.retry_target.map(str::to_string))
        };
        decision.output_data = output_data;
        decision.output_var = input.output_var.map(str::to_string);
        Ok(decision)
    }

    /// Pipe `{task_metadata, phase_output}` JSON to the configured script; a non-zero exit
    /// overrides the decision to rejected (§4.7 script post-processor).
    async fn evaluate_script(input: &GateInput<'_>) -> Result<GateDecision> {
        let Some(script) = input.script else {
            warn!("script gate configured with no script, approving with a warning");
            return Ok(GateDecision::approved("no script configured, approved with warning"));
        };

        let payload = serde_json::json!({
            "task_metadata": input.task_metadata,
            "phase_output": input.phase_output,
        });
        let payload_text = serde_json::to_string(&payload)?;

        let parts = shell_words::split(script)
            .map_err(|e| crate::Error::Config(format!("invalid gate script command: {}", e)))?;
        let Some((program, args)) = parts.split_first() else {
            return Ok(GateDecision::rejected("empty gate script command", input.retry_target.map(str::to_string)));
        };

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| crate::Error::Config(format!("failed to spawn gate script: {}", e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(payload_text.as_bytes()).await;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| crate::Error::Config(format!("gate script failed: {}", e)))?;

        if output.status.success() {
            Ok(GateDecision::approved("script gate exited successfully"))
        } else {
            let reason = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let reason = if reason.is_empty() { "script gate exited non-zero".to_string() } else { reason };
            Ok(GateDecision::rejected(reason, input.retry_target.map(str::to_string)))
        }
    }
}

/// Interactive CLI prompt used for the `human` gate type in environments with a tty.
pub struct CliGate;

impl CliGate {
    pub fn prompt(summary: &str) -> Result<GateDecision> {
        println!("\n{}", summary);
        println!("\n[a]pprove  [r]eject  [s]kip");
        print!("> ");
        std::io::stdout().flush()?;

        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;
        let input = input.trim().to_lowercase();

        match input.as_str() {
            "a" | "approve" | "y" | "yes" | "" => Ok(GateDecision::approved("approved via cli")),
            "s" | "skip" => Ok(GateDecision::approved("skipped via cli")),
            "r" | "reject" | "n" | "no" => Ok(GateDecision::rejected("rejected via cli", None)),
            _ => {
                println!("unrecognized input, please answer a/r/s");
                Self::prompt(summary)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::judge::JudgeResponse;

    struct FakeJudge {
        passed: bool,
    }

    #[async_trait]
    impl LlmJudge for FakeJudge {
        async fn evaluate(&self, _request: &JudgeRequest) -> Result<JudgeResponse> {
            Ok(JudgeResponse {
                passed: self.passed,
                reasoning: "fake verdict".to_string(),
                unmet_criteria: if self.passed { vec![] } else { vec!["x".to_string()] },
            })
        }
    }

    fn base_input<'a>(metadata: &'a HashMap<String, String>) -> GateInput<'a> {
        GateInput {
            gate_type: GateType::Auto,
            phase_output: "output",
            task_metadata: metadata,
            skip_gates_override: false,
            auto_approve_on_success: true,
            ai_criteria: &[],
            output_var: None,
            script: None,
            retry_target: None,
        }
    }

    #[tokio::test]
    async fn test_skip_gates_override_always_approves() {
        let metadata = HashMap::new();
        let mut input = base_input(&metadata);
        input.gate_type = GateType::Human;
        input.skip_gates_override = true;
        let decision = GateEvaluator::evaluate(&input, None).await.unwrap();
        assert!(decision.approved);
        assert!(!decision.pending);
    }

    #[tokio::test]
    async fn test_human_gate_is_pending() {
        let metadata = HashMap::new();
        let mut input = base_input(&metadata);
        input.gate_type = GateType::Human;
        let decision = GateEvaluator::evaluate(&input, None).await.unwrap();
        assert!(decision.pending);
        assert!(!decision.approved);
    }

    #[tokio::test]
    async fn test_ai_gate_approves_on_passing_judge() {
        let metadata = HashMap::new();
        let mut input = base_input(&metadata);
        input.gate_type = GateType::Ai;
        let judge = FakeJudge { passed: true };
        let decision = GateEvaluator::evaluate(&input, Some(&judge)).await.unwrap();
        assert!(decision.approved);
    }

    #[tokio::test]
    async fn test_ai_gate_rejects_with_retry_target_on_failing_judge() {
        let metadata = HashMap::new();
        let mut input = base_input(&metadata);
        input.gate_type = GateType::Ai;
        input.retry_target = Some("implement");
        let judge = FakeJudge { passed: false };
        let decision = GateEvaluator::evaluate(&input, Some(&judge)).await.unwrap();
        assert!(!decision.approved);
        assert_eq!(decision.retry_phase.as_deref(), Some("implement"));
    }

    #[tokio::test]
    async fn test_ai_gate_with_no_judge_passes_through_with_warning() {
        let metadata = HashMap::new();
        let mut input = base_input(&metadata);
        input.gate_type = GateType::Ai;
        let decision = GateEvaluator::evaluate(&input, None).await.unwrap();
        assert!(decision.approved);
    }

    #[tokio::test]
    async fn test_script_gate_approves_on_zero_exit() {
        let metadata = HashMap::new();
        let mut input = base_input(&metadata);
        input.gate_type = GateType::Script;
        input.script = Some("true");
        let decision = GateEvaluator::evaluate(&input, None).await.unwrap();
        assert!(decision.approved);
    }

    #[tokio::test]
    async fn test_script_gate_rejects_on_nonzero_exit() {
        let metadata = HashMap::new();
        let mut input = base_input(&metadata);
        input.gate_type = GateType::Script;
        input.script = Some("false");
        input.retry_target = Some("implement");
        let decision = GateEvaluator::evaluate(&input, None).await.unwrap();
        assert!(!decision.approved);
        assert_eq!(decision.retry_phase.as_deref(), Some("implement"));
    }
}
