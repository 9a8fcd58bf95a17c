//! Phase Executor (§4.5): drive one phase to completion.
//!
//! Grounded on `descartes-v2/src/workflow/runner.rs`'s `run_stage()` (prompt construction,
//! response streaming) and `ralph_loop.rs`'s iteration-loop shape (fresh continuation prompt per
//! iteration, exhaustion as a terminal failure).

use std::path::Path;

use crate::cancellation::CancellationToken;
use crate::harness::{StreamCallbacks, TurnExecutor, TurnOptions, TurnSession, TurnUsage};
use crate::judge::{JudgeRequest, LlmJudge};
use crate::{Error, Result};

use super::backpressure::{self, BackpressureCheck};
use super::parser::{self, PhaseKind, PhaseResponse, Verdict};
use super::retry_context::{self, RetryContextInput};

/// Inputs the runner (§4.6) has already assembled before handing a phase to the executor:
/// resolved variables have been rendered into `initial_prompt`.
pub struct PhaseExecutionInput<'a> {
    pub phase_id: &'a str,
    pub phase_kind: PhaseKind,
    pub max_iterations: u32,
    pub model: &'a str,
    pub initial_prompt: String,
    pub extended_thinking: bool,
    pub backpressure_checks: &'a [BackpressureCheck],
    pub success_criteria: &'a [String],
    pub worktree_path: &'a Path,
}

#[derive(Debug, Clone)]
pub enum PhaseOutcome {
    Complete {
        content: String,
        iterations: u32,
        usage: TurnUsage,
        cost_usd: f64,
        response: PhaseResponse,
    },
    Blocked { reason: String, iterations: u32 },
}

fn accumulate(total: &mut TurnUsage, delta: &TurnUsage) {
    total.input += delta.input;
    total.output += delta.output;
    total.cache_creation += delta.cache_creation;
    total.cache_read += delta.cache_read;
}

pub struct PhaseExecutor<'a> {
    turn_executor: &'a dyn TurnExecutor,
    judge: Option<&'a dyn LlmJudge>,
    cancellation: &'a CancellationToken,
}

impl<'a> PhaseExecutor<'a> {
    pub fn new(
        turn_executor: &'a dyn TurnExecutor,
        judge: Option<&'a dyn LlmJudge>,
        cancellation: &'a CancellationToken,
    ) -> Self {
        Self { turn_executor, judge, cancellation }
    }

    pub async fn execute(&self, input: &PhaseExecutionInput<'_>) -> Result<PhaseOutcome> {
        let mut session = TurnSession { id: None, model: input.model.to_string() };
        let mut prompt = input.initial_prompt.clone();
        let mut total_usage = TurnUsage::default();
        let mut total_cost = 0.0;

        for iteration in 1..=input.max_iterations {
            if self.cancellation.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let rendered = if iteration == 1 && input.extended_thinking {
                format!("ultrathink\n\n{}", prompt)
            } else {
                prompt.clone()
            };

            let opts = TurnOptions::default();
            let mut callbacks = StreamCallbacks::default();
            let result = self
                .turn_executor
                .stream_turn(&mut session, &rendered, &opts, &mut callbacks)
                .await?;

            accumulate(&mut total_usage, &result.usage);
            total_cost += result.cost_usd;

            if result.is_error {
                return Err(Error::Turn(
                    result.error_text.unwrap_or_else(|| "turn failed with no error text".to_string()),
                ));
            }

            let parsed = match parser::parse(&result.content, input.phase_kind) {
                Ok(response) => response,
                Err(e) => {
                    prompt = format!(
                        "Your previous response could not be parsed as the required JSON schema: {}\n\n\
                         Respond again with a single JSON object matching the schema.",
                        e
                    );
                    continue;
                }
            };

            match parsed.verdict {
                Verdict::Continue => {
                    let reason = parsed.reason.unwrap_or_default();
                    prompt = format!(
                        "Continue. Iteration {} of {}. {}",
                        iteration + 1,
                        input.max_iterations,
                        reason
                    );
                    continue;
                }
                Verdict::Blocked => {
                    return Ok(PhaseOutcome::Blocked {
                        reason: parsed.reason.unwrap_or_else(|| "blocked with no reason given".to_string()),
                        iterations: iteration,
                    });
                }
                Verdict::Complete => {
                    if !input.backpressure_checks.is_empty() {
                        let report =
                            backpressure::run_checks(input.backpressure_checks, input.worktree_path).await?;
                        if !report.all_passed {
                            prompt = retry_context::render(&RetryContextInput {
                                failed_phase: input.phase_id.to_string(),
                                reason: "backpressure checks failed".to_string(),
                                failure_output: report.failure_summary,
                                attempt: iteration,
                                review_comments: vec![],
                                pr_comments: vec![],
                                user_instructions: None,
                                previous_context: None,
                            });
                            continue;
                        }
                    }

                    if let (Some(judge), false) = (self.judge, input.success_criteria.is_empty()) {
                        let judge_request = JudgeRequest {
                            criteria: input.success_criteria.to_vec(),
                            context: input.phase_id.to_string(),
                            phase_output: result.content.clone(),
                        };
                        let verdict = judge.evaluate(&judge_request).await?;
                        if !verdict.passed {
                            prompt = format!(
                                "The following success criteria were not met: {}\n\nReasoning: {}\n\n\
                                 Please address them and respond again.",
                                verdict.unmet_criteria.join(", "),
                                verdict.reasoning
                            );
                            continue;
                        }
                    }

                    return Ok(PhaseOutcome::Complete {
                        content: result.content,
                        iterations: iteration,
                        usage: total_usage,
                        cost_usd: total_cost,
                        response: parsed,
                    });
                }
            }
        }

        Err(Error::IterationExhausted(input.phase_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    use crate::harness::TurnResult;
    use crate::judge::JudgeResponse;

    struct ScriptedExecutor {
        responses: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl TurnExecutor for ScriptedExecutor {
        async fn execute_turn(
            &self,
            session: &mut TurnSession,
            prompt: &str,
            opts: &TurnOptions,
        ) -> Result<TurnResult> {
            let mut callbacks = StreamCallbacks::default();
            self.stream_turn(session, prompt, opts, &mut callbacks).await
        }

        async fn stream_turn(
            &self,
            _session: &mut TurnSession,
            _prompt: &str,
            _opts: &TurnOptions,
            _callbacks: &mut StreamCallbacks<'_>,
        ) -> Result<TurnResult> {
            let mut responses = self.responses.lock().unwrap();
            let next = responses.remove(0);
            Ok(TurnResult::text(next))
        }
    }

    struct AlwaysPassJudge;

    #[async_trait]
    impl LlmJudge for AlwaysPassJudge {
        async fn evaluate(&self, _request: &JudgeRequest) -> Result<JudgeResponse> {
            Ok(JudgeResponse { passed: true, reasoning: "ok".to_string(), unmet_criteria: vec![] })
        }
    }

    fn base_input<'a>(worktree: &'a Path) -> PhaseExecutionInput<'a> {
        PhaseExecutionInput {
            phase_id: "implement",
            phase_kind: PhaseKind::Standard,
            max_iterations: 5,
            model: "opus",
            initial_prompt: "do the thing".to_string(),
            extended_thinking: false,
            backpressure_checks: &[],
            success_criteria: &[],
            worktree_path: worktree,
        }
    }

    #[tokio::test]
    async fn test_completes_on_first_iteration() {
        let executor = ScriptedExecutor {
            responses: Mutex::new(vec![r#"{"status": "complete"}"#]),
        };
        let cancellation = CancellationToken::new();
        let phase_executor = PhaseExecutor::new(&executor, None, &cancellation);
        let worktree = Path::new(".");
        let outcome = phase_executor.execute(&base_input(worktree)).await.unwrap();
        assert!(matches!(outcome, PhaseOutcome::Complete { iterations: 1, .. }));
    }

    #[tokio::test]
    async fn test_continue_verdict_loops_to_next_iteration() {
        let executor = ScriptedExecutor {
            responses: Mutex::new(vec![
                r#"{"status": "continue", "reason": "still working"}"#,
                r#"{"status": "complete"}"#,
            ]),
        };
        let cancellation = CancellationToken::new();
        let phase_executor = PhaseExecutor::new(&executor, None, &cancellation);
        let worktree = Path::new(".");
        let outcome = phase_executor.execute(&base_input(worktree)).await.unwrap();
        assert!(matches!(outcome, PhaseOutcome::Complete { iterations: 2, .. }));
    }

    #[tokio::test]
    async fn test_blocked_verdict_returns_blocked_outcome() {
        let executor = ScriptedExecutor {
            responses: Mutex::new(vec![r#"{"status": "blocked", "reason": "need input"}"#]),
        };
        let cancellation = CancellationToken::new();
        let phase_executor = PhaseExecutor::new(&executor, None, &cancellation);
        let worktree = Path::new(".");
        let outcome = phase_executor.execute(&base_input(worktree)).await.unwrap();
        match outcome {
            PhaseOutcome::Blocked { reason, .. } => assert_eq!(reason, "need input"),
            _ => panic!("expected Blocked"),
        }
    }

    #[tokio::test]
    async fn test_parser_error_loops_with_corrective_prompt() {
        let executor = ScriptedExecutor {
            responses: Mutex::new(vec!["not json at all", r#"{"status": "complete"}"#]),
        };
        let cancellation = CancellationToken::new();
        let phase_executor = PhaseExecutor::new(&executor, None, &cancellation);
        let worktree = Path::new(".");
        let outcome = phase_executor.execute(&base_input(worktree)).await.unwrap();
        assert!(matches!(outcome, PhaseOutcome::Complete { iterations: 2, .. }));
    }

    #[tokio::test]
    async fn test_iteration_exhaustion_fails_phase() {
        let executor = ScriptedExecutor {
            responses: Mutex::new(vec![r#"{"status": "continue"}"#; 5]),
        };
        let cancellation = CancellationToken::new();
        let phase_executor = PhaseExecutor::new(&executor, None, &cancellation);
        let worktree = Path::new(".");
        let err = phase_executor.execute(&base_input(worktree)).await.unwrap_err();
        assert!(matches!(err, Error::IterationExhausted(_)));
    }

    #[tokio::test]
    async fn test_cancellation_short_circuits_before_any_turn() {
        let executor = ScriptedExecutor { responses: Mutex::new(vec![]) };
        let cancellation = CancellationToken::new();
        cancellation.cancel("user pressed ctrl-c");
        let phase_executor = PhaseExecutor::new(&executor, None, &cancellation);
        let worktree = Path::new(".");
        let err = phase_executor.execute(&base_input(worktree)).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test]
    async fn test_judge_rejection_loops_with_feedback() {
        struct RejectThenPassJudge {
            calls: Mutex<u32>,
        }

        #[async_trait]
        impl LlmJudge for RejectThenPassJudge {
            async fn evaluate(&self, _request: &JudgeRequest) -> Result<JudgeResponse> {
                let mut calls = self.calls.lock().unwrap();
                *calls += 1;
                if *calls == 1 {
                    Ok(JudgeResponse {
                        passed: false,
                        reasoning: "missing tests".to_string(),
                        unmet_criteria: vec!["has tests".to_string()],
                    })
                } else {
                    Ok(JudgeResponse { passed: true, reasoning: "ok".to_string(), unmet_criteria: vec![] })
                }
            }
        }

        let executor = ScriptedExecutor {
            responses: Mutex::new(vec![
                r#"{"status": "complete"}"#,
                r#"{"status": "complete"}"#,
            ]),
        };
        let judge = RejectThenPassJudge { calls: Mutex::new(0) };
        let cancellation = CancellationToken::new();
        let phase_executor = PhaseExecutor::new(&executor, Some(&judge), &cancellation);
        let worktree = Path::new(".");
        let mut input = base_input(worktree);
        input.success_criteria = &["has tests".to_string()];
        let outcome = phase_executor.execute(&input).await.unwrap();
        assert!(matches!(outcome, PhaseOutcome::Complete { iterations: 2, .. }));
    }

    #[tokio::test]
    async fn test_always_pass_judge_completes_in_one_iteration() {
        let executor = ScriptedExecutor {
            responses: Mutex::new(vec![r#"{"status": "complete"}"#]),
        };
        let judge = AlwaysPassJudge;
        let cancellation = CancellationToken::new();
        let phase_executor = PhaseExecutor::new(&executor, Some(&judge), &cancellation);
        let worktree = Path::new(".");
        let mut input = base_input(worktree);
        input.success_criteria = &["anything".to_string()];
        let outcome = phase_executor.execute(&input).await.unwrap();
        assert!(matches!(outcome, PhaseOutcome::Complete { iterations: 1, .. }));
    }
}
