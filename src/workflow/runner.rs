//! Workflow Runner (§4.6): drives a task through every phase of a workflow in topological
//! order, wiring together the Phase Executor, Gate Evaluator, lifecycle triggers, worktree/sync
//! engine, and execution-state store.
//!
//! Grounded on `descartes-v2/src/workflow/runner.rs`'s `WorkflowRunner::run` (acquire state,
//! iterate stages, persist after each one) for the overall driving loop shape; the per-phase
//! gate/loop-back/retry branching has no teacher counterpart and is built fresh from §4.6.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use tracing::{info, warn};

use crate::backend::{PersistentBackend, PhaseOutput, WorkflowRun};
use crate::cancellation::CancellationToken;
use crate::git::{CleanupTrigger, Git, SyncEngine, WorktreeManager};
use crate::harness::{TurnExecutor, TurnUsage};
use crate::judge::LlmJudge;
use crate::phase::{retry_context, PhaseExecutionInput, PhaseExecutor, PhaseKind, PhaseOutcome, PhaseResponse, Verdict};
use crate::review::{self, ReviewFindings, ReviewIssue, Severity};
use crate::task::{GateDecisionRecord, PhaseStatus, RetryContext, Task, TaskStatus, UsageTotals};
use crate::variables::{DefaultVariableResolver, ResolutionContext, VariableResolver};
use crate::{Config, Error, Result};

use super::config::{GateType, LifecycleEvent, LoopCondition, PhaseTemplate, PromptSource, WorkflowConfig, WorkflowPhase};
use super::gate::{GateDecision, GateEvaluator, GateInput};
use super::resource::{self, BranchLeases};
use super::state::{ExecutionStateStore, HeartbeatRunner};
use super::triggers;

/// Per-invocation overrides (§4.6). Resume is implicit: any phase already `completed` on the
/// loaded task is skipped, its output reloaded into the variable map.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Stop once this phase has completed, instead of running the whole workflow.
    pub to_phase: Option<String>,
    /// Free-text instructions folded into the next retry context, if any.
    pub extra_context: Option<String>,
}

/// Budget assumed for one phase iteration when deriving the phase-level wall-clock timeout, and
/// the hard ceiling on that derived timeout (a runaway phase must not hang the run forever).
const PER_ITERATION_BUDGET: StdDuration = StdDuration::from_secs(600);
const PHASE_TIMEOUT_CEILING: StdDuration = StdDuration::from_secs(3600 * 4);

pub struct WorkflowRunner {
    workflow_config: WorkflowConfig,
    app_config: Config,
    backend: Arc<dyn PersistentBackend>,
    git: Arc<dyn Git>,
    turn_executor: Arc<dyn TurnExecutor>,
    judge: Option<Arc<dyn LlmJudge>>,
    cancellation: CancellationToken,
    branch_leases: BranchLeases,
}

impl WorkflowRunner {
    pub fn new(
        workflow_config: WorkflowConfig,
        app_config: Config,
        backend: Arc<dyn PersistentBackend>,
        git: Arc<dyn Git>,
        turn_executor: Arc<dyn TurnExecutor>,
        judge: Option<Arc<dyn LlmJudge>>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            workflow_config,
            app_config,
            backend,
            git,
            turn_executor,
            judge,
            cancellation,
            branch_leases: BranchLeases::default(),
        }
    }

    /// Run (or resume) `task_id` to completion, to a block/fail/pause point, or to
    /// `options.to_phase`.
    pub async fn run(&self, task_id: &str, options: RunOptions) -> Result<Task> {
        let ordered = self.workflow_config.topological_order()?;
        let state_store = ExecutionStateStore::new(self.backend.as_ref());

        let pid = std::process::id();
        let hostname = hostname();
        let staleness = self.app_config.state.staleness_threshold.unwrap_or(StdDuration::from_secs(60));

        if !state_store.acquire(task_id, pid, &hostname, staleness).await? {
            return Err(Error::TaskBlocked(format!(
                "task {} is already owned by a live executor",
                task_id
            )));
        }

        let heartbeat = self.app_config.state.heartbeat_interval.map(|interval| {
            HeartbeatRunner::spawn(self.backend.clone(), task_id.to_string(), interval)
        });

        let pids_before = resource::snapshot_pids();
        let result = self.run_inner(task_id, &ordered, &options).await;
        resource::log_orphan_candidates(task_id, &pids_before, &resource::snapshot_pids());

        if let Some(heartbeat) = heartbeat {
            heartbeat.stop().await;
        }
        state_store.release(task_id).await?;

        result
    }

    async fn run_inner(&self, task_id: &str, ordered: &[String], options: &RunOptions) -> Result<Task> {
        let mut task = self.backend.load_task(task_id).await?;
        let repo_root = PathBuf::from(".");
        let worktree_manager = WorktreeManager::new(repo_root);
        let worktree = worktree_manager
            .setup_worktree(&task, None, &self.app_config.git, self.git.as_ref())
            .await?;

        let sync = SyncEngine::new(self.git.as_ref(), &self.app_config.git);
        if let Err(e) = sync.start_sync(&task.branch_name(), &worktree.target_branch).await {
            let manager = WorktreeManager::new(PathBuf::from("."));
            let _ = manager
                .cleanup(&worktree.path, self.git.as_ref(), &self.app_config.git, CleanupTrigger::SyncSetup)
                .await;
            task.status = TaskStatus::Failed;
            task.substate.blocked_reason = Some(format!("sync_failed: {}", e));
            self.backend.save_task(&task).await?;
            return Err(e);
        }

        let run_id = self.backend.get_next_workflow_run_id().await?;
        let mut run = WorkflowRun::new(run_id, self.workflow_config.workflow.name.clone(), Some(task_id.to_string()));
        run.status = crate::backend::RunStatus::Running;
        self.backend.save_workflow_run(&run).await?;

        let mut variables: HashMap<String, String> = HashMap::new();
        for phase_id in ordered {
            if task.substate.phase_status(phase_id) == PhaseStatus::Completed {
                if let Some(output) = self.backend.get_phase_output(&run.id, phase_id).await? {
                    variables.insert(output.output_var_name, output.content);
                }
            }
        }
        if let Some(extra) = &options.extra_context {
            variables.insert("user_instructions".to_string(), extra.clone());
        }

        let mut idx = 0usize;
        while idx < ordered.len() {
            let phase_id = ordered[idx].clone();

            if task.substate.phase_status(&phase_id) == PhaseStatus::Completed {
                idx += 1;
                continue;
            }

            if let Some(to_phase) = &options.to_phase {
                if &phase_id == to_phase && idx > 0 {
                    break;
                }
            }

            if self.cancellation.is_cancelled() {
                return self.handle_cancellation(&mut task, &run).await;
            }

            let phase_def = self
                .workflow_config
                .phase(&phase_id)
                .ok_or_else(|| Error::Config(format!("unknown phase \"{}\"", phase_id)))?
                .clone();
            let template = self
                .workflow_config
                .template(&phase_id)
                .ok_or_else(|| Error::Config(format!("unknown template \"{}\"", phase_id)))?
                .clone();

            if let Some(trigger) = &phase_def.before_phase {
                let outcome = triggers::run_before_phase(trigger).await?;
                variables.extend(outcome.updated_vars);
                if !outcome.approved {
                    task.status = TaskStatus::Blocked;
                    task.substate.blocked_reason = outcome.reason;
                    self.backend.save_task(&task).await?;
                    return Ok(task);
                }
            }

            task.substate.set_phase_status(&phase_id, PhaseStatus::Running);
            task.substate.current_phase = Some(phase_id.clone());
            self.backend.save_task(&task).await?;

            let outcome = self.run_one_phase(&task, &template, &variables, &worktree.path).await;

            let outcome = match outcome {
                Ok(outcome) => outcome,
                Err(Error::Cancelled) => return self.handle_cancellation(&mut task, &run).await,
                Err(e) => {
                    task.substate.set_phase_status(&phase_id, PhaseStatus::Failed);
                    task.status = TaskStatus::Failed;
                    self.backend.save_task(&task).await?;
                    triggers::fire_lifecycle(&self.workflow_config.triggers, LifecycleEvent::OnTaskFailed)
                        .await
                        .ok();
                    let manager = WorktreeManager::new(PathBuf::from("."));
                    let _ = manager
                        .cleanup(&worktree.path, self.git.as_ref(), &self.app_config.git, CleanupTrigger::Failure)
                        .await;
                    return Err(e);
                }
            };

            match outcome {
                PhaseOutcome::Blocked { reason, .. } => {
                    task.substate.set_phase_status(&phase_id, PhaseStatus::Failed);
                    task.status = TaskStatus::Blocked;
                    task.substate.blocked_reason = Some(reason);
                    self.backend.save_task(&task).await?;
                    return Ok(task);
                }
                PhaseOutcome::Complete { content, iterations, usage, cost_usd, response } => {
                    task.substate.usage.add(&UsageTotals {
                        input_tokens: usage.input,
                        output_tokens: usage.output,
                        cache_creation_tokens: usage.cache_creation,
                        cache_read_tokens: usage.cache_read,
                        cost_usd,
                    });

                    if let Some(var_name) = &template.output_var_name {
                        self.backend
                            .save_phase_output(&PhaseOutput {
                                run_id: run.id.clone(),
                                phase_id: phase_id.clone(),
                                output_var_name: var_name.clone(),
                                content: content.clone(),
                                produced_at: Utc::now(),
                            })
                            .await?;
                        variables.insert(var_name.clone(), content.clone());
                    }
                    if template.produces_artifact {
                        self.backend.save_artifact(&task.id, &phase_id, &content).await?;
                    }
                    self.backend
                        .save_workflow_run_phase(&crate::backend::PhaseRunRecord {
                            run_id: run.id.clone(),
                            template_id: phase_id.clone(),
                            status: PhaseStatus::Completed,
                            iterations_used: iterations,
                            input_tokens: usage.input,
                            output_tokens: usage.output,
                            cache_tokens: usage.cache_creation + usage.cache_read,
                            cost_usd,
                            duration_ms: 0,
                            artifact_content: if template.produces_artifact { Some(content.clone()) } else { None },
                            error: None,
                        })
                        .await?;

                    if let Some(round) = review_round(template.phase_kind) {
                        let findings = review_findings_from_response(&response);
                        self.backend.save_review_findings(&task.id, round, &findings).await?;
                    }

                    if let Some(loop_config) = &phase_def.loop_config {
                        if evaluate_loop_condition(loop_config.condition, &response, &content) {
                            let retries = task.substate.retry_count(&phase_id);
                            if retries < loop_config.max_iterations {
                                task.substate.increment_retry(&phase_id);
                                if let Some(target_idx) = ordered.iter().position(|p| p == &loop_config.loop_to_phase) {
                                    for reset_id in &ordered[target_idx..=idx] {
                                        task.substate.set_phase_status(reset_id, PhaseStatus::Pending);
                                    }
                                    task.substate.set_phase_status(&phase_id, PhaseStatus::Completed);
                                    self.backend.save_task(&task).await?;
                                    idx = target_idx;
                                    continue;
                                }
                            } else {
                                info!("phase {} loop-back budget exhausted, proceeding to gate", phase_id);
                            }
                        }
                    }

                    let decision = self.evaluate_gate(&task, &phase_id, &template, &phase_def, &content).await?;
                    task.substate.record_gate_decision(GateDecisionRecord {
                        phase: phase_id.clone(),
                        approved: decision.approved,
                        pending: decision.pending,
                        reason: decision.reason.clone(),
                        retry_phase: decision.retry_phase.clone(),
                        recorded_at: Utc::now(),
                    });

                    if decision.pending {
                        task.status = TaskStatus::Blocked;
                        task.substate.blocked_reason = Some(decision.reason);
                        self.backend.save_task(&task).await?;
                        return Ok(task);
                    }

                    if !decision.approved {
                        let max_retries = self.app_config.state.max_retries_per_phase;
                        let is_review_gate =
                            matches!(template.phase_kind, PhaseKind::ReviewRound1 | PhaseKind::ReviewRound2);

                        match &decision.retry_phase {
                            Some(target) if task.substate.retry_count(&phase_id) < max_retries => {
                                let attempt = task.substate.increment_retry(&phase_id);
                                let review_comments = match review_round(template.phase_kind) {
                                    Some(round) => self
                                        .backend
                                        .load_review_findings(&task.id, round)
                                        .await?
                                        .map(|findings| {
                                            findings
                                                .issues
                                                .into_iter()
                                                .map(|issue| retry_context::ReviewComment {
                                                    file: issue.file,
                                                    line: Some(issue.line),
                                                    body: issue.description,
                                                })
                                                .collect()
                                        })
                                        .unwrap_or_default(),
                                    None => vec![],
                                };
                                let rendered = retry_context::render(&retry_context::RetryContextInput {
                                    failed_phase: phase_id.clone(),
                                    reason: decision.reason.clone(),
                                    failure_output: content.clone(),
                                    attempt,
                                    review_comments,
                                    pr_comments: vec![],
                                    user_instructions: options.extra_context.clone(),
                                    previous_context: None,
                                });
                                task.substate.retry_context = Some(RetryContext {
                                    from_phase: phase_id.clone(),
                                    to_phase: target.clone(),
                                    reason: decision.reason.clone(),
                                    failure_output: content.clone(),
                                    attempt,
                                    context_file: None,
                                });
                                variables.insert("retry_context".to_string(), rendered);

                                if let Some(target_idx) = ordered.iter().position(|p| p == target) {
                                    for reset_id in &ordered[target_idx..=idx] {
                                        task.substate.set_phase_status(reset_id, PhaseStatus::Pending);
                                    }
                                    self.backend.save_task(&task).await?;
                                    idx = target_idx;
                                    continue;
                                }
                            }
                            _ => {
                                if is_review_gate {
                                    task.status = TaskStatus::Failed;
                                    self.backend.save_task(&task).await?;
                                    triggers::fire_lifecycle(&self.workflow_config.triggers, LifecycleEvent::OnTaskFailed)
                                        .await
                                        .ok();
                                    let manager = WorktreeManager::new(PathBuf::from("."));
                                    let _ = manager
                                        .cleanup(
                                            &worktree.path,
                                            self.git.as_ref(),
                                            &self.app_config.git,
                                            CleanupTrigger::Failure,
                                        )
                                        .await;
                                    return Ok(task);
                                }
                                warn!(
                                    "gate rejected phase {} with no retry budget remaining, continuing as a warning",
                                    phase_id
                                );
                            }
                        }
                    }

                    task.substate.set_phase_status(&phase_id, PhaseStatus::Completed);
                    task.substate.retry_context = None;
                    self.backend.save_task(&task).await?;
                    idx += 1;
                }
            }
        }

        self.finish(&mut task, &worktree, &mut run).await
    }

    async fn run_one_phase(
        &self,
        task: &Task,
        template: &PhaseTemplate,
        variables: &HashMap<String, String>,
        worktree_path: &std::path::Path,
    ) -> Result<PhaseOutcome> {
        let resolution_ctx = ResolutionContext {
            task_id: task.id.clone(),
            phase_outputs: variables.clone(),
            extra: variables.clone(),
        };
        let resolved = DefaultVariableResolver
            .resolve_all(&self.workflow_config.variables, &resolution_ctx)
            .await?;
        let mut render_vars = variables.clone();
        render_vars.extend(resolved);

        let prompt_text = self.load_prompt(&template.prompt_source)?;
        let prompt = render_template(&prompt_text, &render_vars, task);

        let model = template
            .default_model
            .clone()
            .unwrap_or_else(|| self.app_config.harness.model.clone());

        if matches!(template.phase_kind, PhaseKind::ReviewRound1 | PhaseKind::ReviewRound2)
            && self.app_config.review.parallel_reviewers > 1
        {
            return self.run_parallel_review_phase(template, &prompt, &model).await;
        }

        let input = PhaseExecutionInput {
            phase_id: &template.id,
            phase_kind: template.phase_kind,
            max_iterations: template.max_iterations,
            model: &model,
            initial_prompt: prompt,
            extended_thinking: false,
            backpressure_checks: &template.backpressure,
            success_criteria: &template.success_criteria,
            worktree_path,
        };

        let executor = PhaseExecutor::new(self.turn_executor.as_ref(), self.judge.as_deref(), &self.cancellation);
        let timeout = StdDuration::from_secs(template.max_iterations as u64 * PER_ITERATION_BUDGET.as_secs())
            .min(PHASE_TIMEOUT_CEILING);

        match tokio::time::timeout(timeout, executor.execute(&input)).await {
            Ok(result) => result,
            Err(_) => Err(Error::IterationExhausted(template.id.clone())),
        }
    }

    /// Fan out `review.parallel_reviewers` independent reviewer turns and merge their findings
    /// (§5 "parallel reviewers"), bypassing the single-turn `PhaseExecutor` loop entirely.
    async fn run_parallel_review_phase(
        &self,
        template: &PhaseTemplate,
        prompt: &str,
        model: &str,
    ) -> Result<PhaseOutcome> {
        let phase_kind = template.phase_kind;
        let findings = review::run_parallel_reviewers(
            self.turn_executor.as_ref(),
            prompt,
            model,
            self.app_config.review.parallel_reviewers,
            |content| crate::phase::parser::parse(content, phase_kind).map(|parsed| review_findings_from_response(&parsed)),
        )
        .await;

        let content = serde_json::to_string(&findings)
            .map_err(|e| Error::Config(format!("failed to serialize merged review findings: {}", e)))?;
        let raw = serde_json::to_value(&findings)
            .map_err(|e| Error::Config(format!("failed to serialize merged review findings: {}", e)))?;
        let verdict = if findings.has_findings() { Verdict::Continue } else { Verdict::Complete };
        let response = PhaseResponse {
            verdict,
            reason: None,
            issues: findings.issues.iter().map(|i| i.description.clone()).collect(),
            questions: vec![],
            positives: vec![],
            verification: None,
            raw,
        };

        Ok(PhaseOutcome::Complete {
            content,
            iterations: 1,
            usage: TurnUsage::default(),
            cost_usd: 0.0,
            response,
        })
    }

    async fn evaluate_gate(
        &self,
        task: &Task,
        phase_id: &str,
        template: &PhaseTemplate,
        phase_def: &WorkflowPhase,
        content: &str,
    ) -> Result<GateDecision> {
        let gate_type = phase_def.overrides.gate_type.unwrap_or(template.gate_type);
        let mut metadata = HashMap::new();
        metadata.insert("task_id".to_string(), task.id.clone());
        metadata.insert("title".to_string(), task.title.clone());

        let gate_input = GateInput {
            gate_type,
            phase_output: content,
            task_metadata: &metadata,
            skip_gates_override: self.app_config.skip_gates,
            auto_approve_on_success: true,
            ai_criteria: &[],
            output_var: template.output_var_name.as_deref(),
            script: None,
            retry_target: self.workflow_config.retry_target(phase_id),
        };

        GateEvaluator::evaluate(&gate_input, self.judge.as_deref()).await
    }

    async fn handle_cancellation(&self, task: &mut Task, run: &WorkflowRun) -> Result<Task> {
        let reason = self.cancellation.reason().unwrap_or_else(|| "cancelled".to_string());
        info!("run {} cancelled: {}", run.id, reason);

        let _ = self
            .git
            .create_checkpoint(&task.id, task.substate.current_phase.as_deref().unwrap_or("unknown"), "pause-wip")
            .await;
        let _ = tokio::time::timeout(
            StdDuration::from_secs(30),
            self.git.push("origin", &task.branch_name(), true),
        )
        .await;

        task.status = TaskStatus::Paused;
        task.substate.blocked_reason = Some(reason);
        self.backend.save_task(task).await?;
        Ok(task.clone())
    }

    async fn finish(
        &self,
        task: &mut Task,
        worktree: &crate::git::WorktreeHandle,
        run: &mut WorkflowRun,
    ) -> Result<Task> {
        let sync = SyncEngine::new(self.git.as_ref(), &self.app_config.git);
        if let Err(e) = sync.completion_sync(&task.branch_name(), &worktree.target_branch).await {
            task.status = TaskStatus::Blocked;
            task.substate.blocked_reason = Some(format!("completion sync failed: {}", e));
            self.backend.save_task(task).await?;
            return Ok(task.clone());
        }

        match self.app_config.git.completion_action.as_str() {
            "merge" => {
                let _lease = self.branch_leases.acquire(&worktree.target_branch).await;
                let merged = async {
                    self.git.checkout_safe(&worktree.target_branch).await?;
                    self.git.merge(&task.branch_name(), false).await?;
                    self.git.push("origin", &worktree.target_branch, false).await
                }
                .await;

                if let Err(e) = merged {
                    task.status = TaskStatus::Blocked;
                    task.substate.blocked_reason = Some(format!("merge_failed: {}", e));
                    self.backend.save_task(task).await?;
                    return Ok(task.clone());
                }
            }
            "pr" => {
                self.git.push("origin", &task.branch_name(), true).await?;
            }
            _ => {}
        }

        let manager = WorktreeManager::new(PathBuf::from("."));
        manager
            .cleanup(&worktree.path, self.git.as_ref(), &self.app_config.git, CleanupTrigger::Completion)
            .await?;

        task.status = TaskStatus::Resolved;
        task.substate.current_phase = None;
        self.backend.save_task(task).await?;

        run.status = crate::backend::RunStatus::Completed;
        run.completed_at = Some(Utc::now());
        run.total_cost_usd = task.substate.usage.cost_usd;
        run.total_input_tokens = task.substate.usage.input_tokens;
        run.total_output_tokens = task.substate.usage.output_tokens;
        self.backend.save_workflow_run(run).await?;

        triggers::fire_lifecycle(&self.workflow_config.triggers, LifecycleEvent::OnTaskCompleted).await?;

        Ok(task.clone())
    }

    fn load_prompt(&self, source: &PromptSource) -> Result<String> {
        match source {
            PromptSource::Inline { text } => Ok(text.clone()),
            PromptSource::Filesystem { path } => {
                let full = self.app_config.prompts_dir.join(path);
                std::fs::read_to_string(&full)
                    .map_err(|e| Error::Config(format!("failed to read prompt {}: {}", full.display(), e)))
            }
            PromptSource::Embedded { name } => {
                let full = self.app_config.prompts_dir.join("embedded").join(format!("{}.md", name));
                std::fs::read_to_string(&full)
                    .map_err(|e| Error::Config(format!("failed to read embedded prompt \"{}\": {}", name, e)))
            }
        }
    }
}

/// Which review round a phase kind corresponds to, for `save_review_findings`/
/// `load_review_findings` keying. `None` for non-review phase kinds.
fn review_round(phase_kind: PhaseKind) -> Option<u32> {
    match phase_kind {
        PhaseKind::ReviewRound1 => Some(1),
        PhaseKind::ReviewRound2 => Some(2),
        _ => None,
    }
}

/// Map one reviewer turn's parsed response onto `ReviewFindings`. The parser has no per-issue
/// file/line/severity vocabulary, so each `issues` entry becomes an unlocated medium-severity
/// finding; `merge`'s dedup still collapses duplicates across reviewers by description.
fn review_findings_from_response(response: &PhaseResponse) -> ReviewFindings {
    ReviewFindings {
        issues: response
            .issues
            .iter()
            .map(|issue| ReviewIssue {
                file: "unknown".to_string(),
                line: 0,
                severity: Severity::Medium,
                description: issue.clone(),
            })
            .collect(),
    }
}

/// Substitute `{{name}}` placeholders with resolved variable values, plus the always-available
/// `{{task_id}}`, `{{task_title}}`, `{{task_description}}`.
fn render_template(template: &str, variables: &HashMap<String, String>, task: &Task) -> String {
    let mut rendered = template.to_string();
    rendered = rendered.replace("{{task_id}}", &task.id);
    rendered = rendered.replace("{{task_title}}", &task.title);
    rendered = rendered.replace("{{task_description}}", &task.description);
    for (key, value) in variables {
        rendered = rendered.replace(&format!("{{{{{}}}}}", key), value);
    }
    rendered
}

/// Loop-back condition evaluation (§4.6 step 5), against the phase's just-produced response.
fn evaluate_loop_condition(condition: LoopCondition, response: &PhaseResponse, content: &str) -> bool {
    match condition {
        LoopCondition::HasFindings => !response.issues.is_empty(),
        LoopCondition::NotEmpty => !content.trim().is_empty(),
        LoopCondition::StatusNeedsFix => response
            .raw
            .get("status")
            .and_then(|v| v.as_str())
            .map(|s| s.contains("fix") || s.contains("needs"))
            .unwrap_or(false),
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}
