//! Task data model: identity, lifecycle, and execution substate.
//!
//! Grounded on `descartes-v2/src/scud/mod.rs`'s `Task`/`TaskStatus` for the general shape of a
//! persisted unit-of-work record, extended with the execution substate (retry context, executor
//! identity, heartbeat, token/cost counters) this engine's resumability requires.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Relative size of the work a task represents. Recorded but not interpreted by the core (see
/// DESIGN.md's Open Question resolution on parallel-reviewer scaling).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskWeight {
    Trivial,
    Small,
    Medium,
    Large,
    Greenfield,
}

/// Top-level task lifecycle. Transitions are driven exclusively by the workflow runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Created,
    Running,
    Paused,
    Blocked,
    Failed,
    Completed,
    /// Terminal alias for `Completed` after the completion action (merge/PR) has landed.
    Resolved,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Paused
                | TaskStatus::Blocked
                | TaskStatus::Failed
                | TaskStatus::Completed
                | TaskStatus::Resolved
        )
    }
}

/// Per-phase status within a task's execution substate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl Default for PhaseStatus {
    fn default() -> Self {
        PhaseStatus::Pending
    }
}

/// `{from_phase, to_phase, reason, failure_output, attempt, context_file?}`, persisted on the
/// execution substate. Cleared after a successful review or at task completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryContext {
    pub from_phase: String,
    pub to_phase: String,
    pub reason: String,
    pub failure_output: String,
    pub attempt: u32,
    #[serde(default)]
    pub context_file: Option<String>,
}

/// Identity of the process currently executing a task. At most one executor may own a task at a
/// time; ownership is acquired by a compare-and-set on the execution substate (see
/// `ExecutionSubstate::try_acquire`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorIdentity {
    pub pid: u32,
    pub hostname: String,
    pub last_heartbeat: DateTime<Utc>,
}

/// A recorded gate decision, kept on the execution substate for audit/resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateDecisionRecord {
    pub phase: String,
    pub approved: bool,
    pub pending: bool,
    pub reason: String,
    pub retry_phase: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Accumulated token/cost counters across the run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
    pub cost_usd: f64,
}

impl UsageTotals {
    pub fn add(&mut self, other: &UsageTotals) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_creation_tokens += other.cache_creation_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
        self.cost_usd += other.cost_usd;
    }

    /// Effective input tokens = raw input + cache-creation + cache-read (§6.1).
    pub fn effective_input_tokens(&self) -> u64 {
        self.input_tokens + self.cache_creation_tokens + self.cache_read_tokens
    }
}

/// Nested per-task execution state: phase statuses, retry context, current executor identity,
/// accumulated cost/token counters, recorded gate decisions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionSubstate {
    #[serde(default)]
    pub phases: HashMap<String, PhaseStatus>,
    #[serde(default)]
    pub retry_context: Option<RetryContext>,
    #[serde(default)]
    pub retry_counts: HashMap<String, u32>,
    #[serde(default)]
    pub executor: Option<ExecutorIdentity>,
    #[serde(default)]
    pub usage: UsageTotals,
    #[serde(default)]
    pub gate_decisions: Vec<GateDecisionRecord>,
    #[serde(default)]
    pub current_phase: Option<String>,
    #[serde(default)]
    pub blocked_reason: Option<String>,
}

impl ExecutionSubstate {
    /// Compare-and-set ownership acquisition: succeeds if no executor is recorded, or the
    /// recorded executor's heartbeat is at least `staleness` old.
    pub fn try_acquire(
        &mut self,
        pid: u32,
        hostname: &str,
        now: DateTime<Utc>,
        staleness: chrono::Duration,
    ) -> bool {
        if let Some(existing) = &self.executor {
            let age = now - existing.last_heartbeat;
            if age < staleness {
                return false;
            }
        }
        self.executor = Some(ExecutorIdentity {
            pid,
            hostname: hostname.to_string(),
            last_heartbeat: now,
        });
        true
    }

    pub fn heartbeat(&mut self, now: DateTime<Utc>) {
        if let Some(executor) = &mut self.executor {
            executor.last_heartbeat = now;
        }
    }

    pub fn clear_executor(&mut self) {
        self.executor = None;
    }

    pub fn is_stale(&self, now: DateTime<Utc>, staleness: chrono::Duration) -> bool {
        match &self.executor {
            Some(e) => now - e.last_heartbeat > staleness,
            None => false,
        }
    }

    pub fn phase_status(&self, phase_id: &str) -> PhaseStatus {
        self.phases.get(phase_id).copied().unwrap_or_default()
    }

    pub fn set_phase_status(&mut self, phase_id: &str, status: PhaseStatus) {
        self.phases.insert(phase_id.to_string(), status);
    }

    pub fn retry_count(&self, phase_id: &str) -> u32 {
        self.retry_counts.get(phase_id).copied().unwrap_or(0)
    }

    pub fn increment_retry(&mut self, phase_id: &str) -> u32 {
        let count = self.retry_counts.entry(phase_id.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn record_gate_decision(&mut self, record: GateDecisionRecord) {
        self.gate_decisions.push(record);
    }
}

/// The unit of work driven through a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub category: Option<String>,
    pub weight: TaskWeight,
    pub status: TaskStatus,
    #[serde(default)]
    pub substate: ExecutionSubstate,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(id: impl Into<String>, title: impl Into<String>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: title.into(),
            description: description.into(),
            category: None,
            weight: TaskWeight::Medium,
            status: TaskStatus::Created,
            substate: ExecutionSubstate::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Branch name is derived deterministically from the task id (`orc/<id>`).
    pub fn branch_name(&self) -> String {
        format!("orc/{}", self.id)
    }

    /// A task is resumable when it has at least one completed phase and at least one
    /// non-completed phase.
    pub fn is_resumable(&self) -> bool {
        let has_completed = self
            .substate
            .phases
            .values()
            .any(|s| *s == PhaseStatus::Completed);
        let has_incomplete = self
            .substate
            .phases
            .values()
            .any(|s| *s != PhaseStatus::Completed);
        has_completed && has_incomplete
    }
}
