//! Persistent Backend (§6.3) — the data plane.
//!
//! ```text
//! GetNextTaskID() -> string
//! GetNextWorkflowRunID() -> string
//! SaveTask(task); LoadTask(id); LoadAllTasks()
//! SaveWorkflowRun(run); SaveWorkflowRunPhase(p)
//! SetTaskExecutor(taskID, pid, hostname); ClearTaskExecutor(taskID)
//! SavePhaseOutput; GetPhaseOutput(runID, phaseID)
//! SaveArtifact; LoadArtifact(taskID, phaseID)
//! LoadSpec(taskID)
//! LoadReviewFindings(taskID, round)
//! SaveReviewFindings(taskID, round, findings)
//! LoadConstitution()
//! ```
//!
//! Grounded on `descartes-v2/src/workflow/state.rs`'s `StateManager` (one JSON/YAML file per
//! run, directory-scan for `find_latest`/`list`) and `descartes-v2/src/transcript/mod.rs`'s
//! directory-layout conventions, generalized from a single `WorkflowState` document into the
//! full record set §6.3 names.

pub mod file_backend;

pub use file_backend::FileBackend;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::review::ReviewFindings;
use crate::task::Task;
use crate::Result;

/// Status of one workflow run (§3 Workflow Run).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// One execution of a workflow on a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: String,
    pub workflow_id: String,
    pub task_id: Option<String>,
    pub context_prompt: Option<String>,
    pub context_instructions: Option<String>,
    pub variables_snapshot: std::collections::HashMap<String, String>,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_cost_usd: f64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
}

impl WorkflowRun {
    pub fn new(id: impl Into<String>, workflow_id: impl Into<String>, task_id: Option<String>) -> Self {
        Self {
            id: id.into(),
            workflow_id: workflow_id.into(),
            task_id,
            context_prompt: None,
            context_instructions: None,
            variables_snapshot: std::collections::HashMap::new(),
            status: RunStatus::Pending,
            started_at: Utc::now(),
            completed_at: None,
            total_cost_usd: 0.0,
            total_input_tokens: 0,
            total_output_tokens: 0,
        }
    }
}

/// One execution of one phase within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseRunRecord {
    pub run_id: String,
    pub template_id: String,
    pub status: crate::task::PhaseStatus,
    pub iterations_used: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_tokens: u64,
    pub cost_usd: f64,
    pub duration_ms: u64,
    pub artifact_content: Option<String>,
    pub error: Option<String>,
}

/// Content produced by a phase, keyed by (run id, phase id), addressable by `output_var_name`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseOutput {
    pub run_id: String,
    pub phase_id: String,
    pub output_var_name: String,
    pub content: String,
    pub produced_at: DateTime<Utc>,
}

#[async_trait]
pub trait PersistentBackend: Send + Sync {
    async fn get_next_task_id(&self) -> Result<String>;
    async fn get_next_workflow_run_id(&self) -> Result<String>;

    async fn save_task(&self, task: &Task) -> Result<()>;
    async fn load_task(&self, id: &str) -> Result<Task>;
    async fn load_all_tasks(&self) -> Result<Vec<Task>>;

    async fn save_workflow_run(&self, run: &WorkflowRun) -> Result<()>;
    async fn save_workflow_run_phase(&self, record: &PhaseRunRecord) -> Result<()>;

    async fn set_task_executor(&self, task_id: &str, pid: u32, hostname: &str) -> Result<()>;
    async fn clear_task_executor(&self, task_id: &str) -> Result<()>;

    async fn save_phase_output(&self, output: &PhaseOutput) -> Result<()>;
    async fn get_phase_output(&self, run_id: &str, phase_id: &str) -> Result<Option<PhaseOutput>>;

    async fn save_artifact(&self, task_id: &str, phase_id: &str, content: &str) -> Result<()>;
    async fn load_artifact(&self, task_id: &str, phase_id: &str) -> Result<Option<String>>;

    async fn load_spec(&self, task_id: &str) -> Result<Option<String>>;

    async fn load_review_findings(&self, task_id: &str, round: u32) -> Result<Option<ReviewFindings>>;
    async fn save_review_findings(
        &self,
        task_id: &str,
        round: u32,
        findings: &ReviewFindings,
    ) -> Result<()>;

    async fn load_constitution(&self) -> Result<Option<String>>;
}
