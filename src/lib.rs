//! orc — autonomous task-execution engine
//!
//! Drives a language-model agent through a multi-phase workflow
//! (specify -> implement -> review -> test -> merge) to completion.
//!
//! ```text
//! Workflow + Task -> Workflow Runner -> (per phase) Phase Executor
//!                       -> (per iteration) Turn Executor -> Response Parser
//!                       -> {continue|blocked|complete} -> Gate Evaluator
//!                       -> {approve|retry->earlier phase|block|loop-back}
//! ```
//!
//! Side channel: execution state, heartbeat, events, git commits.

pub mod backend;
pub mod cancellation;
pub mod config;
pub mod git;
pub mod harness;
pub mod judge;
pub mod phase;
pub mod review;
pub mod task;
pub mod variables;
pub mod workflow;

pub use config::Config;
pub use task::{Task, TaskStatus, TaskWeight};

/// Crate-wide error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("turn execution error: {0}")]
    Turn(String),

    #[error("phase {0} exhausted its iteration budget")]
    IterationExhausted(String),

    #[error("gate rejected phase {phase}: {reason}")]
    GateRejection { phase: String, reason: String },

    #[error("sync conflict: {0}")]
    SyncConflict(String),

    #[error("merge failed: {0}")]
    MergeFailed(String),

    #[error("cancelled by user")]
    Cancelled,

    #[error("trigger infrastructure error: {0}")]
    TriggerInfra(String),

    #[error("task blocked: {0}")]
    TaskBlocked(String),

    #[error("git error: {0}")]
    Git(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("toml deserialize error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("toml serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
