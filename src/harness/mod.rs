//! Turn Executor (§6.1) — external collaborator interface.
//!
//! ```text
//! ExecuteTurn(ctx, prompt) -> { content, usage: {input, output, cache_creation, cache_read},
//!                               cost_usd, is_error, error_text?, status_hint? }
//! UpdateSessionID(id)
//! StreamTurn(ctx, prompt, onChunk, onActivity, onHeartbeat, onIdleWarning, onTurnTimeout)
//! ```
//!
//! Grounded on `descartes-v2/src/harness/mod.rs`'s `Harness` trait and
//! `descartes-v2/src/harness/claude_code.rs`'s subprocess-argument construction and stream-json
//! line parser, widened to surface token usage and cost directly rather than leaving it
//! untracked.

mod claude_code;

pub use claude_code::ClaudeCodeExecutor;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{Error, Result};

/// A turn-local session handle. The turn executor is free to treat this as opaque; the engine
/// only ever round-trips it via `update_session_id`.
#[derive(Debug, Clone, Default)]
pub struct TurnSession {
    pub id: Option<String>,
    pub model: String,
}

/// Token usage for one turn.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TurnUsage {
    pub input: u64,
    pub output: u64,
    pub cache_creation: u64,
    pub cache_read: u64,
}

impl TurnUsage {
    pub fn effective_input(&self) -> u64 {
        self.input + self.cache_creation + self.cache_read
    }
}

/// A coarse hint about how the turn resolved, surfaced by harnesses that can detect it without
/// the engine needing to parse the response body (e.g. the LLM driver's own exit signalling).
/// The engine's own Response Parser (§4.1) is authoritative; this is advisory only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusVerdict {
    Complete,
    Blocked,
    Continue,
}

#[derive(Debug, Clone)]
pub struct StatusHint {
    pub verdict: StatusVerdict,
    pub reason: Option<String>,
}

/// Result of one turn.
#[derive(Debug, Clone)]
pub struct TurnResult {
    pub content: String,
    pub usage: TurnUsage,
    pub cost_usd: f64,
    pub is_error: bool,
    pub error_text: Option<String>,
    pub status_hint: Option<StatusHint>,
}

impl TurnResult {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            usage: TurnUsage::default(),
            cost_usd: 0.0,
            is_error: false,
            error_text: None,
            status_hint: None,
        }
    }
}

/// Turn budget and streaming-notification timing, passed as policy flags rather than baked into
/// the executor.
#[derive(Debug, Clone)]
pub struct TurnOptions {
    pub timeout: Duration,
    pub idle_warning: Option<Duration>,
    pub heartbeat_interval: Option<Duration>,
}

impl Default for TurnOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(600),
            idle_warning: Some(Duration::from_secs(120)),
            heartbeat_interval: Some(Duration::from_secs(5)),
        }
    }
}

/// Callbacks driven during `stream_turn`. Plain `FnMut` closures rather than a trait object per
/// callback keeps call sites terse; all are optional no-ops by default.
pub struct StreamCallbacks<'a> {
    pub on_chunk: Box<dyn FnMut(&str) + Send + 'a>,
    pub on_activity: Box<dyn FnMut() + Send + 'a>,
    pub on_heartbeat: Box<dyn FnMut() + Send + 'a>,
    pub on_idle_warning: Box<dyn FnMut() + Send + 'a>,
    pub on_turn_timeout: Box<dyn FnMut() + Send + 'a>,
}

impl<'a> Default for StreamCallbacks<'a> {
    fn default() -> Self {
        Self {
            on_chunk: Box::new(|_| {}),
            on_activity: Box::new(|| {}),
            on_heartbeat: Box::new(|| {}),
            on_idle_warning: Box::new(|| {}),
            on_turn_timeout: Box::new(|| {}),
        }
    }
}

/// The Turn Executor contract (§6.1).
#[async_trait]
pub trait TurnExecutor: Send + Sync {
    /// Run one turn to completion and return its full result.
    async fn execute_turn(
        &self,
        session: &mut TurnSession,
        prompt: &str,
        opts: &TurnOptions,
    ) -> Result<TurnResult>;

    /// Run one turn, delivering incremental output through `callbacks` as it arrives.
    async fn stream_turn(
        &self,
        session: &mut TurnSession,
        prompt: &str,
        opts: &TurnOptions,
        callbacks: &mut StreamCallbacks<'_>,
    ) -> Result<TurnResult>;

    fn update_session_id(&self, session: &mut TurnSession, id: String) {
        session.id = Some(id);
    }
}

/// Which turn-executor backend to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HarnessKind {
    ClaudeCode,
}

impl std::str::FromStr for HarnessKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "claude-code" | "claude" => Ok(HarnessKind::ClaudeCode),
            other => Err(Error::Config(format!("unknown harness kind: {}", other))),
        }
    }
}

/// Construct the configured turn executor.
pub fn create_turn_executor(config: &crate::Config) -> Result<Box<dyn TurnExecutor>> {
    let kind: HarnessKind = config.harness.kind.parse()?;
    match kind {
        HarnessKind::ClaudeCode => Ok(Box::new(ClaudeCodeExecutor::new(&config.harness)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_input_tokens() {
        let usage = TurnUsage {
            input: 10,
            output: 5,
            cache_creation: 3,
            cache_read: 2,
        };
        assert_eq!(usage.effective_input(), 15);
    }

    #[test]
    fn test_harness_kind_parse() {
        assert_eq!("claude".parse::<HarnessKind>().unwrap(), HarnessKind::ClaudeCode);
        assert!("nonexistent".parse::<HarnessKind>().is_err());
    }
}
