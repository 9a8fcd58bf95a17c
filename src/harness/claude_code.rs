//! Subprocess-backed turn executor driving a headless Claude Code-style CLI.
//!
//! Grounded on `descartes-v2/src/harness/claude_code.rs`'s argument construction and
//! stream-json line parser; extended to read the driver's own `result` line for usage and cost
//! rather than leaving those untracked, and to honor the idle-warning/turn-timeout budget passed
//! in via `TurnOptions`.

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::time::timeout;

use crate::config::HarnessConfig;
use crate::{Error, Result};

use super::{
    StatusHint, StatusVerdict, StreamCallbacks, TurnExecutor, TurnOptions, TurnResult, TurnSession,
    TurnUsage,
};

pub struct ClaudeCodeExecutor {
    binary: String,
    model: String,
    skip_permissions: bool,
}

impl ClaudeCodeExecutor {
    pub fn new(config: &HarnessConfig) -> Result<Self> {
        Ok(Self {
            binary: config.binary.clone().unwrap_or_else(|| "claude".to_string()),
            model: config.model.clone(),
            skip_permissions: config.dangerously_skip_permissions,
        })
    }

    fn build_args(&self, session: &TurnSession, prompt: &str) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            prompt.to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--model".to_string(),
            self.model.clone(),
            "--verbose".to_string(),
        ];
        if let Some(id) = &session.id {
            args.push("--resume".to_string());
            args.push(id.clone());
        }
        if self.skip_permissions {
            args.push("--dangerously-skip-permissions".to_string());
        }
        args
    }
}

#[derive(Debug, Deserialize)]
struct StreamLine {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default)]
    usage: Option<StreamUsage>,
    #[serde(default)]
    total_cost_usd: Option<f64>,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    is_error: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cache_creation_input_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: u64,
}

fn status_hint_from_subtype(subtype: &str) -> Option<StatusHint> {
    match subtype {
        "success" => Some(StatusHint {
            verdict: StatusVerdict::Complete,
            reason: None,
        }),
        "error_max_turns" | "error_during_execution" => Some(StatusHint {
            verdict: StatusVerdict::Blocked,
            reason: Some(subtype.to_string()),
        }),
        _ => None,
    }
}

#[async_trait]
impl TurnExecutor for ClaudeCodeExecutor {
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
        session: &mut TurnSession,
        prompt: &str,
        opts: &TurnOptions,
        callbacks: &mut StreamCallbacks<'_>,
    ) -> Result<TurnResult> {
        let args = self.build_args(session, prompt);

        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Turn(format!("failed to spawn {}: {}", self.binary, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Turn("child process had no stdout".to_string()))?;
        let mut lines = BufReader::new(stdout).lines();

        let mut content = String::new();
        let mut usage = TurnUsage::default();
        let mut cost_usd = 0.0;
        let mut is_error = false;
        let mut error_text = None;
        let mut status_hint = None;

        let mut last_activity = Instant::now();
        let deadline = Instant::now() + opts.timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                (callbacks.on_turn_timeout)();
                let _ = child.start_kill();
                return Err(Error::Turn(format!(
                    "turn exceeded timeout of {:?}",
                    opts.timeout
                )));
            }

            let poll_window = opts
                .idle_warning
                .unwrap_or(Duration::from_secs(120))
                .min(remaining);

            match timeout(poll_window, lines.next_line()).await {
                Ok(Ok(Some(line))) => {
                    last_activity = Instant::now();
                    (callbacks.on_activity)();
                    if line.trim().is_empty() {
                        continue;
                    }
                    let parsed: StreamLine = match serde_json::from_str(&line) {
                        Ok(v) => v,
                        Err(_) => continue,
                    };

                    if let Some(id) = parsed.session_id.clone() {
                        session.id = Some(id);
                    }

                    match parsed.kind.as_str() {
                        "assistant" | "content" => {
                            let chunk = parsed.content.or(parsed.text).unwrap_or_default();
                            if !chunk.is_empty() {
                                (callbacks.on_chunk)(&chunk);
                                content.push_str(&chunk);
                            }
                        }
                        "result" => {
                            if let Some(u) = parsed.usage {
                                usage.input += u.input_tokens;
                                usage.output += u.output_tokens;
                                usage.cache_creation += u.cache_creation_input_tokens;
                                usage.cache_read += u.cache_read_input_tokens;
                            }
                            if let Some(c) = parsed.total_cost_usd {
                                cost_usd = c;
                            }
                            if let Some(text) = &parsed.result {
                                if content.is_empty() {
                                    content.push_str(text);
                                }
                            }
                            is_error = parsed.is_error.unwrap_or(false);
                            if let Some(subtype) = &parsed.subtype {
                                status_hint = status_hint_from_subtype(subtype);
                            }
                        }
                        "error" => {
                            is_error = true;
                            error_text = parsed.content.or(parsed.text);
                        }
                        _ => {}
                    }
                }
                Ok(Ok(None)) => break,
                Ok(Err(e)) => {
                    return Err(Error::Turn(format!("error reading child stdout: {}", e)));
                }
                Err(_) => {
                    if last_activity.elapsed() >= opts.idle_warning.unwrap_or(Duration::from_secs(120)) {
                        (callbacks.on_idle_warning)();
                    }
                    if let Some(interval) = opts.heartbeat_interval {
                        if last_activity.elapsed() >= interval {
                            (callbacks.on_heartbeat)();
                        }
                    }
                }
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| Error::Turn(format!("child process wait failed: {}", e)))?;
        if !status.success() && !is_error {
            is_error = true;
            error_text.get_or_insert_with(|| format!("process exited with {}", status));
        }

        Ok(TurnResult {
            content,
            usage,
            cost_usd,
            is_error,
            error_text,
            status_hint,
        })
    }
}
