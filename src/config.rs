//! Configuration loading and management.
//!
//! Grounded on `descartes-v2/src/config.rs`'s `Config::load` search order and TOML-backed
//! `Default` struct style.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub harness: HarnessConfig,

    #[serde(default)]
    pub git: GitConfig,

    #[serde(default)]
    pub review: ReviewConfig,

    #[serde(default)]
    pub judge: JudgeConfig,

    #[serde(default)]
    pub state: StateConfig,

    /// Global override: short-circuit every gate to approved (CLI `--skip-gates`).
    #[serde(default)]
    pub skip_gates: bool,

    #[serde(default = "default_prompts_dir")]
    pub prompts_dir: PathBuf,
}

fn default_prompts_dir() -> PathBuf {
    PathBuf::from("prompts")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            harness: HarnessConfig::default(),
            git: GitConfig::default(),
            review: ReviewConfig::default(),
            judge: JudgeConfig::default(),
            state: StateConfig::default(),
            skip_gates: false,
            prompts_dir: default_prompts_dir(),
        }
    }
}

impl Config {
    /// Load configuration from an explicit path, else `.orc/config.toml`, else
    /// `~/.orc/config.toml`, else built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = path.map(PathBuf::from).or_else(|| {
            let local = PathBuf::from(".orc/config.toml");
            if local.exists() {
                return Some(local);
            }
            dirs::home_dir().map(|h| h.join(".orc/config.toml"))
        });

        match config_path {
            Some(p) if p.exists() => {
                let content = std::fs::read_to_string(&p)?;
                let config: Config = toml::from_str(&content)?;
                Ok(config)
            }
            _ => Ok(Config::default()),
        }
    }

    pub fn state_dir(&self) -> PathBuf {
        self.state.directory.clone()
    }
}

/// Which turn-executor harness to use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessConfig {
    #[serde(default = "default_harness_kind")]
    pub kind: String,
    /// Path to the LLM driver binary (defaults to "claude" in PATH).
    #[serde(default)]
    pub binary: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub dangerously_skip_permissions: bool,
    /// Per-turn timeout.
    #[serde(with = "humantime_serde", default = "default_turn_timeout")]
    pub turn_timeout: Option<std::time::Duration>,
    /// Idle-warning threshold: warn if no output is seen for this long before the turn timeout.
    #[serde(with = "humantime_serde", default = "default_idle_warning")]
    pub idle_warning: Option<std::time::Duration>,
}

fn default_harness_kind() -> String {
    "claude-code".to_string()
}

fn default_model() -> String {
    "opus".to_string()
}

fn default_turn_timeout() -> Option<std::time::Duration> {
    Some(std::time::Duration::from_secs(600))
}

fn default_idle_warning() -> Option<std::time::Duration> {
    Some(std::time::Duration::from_secs(120))
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            kind: default_harness_kind(),
            binary: None,
            model: default_model(),
            dangerously_skip_permissions: false,
            turn_timeout: default_turn_timeout(),
            idle_warning: default_idle_warning(),
        }
    }
}

/// Git/worktree/sync policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    #[serde(default = "default_target_branch")]
    pub default_target_branch: String,
    #[serde(default = "default_true")]
    pub cleanup_on_completion: bool,
    #[serde(default)]
    pub cleanup_on_failure: bool,
    #[serde(default)]
    pub fail_on_conflict: bool,
    #[serde(default = "default_conflict_threshold")]
    pub conflict_count_threshold: usize,
    #[serde(default = "default_completion_action")]
    pub completion_action: String,
}

fn default_target_branch() -> String {
    "main".to_string()
}

fn default_true() -> bool {
    true
}

fn default_conflict_threshold() -> usize {
    10
}

fn default_completion_action() -> String {
    "none".to_string()
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            default_target_branch: default_target_branch(),
            cleanup_on_completion: default_true(),
            cleanup_on_failure: false,
            fail_on_conflict: false,
            conflict_count_threshold: default_conflict_threshold(),
            completion_action: default_completion_action(),
        }
    }
}

/// Parallel-reviewer policy (§5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewConfig {
    #[serde(default)]
    pub parallel_reviewers: usize,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            parallel_reviewers: 1,
        }
    }
}

/// LLM judge (AI gates, success-criteria validation) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_model")]
    pub model: String,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model: default_model(),
        }
    }
}

/// Execution-state store policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(default = "default_state_dir")]
    pub directory: PathBuf,
    #[serde(with = "humantime_serde", default = "default_heartbeat_interval")]
    pub heartbeat_interval: Option<std::time::Duration>,
    #[serde(with = "humantime_serde", default = "default_staleness_threshold")]
    pub staleness_threshold: Option<std::time::Duration>,
    #[serde(default = "default_max_retries")]
    pub max_retries_per_phase: u32,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".orc")
}

fn default_heartbeat_interval() -> Option<std::time::Duration> {
    Some(std::time::Duration::from_secs(5))
}

fn default_staleness_threshold() -> Option<std::time::Duration> {
    Some(std::time::Duration::from_secs(60))
}

fn default_max_retries() -> u32 {
    3
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            directory: default_state_dir(),
            heartbeat_interval: default_heartbeat_interval(),
            staleness_threshold: default_staleness_threshold(),
            max_retries_per_phase: default_max_retries(),
        }
    }
}

/// Custom serde module for `Option<Duration>` via humantime, since TOML has no native duration
/// type. Mirrors `descartes-v2/src/workflow/config.rs`'s `humantime_serde` helper.
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(d) => humantime::format_duration(*d).to_string().serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let opt: Option<String> = Option::deserialize(deserializer)?;
        match opt {
            Some(s) => humantime::parse_duration(&s)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

/// Initialize `.orc/` directory with a default config.
pub fn init() -> Result<()> {
    let orc_dir = PathBuf::from(".orc");
    if !orc_dir.exists() {
        std::fs::create_dir_all(&orc_dir)?;
    }

    let config_path = orc_dir.join("config.toml");
    if !config_path.exists() {
        let default_config = Config::default();
        let config_str =
            toml::to_string_pretty(&default_config).map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(&config_path, config_str)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.git.default_target_branch, "main");
        assert_eq!(config.state.max_retries_per_phase, 3);
        assert!(!config.skip_gates);
    }

    #[test]
    fn test_load_missing_path_falls_back_to_default() {
        let config = Config::load(Some(Path::new("/nonexistent/path.toml"))).unwrap();
        assert_eq!(config.harness.kind, "claude-code");
    }

    #[test]
    fn test_roundtrip_toml() {
        let config = Config::default();
        let s = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&s).unwrap();
        assert_eq!(parsed.git.conflict_count_threshold, config.git.conflict_count_threshold);
    }
}
