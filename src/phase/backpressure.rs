//! Backpressure (§4.5): deterministic, process-local checks (tests, lint) run before a phase's
//! `complete` verdict is accepted. Skipped for non-code phases.
//!
//! Grounded on `descartes-v2/src/ralph_loop.rs`'s subprocess-and-check-exit-status style (same
//! pattern as its git helpers), generalized into a configurable battery rather than one
//! hardcoded command.

use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::Result;

/// One configured check, e.g. `{name: "tests", command: "cargo test"}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackpressureCheck {
    pub name: String,
    pub command: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub output: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackpressureReport {
    pub all_passed: bool,
    pub results: Vec<CheckResult>,
    pub failure_summary: String,
}

/// Run each configured check to completion, in order, in `cwd`.
pub async fn run_checks(checks: &[BackpressureCheck], cwd: &std::path::Path) -> Result<BackpressureReport> {
    let mut results = Vec::with_capacity(checks.len());

    for check in checks {
        let parts = shell_words::split(&check.command)
            .map_err(|e| crate::Error::Config(format!("invalid backpressure command: {}", e)))?;
        let Some((program, args)) = parts.split_first() else {
            results.push(CheckResult {
                name: check.name.clone(),
                passed: false,
                output: "empty command".to_string(),
            });
            continue;
        };

        let output = Command::new(program)
            .args(args)
            .current_dir(cwd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await;

        match output {
            Ok(output) => {
                let combined = format!(
                    "{}{}",
                    String::from_utf8_lossy(&output.stdout),
                    String::from_utf8_lossy(&output.stderr)
                );
                results.push(CheckResult {
                    name: check.name.clone(),
                    passed: output.status.success(),
                    output: combined,
                });
            }
            Err(e) => {
                results.push(CheckResult {
                    name: check.name.clone(),
                    passed: false,
                    output: format!("failed to run: {}", e),
                });
            }
        }
    }

    let all_passed = results.iter().all(|r| r.passed);
    let failure_summary = if all_passed {
        String::new()
    } else {
        results
            .iter()
            .filter(|r| !r.passed)
            .map(|r| format!("{}: FAILED\n{}", r.name, r.output))
            .collect::<Vec<_>>()
            .join("\n\n")
    };

    Ok(BackpressureReport {
        all_passed,
        results,
        failure_summary,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_checks_all_pass() {
        let report = run_checks(&[], std::path::Path::new(".")).await.unwrap();
        assert!(report.all_passed);
        assert!(report.failure_summary.is_empty());
    }

    #[tokio::test]
    async fn test_passing_check() {
        let checks = vec![BackpressureCheck {
            name: "true-check".to_string(),
            command: "true".to_string(),
        }];
        let report = run_checks(&checks, std::path::Path::new(".")).await.unwrap();
        assert!(report.all_passed);
    }

    #[tokio::test]
    async fn test_failing_check_populates_summary() {
        let checks = vec![BackpressureCheck {
            name: "false-check".to_string(),
            command: "false".to_string(),
        }];
        let report = run_checks(&checks, std::path::Path::new(".")).await.unwrap();
        assert!(!report.all_passed);
        assert!(report.failure_summary.contains("false-check"));
    }
}
