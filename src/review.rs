//! Parallel-reviewer fan-out and deterministic findings merge (§5).
//!
//! Grounded on `descartes-v2/src/agent/subagent.rs`'s `spawn_parallel` (`join_all` fan-out,
//! independent completion, no shared mutable state across the parallel branch). The merge rule
//! itself — dedup by `(file, line, normalized_description)`, sort by severity rank then file —
//! has no teacher counterpart and is built fresh from §5's description.

use std::collections::HashSet;

use futures::future::join_all;
use serde::{Deserialize, Serialize};

use crate::harness::{TurnExecutor, TurnOptions, TurnSession};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Rank used for sorting: highest severity first.
    fn rank(self) -> u8 {
        match self {
            Severity::Critical => 0,
            Severity::High => 1,
            Severity::Medium => 2,
            Severity::Low => 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewIssue {
    pub file: String,
    pub line: u32,
    pub severity: Severity,
    pub description: String,
}

impl ReviewIssue {
    fn normalized_description(&self) -> String {
        self.description
            .to_lowercase()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn dedup_key(&self) -> (String, u32, String) {
        (self.file.clone(), self.line, self.normalized_description())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReviewFindings {
    pub issues: Vec<ReviewIssue>,
}

impl ReviewFindings {
    pub fn has_findings(&self) -> bool {
        !self.issues.is_empty()
    }

    /// Merge findings from N independent reviewer perspectives: concatenate, deduplicate by
    /// `(file, line, normalized_description)`, sort by severity rank then file (§5).
    pub fn merge(findings: Vec<ReviewFindings>) -> ReviewFindings {
        let mut seen = HashSet::new();
        let mut merged = Vec::new();

        for f in findings {
            for issue in f.issues {
                let key = issue.dedup_key();
                if seen.insert(key) {
                    merged.push(issue);
                }
            }
        }

        merged.sort_by(|a, b| {
            a.severity
                .rank()
                .cmp(&b.severity.rank())
                .then_with(|| a.file.cmp(&b.file))
        });

        ReviewFindings { issues: merged }
    }
}

/// Run `count` independent reviewer turns against the same prompt and merge their findings.
/// `parse` converts one turn's raw content into `ReviewFindings` (the Response Parser owns the
/// actual extraction strategy; this function only owns the fan-out and merge).
pub async fn run_parallel_reviewers<F>(
    executor: &dyn TurnExecutor,
    prompt: &str,
    model: &str,
    count: usize,
    parse: F,
) -> ReviewFindings
where
    F: Fn(&str) -> Result<ReviewFindings> + Send + Sync,
{
    let opts = TurnOptions::default();

    let turns = (0..count.max(1)).map(|_| async {
        let mut session = TurnSession {
            id: None,
            model: model.to_string(),
        };
        executor.execute_turn(&mut session, prompt, &opts).await
    });

    let results = join_all(turns).await;

    let findings: Vec<ReviewFindings> = results
        .into_iter()
        .filter_map(|r| r.ok())
        .filter(|r| !r.is_error)
        .filter_map(|r| parse(&r.content).ok())
        .collect();

    ReviewFindings::merge(findings)
}
