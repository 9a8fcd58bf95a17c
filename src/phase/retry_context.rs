//! Retry-Context Builder (§4.2).
//!
//! `{failed_phase, reason, failure_output, attempt, review_comments?, pr_comments?,
//! user_instructions?, previous_context?} -> markdown`. Idempotent, pure function of its
//! inputs; truncation always keeps the tail (most recent output is most informative).
//!
//! Grounded on `descartes-v2/src/handoff/mod.rs`'s `Handoff`/`HandoffBuilder::render_default`
//! (section-by-populated-field markdown rendering) and its `truncate` tail-preservation idea,
//! reshaped for the backward (later-phase-failed -> earlier-phase-retried) direction and
//! widened to a ≥250,000-byte budget — the teacher only ever truncates to 500 chars for CLI
//! display.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One review comment, grouped by file for deterministic rendering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewComment {
    pub file: String,
    pub line: Option<u32>,
    pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrComment {
    pub author: String,
    pub body: String,
}

/// Inputs to the retry-context builder (§4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryContextInput {
    pub failed_phase: String,
    pub reason: String,
    pub failure_output: String,
    pub attempt: u32,
    #[serde(default)]
    pub review_comments: Vec<ReviewComment>,
    #[serde(default)]
    pub pr_comments: Vec<PrComment>,
    #[serde(default)]
    pub user_instructions: Option<String>,
    #[serde(default)]
    pub previous_context: Option<String>,
}

/// Minimum byte budget for the tail-preserved failure output, per §4.2.
pub const MIN_TRUNCATION_BUDGET: usize = 250_000;

/// Keep the tail of `text` within `budget` bytes, since the most recent output is the most
/// informative. Cuts on a UTF-8 char boundary.
pub fn truncate_tail(text: &str, budget: usize) -> String {
    if text.len() <= budget {
        return text.to_string();
    }
    let mut start = text.len() - budget;
    while start < text.len() && !text.is_char_boundary(start) {
        start += 1;
    }
    format!("... [truncated {} bytes] ...\n{}", start, &text[start..])
}

/// Render the structured retry context as markdown. Pure and idempotent: identical input always
/// produces identical output.
pub fn render(input: &RetryContextInput) -> String {
    let mut sections = Vec::new();

    sections.push(format!(
        "# Retry Context: {} (attempt {})\n",
        input.failed_phase, input.attempt
    ));

    sections.push(format!("## Previous Failure\n{}\n", input.reason));

    let truncated_output = truncate_tail(&input.failure_output, MIN_TRUNCATION_BUDGET);
    sections.push(format!("## Failure Output\n```\n{}\n```\n", truncated_output));

    if !input.review_comments.is_empty() {
        let mut by_file: BTreeMap<&str, Vec<&ReviewComment>> = BTreeMap::new();
        for comment in &input.review_comments {
            by_file.entry(comment.file.as_str()).or_default().push(comment);
        }
        let mut rendered = String::new();
        for (file, mut comments) in by_file {
            comments.sort_by_key(|c| c.line.unwrap_or(0));
            rendered.push_str(&format!("### {}\n", file));
            for comment in comments {
                match comment.line {
                    Some(line) => rendered.push_str(&format!("- L{}: {}\n", line, comment.body)),
                    None => rendered.push_str(&format!("- {}\n", comment.body)),
                }
            }
        }
        sections.push(format!("## Review Comments\n{}", rendered));
    }

    if !input.pr_comments.is_empty() {
        let rendered = input
            .pr_comments
            .iter()
            .map(|c| format!("- **{}**: {}", c.author, c.body))
            .collect::<Vec<_>>()
            .join("\n");
        sections.push(format!("## PR Comments\n{}\n", rendered));
    }

    if let Some(instructions) = &input.user_instructions {
        sections.push(format!("## User Instructions\n{}\n", instructions));
    }

    if let Some(previous) = &input.previous_context {
        sections.push(format!("## Previous Session Summary\n{}\n", previous));
    }

    sections.push("---\nPlease address these and complete the task.".to_string());

    sections.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_input() -> RetryContextInput {
        RetryContextInput {
            failed_phase: "implement".to_string(),
            reason: "review rejected".to_string(),
            failure_output: "short output".to_string(),
            attempt: 1,
            review_comments: vec![],
            pr_comments: vec![],
            user_instructions: None,
            previous_context: None,
        }
    }

    #[test]
    fn test_render_is_pure_and_idempotent() {
        let input = base_input();
        assert_eq!(render(&input), render(&input));
    }

    #[test]
    fn test_truncate_tail_keeps_most_recent_bytes() {
        let text = "a".repeat(10) + "END";
        let truncated = truncate_tail(&text, 3);
        assert!(truncated.ends_with("END"));
    }

    #[test]
    fn test_truncate_tail_no_op_under_budget() {
        let text = "short";
        assert_eq!(truncate_tail(text, 250_000), text);
    }

    #[test]
    fn test_review_comments_grouped_by_file_and_sorted() {
        let mut input = base_input();
        input.review_comments = vec![
            ReviewComment {
                file: "b.rs".to_string(),
                line: Some(5),
                body: "fix this".to_string(),
            },
            ReviewComment {
                file: "a.rs".to_string(),
                line: Some(20),
                body: "second".to_string(),
            },
            ReviewComment {
                file: "a.rs".to_string(),
                line: Some(3),
                body: "first".to_string(),
            },
        ];
        let rendered = render(&input);
        let a_pos = rendered.find("### a.rs").unwrap();
        let b_pos = rendered.find("### b.rs").unwrap();
        assert!(a_pos < b_pos);
        let first_pos = rendered.find("first").unwrap();
        let second_pos = rendered.find("second").unwrap();
        assert!(first_pos < second_pos);
    }

    #[test]
    fn test_all_optional_sections_included_when_present() {
        let mut input = base_input();
        input.user_instructions = Some("focus on edge cases".to_string());
        input.previous_context = Some("prior attempt summary".to_string());
        input.pr_comments = vec![PrComment {
            author: "reviewer".to_string(),
            body: "looks close".to_string(),
        }];
        let rendered = render(&input);
        assert!(rendered.contains("focus on edge cases"));
        assert!(rendered.contains("prior attempt summary"));
        assert!(rendered.contains("looks close"));
    }
}
