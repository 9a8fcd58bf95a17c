//! Response Parser (§4.1).
//!
//! `Parse(content) -> PhaseResponse | error`. Extraction strategy, in order: trimmed-content
//! parse, fenced-code-block extraction, string-aware balanced-brace scan.
//!
//! Grounded on `descartes-v2/src/baml/decision.rs`'s `get_output_format`/tagged-JSON-union
//! handling for the general shape of "the agent must answer in one JSON object", generalized
//! into an actual multi-strategy extractor since the teacher never needed to pull JSON out of
//! free prose (its BAML runtime enforced the schema upstream).

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

/// Which phase kind is being parsed — determines the accepted `status` vocabulary and its
/// mapping onto the three-way verdict (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    Standard,
    ReviewRound1,
    ReviewRound2,
    Qa,
    Implement,
}

impl Default for PhaseKind {
    fn default() -> Self {
        PhaseKind::Standard
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Complete,
    Blocked,
    Continue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VerificationCheck {
    pub status: CheckStatus,
    #[serde(default)]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SuccessCriterion {
    pub name: String,
    pub status: CheckStatus,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Verification {
    pub tests: VerificationCheck,
    pub build: VerificationCheck,
    pub linting: VerificationCheck,
    #[serde(default)]
    pub success_criteria: Vec<SuccessCriterion>,
}

#[derive(Debug, Clone)]
pub struct PhaseResponse {
    pub verdict: Verdict,
    pub reason: Option<String>,
    pub issues: Vec<String>,
    pub questions: Vec<String>,
    pub positives: Vec<String>,
    pub verification: Option<Verification>,
    pub raw: Value,
}

fn map_status(phase_kind: PhaseKind, status: &str) -> Option<Verdict> {
    match phase_kind {
        PhaseKind::Standard | PhaseKind::ReviewRound1 => match status {
            "complete" => Some(Verdict::Complete),
            "blocked" => Some(Verdict::Blocked),
            "continue" => Some(Verdict::Continue),
            _ => None,
        },
        PhaseKind::ReviewRound2 => match status {
            "pass" => Some(Verdict::Complete),
            "fail" => Some(Verdict::Blocked),
            "needs_user_input" => Some(Verdict::Blocked),
            _ => None,
        },
        PhaseKind::Qa => match status {
            "pass" => Some(Verdict::Complete),
            "fail" => Some(Verdict::Blocked),
            "needs_attention" => Some(Verdict::Blocked),
            _ => None,
        },
        PhaseKind::Implement => match status {
            "complete" => Some(Verdict::Complete),
            "blocked" => Some(Verdict::Blocked),
            "continue" => Some(Verdict::Continue),
            _ => None,
        },
    }
}

fn string_array(value: &Value, key: &str) -> Vec<String> {
    value
        .get(key)
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// Parse the extracted JSON value into a [`PhaseResponse`], enforcing the implement-phase
/// verification rule: a `complete` verdict with any FAIL entry is a parser error, not a blocked
/// verdict — the agent claimed success it did not have evidence for.
fn interpret(value: Value, phase_kind: PhaseKind) -> Result<PhaseResponse> {
    let status = value
        .get("status")
        .and_then(|s| s.as_str())
        .ok_or_else(|| Error::Parse("response JSON is missing a \"status\" field".to_string()))?;

    let verdict = map_status(phase_kind, status)
        .ok_or_else(|| Error::Parse(format!("unrecognized status value: \"{}\"", status)))?;

    let verification: Option<Verification> = match value.get("verification") {
        Some(v) => Some(
            serde_json::from_value(v.clone())
                .map_err(|e| Error::Parse(format!("malformed verification object: {}", e)))?,
        ),
        None => None,
    };

    if phase_kind == PhaseKind::Implement && verdict == Verdict::Complete {
        let verification = verification.as_ref().ok_or_else(|| {
            Error::Parse(
                "implement phase claimed complete with no verification object".to_string(),
            )
        })?;
        let any_fail = verification.tests.status == CheckStatus::Fail
            || verification.build.status == CheckStatus::Fail
            || verification.linting.status == CheckStatus::Fail
            || verification
                .success_criteria
                .iter()
                .any(|c| c.status == CheckStatus::Fail);
        if any_fail {
            return Err(Error::Parse(
                "implement phase claimed complete but verification contains a FAIL entry"
                    .to_string(),
            ));
        }
    }

    Ok(PhaseResponse {
        verdict,
        reason: value.get("reason").and_then(|v| v.as_str()).map(str::to_string),
        issues: string_array(&value, "issues"),
        questions: string_array(&value, "questions"),
        positives: string_array(&value, "positives"),
        verification,
        raw: value,
    })
}

fn extract_fenced_json(content: &str) -> Option<&str> {
    let re = Regex::new(r"```(?:json)?\s*\n?([\s\S]*?)```").unwrap();
    for cap in re.captures_iter(content) {
        if let Some(block) = cap.get(1) {
            let text = block.as_str().trim();
            if text.contains("\"status\"") {
                return Some(text);
            }
        }
    }
    None
}

/// String-aware balanced-brace scan: find the first `{`, then track nesting depth, skipping
/// over characters inside double-quoted strings (honoring backslash escapes), and return the
/// first fully-balanced substring whose contents mention `"status"`.
fn scan_balanced_json(content: &str) -> Option<&str> {
    let bytes = content.as_bytes();
    let mut start_candidates = Vec::new();
    for (i, b) in bytes.iter().enumerate() {
        if *b == b'{' {
            start_candidates.push(i);
        }
    }

    for start in start_candidates {
        let mut depth = 0i32;
        let mut in_string = false;
        let mut escape = false;
        for (offset, ch) in content[start..].char_indices() {
            if escape {
                escape = false;
                continue;
            }
            match ch {
                '\\' if in_string => escape = true,
                '"' => in_string = !in_string,
                '{' if !in_string => depth += 1,
                '}' if !in_string => {
                    depth -= 1;
                    if depth == 0 {
                        let end = start + offset + ch.len_utf8();
                        let candidate = &content[start..end];
                        if candidate.contains("\"status\"") {
                            return Some(candidate);
                        }
                        break;
                    }
                }
                _ => {}
            }
        }
    }
    None
}

pub fn parse(content: &str, phase_kind: PhaseKind) -> Result<PhaseResponse> {
    let trimmed = content.trim();

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return interpret(value, phase_kind);
    }

    if let Some(fenced) = extract_fenced_json(trimmed) {
        if let Ok(value) = serde_json::from_str::<Value>(fenced) {
            return interpret(value, phase_kind);
        }
    }

    if let Some(scanned) = scan_balanced_json(trimmed) {
        if let Ok(value) = serde_json::from_str::<Value>(scanned) {
            return interpret(value, phase_kind);
        }
    }

    Err(Error::Parse(format!(
        "no JSON object with a \"status\" field could be extracted from: {}",
        truncate_for_error(trimmed)
    )))
}

fn truncate_for_error(s: &str) -> String {
    const MAX: usize = 500;
    if s.len() <= MAX {
        s.to_string()
    } else {
        format!("{}...", &s[..MAX])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_direct_json() {
        let content = r#"{"status": "complete", "reason": "done"}"#;
        let response = parse(content, PhaseKind::Standard).unwrap();
        assert_eq!(response.verdict, Verdict::Complete);
    }

    #[test]
    fn test_parse_fenced_json() {
        let content = "Here's my response:\n```json\n{\"status\": \"continue\"}\n```\nLet me know.";
        let response = parse(content, PhaseKind::Standard).unwrap();
        assert_eq!(response.verdict, Verdict::Continue);
    }

    #[test]
    fn test_parse_scanned_json_with_nested_braces() {
        let content = "Some prose { not json } more prose {\"status\": \"blocked\", \"reason\": \"needs a {nested} decision\"}";
        let response = parse(content, PhaseKind::Standard).unwrap();
        assert_eq!(response.verdict, Verdict::Blocked);
    }

    #[test]
    fn test_unknown_status_is_error() {
        let content = r#"{"status": "maybe"}"#;
        assert!(parse(content, PhaseKind::Standard).is_err());
    }

    #[test]
    fn test_review_round_two_status_mapping() {
        let content = r#"{"status": "needs_user_input"}"#;
        let response = parse(content, PhaseKind::ReviewRound2).unwrap();
        assert_eq!(response.verdict, Verdict::Blocked);
    }

    #[test]
    fn test_implement_complete_with_fail_is_rejected() {
        let content = r#"{
            "status": "complete",
            "verification": {
                "tests": {"status": "FAIL"},
                "build": {"status": "PASS"},
                "linting": {"status": "PASS"},
                "success_criteria": []
            }
        }"#;
        let err = parse(content, PhaseKind::Implement).unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }

    #[test]
    fn test_implement_complete_without_verification_is_rejected() {
        let content = r#"{"status": "complete"}"#;
        assert!(parse(content, PhaseKind::Implement).is_err());
    }

    #[test]
    fn test_implement_complete_with_all_pass_succeeds() {
        let content = r#"{
            "status": "complete",
            "verification": {
                "tests": {"status": "PASS"},
                "build": {"status": "PASS"},
                "linting": {"status": "PASS"},
                "success_criteria": [{"name": "renders", "status": "PASS"}]
            }
        }"#;
        let response = parse(content, PhaseKind::Implement).unwrap();
        assert_eq!(response.verdict, Verdict::Complete);
    }
}
