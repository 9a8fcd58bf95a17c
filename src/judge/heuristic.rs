//! Keyword-cascade fallback judge.
//!
//! Grounded on `descartes-v2/src/baml/decision.rs`'s `make_heuristic_decision`: a short,
//! ordered list of rules evaluated top to bottom rather than a single scoring function, so the
//! reasoning stays legible when a human reads it back.

use async_trait::async_trait;

use super::{JudgeRequest, JudgeResponse, LlmJudge};
use crate::Result;

const FAILURE_MARKERS: &[&str] = &["fail", "error", "exception", "traceback", "panicked"];

pub struct HeuristicJudge;

#[async_trait]
impl LlmJudge for HeuristicJudge {
    async fn evaluate(&self, request: &JudgeRequest) -> Result<JudgeResponse> {
        let output_lower = request.phase_output.to_lowercase();

        // Rule 1: no criteria to check means nothing to fail against.
        if request.criteria.is_empty() {
            return Ok(JudgeResponse {
                passed: true,
                reasoning: "no success criteria were configured for this phase".to_string(),
                unmet_criteria: vec![],
            });
        }

        // Rule 2: a failure marker anywhere in the output is treated as touching every
        // criterion, since we have no way to attribute it to one specifically.
        if FAILURE_MARKERS.iter().any(|m| output_lower.contains(m)) {
            return Ok(JudgeResponse {
                passed: false,
                reasoning: "phase output contains a failure marker".to_string(),
                unmet_criteria: request.criteria.clone(),
            });
        }

        // Rule 3: each criterion passes if its own keywords (lowercased, non-trivial words)
        // appear somewhere in the output.
        let unmet: Vec<String> = request
            .criteria
            .iter()
            .filter(|criterion| {
                let words: Vec<&str> = criterion
                    .split_whitespace()
                    .filter(|w| w.len() > 3)
                    .collect();
                if words.is_empty() {
                    return false;
                }
                let criterion_lower = criterion.to_lowercase();
                !output_lower.contains(&criterion_lower)
                    && !words.iter().any(|w| output_lower.contains(&w.to_lowercase()))
            })
            .cloned()
            .collect();

        if unmet.is_empty() {
            Ok(JudgeResponse {
                passed: true,
                reasoning: "no failure markers found and all criteria keywords were present"
                    .to_string(),
                unmet_criteria: vec![],
            })
        } else {
            Ok(JudgeResponse {
                reasoning: format!("{} of {} criteria had no supporting evidence in the output", unmet.len(), request.criteria.len()),
                passed: false,
                unmet_criteria: unmet,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_criteria_passes() {
        let judge = HeuristicJudge;
        let request = JudgeRequest {
            criteria: vec![],
            context: String::new(),
            phase_output: "anything".to_string(),
        };
        let response = judge.evaluate(&request).await.unwrap();
        assert!(response.passed);
    }

    #[tokio::test]
    async fn test_failure_marker_fails_all_criteria() {
        let judge = HeuristicJudge;
        let request = JudgeRequest {
            criteria: vec!["tests pass".to_string()],
            context: String::new(),
            phase_output: "Traceback (most recent call last): AssertionError".to_string(),
        };
        let response = judge.evaluate(&request).await.unwrap();
        assert!(!response.passed);
        assert_eq!(response.unmet_criteria, vec!["tests pass".to_string()]);
    }

    #[tokio::test]
    async fn test_matching_keywords_pass() {
        let judge = HeuristicJudge;
        let request = JudgeRequest {
            criteria: vec!["all tests pass".to_string()],
            context: String::new(),
            phase_output: "Ran 12 tests, all passed successfully.".to_string(),
        };
        let response = judge.evaluate(&request).await.unwrap();
        assert!(response.passed);
    }
}
