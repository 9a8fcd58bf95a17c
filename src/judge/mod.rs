//! LLM Judge (§6.4) — external collaborator interface.
//!
//! `Evaluate(request: {criteria, context, phase_output}) -> {passed, reasoning,
//! unmet_criteria}`. Used by the AI gate type and by the Phase Executor's success-criteria
//! validation (§4.5).
//!
//! Grounded on `descartes-v2/src/baml/runtime.rs`'s `PromptBuilder` section-based prompt
//! assembly and `descartes-v2/src/baml/decision.rs`'s `make_heuristic_decision` rule cascade,
//! which becomes the fallback judge in [`heuristic`] when no turn executor is configured or the
//! judge is disabled.

pub mod heuristic;

pub use heuristic::HeuristicJudge;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::harness::{TurnExecutor, TurnOptions, TurnSession};
use crate::{Error, Result};

/// What the judge is asked to evaluate.
#[derive(Debug, Clone)]
pub struct JudgeRequest {
    pub criteria: Vec<String>,
    pub context: String,
    pub phase_output: String,
}

/// The judge's verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeResponse {
    pub passed: bool,
    pub reasoning: String,
    #[serde(default)]
    pub unmet_criteria: Vec<String>,
}

#[async_trait]
pub trait LlmJudge: Send + Sync {
    async fn evaluate(&self, request: &JudgeRequest) -> Result<JudgeResponse>;
}

/// Assembles a structured prompt the way `PromptBuilder` does: ordered `## Title` sections
/// followed by an explicit output-format instruction.
struct PromptBuilder {
    sections: Vec<String>,
}

impl PromptBuilder {
    fn new() -> Self {
        Self { sections: Vec::new() }
    }

    fn section(mut self, title: &str, content: &str) -> Self {
        self.sections.push(format!("## {}\n{}", title, content));
        self
    }

    fn build(self) -> String {
        let mut prompt = self.sections.join("\n\n");
        prompt.push_str(
            "\n\n## Output Format\nRespond with a single JSON object: \
             {\"passed\": true|false, \"reasoning\": \"...\", \"unmet_criteria\": [\"...\"]}",
        );
        prompt
    }
}

fn build_judge_prompt(request: &JudgeRequest) -> String {
    PromptBuilder::new()
        .section("Success Criteria", &request.criteria.join("\n- "))
        .section("Context", &request.context)
        .section("Phase Output", &request.phase_output)
        .build()
}

/// Judge backed by a turn executor: sends the evaluation prompt as a one-shot turn and parses
/// the JSON response directly. Falls back to [`HeuristicJudge`] if the turn itself errors.
pub struct TurnExecutorJudge {
    executor: Arc<dyn TurnExecutor>,
    model: String,
    fallback: HeuristicJudge,
}

impl TurnExecutorJudge {
    pub fn new(executor: Arc<dyn TurnExecutor>, model: impl Into<String>) -> Self {
        Self {
            executor,
            model: model.into(),
            fallback: HeuristicJudge,
        }
    }
}

#[async_trait]
impl LlmJudge for TurnExecutorJudge {
    async fn evaluate(&self, request: &JudgeRequest) -> Result<JudgeResponse> {
        let prompt = build_judge_prompt(request);
        let mut session = TurnSession {
            id: None,
            model: self.model.clone(),
        };
        let opts = TurnOptions::default();

        let result = match self.executor.execute_turn(&mut session, &prompt, &opts).await {
            Ok(r) if !r.is_error => r,
            _ => return self.fallback.evaluate(request).await,
        };

        match parse_judge_response(&result.content) {
            Ok(response) => Ok(response),
            Err(_) => self.fallback.evaluate(request).await,
        }
    }
}

/// Extract the JSON judge verdict from the turn's content. Tries a direct parse first, then
/// falls back to scanning for the first balanced `{...}` block, mirroring the Response Parser's
/// trimmed-parse-then-scan strategy (§4.1).
fn parse_judge_response(content: &str) -> Result<JudgeResponse> {
    let trimmed = content.trim();
    if let Ok(response) = serde_json::from_str::<JudgeResponse>(trimmed) {
        return Ok(response);
    }

    if let Some(start) = trimmed.find('{') {
        let mut depth = 0i32;
        let mut in_string = false;
        let mut escape = false;
        for (offset, ch) in trimmed[start..].char_indices() {
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
                        let candidate = &trimmed[start..start + offset + ch.len_utf8()];
                        if let Ok(response) = serde_json::from_str::<JudgeResponse>(candidate) {
                            return Ok(response);
                        }
                        break;
                    }
                }
                _ => {}
            }
        }
    }

    Err(Error::Parse(
        "could not locate a judge verdict JSON object in the turn output".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_judge_prompt_includes_all_sections() {
        let request = JudgeRequest {
            criteria: vec!["Tests pass".to_string()],
            context: "phase: test".to_string(),
            phase_output: "all green".to_string(),
        };
        let prompt = build_judge_prompt(&request);
        assert!(prompt.contains("Tests pass"));
        assert!(prompt.contains("all green"));
        assert!(prompt.contains("Output Format"));
    }

    #[test]
    fn test_parse_judge_response_direct() {
        let content = r#"{"passed": true, "reasoning": "ok", "unmet_criteria": []}"#;
        let parsed = parse_judge_response(content).unwrap();
        assert!(parsed.passed);
    }

    #[test]
    fn test_parse_judge_response_embedded_in_prose() {
        let content = "Here is my verdict:\n{\"passed\": false, \"reasoning\": \"missing tests\", \"unmet_criteria\": [\"tests pass\"]}\nThanks.";
        let parsed = parse_judge_response(content).unwrap();
        assert!(!parsed.passed);
        assert_eq!(parsed.unmet_criteria, vec!["tests pass".to_string()]);
    }
}
