use super::{EvaluatorContent, EvaluatorDraft, EvaluatorKind, ModelConfig, PromptMessage};
use crate::model::AggregatorType;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluatorTemplate {
    pub key: String,
    pub name: String,
    pub description: String,
    pub kind: EvaluatorKind,
    pub draft: EvaluatorDraft,
}

const JUDGE_OUTPUT: &str = "Respond with JSON only: {\"score\": <number>, \"reason\": \"<one sentence>\"}.";

fn prompt(key: &str, name: &str, description: &str, system: &str, user: &str, value_set: Option<Vec<f64>>) -> EvaluatorTemplate {
    EvaluatorTemplate {
        key: key.into(),
        name: name.into(),
        description: description.into(),
        kind: EvaluatorKind::Prompt,
        draft: EvaluatorDraft {
            content: EvaluatorContent::Prompt {
                messages: vec![
                    PromptMessage {
                        role: "system".into(),
                        content: format!("{} {}", system, JUDGE_OUTPUT),
                    },
                    PromptMessage {
                        role: "user".into(),
                        content: user.into(),
                    },
                ],
                model: ModelConfig {
                    model: "gpt-4o-mini".into(),
                    temperature: Some(0.0),
                    max_tokens: Some(256),
                },
                tools: Vec::new(),
            },
            aggregators: vec![AggregatorType::Average, AggregatorType::Distribution],
            value_set,
        },
    }
}

fn code(key: &str, name: &str, description: &str, rules: &str) -> EvaluatorTemplate {
    EvaluatorTemplate {
        key: key.into(),
        name: name.into(),
        description: description.into(),
        kind: EvaluatorKind::Code,
        draft: EvaluatorDraft {
            content: EvaluatorContent::Code {
                language: "rules".into(),
                code: rules.into(),
            },
            aggregators: vec![AggregatorType::Average, AggregatorType::Distribution],
            value_set: Some(vec![0.0, 1.0]),
        },
    }
}

/// Built-in starting points for new evaluators.
pub fn builtin() -> Vec<EvaluatorTemplate> {
    vec![
        prompt(
            "correctness",
            "Correctness",
            "Judges whether the answer agrees with the reference answer.",
            "You grade answers against a reference. Score 1 if the answer is correct, 0 otherwise.",
            "Question: {{input}}\nReference: {{reference_output}}\nAnswer: {{actual_output}}",
            Some(vec![0.0, 1.0]),
        ),
        prompt(
            "relevance",
            "Relevance",
            "Rates how well the answer addresses the question on a 1-5 scale.",
            "You rate relevance from 1 (off-topic) to 5 (fully addresses the question).",
            "Question: {{input}}\nAnswer: {{actual_output}}",
            Some(vec![1.0, 2.0, 3.0, 4.0, 5.0]),
        ),
        code(
            "exact_match",
            "Exact match",
            "Scores 1 when the output equals the reference output.",
            r#"{"rules": [{"type": "equals_field", "field": "actual_output", "other": "reference_output"}]}"#,
        ),
        code(
            "contains_reference",
            "Contains reference",
            "Scores 1 when the output contains the reference output.",
            r#"{"rules": [{"type": "contains_field", "field": "actual_output", "other": "reference_output"}]}"#,
        ),
        code(
            "valid_json",
            "Valid JSON",
            "Scores 1 when the output parses as a JSON object.",
            r#"{"rules": [{"type": "json_schema", "field": "actual_output", "schema": {"type": "object"}}]}"#,
        ),
    ]
}

pub fn find(key: &str) -> Option<EvaluatorTemplate> {
    builtin().into_iter().find(|t| t.key == key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_keys_are_unique_and_kinds_match() {
        let all = builtin();
        let mut keys: Vec<&str> = all.iter().map(|t| t.key.as_str()).collect();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), all.len());
        for t in &all {
            assert_eq!(t.kind, t.draft.content.kind(), "{}", t.key);
        }
        assert!(find("exact_match").is_some());
        assert!(find("nope").is_none());
    }
}
