//! Prompt evaluator: renders the version's messages and asks an LLM for a verdict.

use crate::llm::{ChatRequest, LlmClient};
use crate::render::{placeholders, render};
use async_trait::async_trait;
use loopeval_core::context::Ctx;
use loopeval_core::errors::{EvalError, EvalResult};
use loopeval_core::evaluator::{
    EvaluatorContent, EvaluatorExecutor, EvaluatorInput, EvaluatorKind, EvaluatorOutput, EvaluatorVersion,
    PromptMessage,
};
use std::sync::Arc;

const EPSILON: f64 = 1e-9;

pub struct PromptEvaluator {
    llm: Arc<dyn LlmClient>,
}

impl PromptEvaluator {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }
}

/// Score and reason extracted from a judge reply.
#[derive(Debug, Clone, PartialEq)]
pub struct JudgeVerdict {
    pub score: f64,
    pub reason: Option<String>,
}

/// Pulls `{"score": .., "reason": ..}` out of a reply. Code fences and
/// surrounding prose are tolerated; the first JSON object wins.
pub fn parse_verdict(text: &str) -> anyhow::Result<JudgeVerdict> {
    let start = text
        .find('{')
        .ok_or_else(|| anyhow::anyhow!("judge reply has no JSON object"))?;
    let end = text
        .rfind('}')
        .filter(|e| *e > start)
        .ok_or_else(|| anyhow::anyhow!("judge reply has no JSON object"))?;
    let obj: serde_json::Value = serde_json::from_str(&text[start..=end])
        .map_err(|e| anyhow::anyhow!("judge reply is not valid JSON: {}", e))?;

    let score = match obj.get("score") {
        Some(serde_json::Value::Number(n)) => n.as_f64(),
        Some(serde_json::Value::String(s)) => s.trim().parse::<f64>().ok(),
        Some(serde_json::Value::Bool(b)) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
    .filter(|s| s.is_finite())
    .ok_or_else(|| anyhow::anyhow!("judge reply has no numeric score"))?;

    let reason = obj
        .get("reason")
        .or_else(|| obj.get("reasoning"))
        .and_then(|v| v.as_str())
        .map(str::to_string);
    Ok(JudgeVerdict { score, reason })
}

/// Snaps a score onto the closest allowed value.
pub fn snap_to_value_set(score: f64, value_set: &[f64]) -> f64 {
    value_set
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .min_by(|a, b| {
            (a - score)
                .abs()
                .partial_cmp(&(b - score).abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .unwrap_or(score)
}

fn render_messages(messages: &[PromptMessage], input: &EvaluatorInput) -> Vec<PromptMessage> {
    messages
        .iter()
        .map(|m| PromptMessage {
            role: m.role.clone(),
            content: render(&m.content, |k| input.var(k)),
        })
        .collect()
}

#[async_trait]
impl EvaluatorExecutor for PromptEvaluator {
    fn kind(&self) -> EvaluatorKind {
        EvaluatorKind::Prompt
    }

    fn validate(&self, content: &EvaluatorContent) -> EvalResult<()> {
        let EvaluatorContent::Prompt { messages, .. } = content else {
            return Err(EvalError::InvalidParam("prompt evaluator needs prompt content".into()));
        };
        if messages.is_empty() {
            return Err(EvalError::InvalidParam("prompt evaluator has no messages".into()));
        }
        for m in messages {
            if !matches!(m.role.as_str(), "system" | "user" | "assistant") {
                return Err(EvalError::InvalidParam(format!("unsupported message role '{}'", m.role)));
            }
        }
        if messages.iter().all(|m| placeholders(&m.content).is_empty()) {
            return Err(EvalError::InvalidParam(
                "prompt evaluator references no input variables".into(),
            ));
        }
        Ok(())
    }

    async fn execute(
        &self,
        _ctx: &Ctx,
        version: &EvaluatorVersion,
        input: &EvaluatorInput,
    ) -> EvalResult<EvaluatorOutput> {
        let EvaluatorContent::Prompt { messages, model, tools } = &version.content else {
            return Err(EvalError::InvalidParam(format!(
                "evaluator version {} is not a prompt evaluator",
                version.id
            )));
        };
        let req = ChatRequest {
            messages: render_messages(messages, input),
            model: model.clone(),
            tools: tools.clone(),
        };
        let resp = self.llm.chat(&req).await.map_err(|e| {
            EvalError::UpstreamUnavailable(format!("{} judge call failed: {}", self.llm.provider_name(), e))
        })?;
        let verdict = parse_verdict(&resp.text).map_err(|e| EvalError::Internal(e.to_string()))?;

        let score = match &version.value_set {
            Some(vs) if !vs.is_empty() => {
                let snapped = snap_to_value_set(verdict.score, vs);
                if (snapped - verdict.score).abs() > EPSILON {
                    tracing::debug!(
                        event = "judge.score_snapped",
                        evaluator_version_id = version.id,
                        raw = verdict.score,
                        snapped,
                    );
                }
                snapped
            }
            _ => verdict.score,
        };

        Ok(EvaluatorOutput {
            score: Some(score),
            reasoning: verdict.reason,
            usage: resp.usage,
        })
    }
}
