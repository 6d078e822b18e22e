//! Evaluators score a turn. Kinds dispatch through [`EvaluatorRegistry`].

pub mod service;
pub mod templates;

use crate::context::Ctx;
use crate::errors::{ErrorDetail, EvalError, EvalResult};
use crate::model::{
    AggregatorType, Correction, EvaluatorId, EvaluatorVersionId, ExptId, ItemId, RecordId,
    RecordStatus, RunId, SpaceId, TokenUsage, TurnId,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

pub use service::EvaluatorService;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluatorKind {
    Prompt,
    Code,
}

impl EvaluatorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EvaluatorKind::Prompt => "prompt",
            EvaluatorKind::Code => "code",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "prompt" => Some(EvaluatorKind::Prompt),
            "code" => Some(EvaluatorKind::Code),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ModelConfig {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EvaluatorContent {
    Prompt {
        messages: Vec<PromptMessage>,
        #[serde(default)]
        model: ModelConfig,
        #[serde(default)]
        tools: Vec<serde_json::Value>,
    },
    Code {
        #[serde(default = "default_language")]
        language: String,
        code: String,
    },
}

fn default_language() -> String {
    "rules".into()
}

impl EvaluatorContent {
    pub fn kind(&self) -> EvaluatorKind {
        match self {
            EvaluatorContent::Prompt { .. } => EvaluatorKind::Prompt,
            EvaluatorContent::Code { .. } => EvaluatorKind::Code,
        }
    }

    /// Text checked by content moderation.
    pub fn moderation_text(&self) -> String {
        match self {
            EvaluatorContent::Prompt { messages, .. } => messages
                .iter()
                .map(|m| m.content.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
            EvaluatorContent::Code { code, .. } => code.clone(),
        }
    }
}

/// Mutable working copy of an evaluator; submitting freezes it into a version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluatorDraft {
    pub content: EvaluatorContent,
    #[serde(default)]
    pub aggregators: Vec<AggregatorType>,
    #[serde(default)]
    pub value_set: Option<Vec<f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluator {
    pub id: EvaluatorId,
    pub space_id: SpaceId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub kind: EvaluatorKind,
    pub draft: EvaluatorDraft,
    #[serde(default)]
    pub latest_version: Option<String>,
    pub created_by: String,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default)]
    pub deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluatorVersion {
    pub id: EvaluatorVersionId,
    pub evaluator_id: EvaluatorId,
    pub space_id: SpaceId,
    /// Owning evaluator's name, joined on read.
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    pub content: EvaluatorContent,
    pub aggregators: Vec<AggregatorType>,
    #[serde(default)]
    pub value_set: Option<Vec<f64>>,
    pub content_hash: String,
    pub created_by: String,
    pub created_at: i64,
}

impl EvaluatorVersion {
    pub fn kind(&self) -> EvaluatorKind {
        self.content.kind()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EvaluatorInput {
    /// Mapped fields from the dataset turn.
    #[serde(default)]
    pub turn_input: BTreeMap<String, serde_json::Value>,
    /// Mapped fields from the target output.
    #[serde(default)]
    pub target_output: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub ext: BTreeMap<String, String>,
}

impl EvaluatorInput {
    /// Looks a variable up in target output first, then in the turn input.
    pub fn var(&self, name: &str) -> Option<&serde_json::Value> {
        self.target_output
            .get(name)
            .or_else(|| self.turn_input.get(name))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EvaluatorOutput {
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub usage: TokenUsage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluatorRecord {
    pub id: RecordId,
    pub space_id: SpaceId,
    pub evaluator_version_id: EvaluatorVersionId,
    #[serde(default)]
    pub expt_id: Option<ExptId>,
    #[serde(default)]
    pub run_id: Option<RunId>,
    #[serde(default)]
    pub item_id: Option<ItemId>,
    #[serde(default)]
    pub turn_id: Option<TurnId>,
    pub input: EvaluatorInput,
    #[serde(default)]
    pub output: Option<EvaluatorOutput>,
    pub status: RecordStatus,
    #[serde(default)]
    pub error: Option<ErrorDetail>,
    #[serde(default)]
    pub correction: Option<Correction>,
    #[serde(default)]
    pub trace_id: Option<String>,
    pub created_by: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl EvaluatorRecord {
    pub fn score(&self) -> Option<f64> {
        self.correction
            .as_ref()
            .map(|c| c.score)
            .or_else(|| self.output.as_ref().and_then(|o| o.score))
    }
}

#[async_trait]
pub trait EvaluatorExecutor: Send + Sync {
    fn kind(&self) -> EvaluatorKind;

    /// Rejects content this executor cannot run (bad template, unparsable rules).
    fn validate(&self, _content: &EvaluatorContent) -> EvalResult<()> {
        Ok(())
    }

    async fn execute(
        &self,
        ctx: &Ctx,
        version: &EvaluatorVersion,
        input: &EvaluatorInput,
    ) -> EvalResult<EvaluatorOutput>;

    /// Applies a human correction to a record.
    fn correct(&self, record: &EvaluatorRecord, correction: &Correction) -> EvalResult<EvaluatorRecord> {
        if !correction.score.is_finite() {
            return Err(EvalError::InvalidParam("correction score must be finite".into()));
        }
        let mut out = record.clone();
        out.correction = Some(correction.clone());
        out.updated_at = correction.updated_at;
        Ok(out)
    }
}

#[derive(Clone, Default)]
pub struct EvaluatorRegistry {
    executors: HashMap<EvaluatorKind, Arc<dyn EvaluatorExecutor>>,
}

impl EvaluatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, exec: Arc<dyn EvaluatorExecutor>) -> &mut Self {
        self.executors.insert(exec.kind(), exec);
        self
    }

    pub fn with(mut self, exec: Arc<dyn EvaluatorExecutor>) -> Self {
        self.register(exec);
        self
    }

    pub fn get(&self, kind: EvaluatorKind) -> EvalResult<Arc<dyn EvaluatorExecutor>> {
        self.executors.get(&kind).cloned().ok_or_else(|| {
            EvalError::InvalidParam(format!("no executor registered for evaluator kind {}", kind.as_str()))
        })
    }

    /// Runs a version without persisting anything.
    pub async fn debug(
        &self,
        ctx: &Ctx,
        version: &EvaluatorVersion,
        input: &EvaluatorInput,
    ) -> EvalResult<EvaluatorOutput> {
        self.get(version.kind())?.execute(ctx, version, input).await
    }
}
