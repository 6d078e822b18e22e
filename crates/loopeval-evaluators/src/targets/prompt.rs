use super::StaticSources;
use crate::llm::{ChatRequest, LlmClient};
use crate::render::{placeholders, render};
use async_trait::async_trait;
use loopeval_core::context::Ctx;
use loopeval_core::errors::{EvalError, EvalResult};
use loopeval_core::evaluator::{ModelConfig, PromptMessage};
use loopeval_core::model::SpaceId;
use loopeval_core::storage::Page;
use loopeval_core::target::{EvalTargetVersion, TargetInput, TargetKind, TargetOutput, TargetSource, TargetSourceInfo};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Version config for a prompt under test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptTargetConfig {
    pub messages: Vec<PromptMessage>,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default = "default_output_field")]
    pub output_field: String,
}

fn default_output_field() -> String {
    "actual_output".into()
}

fn parse_config(config: &serde_json::Value) -> EvalResult<PromptTargetConfig> {
    let cfg: PromptTargetConfig = serde_json::from_value(config.clone())
        .map_err(|e| EvalError::InvalidParam(format!("invalid prompt target config: {}", e)))?;
    if cfg.messages.is_empty() {
        return Err(EvalError::InvalidParam("prompt target has no messages".into()));
    }
    if cfg.output_field.trim().is_empty() {
        return Err(EvalError::InvalidParam("prompt target output_field is empty".into()));
    }
    Ok(cfg)
}

/// Runs a managed prompt through the configured LLM.
pub struct PromptTarget {
    llm: Arc<dyn LlmClient>,
    sources: StaticSources,
}

impl PromptTarget {
    pub fn new(llm: Arc<dyn LlmClient>, sources: StaticSources) -> Self {
        Self { llm, sources }
    }
}

#[async_trait]
impl TargetSource for PromptTarget {
    fn kind(&self) -> TargetKind {
        TargetKind::LoopPrompt
    }

    async fn list_sources(
        &self,
        _ctx: &Ctx,
        space_id: SpaceId,
        keyword: Option<&str>,
        page: Page,
    ) -> EvalResult<Vec<TargetSourceInfo>> {
        Ok(self.sources.list(space_id, keyword, page))
    }

    async fn list_source_versions(
        &self,
        _ctx: &Ctx,
        space_id: SpaceId,
        source_id: &str,
        page: Page,
    ) -> EvalResult<Vec<TargetSourceInfo>> {
        Ok(self.sources.versions(space_id, source_id, page))
    }

    async fn batch_get_source(
        &self,
        _ctx: &Ctx,
        space_id: SpaceId,
        source_ids: &[String],
    ) -> EvalResult<Vec<TargetSourceInfo>> {
        Ok(self.sources.batch_get(space_id, source_ids))
    }

    fn validate_config(&self, config: &serde_json::Value) -> EvalResult<()> {
        parse_config(config).map(|_| ())
    }

    async fn execute(&self, _ctx: &Ctx, version: &EvalTargetVersion, input: &TargetInput) -> EvalResult<TargetOutput> {
        let cfg = parse_config(&version.config)?;
        let messages = cfg
            .messages
            .iter()
            .map(|m| PromptMessage {
                role: m.role.clone(),
                content: render(&m.content, |k| input.fields.get(k)),
            })
            .collect();
        let vars: Vec<String> = cfg.messages.iter().flat_map(|m| placeholders(&m.content)).collect();
        tracing::debug!(
            event = "target.prompt_rendered",
            target_version_id = version.id,
            variables = vars.len(),
        );

        let resp = self
            .llm
            .chat(&ChatRequest {
                messages,
                model: cfg.model,
                tools: Vec::new(),
            })
            .await
            .map_err(|e| EvalError::UpstreamUnavailable(format!("prompt target call failed: {}", e)))?;

        let mut fields = BTreeMap::new();
        fields.insert(cfg.output_field, json!(resp.text));
        Ok(TargetOutput {
            fields,
            usage: resp.usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::fake::FakeLlm;

    fn version(config: serde_json::Value) -> EvalTargetVersion {
        EvalTargetVersion {
            id: 3,
            target_id: 1,
            space_id: 1,
            kind: TargetKind::LoopPrompt,
            source_id: "capital-prompt".into(),
            source_version: "1".into(),
            config,
            source_info: None,
            created_at: 0,
        }
    }

    #[tokio::test]
    async fn test_prompt_target_renders_and_names_output() {
        let llm = Arc::new(FakeLlm::new("Paris"));
        let target = PromptTarget::new(llm.clone(), StaticSources::new());
        let cfg = json!({
            "messages": [{"role": "user", "content": "Capital of {{country}}?"}],
            "output_field": "answer"
        });
        target.validate_config(&cfg).unwrap();

        let mut input = TargetInput::default();
        input.fields.insert("country".into(), json!("France"));
        let out = target.execute(&Ctx::system(), &version(cfg), &input).await.unwrap();
        assert_eq!(out.fields.get("answer"), Some(&json!("Paris")));
        assert_eq!(llm.requests()[0].messages[0].content, "Capital of France?");
    }

    #[test]
    fn test_prompt_target_config_errors() {
        let target = PromptTarget::new(Arc::new(FakeLlm::new("")), StaticSources::new());
        assert!(target.validate_config(&json!({"messages": []})).is_err());
        assert!(target.validate_config(&json!({"prompt": "x"})).is_err());
    }
}
