use async_trait::async_trait;
use loopeval_core::evaluator::{ModelConfig, PromptMessage};
use loopeval_core::model::TokenUsage;
use serde::{Deserialize, Serialize};

pub mod fake;
pub mod openai;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ChatRequest {
    pub messages: Vec<PromptMessage>,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub tools: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ChatResponse {
    pub text: String,
    pub model: String,
    #[serde(default)]
    pub usage: TokenUsage,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// `Err` means the provider could not produce a completion.
    async fn chat(&self, req: &ChatRequest) -> anyhow::Result<ChatResponse>;
    fn provider_name(&self) -> &'static str;
}

/// Stands in when no provider is configured; every call fails as an outage.
pub struct Unconfigured;

#[async_trait]
impl LlmClient for Unconfigured {
    async fn chat(&self, _req: &ChatRequest) -> anyhow::Result<ChatResponse> {
        anyhow::bail!("no llm provider configured")
    }

    fn provider_name(&self) -> &'static str {
        "none"
    }
}
