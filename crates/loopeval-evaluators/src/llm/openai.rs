use super::{ChatRequest, ChatResponse, LlmClient};
use async_trait::async_trait;
use loopeval_core::model::TokenUsage;
use serde_json::json;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Chat-completions client for OpenAI and compatible gateways.
pub struct OpenAIClient {
    pub base_url: String,
    pub api_key: String,
    pub default_model: String,
    pub client: reqwest::Client,
}

impl OpenAIClient {
    pub fn new(api_key: String, default_model: String) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key,
            default_model,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Reads `OPENAI_API_KEY`, `LOOPEVAL_LLM_BASE_URL` and `LOOPEVAL_LLM_MODEL`.
    pub fn from_env() -> anyhow::Result<Self> {
        let key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("config error: OPENAI_API_KEY is not set"))?;
        let model = std::env::var("LOOPEVAL_LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".into());
        let mut c = Self::new(key, model);
        if let Ok(url) = std::env::var("LOOPEVAL_LLM_BASE_URL") {
            c = c.with_base_url(url);
        }
        Ok(c)
    }

    fn body(&self, req: &ChatRequest) -> serde_json::Value {
        let model = if req.model.model.is_empty() {
            self.default_model.as_str()
        } else {
            req.model.model.as_str()
        };
        let messages: Vec<_> = req
            .messages
            .iter()
            .map(|m| json!({"role": m.role, "content": m.content}))
            .collect();
        let mut body = json!({
            "model": model,
            "messages": messages,
        });
        if let Some(t) = req.model.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(n) = req.model.max_tokens {
            body["max_tokens"] = json!(n);
        }
        if !req.tools.is_empty() {
            body["tools"] = json!(req.tools);
        }
        body
    }
}

fn parse_response(json: &serde_json::Value, fallback_model: &str) -> anyhow::Result<ChatResponse> {
    let message = json
        .pointer("/choices/0/message")
        .ok_or_else(|| anyhow::anyhow!("chat API response missing choices"))?;
    // Tool-call answers carry the verdict in the first call's arguments.
    let text = match message.get("content").and_then(|v| v.as_str()) {
        Some(s) if !s.is_empty() => s.to_string(),
        _ => message
            .pointer("/tool_calls/0/function/arguments")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("chat API response missing content"))?
            .to_string(),
    };
    let usage = TokenUsage {
        input_tokens: json.pointer("/usage/prompt_tokens").and_then(|v| v.as_i64()).unwrap_or(0),
        output_tokens: json
            .pointer("/usage/completion_tokens")
            .and_then(|v| v.as_i64())
            .unwrap_or(0),
    };
    Ok(ChatResponse {
        text,
        model: json
            .get("model")
            .and_then(|v| v.as_str())
            .unwrap_or(fallback_model)
            .to_string(),
        usage,
    })
}

#[async_trait]
impl LlmClient for OpenAIClient {
    async fn chat(&self, req: &ChatRequest) -> anyhow::Result<ChatResponse> {
        let url = format!("{}/chat/completions", self.base_url);
        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&self.body(req))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let error_text = resp.text().await.unwrap_or_default();
            anyhow::bail!("chat API error ({}): {}", status, error_text);
        }

        let json: serde_json::Value = resp.json().await?;
        parse_response(&json, &self.default_model)
    }

    fn provider_name(&self) -> &'static str {
        "openai"
    }
}
