use super::StaticSources;
use crate::render::render_json;
use async_trait::async_trait;
use loopeval_core::context::Ctx;
use loopeval_core::errors::{EvalError, EvalResult};
use loopeval_core::model::{SpaceId, TokenUsage};
use loopeval_core::storage::Page;
use loopeval_core::target::{EvalTargetVersion, TargetInput, TargetKind, TargetOutput, TargetSource, TargetSourceInfo};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// How an HTTP bot or workflow is called.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpTargetConfig {
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// JSON body; string leaves are `{{field}}` templates over the input.
    #[serde(default = "default_body")]
    pub body: Value,
    /// Output field name to JSON pointer into the response.
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
}

fn default_body() -> Value {
    json!({"input": "{{input}}"})
}

fn default_outputs(kind: TargetKind) -> BTreeMap<String, String> {
    let pointer = match kind {
        TargetKind::CozeWorkflow => "/data/output",
        _ => "/answer",
    };
    BTreeMap::from([("actual_output".to_string(), pointer.to_string())])
}

fn parse_config(config: &Value) -> EvalResult<HttpTargetConfig> {
    let cfg: HttpTargetConfig = serde_json::from_value(config.clone())
        .map_err(|e| EvalError::InvalidParam(format!("invalid http target config: {}", e)))?;
    if !(cfg.url.starts_with("http://") || cfg.url.starts_with("https://")) {
        return Err(EvalError::InvalidParam(format!("target url must be http(s): {}", cfg.url)));
    }
    for p in cfg.outputs.values() {
        if !p.is_empty() && !p.starts_with('/') {
            return Err(EvalError::InvalidParam(format!("output pointer must start with '/': {}", p)));
        }
    }
    Ok(cfg)
}

/// Picks output fields and token usage out of a response body.
pub fn extract(kind: TargetKind, cfg: &HttpTargetConfig, resp: &Value) -> EvalResult<TargetOutput> {
    let outputs = if cfg.outputs.is_empty() {
        default_outputs(kind)
    } else {
        cfg.outputs.clone()
    };
    let mut fields = BTreeMap::new();
    for (name, pointer) in &outputs {
        let v = resp
            .pointer(pointer)
            .ok_or_else(|| EvalError::Internal(format!("response has nothing at {} for {}", pointer, name)))?;
        fields.insert(name.clone(), v.clone());
    }
    let num = |ptrs: &[&str]| ptrs.iter().find_map(|p| resp.pointer(p).and_then(Value::as_i64)).unwrap_or(0);
    let usage = TokenUsage {
        input_tokens: num(&["/usage/input_tokens", "/usage/prompt_tokens"]),
        output_tokens: num(&["/usage/output_tokens", "/usage/completion_tokens"]),
    };
    Ok(TargetOutput { fields, usage })
}

/// Calls a bot or workflow published behind an HTTP endpoint.
pub struct HttpTarget {
    kind: TargetKind,
    client: reqwest::Client,
    sources: StaticSources,
}

impl HttpTarget {
    pub fn bot(sources: StaticSources) -> Self {
        Self::new(TargetKind::CozeBot, sources)
    }

    pub fn workflow(sources: StaticSources) -> Self {
        Self::new(TargetKind::CozeWorkflow, sources)
    }

    fn new(kind: TargetKind, sources: StaticSources) -> Self {
        Self {
            kind,
            client: reqwest::Client::new(),
            sources,
        }
    }
}

#[async_trait]
impl TargetSource for HttpTarget {
    fn kind(&self) -> TargetKind {
        self.kind
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

    fn validate_config(&self, config: &Value) -> EvalResult<()> {
        parse_config(config).map(|_| ())
    }

    async fn execute(&self, ctx: &Ctx, version: &EvalTargetVersion, input: &TargetInput) -> EvalResult<TargetOutput> {
        let cfg = parse_config(&version.config)?;
        let body = render_json(&cfg.body, &|k: &str| input.fields.get(k));

        let mut req = self
            .client
            .post(&cfg.url)
            .header("Content-Type", "application/json")
            .header("X-Trace-Id", ctx.trace_id.as_str())
            .json(&body);
        for (k, v) in &cfg.headers {
            req = req.header(k.as_str(), v.as_str());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| EvalError::UpstreamUnavailable(format!("{} unreachable: {}", self.kind.as_str(), e)))?;
        let status = resp.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(EvalError::UpstreamUnavailable(format!(
                "{} returned {}",
                self.kind.as_str(),
                status
            )));
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(EvalError::InvalidParam(format!(
                "{} rejected the request ({}): {}",
                self.kind.as_str(),
                status,
                text
            )));
        }
        let json: Value = resp
            .json()
            .await
            .map_err(|e| EvalError::Internal(format!("{} returned non-JSON body: {}", self.kind.as_str(), e)))?;
        extract(self.kind, &cfg, &json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validation() {
        let t = HttpTarget::bot(StaticSources::new());
        assert!(t.validate_config(&json!({"url": "https://bot.example/chat"})).is_ok());
        assert!(t.validate_config(&json!({"url": "ftp://bot"})).is_err());
        assert!(t
            .validate_config(&json!({"url": "http://x", "outputs": {"a": "answer"}}))
            .is_err());
    }

    #[test]
    fn test_extract_defaults_per_kind() {
        let cfg = parse_config(&json!({"url": "http://x"})).unwrap();
        let bot = extract(
            TargetKind::CozeBot,
            &cfg,
            &json!({"answer": "hi", "usage": {"prompt_tokens": 9, "completion_tokens": 2}}),
        )
        .unwrap();
        assert_eq!(bot.fields.get("actual_output"), Some(&json!("hi")));
        assert_eq!((bot.usage.input_tokens, bot.usage.output_tokens), (9, 2));

        let wf = extract(TargetKind::CozeWorkflow, &cfg, &json!({"data": {"output": {"k": 1}}})).unwrap();
        assert_eq!(wf.fields.get("actual_output"), Some(&json!({"k": 1})));
        assert!(extract(TargetKind::CozeWorkflow, &cfg, &json!({"answer": "x"})).is_err());
    }

    #[test]
    fn test_extract_custom_outputs() {
        let cfg = parse_config(&json!({
            "url": "http://x",
            "outputs": {"answer": "/result/text", "sources": "/result/refs"}
        }))
        .unwrap();
        let out = extract(
            TargetKind::CozeBot,
            &cfg,
            &json!({"result": {"text": "t", "refs": ["a"]}}),
        )
        .unwrap();
        assert_eq!(out.fields.len(), 2);
        assert_eq!(out.fields.get("sources"), Some(&json!(["a"])));
    }
}
