use super::StaticSources;
use crate::render::as_text;
use async_trait::async_trait;
use loopeval_core::context::Ctx;
use loopeval_core::errors::{EvalError, EvalResult};
use loopeval_core::model::{SpaceId, TokenUsage};
use loopeval_core::storage::Page;
use loopeval_core::target::{EvalTargetVersion, TargetInput, TargetKind, TargetOutput, TargetSource, TargetSourceInfo};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// One captured response of the system under test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedOutput {
    pub fields: BTreeMap<String, Value>,
    #[serde(default)]
    pub usage: TokenUsage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceReplayConfig {
    /// Input field whose value selects the recording.
    #[serde(default = "default_key_field")]
    pub key_field: String,
    pub recordings: BTreeMap<String, RecordedOutput>,
}

fn default_key_field() -> String {
    "trace_id".into()
}

fn parse_config(config: &Value) -> EvalResult<TraceReplayConfig> {
    serde_json::from_value(config.clone())
        .map_err(|e| EvalError::InvalidParam(format!("invalid trace replay config: {}", e)))
}

/// Replays outputs captured from production traces instead of calling the target live.
pub struct TraceReplayTarget {
    sources: StaticSources,
}

impl TraceReplayTarget {
    pub fn new(sources: StaticSources) -> Self {
        Self { sources }
    }
}

#[async_trait]
impl TargetSource for TraceReplayTarget {
    fn kind(&self) -> TargetKind {
        TargetKind::TraceCallback
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

    async fn execute(&self, _ctx: &Ctx, version: &EvalTargetVersion, input: &TargetInput) -> EvalResult<TargetOutput> {
        let cfg = parse_config(&version.config)?;
        let key = input
            .fields
            .get(&cfg.key_field)
            .map(as_text)
            .ok_or_else(|| EvalError::InvalidParam(format!("input has no '{}' to replay by", cfg.key_field)))?;
        let rec = cfg
            .recordings
            .get(&key)
            .ok_or_else(|| EvalError::InvalidParam(format!("no recording for {} = {}", cfg.key_field, key)))?;
        Ok(TargetOutput {
            fields: rec.fields.clone(),
            usage: rec.usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_replay_by_key() {
        let t = TraceReplayTarget::new(StaticSources::new());
        let config = json!({
            "key_field": "id",
            "recordings": {
                "42": {"fields": {"actual_output": "hello"}, "usage": {"input_tokens": 3, "output_tokens": 1}}
            }
        });
        t.validate_config(&config).unwrap();
        let version = EvalTargetVersion {
            id: 1,
            target_id: 1,
            space_id: 1,
            kind: TargetKind::TraceCallback,
            source_id: "prod".into(),
            source_version: "2026-10-01".into(),
            config,
            source_info: None,
            created_at: 0,
        };

        let mut input = TargetInput::default();
        input.fields.insert("id".into(), json!(42));
        let out = t.execute(&Ctx::system(), &version, &input).await.unwrap();
        assert_eq!(out.fields.get("actual_output"), Some(&json!("hello")));
        assert_eq!(out.usage.input_tokens, 3);

        input.fields.insert("id".into(), json!(43));
        let err = t.execute(&Ctx::system(), &version, &input).await.unwrap_err();
        assert!(matches!(err, EvalError::InvalidParam(_)));
    }
}
