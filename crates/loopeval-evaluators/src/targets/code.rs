use crate::render::render_json;
use async_trait::async_trait;
use loopeval_core::context::Ctx;
use loopeval_core::errors::{EvalError, EvalResult};
use loopeval_core::model::TokenUsage;
use loopeval_core::target::{EvalTargetVersion, TargetInput, TargetKind, TargetOutput, TargetSource};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateTargetConfig {
    /// Output field name to a JSON template over the input fields.
    pub outputs: BTreeMap<String, Value>,
    #[serde(default)]
    pub passthrough: bool,
}

fn parse_config(config: &Value) -> EvalResult<TemplateTargetConfig> {
    let cfg: TemplateTargetConfig = serde_json::from_value(config.clone())
        .map_err(|e| EvalError::InvalidParam(format!("invalid code target config: {}", e)))?;
    if cfg.outputs.is_empty() && !cfg.passthrough {
        return Err(EvalError::InvalidParam("code target produces no fields".into()));
    }
    Ok(cfg)
}

/// Deterministic target that derives its output from the input itself.
/// Used for baselines and for datasets that already hold the answers.
#[derive(Default)]
pub struct TemplateTarget;

#[async_trait]
impl TargetSource for TemplateTarget {
    fn kind(&self) -> TargetKind {
        TargetKind::Code
    }

    fn validate_config(&self, config: &Value) -> EvalResult<()> {
        parse_config(config).map(|_| ())
    }

    async fn execute(&self, _ctx: &Ctx, version: &EvalTargetVersion, input: &TargetInput) -> EvalResult<TargetOutput> {
        let cfg = parse_config(&version.config)?;
        let lookup = |k: &str| input.fields.get(k);
        let mut fields = if cfg.passthrough {
            input.fields.clone()
        } else {
            BTreeMap::new()
        };
        for (name, template) in &cfg.outputs {
            fields.insert(name.clone(), render_json(template, &lookup));
        }
        Ok(TargetOutput {
            fields,
            usage: TokenUsage::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_template_target_outputs() {
        let config = json!({"outputs": {"actual_output": "{{reference_output}}", "echo": "Q: {{input}}"}});
        let version = EvalTargetVersion {
            id: 1,
            target_id: 1,
            space_id: 1,
            kind: TargetKind::Code,
            source_id: "oracle".into(),
            source_version: "1".into(),
            config,
            source_info: None,
            created_at: 0,
        };
        let mut input = TargetInput::default();
        input.fields.insert("input".into(), json!("2+2"));
        input.fields.insert("reference_output".into(), json!(4));

        let out = TemplateTarget.execute(&Ctx::system(), &version, &input).await.unwrap();
        assert_eq!(out.fields.get("actual_output"), Some(&json!(4)));
        assert_eq!(out.fields.get("echo"), Some(&json!("Q: 2+2")));
        assert!(out.fields.get("input").is_none());

        assert!(TemplateTarget.validate_config(&json!({"outputs": {}})).is_err());
        assert!(TemplateTarget.validate_config(&json!({"outputs": {}, "passthrough": true})).is_ok());
    }
}
