//! The YAML experiment file `loopeval run` consumes.

use loopeval_core::dataset::{FieldSchema, NewItem};
use loopeval_core::evaluator::{templates, EvaluatorContent, EvaluatorDraft};
use loopeval_core::model::{AggregatorType, FieldMapping, SpaceId};
use loopeval_core::target::TargetKind;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct ExperimentFile {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_space")]
    pub space_id: SpaceId,
    #[serde(default)]
    pub item_concurrency: Option<u32>,
    #[serde(default)]
    pub evaluator_concurrency: Option<u32>,
    #[serde(default)]
    pub max_alive_time_ms: i64,
    pub dataset: DatasetSpec,
    #[serde(default)]
    pub target: Option<TargetSpec>,
    pub evaluators: Vec<EvaluatorSpec>,
    #[serde(default)]
    pub thresholds: BTreeMap<String, f64>,
    #[serde(default)]
    pub llm: LlmSpec,
}

fn default_space() -> SpaceId {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatasetSpec {
    #[serde(default)]
    pub name: Option<String>,
    /// Declared columns; undeclared turn fields are still carried through.
    #[serde(default)]
    pub fields: Vec<String>,
    pub items: Vec<ItemSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ItemSpec {
    MultiTurn {
        #[serde(default)]
        key: Option<String>,
        turns: Vec<BTreeMap<String, Value>>,
    },
    SingleTurn(BTreeMap<String, Value>),
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetSpec {
    pub kind: TargetKind,
    #[serde(default = "default_source_id")]
    pub source_id: String,
    #[serde(default = "default_source_version")]
    pub source_version: String,
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub field_mapping: Vec<FieldMapping>,
}

fn default_source_id() -> String {
    "local".into()
}

fn default_source_version() -> String {
    "1".into()
}

#[derive(Debug, Clone, Deserialize)]
pub struct EvaluatorSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Built-in template key; `content` overrides the template's content.
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub content: Option<EvaluatorContent>,
    #[serde(default)]
    pub aggregators: Option<Vec<AggregatorType>>,
    #[serde(default)]
    pub value_set: Option<Vec<f64>>,
    #[serde(default)]
    pub from_eval_set: Vec<FieldMapping>,
    #[serde(default)]
    pub from_target: Vec<FieldMapping>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    #[default]
    None,
    Fake,
    Openai,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LlmSpec {
    #[serde(default)]
    pub provider: LlmProvider,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Fake provider: replies served in order, then `fallback` forever.
    #[serde(default)]
    pub replies: Vec<String>,
    #[serde(default)]
    pub fallback: Option<String>,
}

impl ExperimentFile {
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let mut ignored = Vec::new();
        let de = serde_yaml::Deserializer::from_str(raw);
        let file: ExperimentFile = serde_ignored::deserialize(de, |path| ignored.push(path.to_string()))
            .map_err(|e| anyhow::anyhow!("config error: invalid experiment file: {}", e))?;
        if !ignored.is_empty() {
            anyhow::bail!("config error: unknown keys in experiment file: {}", ignored.join(", "));
        }
        file.check()?;
        Ok(file)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("config error: failed to read {}: {}", path.display(), e))?;
        Self::parse(&raw)
    }

    fn check(&self) -> anyhow::Result<()> {
        if self.dataset.items.is_empty() {
            anyhow::bail!("config error: dataset has no items");
        }
        if self.evaluators.is_empty() {
            anyhow::bail!("config error: at least one evaluator is required");
        }
        let mut names: Vec<&str> = self.evaluators.iter().map(|e| e.name.as_str()).collect();
        names.sort();
        if names.windows(2).any(|w| w[0] == w[1]) {
            anyhow::bail!("config error: evaluator names must be unique");
        }
        for key in self.thresholds.keys() {
            if !names.contains(&key.as_str()) {
                anyhow::bail!("config error: threshold for unknown evaluator '{}'", key);
            }
        }
        if self.needs_llm() && self.llm.provider == LlmProvider::None {
            anyhow::bail!("config error: prompt evaluators or targets need llm.provider (fake or openai)");
        }
        for e in &self.evaluators {
            e.draft()?;
        }
        Ok(())
    }

    pub fn needs_llm(&self) -> bool {
        let prompt_target = self.target.as_ref().map(|t| t.kind) == Some(TargetKind::LoopPrompt);
        let prompt_eval = self
            .evaluators
            .iter()
            .any(|e| matches!(e.draft().map(|d| d.content), Ok(EvaluatorContent::Prompt { .. })));
        prompt_target || prompt_eval
    }

    pub fn schema(&self) -> Vec<FieldSchema> {
        self.dataset
            .fields
            .iter()
            .map(|k| FieldSchema {
                key: k.clone(),
                name: k.clone(),
                content_type: "text".into(),
                description: String::new(),
            })
            .collect()
    }

    pub fn items(&self) -> Vec<NewItem> {
        self.dataset
            .items
            .iter()
            .map(|i| match i {
                ItemSpec::MultiTurn { key, turns } => NewItem {
                    item_key: key.clone(),
                    turns: turns.clone(),
                },
                ItemSpec::SingleTurn(t) => NewItem {
                    item_key: None,
                    turns: vec![t.clone()],
                },
            })
            .collect()
    }
}

impl EvaluatorSpec {
    pub fn draft(&self) -> anyhow::Result<EvaluatorDraft> {
        let base = match &self.template {
            Some(key) => Some(
                templates::find(key)
                    .ok_or_else(|| anyhow::anyhow!("config error: unknown evaluator template '{}'", key))?
                    .draft,
            ),
            None => None,
        };
        let content = match (&self.content, &base) {
            (Some(c), _) => c.clone(),
            (None, Some(b)) => b.content.clone(),
            (None, None) => anyhow::bail!(
                "config error: evaluator '{}' needs a template or content",
                self.name
            ),
        };
        let aggregators = self
            .aggregators
            .clone()
            .or_else(|| base.as_ref().map(|b| b.aggregators.clone()))
            .unwrap_or_else(|| vec![AggregatorType::Average]);
        let value_set = self
            .value_set
            .clone()
            .or_else(|| base.as_ref().and_then(|b| b.value_set.clone()));
        Ok(EvaluatorDraft {
            content,
            aggregators,
            value_set,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sample_file() {
        let f = ExperimentFile::parse(crate::templates::SAMPLE_EXPERIMENT).unwrap();
        assert_eq!(f.name, "capitals-smoke");
        assert_eq!(f.items().len(), 2);
        assert_eq!(f.schema().len(), 2);
        assert_eq!(f.target.as_ref().unwrap().kind, TargetKind::Code);
        assert!(!f.needs_llm());
        assert_eq!(f.thresholds.get("exact"), Some(&0.5));
    }

    #[test]
    fn test_multi_turn_items_and_inline_content() {
        let f = ExperimentFile::parse(
            r#"
name: chat
dataset:
  items:
    - key: conv-1
      turns:
        - input: hi
        - input: bye
    - input: single
evaluators:
  - name: judge
    content:
      kind: prompt
      messages:
        - role: user
          content: "Rate {{actual_output}}"
llm:
  provider: fake
  fallback: '{"score": 1}'
"#,
        )
        .unwrap();
        let items = f.items();
        assert_eq!(items[0].turns.len(), 2);
        assert_eq!(items[0].item_key.as_deref(), Some("conv-1"));
        assert_eq!(items[1].turns.len(), 1);
        assert!(f.needs_llm());
        assert_eq!(f.evaluators[0].draft().unwrap().aggregators, vec![AggregatorType::Average]);
    }

    #[test]
    fn test_rejects_bad_files() {
        let base = "name: x\ndataset:\n  items:\n    - input: a\n";
        let err = ExperimentFile::parse(&format!("{}evaluators: []\n", base)).unwrap_err();
        assert!(err.to_string().contains("at least one evaluator"));

        let err = ExperimentFile::parse(&format!("{}evaluators:\n  - name: e\n    template: nope\n", base)).unwrap_err();
        assert!(err.to_string().contains("unknown evaluator template"));

        let err = ExperimentFile::parse(&format!("{}evaluators:\n  - name: e\n    template: correctness\n", base))
            .unwrap_err();
        assert!(err.to_string().contains("llm.provider"));

        let err = ExperimentFile::parse(&format!("{}evaluators:\n  - name: e\n    template: exact_match\nextra: 1\n", base))
            .unwrap_err();
        assert!(err.to_string().contains("unknown keys"), "{}", err);
    }
}
