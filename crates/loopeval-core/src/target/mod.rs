//! Targets are the systems under test. Each kind registers a [`TargetSource`]
//! that knows how to browse its catalog and execute one input.

pub mod service;

use crate::context::Ctx;
use crate::errors::{ErrorDetail, EvalError, EvalResult};
use crate::model::{
    ExptId, ItemId, RecordId, RecordStatus, SpaceId, TargetId, TargetVersionId, TokenUsage, TurnId,
};
use crate::storage::Page;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

pub use service::EvalTargetService;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    LoopPrompt,
    CozeBot,
    CozeWorkflow,
    TraceCallback,
    Code,
}

impl TargetKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TargetKind::LoopPrompt => "loop_prompt",
            TargetKind::CozeBot => "coze_bot",
            TargetKind::CozeWorkflow => "coze_workflow",
            TargetKind::TraceCallback => "trace_callback",
            TargetKind::Code => "code",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "loop_prompt" => Some(TargetKind::LoopPrompt),
            "coze_bot" => Some(TargetKind::CozeBot),
            "coze_workflow" => Some(TargetKind::CozeWorkflow),
            "trace_callback" => Some(TargetKind::TraceCallback),
            "code" => Some(TargetKind::Code),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalTarget {
    pub id: TargetId,
    pub space_id: SpaceId,
    pub kind: TargetKind,
    pub source_id: String,
    pub created_by: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetSourceInfo {
    pub source_id: String,
    #[serde(default)]
    pub source_version: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub extra: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalTargetVersion {
    pub id: TargetVersionId,
    pub target_id: TargetId,
    pub space_id: SpaceId,
    pub kind: TargetKind,
    pub source_id: String,
    pub source_version: String,
    /// Kind-specific execution settings (prompt text, endpoint, template...).
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub source_info: Option<TargetSourceInfo>,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TargetInput {
    #[serde(default)]
    pub fields: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub ext: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TargetOutput {
    #[serde(default)]
    pub fields: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub usage: TokenUsage,
}

/// Where a target invocation belongs when it runs inside an experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RecordScope {
    pub expt_id: Option<ExptId>,
    pub item_id: Option<ItemId>,
    pub turn_id: Option<TurnId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetRecord {
    pub id: RecordId,
    pub space_id: SpaceId,
    pub target_id: TargetId,
    pub target_version_id: TargetVersionId,
    #[serde(flatten)]
    pub scope: RecordScope,
    pub input: TargetInput,
    #[serde(default)]
    pub output: Option<TargetOutput>,
    pub status: RecordStatus,
    #[serde(default)]
    pub error: Option<ErrorDetail>,
    pub latency_ms: i64,
    #[serde(default)]
    pub trace_id: Option<String>,
    pub created_at: i64,
}

#[async_trait]
pub trait TargetSource: Send + Sync {
    fn kind(&self) -> TargetKind;

    async fn list_sources(
        &self,
        _ctx: &Ctx,
        _space_id: SpaceId,
        _keyword: Option<&str>,
        _page: Page,
    ) -> EvalResult<Vec<TargetSourceInfo>> {
        Ok(Vec::new())
    }

    async fn list_source_versions(
        &self,
        _ctx: &Ctx,
        _space_id: SpaceId,
        _source_id: &str,
        _page: Page,
    ) -> EvalResult<Vec<TargetSourceInfo>> {
        Ok(Vec::new())
    }

    async fn batch_get_source(
        &self,
        _ctx: &Ctx,
        _space_id: SpaceId,
        _source_ids: &[String],
    ) -> EvalResult<Vec<TargetSourceInfo>> {
        Ok(Vec::new())
    }

    /// Fills `source_info` on versions of this kind.
    async fn pack_source_info(
        &self,
        ctx: &Ctx,
        space_id: SpaceId,
        versions: &mut [EvalTargetVersion],
    ) -> EvalResult<()> {
        let ids: Vec<String> = versions.iter().map(|v| v.source_id.clone()).collect();
        let infos = self.batch_get_source(ctx, space_id, &ids).await?;
        for v in versions.iter_mut() {
            v.source_info = infos.iter().find(|i| i.source_id == v.source_id).cloned();
        }
        Ok(())
    }

    /// Validates a version's config before it is persisted.
    fn validate_config(&self, _config: &serde_json::Value) -> EvalResult<()> {
        Ok(())
    }

    async fn execute(
        &self,
        ctx: &Ctx,
        version: &EvalTargetVersion,
        input: &TargetInput,
    ) -> EvalResult<TargetOutput>;
}

/// Kind-keyed table of target implementations, filled at startup.
#[derive(Clone, Default)]
pub struct TargetRegistry {
    sources: HashMap<TargetKind, Arc<dyn TargetSource>>,
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, source: Arc<dyn TargetSource>) -> &mut Self {
        self.sources.insert(source.kind(), source);
        self
    }

    pub fn with(mut self, source: Arc<dyn TargetSource>) -> Self {
        self.register(source);
        self
    }

    pub fn get(&self, kind: TargetKind) -> EvalResult<Arc<dyn TargetSource>> {
        self.sources.get(&kind).cloned().ok_or_else(|| {
            EvalError::InvalidParam(format!("no executor registered for target kind {}", kind.as_str()))
        })
    }

    pub fn kinds(&self) -> Vec<TargetKind> {
        let mut k: Vec<TargetKind> = self.sources.keys().copied().collect();
        k.sort_by_key(|k| k.as_str());
        k
    }
}
