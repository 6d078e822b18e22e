use super::{
    EvalTarget, EvalTargetVersion, RecordScope, TargetInput, TargetKind, TargetOutput, TargetRecord,
    TargetRegistry, TargetSourceInfo,
};
use crate::context::Ctx;
use crate::errors::{EvalError, EvalResult, ResourceKind};
use crate::idgen::IdGenerator;
use crate::model::{now_ms, RecordId, RecordStatus, SpaceId, TargetId, TargetVersionId};
use crate::storage::{Page, Store};
use crate::usage::log_usage_event;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateTarget {
    pub space_id: SpaceId,
    pub kind: TargetKind,
    pub source_id: String,
    pub source_version: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedTarget {
    pub target_id: TargetId,
    pub target_version_id: TargetVersionId,
}

/// Catalog and standalone execution of evaluation targets.
#[derive(Clone)]
pub struct EvalTargetService {
    store: Store,
    registry: Arc<TargetRegistry>,
    ids: Arc<dyn IdGenerator>,
    default_timeout: Duration,
}

impl EvalTargetService {
    pub fn new(
        store: Store,
        registry: Arc<TargetRegistry>,
        ids: Arc<dyn IdGenerator>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            ids,
            default_timeout,
        }
    }

    pub fn registry(&self) -> &TargetRegistry {
        &self.registry
    }

    /// Idempotent on `(space, kind, source_id)` and `(target, source_version)`.
    pub async fn create(&self, ctx: &Ctx, req: CreateTarget) -> EvalResult<CreatedTarget> {
        if req.source_id.trim().is_empty() {
            return Err(EvalError::InvalidParam("source_id is required".into()));
        }
        if req.source_version.trim().is_empty() {
            return Err(EvalError::InvalidParam("source_version is required".into()));
        }
        let source = self.registry.get(req.kind)?;
        source.validate_config(&req.config)?;

        let now = now_ms();
        let target = self.store.upsert_target(&EvalTarget {
            id: self.ids.next_id(),
            space_id: req.space_id,
            kind: req.kind,
            source_id: req.source_id.clone(),
            created_by: ctx.user().to_string(),
            created_at: now,
        })?;
        let mut version = EvalTargetVersion {
            id: self.ids.next_id(),
            target_id: target.id,
            space_id: req.space_id,
            kind: req.kind,
            source_id: req.source_id,
            source_version: req.source_version,
            config: req.config,
            source_info: None,
            created_at: now,
        };
        // Source info is a best-effort snapshot.
        if let Err(e) = source
            .pack_source_info(ctx, req.space_id, std::slice::from_mut(&mut version))
            .await
        {
            tracing::warn!(event = "target.source_info_failed", kind = req.kind.as_str(), error = %e);
        }
        let version_id = self.store.upsert_target_version(&version)?;
        tracing::info!(
            event = "target.created",
            space_id = req.space_id,
            target_id = target.id,
            target_version_id = version_id,
            kind = req.kind.as_str(),
        );
        Ok(CreatedTarget {
            target_id: target.id,
            target_version_id: version_id,
        })
    }

    pub fn get_target(&self, space_id: SpaceId, id: TargetId) -> EvalResult<EvalTarget> {
        self.store
            .get_target(space_id, id)?
            .ok_or_else(|| EvalError::not_found(ResourceKind::Target, id))
    }

    pub fn batch_get_by_source(
        &self,
        space_id: SpaceId,
        kind: TargetKind,
        source_ids: &[String],
    ) -> EvalResult<Vec<EvalTarget>> {
        Ok(self.store.targets_by_source(space_id, kind, source_ids)?)
    }

    pub async fn get_version(
        &self,
        ctx: &Ctx,
        space_id: SpaceId,
        id: TargetVersionId,
        with_source_info: bool,
    ) -> EvalResult<EvalTargetVersion> {
        self.batch_get_versions(ctx, space_id, &[id], with_source_info)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| EvalError::not_found(ResourceKind::TargetVersion, id))
    }

    /// Missing ids are omitted. With `with_source_info`, each kind refreshes its snapshot.
    pub async fn batch_get_versions(
        &self,
        ctx: &Ctx,
        space_id: SpaceId,
        ids: &[TargetVersionId],
        with_source_info: bool,
    ) -> EvalResult<Vec<EvalTargetVersion>> {
        let mut versions = self.store.mget_target_versions(space_id, ids)?;
        if with_source_info {
            for kind in self.registry.kinds() {
                let source = self.registry.get(kind)?;
                let mut of_kind: Vec<EvalTargetVersion> =
                    versions.iter().filter(|v| v.kind == kind).cloned().collect();
                if of_kind.is_empty() {
                    continue;
                }
                source.pack_source_info(ctx, space_id, &mut of_kind).await?;
                for packed in of_kind {
                    if let Some(v) = versions.iter_mut().find(|v| v.id == packed.id) {
                        v.source_info = packed.source_info;
                    }
                }
            }
        }
        Ok(versions)
    }

    pub fn list_versions(&self, space_id: SpaceId, target_id: TargetId) -> EvalResult<Vec<EvalTargetVersion>> {
        self.get_target(space_id, target_id)?;
        Ok(self.store.list_target_versions(space_id, target_id)?)
    }

    pub async fn list_sources(
        &self,
        ctx: &Ctx,
        space_id: SpaceId,
        kind: TargetKind,
        keyword: Option<&str>,
        page: Page,
    ) -> EvalResult<Vec<TargetSourceInfo>> {
        self.registry
            .get(kind)?
            .list_sources(ctx, space_id, keyword, page)
            .await
    }

    pub async fn list_source_versions(
        &self,
        ctx: &Ctx,
        space_id: SpaceId,
        kind: TargetKind,
        source_id: &str,
        page: Page,
    ) -> EvalResult<Vec<TargetSourceInfo>> {
        self.registry
            .get(kind)?
            .list_source_versions(ctx, space_id, source_id, page)
            .await
    }

    /// Runs a stored version standalone and persists the record.
    pub async fn execute(
        &self,
        ctx: &Ctx,
        space_id: SpaceId,
        version_id: TargetVersionId,
        input: TargetInput,
    ) -> EvalResult<TargetRecord> {
        let version = self.get_version(ctx, space_id, version_id, false).await?;
        self.run_version(ctx, &version, input, RecordScope::default(), self.default_timeout)
            .await
    }

    /// Executes one input with a hard timeout. A record is written for
    /// failures too; only storage errors surface as `Err`.
    pub async fn run_version(
        &self,
        ctx: &Ctx,
        version: &EvalTargetVersion,
        input: TargetInput,
        scope: RecordScope,
        timeout: Duration,
    ) -> EvalResult<TargetRecord> {
        let started = Instant::now();
        let outcome: EvalResult<TargetOutput> = match self.registry.get(version.kind) {
            Err(e) => Err(e),
            Ok(source) => match tokio::time::timeout(timeout, source.execute(ctx, version, &input)).await {
                Ok(r) => r,
                Err(_) => Err(EvalError::UpstreamUnavailable(format!(
                    "target timed out after {} ms",
                    timeout.as_millis()
                ))),
            },
        };
        let latency_ms = started.elapsed().as_millis() as i64;

        let (status, output, error) = match outcome {
            Ok(out) => (RecordStatus::Success, Some(out), None),
            Err(e) => {
                tracing::warn!(
                    event = "target.failed",
                    kind = version.kind.as_str(),
                    target_version_id = version.id,
                    trace_id = %ctx.trace_id,
                    error = %e,
                );
                (RecordStatus::Failed, None, Some(e.detail()))
            }
        };
        log_usage_event("target_call", 1);
        if let Some(o) = &output {
            log_usage_event("tokens", o.usage.total().max(0) as u64);
        }

        let record = TargetRecord {
            id: self.ids.next_id(),
            space_id: version.space_id,
            target_id: version.target_id,
            target_version_id: version.id,
            scope,
            input,
            output,
            status,
            error,
            latency_ms,
            trace_id: Some(ctx.trace_id.clone()),
            created_at: now_ms(),
        };
        self.store.insert_target_record(&record)?;
        Ok(record)
    }

    pub fn get_record(&self, space_id: SpaceId, id: RecordId) -> EvalResult<TargetRecord> {
        self.batch_get_records(space_id, &[id])?
            .into_iter()
            .next()
            .ok_or_else(|| EvalError::not_found(ResourceKind::Record, id))
    }

    pub fn batch_get_records(&self, space_id: SpaceId, ids: &[RecordId]) -> EvalResult<Vec<TargetRecord>> {
        Ok(self.store.mget_target_records(space_id, ids)?)
    }
}
