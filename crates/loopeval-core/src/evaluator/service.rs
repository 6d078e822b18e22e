use super::templates::{self, EvaluatorTemplate};
use super::{
    Evaluator, EvaluatorContent, EvaluatorDraft, EvaluatorInput, EvaluatorKind, EvaluatorOutput,
    EvaluatorRecord, EvaluatorRegistry, EvaluatorVersion,
};
use crate::context::Ctx;
use crate::errors::{EvalError, EvalResult, ResourceKind};
use crate::events::{publish_event, AggregateCalculateEvent, EventBus};
use crate::idgen::IdGenerator;
use crate::model::{
    now_ms, Correction, EvaluatorCell, EvaluatorId, EvaluatorVersionId, ExptId, ItemId, RecordId,
    RecordStatus, RunId, SpaceId, TurnId,
};
use crate::moderation::{enforce, ContentModerator};
use crate::on_error::ErrorPolicy;
use crate::storage::{Page, Store};
use crate::usage::log_usage_event;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

pub const MAX_NAME_CHARS: usize = 50;
pub const MAX_DESCRIPTION_CHARS: usize = 1000;
const MAX_VERSION_CHARS: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateEvaluator {
    pub space_id: SpaceId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub draft: EvaluatorDraft,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluatorWithVersions {
    pub evaluator: Evaluator,
    pub versions: Vec<EvaluatorVersion>,
}

/// Where an evaluator run belongs when it scores an experiment turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunScope {
    pub expt_id: Option<ExptId>,
    pub run_id: Option<RunId>,
    pub item_id: Option<ItemId>,
    pub turn_id: Option<TurnId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionRequest {
    pub score: f64,
    #[serde(default)]
    pub explain: Option<String>,
}

fn check_len(field: &str, value: &str, max: usize) -> EvalResult<()> {
    if value.chars().count() > max {
        return Err(EvalError::InvalidParam(format!(
            "{} exceeds {} characters",
            field, max
        )));
    }
    Ok(())
}

fn check_name(name: &str) -> EvalResult<()> {
    if name.trim().is_empty() {
        return Err(EvalError::InvalidParam("name is required".into()));
    }
    check_len("name", name, MAX_NAME_CHARS)
}

/// Stable fingerprint of submitted content.
pub fn content_hash(content: &EvaluatorContent) -> EvalResult<String> {
    let canonical = serde_json::to_vec(content)?;
    Ok(hex::encode(Sha256::digest(&canonical)))
}

#[derive(Clone)]
pub struct EvaluatorService {
    store: Store,
    registry: Arc<EvaluatorRegistry>,
    ids: Arc<dyn IdGenerator>,
    moderator: Arc<dyn ContentModerator>,
    moderation_on_error: ErrorPolicy,
    bus: Arc<dyn EventBus>,
    default_timeout: Duration,
}

impl EvaluatorService {
    pub fn new(
        store: Store,
        registry: Arc<EvaluatorRegistry>,
        ids: Arc<dyn IdGenerator>,
        moderator: Arc<dyn ContentModerator>,
        moderation_on_error: ErrorPolicy,
        bus: Arc<dyn EventBus>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            ids,
            moderator,
            moderation_on_error,
            bus,
            default_timeout,
        }
    }

    pub fn registry(&self) -> &EvaluatorRegistry {
        &self.registry
    }

    async fn moderate(&self, ctx: &Ctx, operation: &str, texts: &[&str]) -> EvalResult<()> {
        enforce(
            self.moderator.as_ref(),
            self.moderation_on_error,
            ctx,
            operation,
            texts,
        )
        .await
    }

    pub async fn create(&self, ctx: &Ctx, req: CreateEvaluator) -> EvalResult<Evaluator> {
        check_name(&req.name)?;
        check_len("description", &req.description, MAX_DESCRIPTION_CHARS)?;
        let kind = req.draft.content.kind();
        self.registry.get(kind)?.validate(&req.draft.content)?;
        let content_text = req.draft.content.moderation_text();
        self.moderate(
            ctx,
            "evaluator.create",
            &[req.name.as_str(), req.description.as_str(), content_text.as_str()],
        )
        .await?;
        if self.store.evaluator_name_exists(req.space_id, &req.name, None)? {
            return Err(EvalError::NameExists(req.name));
        }

        let now = now_ms();
        let e = Evaluator {
            id: self.ids.next_id(),
            space_id: req.space_id,
            name: req.name,
            description: req.description,
            kind,
            draft: req.draft,
            latest_version: None,
            created_by: ctx.user().to_string(),
            created_at: now,
            updated_at: now,
            deleted: false,
        };
        self.store.insert_evaluator(&e)?;
        tracing::info!(event = "evaluator.created", space_id = e.space_id, evaluator_id = e.id, kind = kind.as_str());
        Ok(e)
    }

    pub fn get(&self, space_id: SpaceId, id: EvaluatorId) -> EvalResult<Evaluator> {
        self.store
            .get_evaluator(space_id, id)?
            .ok_or_else(|| EvalError::not_found(ResourceKind::Evaluator, id))
    }

    pub fn get_with_versions(&self, space_id: SpaceId, id: EvaluatorId) -> EvalResult<EvaluatorWithVersions> {
        let evaluator = self.get(space_id, id)?;
        let versions = self.store.list_evaluator_versions(space_id, id)?;
        Ok(EvaluatorWithVersions { evaluator, versions })
    }

    pub fn batch_get(&self, space_id: SpaceId, ids: &[EvaluatorId]) -> EvalResult<Vec<Evaluator>> {
        Ok(self.store.mget_evaluators(space_id, ids)?)
    }

    pub fn list(
        &self,
        space_id: SpaceId,
        name_like: Option<&str>,
        kind: Option<EvaluatorKind>,
        page: Page,
    ) -> EvalResult<(Vec<Evaluator>, i64)> {
        Ok(self
            .store
            .list_evaluators(space_id, name_like, kind, page.offset, page.limit)?)
    }

    pub fn check_name(&self, space_id: SpaceId, name: &str, exclude: Option<EvaluatorId>) -> EvalResult<bool> {
        Ok(!self.store.evaluator_name_exists(space_id, name, exclude)?)
    }

    pub async fn update(
        &self,
        ctx: &Ctx,
        space_id: SpaceId,
        id: EvaluatorId,
        name: Option<String>,
        description: Option<String>,
    ) -> EvalResult<Evaluator> {
        let mut e = self.get(space_id, id)?;
        if let Some(n) = &name {
            check_name(n)?;
            if self.store.evaluator_name_exists(space_id, n, Some(id))? {
                return Err(EvalError::NameExists(n.clone()));
            }
        }
        if let Some(d) = &description {
            check_len("description", d, MAX_DESCRIPTION_CHARS)?;
        }
        self.moderate(
            ctx,
            "evaluator.update",
            &[
                name.as_deref().unwrap_or_default(),
                description.as_deref().unwrap_or_default(),
            ],
        )
        .await?;
        if let Some(n) = name {
            e.name = n;
        }
        if let Some(d) = description {
            e.description = d;
        }
        e.updated_at = now_ms();
        if !self.store.update_evaluator(&e)? {
            return Err(EvalError::not_found(ResourceKind::Evaluator, id));
        }
        Ok(e)
    }

    pub async fn update_draft(
        &self,
        ctx: &Ctx,
        space_id: SpaceId,
        id: EvaluatorId,
        draft: EvaluatorDraft,
    ) -> EvalResult<Evaluator> {
        let mut e = self.get(space_id, id)?;
        if draft.content.kind() != e.kind {
            return Err(EvalError::InvalidParam(format!(
                "draft kind {} does not match evaluator kind {}",
                draft.content.kind().as_str(),
                e.kind.as_str()
            )));
        }
        self.registry.get(e.kind)?.validate(&draft.content)?;
        let text = draft.content.moderation_text();
        self.moderate(ctx, "evaluator.update_draft", &[text.as_str()]).await?;
        e.draft = draft;
        e.updated_at = now_ms();
        if !self.store.update_evaluator(&e)? {
            return Err(EvalError::not_found(ResourceKind::Evaluator, id));
        }
        Ok(e)
    }

    /// Versions stay resolvable for experiments that already reference them.
    pub fn delete(&self, space_id: SpaceId, id: EvaluatorId) -> EvalResult<()> {
        if !self.store.delete_evaluator(space_id, id)? {
            return Err(EvalError::not_found(ResourceKind::Evaluator, id));
        }
        tracing::info!(event = "evaluator.deleted", space_id, evaluator_id = id);
        Ok(())
    }

    /// Freezes the current draft into an immutable version.
    pub async fn submit_version(
        &self,
        ctx: &Ctx,
        space_id: SpaceId,
        id: EvaluatorId,
        version: &str,
        description: &str,
    ) -> EvalResult<EvaluatorVersion> {
        if version.trim().is_empty() {
            return Err(EvalError::InvalidParam("version is required".into()));
        }
        check_len("version", version, MAX_VERSION_CHARS)?;
        check_len("description", description, MAX_DESCRIPTION_CHARS)?;
        let e = self.get(space_id, id)?;
        self.registry.get(e.kind)?.validate(&e.draft.content)?;
        let text = e.draft.content.moderation_text();
        self.moderate(ctx, "evaluator.submit_version", &[description, text.as_str()])
            .await?;

        let v = EvaluatorVersion {
            id: self.ids.next_id(),
            evaluator_id: e.id,
            space_id,
            name: e.name.clone(),
            version: version.to_string(),
            description: description.to_string(),
            content_hash: content_hash(&e.draft.content)?,
            content: e.draft.content,
            aggregators: e.draft.aggregators,
            value_set: e.draft.value_set,
            created_by: ctx.user().to_string(),
            created_at: now_ms(),
        };
        self.store.insert_evaluator_version(&v)?;
        tracing::info!(
            event = "evaluator.version_submitted",
            space_id,
            evaluator_id = id,
            evaluator_version_id = v.id,
            version = %v.version,
        );
        Ok(v)
    }

    pub fn list_versions(&self, space_id: SpaceId, id: EvaluatorId) -> EvalResult<Vec<EvaluatorVersion>> {
        self.get(space_id, id)?;
        Ok(self.store.list_evaluator_versions(space_id, id)?)
    }

    pub fn batch_get_versions(
        &self,
        space_id: SpaceId,
        ids: &[EvaluatorVersionId],
    ) -> EvalResult<Vec<EvaluatorVersion>> {
        Ok(self.store.mget_evaluator_versions(space_id, ids)?)
    }

    pub fn get_version(&self, space_id: SpaceId, id: EvaluatorVersionId) -> EvalResult<EvaluatorVersion> {
        self.batch_get_versions(space_id, &[id])?
            .into_iter()
            .next()
            .ok_or_else(|| EvalError::not_found(ResourceKind::EvaluatorVersion, id))
    }

    pub fn list_templates(&self, kind: Option<EvaluatorKind>) -> Vec<EvaluatorTemplate> {
        templates::builtin()
            .into_iter()
            .filter(|t| kind.map_or(true, |k| t.kind == k))
            .collect()
    }

    pub fn get_template(&self, key: &str) -> EvalResult<EvaluatorTemplate> {
        templates::find(key).ok_or_else(|| EvalError::InvalidParam(format!("unknown template {}", key)))
    }

    /// Runs unsubmitted content once; nothing is persisted.
    pub async fn debug(
        &self,
        ctx: &Ctx,
        space_id: SpaceId,
        draft: EvaluatorDraft,
        input: &EvaluatorInput,
    ) -> EvalResult<EvaluatorOutput> {
        let exec = self.registry.get(draft.content.kind())?;
        exec.validate(&draft.content)?;
        let transient = EvaluatorVersion {
            id: 0,
            evaluator_id: 0,
            space_id,
            name: "debug".into(),
            version: "draft".into(),
            description: String::new(),
            content_hash: content_hash(&draft.content)?,
            content: draft.content,
            aggregators: draft.aggregators,
            value_set: draft.value_set,
            created_by: ctx.user().to_string(),
            created_at: now_ms(),
        };
        let budget = ctx.budget(self.default_timeout);
        match tokio::time::timeout(budget, exec.execute(ctx, &transient, input)).await {
            Ok(r) => r,
            Err(_) => Err(EvalError::UpstreamUnavailable(format!(
                "evaluator timed out after {} ms",
                budget.as_millis()
            ))),
        }
    }

    /// Runs a submitted version and persists the record.
    pub async fn run(
        &self,
        ctx: &Ctx,
        space_id: SpaceId,
        version_id: EvaluatorVersionId,
        input: EvaluatorInput,
    ) -> EvalResult<EvaluatorRecord> {
        let version = self.get_version(space_id, version_id)?;
        self.run_version(ctx, &version, input, RunScope::default(), self.default_timeout)
            .await
    }

    /// Executes with a hard timeout and always writes a record; only storage
    /// errors surface as `Err`.
    pub async fn run_version(
        &self,
        ctx: &Ctx,
        version: &EvaluatorVersion,
        input: EvaluatorInput,
        scope: RunScope,
        timeout: Duration,
    ) -> EvalResult<EvaluatorRecord> {
        let outcome = match self.registry.get(version.kind()) {
            Err(e) => Err(e),
            Ok(exec) => match tokio::time::timeout(timeout, exec.execute(ctx, version, &input)).await {
                Ok(r) => r,
                Err(_) => Err(EvalError::UpstreamUnavailable(format!(
                    "evaluator timed out after {} ms",
                    timeout.as_millis()
                ))),
            },
        };
        let (status, output, error) = match outcome {
            Ok(out) if out.score.is_some_and(|s| !s.is_finite()) => (
                RecordStatus::Failed,
                None,
                Some(EvalError::InvalidParam("evaluator returned a non-finite score".into()).detail()),
            ),
            Ok(out) => (RecordStatus::Success, Some(out), None),
            Err(e) => {
                tracing::warn!(
                    event = "evaluator.failed",
                    evaluator_version_id = version.id,
                    trace_id = %ctx.trace_id,
                    error = %e,
                );
                (RecordStatus::Failed, None, Some(e.detail()))
            }
        };
        log_usage_event("evaluator_call", 1);
        if let Some(o) = &output {
            log_usage_event("tokens", o.usage.total().max(0) as u64);
        }

        let now = now_ms();
        let record = EvaluatorRecord {
            id: self.ids.next_id(),
            space_id: version.space_id,
            evaluator_version_id: version.id,
            expt_id: scope.expt_id,
            run_id: scope.run_id,
            item_id: scope.item_id,
            turn_id: scope.turn_id,
            input,
            output,
            status,
            error,
            correction: None,
            trace_id: Some(ctx.trace_id.clone()),
            created_by: ctx.user().to_string(),
            created_at: now,
            updated_at: now,
        };
        self.store.insert_evaluator_record(&record)?;
        Ok(record)
    }

    pub fn get_record(&self, space_id: SpaceId, id: RecordId) -> EvalResult<EvaluatorRecord> {
        self.batch_get_records(space_id, &[id])?
            .into_iter()
            .next()
            .ok_or_else(|| EvalError::not_found(ResourceKind::Record, id))
    }

    pub fn batch_get_records(&self, space_id: SpaceId, ids: &[RecordId]) -> EvalResult<Vec<EvaluatorRecord>> {
        Ok(self.store.mget_evaluator_records(space_id, ids)?)
    }

    /// Applies a human correction. When the record scored an experiment turn,
    /// the turn cell is rewritten and the experiment's aggregates are recomputed.
    pub async fn update_record(
        &self,
        ctx: &Ctx,
        space_id: SpaceId,
        record_id: RecordId,
        req: CorrectionRequest,
    ) -> EvalResult<EvaluatorRecord> {
        let record = self.get_record(space_id, record_id)?;
        let version = self.get_version(space_id, record.evaluator_version_id)?;
        let correction = Correction {
            score: req.score,
            explain: req.explain,
            updated_by: ctx.user().to_string(),
            updated_at: now_ms(),
        };
        let corrected = self.registry.get(version.kind())?.correct(&record, &correction)?;
        if !self.store.update_evaluator_record_correction(&corrected)? {
            return Err(EvalError::not_found(ResourceKind::Record, record_id));
        }

        if let (Some(expt_id), Some(item_id), Some(turn_id)) = (record.expt_id, record.item_id, record.turn_id) {
            let cell = EvaluatorCell {
                record_id: Some(record.id),
                score: record.output.as_ref().and_then(|o| o.score),
                reasoning: record.output.as_ref().and_then(|o| o.reasoning.clone()),
                correction: corrected.correction.clone(),
                error: record.error.clone(),
            };
            let updated = self
                .store
                .update_turn_cell(expt_id, item_id, turn_id, record.evaluator_version_id, &cell)?;
            if updated {
                publish_event(
                    self.bus.as_ref(),
                    &AggregateCalculateEvent { expt_id, space_id },
                    &ctx.trace_id,
                )
                .await?;
            }
        }
        tracing::info!(
            event = "evaluator.record_corrected",
            space_id,
            record_id,
            score = req.score,
            updated_by = %ctx.user(),
        );
        Ok(corrected)
    }
}
