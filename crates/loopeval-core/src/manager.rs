use crate::config::EngineConfig;
use crate::context::Ctx;
use crate::dataset::{all_items, EvalSetProvider, ItemOutcome, NewItem};
use crate::errors::{EvalError, EvalResult, ResourceKind};
use crate::events::{publish_event, AggregateCalculateEvent, EventBus, ExptScheduleEvent, ItemEvalEvent};
use crate::idempotency::{dispatch_key, IdempotencyStore};
use crate::idgen::IdGenerator;
use crate::model::{
    now_ms, EvalMode, EvaluatorFieldMapping, EvaluatorRef, EvaluatorVersionId, Experiment, ExperimentDetail,
    ExptId, ExptStats, ExptStatus, ExptType, ItemId, RunId, RunLog, RunState, SourceType, SpaceId,
    TargetFieldMapping, TargetRef, TargetVersionId,
};
use crate::moderation::{enforce, ContentModerator};
use crate::quota::QuotaService;
use crate::status_cache::StatusProbe;
use crate::storage::{EvaluatorLink, ExptFilter, OrderBy, Page, StatusTransition, Store};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

pub const MAX_EXPT_NAME_CHARS: usize = 100;
pub const MAX_EXPT_DESCRIPTION_CHARS: usize = 1000;
const CAS_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateExperiment {
    pub space_id: SpaceId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub expt_type: ExptType,
    #[serde(default)]
    pub source_type: SourceType,
    #[serde(default)]
    pub source_id: Option<String>,
    #[serde(default)]
    pub max_alive_time_ms: i64,
    #[serde(default)]
    pub item_concurrency: Option<u32>,
    #[serde(default)]
    pub evaluator_concurrency: Option<u32>,
    pub eval_set_version_id: i64,
    #[serde(default)]
    pub target_version_id: Option<TargetVersionId>,
    #[serde(default)]
    pub evaluator_version_ids: Vec<EvaluatorVersionId>,
    #[serde(default)]
    pub target_field_mapping: TargetFieldMapping,
    #[serde(default)]
    pub evaluator_field_mapping: Vec<EvaluatorFieldMapping>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokeResult {
    pub run_id: RunId,
    pub outcomes: Vec<ItemOutcome>,
    /// Items newly attached to the experiment.
    pub added: usize,
}

/// Terminal status for a finished experiment.
///
/// Failed when nothing succeeded but something failed, or when the failed share
/// exceeds `failed_ratio`. Everything else is a Success.
pub fn finish_status(stats: &ExptStats, failed_ratio: Option<f64>) -> ExptStatus {
    if stats.total_cnt <= 0 {
        return ExptStatus::Success;
    }
    if stats.success_cnt == 0 && stats.failed_cnt > 0 {
        return ExptStatus::Failed;
    }
    match failed_ratio {
        Some(r) if stats.failed_cnt as f64 / stats.total_cnt as f64 > r => ExptStatus::Failed,
        _ => ExptStatus::Success,
    }
}

fn check_len(field: &str, value: &str, max: usize) -> EvalResult<()> {
    if value.chars().count() > max {
        return Err(EvalError::InvalidParam(format!("{} exceeds {} characters", field, max)));
    }
    Ok(())
}

fn check_name(name: &str) -> EvalResult<()> {
    if name.trim().is_empty() {
        return Err(EvalError::InvalidParam("experiment name is required".into()));
    }
    check_len("name", name, MAX_EXPT_NAME_CHARS)
}

fn invalid_state(op: &str, s: ExptStatus) -> EvalError {
    EvalError::InvalidState(format!("cannot {} experiment in status {}", op, s.as_str()))
}

/// Owns every write to `experiment.status`.
#[derive(Clone)]
pub struct ExperimentManager {
    store: Store,
    quota: QuotaService,
    bus: Arc<dyn EventBus>,
    idem: Arc<dyn IdempotencyStore>,
    ids: Arc<dyn IdGenerator>,
    eval_sets: Arc<dyn EvalSetProvider>,
    moderator: Arc<dyn ContentModerator>,
    probe: StatusProbe,
    cfg: Arc<EngineConfig>,
}

impl ExperimentManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        quota: QuotaService,
        bus: Arc<dyn EventBus>,
        idem: Arc<dyn IdempotencyStore>,
        ids: Arc<dyn IdGenerator>,
        eval_sets: Arc<dyn EvalSetProvider>,
        moderator: Arc<dyn ContentModerator>,
        probe: StatusProbe,
        cfg: Arc<EngineConfig>,
    ) -> Self {
        Self {
            store,
            quota,
            bus,
            idem,
            ids,
            eval_sets,
            moderator,
            probe,
            cfg,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn quota(&self) -> &QuotaService {
        &self.quota
    }

    pub fn probe(&self) -> &StatusProbe {
        &self.probe
    }

    pub fn eval_sets(&self) -> &Arc<dyn EvalSetProvider> {
        &self.eval_sets
    }

    pub async fn create(&self, ctx: &Ctx, req: CreateExperiment) -> EvalResult<Experiment> {
        check_name(&req.name)?;
        check_len("description", &req.description, MAX_EXPT_DESCRIPTION_CHARS)?;
        let mut seen = HashSet::new();
        if !req.evaluator_version_ids.iter().all(|id| seen.insert(*id)) {
            return Err(EvalError::InvalidParam("duplicate evaluator version ids".into()));
        }
        for m in &req.evaluator_field_mapping {
            if !seen.contains(&m.evaluator_version_id) {
                return Err(EvalError::InvalidParam(format!(
                    "field mapping references unknown evaluator version {}",
                    m.evaluator_version_id
                )));
            }
        }
        let item_concurrency = req.item_concurrency.unwrap_or(self.cfg.default_item_concurrency);
        let evaluator_concurrency = req
            .evaluator_concurrency
            .unwrap_or(self.cfg.default_evaluator_concurrency);
        if item_concurrency == 0 || evaluator_concurrency == 0 {
            return Err(EvalError::InvalidParam("concurrency must be at least 1".into()));
        }
        if req.max_alive_time_ms < 0 {
            return Err(EvalError::InvalidParam("max_alive_time_ms must not be negative".into()));
        }

        enforce(
            self.moderator.as_ref(),
            self.cfg.moderation_on_error,
            ctx,
            "experiment.create",
            &[req.name.as_str(), req.description.as_str()],
        )
        .await?;
        if self.store.experiment_name_exists(req.space_id, &req.name, None)? {
            return Err(EvalError::NameExists(req.name));
        }

        let set_version = self
            .eval_sets
            .get_version(req.space_id, req.eval_set_version_id)
            .await?;
        let target_id = match req.target_version_id {
            None => None,
            Some(tv) => {
                let found = self.store.mget_target_versions(req.space_id, &[tv])?;
                let v = found
                    .first()
                    .ok_or_else(|| EvalError::not_found(ResourceKind::TargetVersion, tv))?;
                Some(v.target_id)
            }
        };
        let versions = self
            .store
            .mget_evaluator_versions(req.space_id, &req.evaluator_version_ids)?;
        let mut refs = Vec::with_capacity(req.evaluator_version_ids.len());
        for id in &req.evaluator_version_ids {
            let v = versions
                .iter()
                .find(|v| v.id == *id)
                .ok_or_else(|| EvalError::not_found(ResourceKind::EvaluatorVersion, id))?;
            refs.push(EvaluatorLink {
                evaluator_id: v.evaluator_id,
                evaluator_version_id: v.id,
            });
        }

        let items = self.initial_items(req.expt_type, req.space_id, set_version.id).await?;
        let now = now_ms();
        let e = Experiment {
            id: self.ids.next_id(),
            space_id: req.space_id,
            name: req.name,
            description: req.description,
            created_by: ctx.user().to_string(),
            status: ExptStatus::Pending,
            status_message: None,
            expt_type: req.expt_type,
            source_type: req.source_type,
            source_id: req.source_id,
            max_alive_time_ms: req.max_alive_time_ms,
            item_concurrency,
            evaluator_concurrency,
            eval_set_id: set_version.eval_set_id,
            eval_set_version_id: set_version.id,
            target_id,
            target_version_id: req.target_version_id,
            evaluator_version_ids: req.evaluator_version_ids,
            target_field_mapping: req.target_field_mapping,
            evaluator_field_mapping: req.evaluator_field_mapping,
            latest_run_id: None,
            start_at: None,
            end_at: None,
            created_at: now,
            updated_at: now,
            version: 1,
            deleted: false,
        };
        self.persist_new(&e, &refs, &items)?;
        tracing::info!(
            event = "experiment.created",
            space_id = e.space_id,
            expt_id = e.id,
            items = items.len(),
            evaluators = refs.len(),
            trace_id = %ctx.trace_id,
        );
        Ok(e)
    }

    async fn initial_items(&self, t: ExptType, space_id: SpaceId, version_id: i64) -> EvalResult<Vec<ItemId>> {
        match t {
            ExptType::Online => Ok(Vec::new()),
            ExptType::Offline => Ok(all_items(self.eval_sets.as_ref(), space_id, version_id)
                .await?
                .into_iter()
                .map(|i| i.item_id)
                .collect()),
        }
    }

    /// Admits quota, then inserts. A failed insert gives the slot back.
    fn persist_new(&self, e: &Experiment, refs: &[EvaluatorLink], items: &[ItemId]) -> EvalResult<()> {
        self.quota.admit(e.space_id, e.id)?;
        if let Err(err) = self.store.insert_experiment(e, refs, items) {
            if let Err(rel) = self.quota.release(e.space_id, e.id) {
                tracing::error!(event = "quota.release_failed", expt_id = e.id, error = %rel);
            }
            return Err(err.into());
        }
        Ok(())
    }

    /// Creates and immediately runs in the type's default mode.
    pub async fn submit(&self, ctx: &Ctx, req: CreateExperiment) -> EvalResult<(Experiment, RunLog)> {
        let e = self.create(ctx, req).await?;
        let log = self
            .run(ctx, e.space_id, e.id, EvalMode::default_for(e.expt_type))
            .await?;
        let e = self.get(e.space_id, e.id)?;
        Ok((e, log))
    }

    pub fn get(&self, space_id: SpaceId, id: ExptId) -> EvalResult<Experiment> {
        self.store
            .get_experiment(id)?
            .filter(|e| !e.deleted && e.space_id == space_id)
            .ok_or_else(|| EvalError::not_found(ResourceKind::Experiment, id))
    }

    /// Live experiments with their target, evaluator refs and stats; missing ids are skipped.
    pub fn mget_detail(&self, space_id: SpaceId, ids: &[ExptId]) -> EvalResult<Vec<ExperimentDetail>> {
        let expts = self.store.mget_experiments(space_id, ids)?;
        let target_ids: Vec<TargetVersionId> = expts.iter().filter_map(|e| e.target_version_id).collect();
        let targets = self.store.mget_target_versions(space_id, &target_ids)?;
        let mut ev_ids: Vec<EvaluatorVersionId> =
            expts.iter().flat_map(|e| e.evaluator_version_ids.iter().copied()).collect();
        ev_ids.sort_unstable();
        ev_ids.dedup();
        let versions = self.store.mget_evaluator_versions(space_id, &ev_ids)?;
        let stats: HashMap<ExptId, ExptStats> = self
            .store
            .mget_stats(&expts.iter().map(|e| e.id).collect::<Vec<_>>())?
            .into_iter()
            .map(|s| (s.expt_id, s))
            .collect();

        Ok(expts
            .into_iter()
            .map(|e| {
                let target = e
                    .target_version_id
                    .and_then(|tv| targets.iter().find(|t| t.id == tv))
                    .map(|t| TargetRef {
                        target_id: t.target_id,
                        target_version_id: t.id,
                        kind: t.kind.as_str().to_string(),
                        source_id: t.source_id.clone(),
                        source_version: t.source_version.clone(),
                    });
                let evaluators = e
                    .evaluator_version_ids
                    .iter()
                    .filter_map(|id| versions.iter().find(|v| v.id == *id))
                    .map(|v| EvaluatorRef {
                        evaluator_id: v.evaluator_id,
                        evaluator_version_id: v.id,
                        name: v.name.clone(),
                        version: v.version.clone(),
                    })
                    .collect();
                let stats = stats.get(&e.id).cloned();
                ExperimentDetail {
                    experiment: e,
                    target,
                    evaluators,
                    stats,
                }
            })
            .collect())
    }

    pub fn list(
        &self,
        space_id: SpaceId,
        filter: &ExptFilter,
        order: OrderBy,
        page: Page,
    ) -> EvalResult<(Vec<Experiment>, i64)> {
        Ok(self.store.list_experiments(space_id, filter, order, page)?)
    }

    pub fn list_stats(&self, space_id: SpaceId, ids: &[ExptId]) -> EvalResult<Vec<ExptStats>> {
        Ok(self
            .store
            .mget_stats(ids)?
            .into_iter()
            .filter(|s| s.space_id == space_id)
            .collect())
    }

    /// True when `name` is free in the space. Matching is exact and case-sensitive.
    pub fn check_name(&self, space_id: SpaceId, name: &str, exclude: Option<ExptId>) -> EvalResult<bool> {
        Ok(!self.store.experiment_name_exists(space_id, name, exclude)?)
    }

    pub async fn update(
        &self,
        ctx: &Ctx,
        space_id: SpaceId,
        id: ExptId,
        name: Option<String>,
        description: Option<String>,
    ) -> EvalResult<Experiment> {
        if let Some(n) = &name {
            check_name(n)?;
        }
        if let Some(d) = &description {
            check_len("description", d, MAX_EXPT_DESCRIPTION_CHARS)?;
        }
        enforce(
            self.moderator.as_ref(),
            self.cfg.moderation_on_error,
            ctx,
            "experiment.update",
            &[name.as_deref().unwrap_or_default(), description.as_deref().unwrap_or_default()],
        )
        .await?;

        for _ in 0..CAS_ATTEMPTS {
            let e = self.get(space_id, id)?;
            let rename = name.as_deref().filter(|n| *n != e.name);
            if rename.is_some() && e.status.is_terminal() {
                return Err(invalid_state("rename", e.status));
            }
            if let Some(n) = rename {
                if self.store.experiment_name_exists(space_id, n, Some(id))? {
                    return Err(EvalError::NameExists(n.to_string()));
                }
            }
            if self
                .store
                .update_experiment_meta(id, e.version, rename, description.as_deref())?
            {
                tracing::info!(event = "experiment.updated", expt_id = id, renamed = rename.is_some());
                return self.get(space_id, id);
            }
        }
        Err(EvalError::Internal(format!("concurrent updates on experiment {}", id)))
    }

    /// Tombstones one experiment. Running experiments are terminated first so
    /// their workers stop and the quota slot is returned.
    pub async fn delete(&self, ctx: &Ctx, space_id: SpaceId, id: ExptId) -> EvalResult<()> {
        self.get(space_id, id)?;
        self.mdelete(ctx, space_id, &[id]).await.map(|_| ())
    }

    pub async fn mdelete(&self, ctx: &Ctx, space_id: SpaceId, ids: &[ExptId]) -> EvalResult<Vec<ExptId>> {
        for id in ids {
            match self.get(space_id, *id) {
                Ok(e) if !e.status.is_terminal() => {
                    self.settle(ctx, *id, "delete", |e| {
                        Ok((!e.status.is_terminal()).then(|| (ExptStatus::Terminated, "deleted".to_string())))
                    })
                    .await?;
                }
                Ok(_) | Err(EvalError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        let deleted = self.store.soft_delete_experiments(space_id, ids)?;
        for id in &deleted {
            self.quota.release(space_id, *id)?;
            self.probe.invalidate(*id);
        }
        tracing::info!(event = "experiment.deleted", space_id, count = deleted.len(), trace_id = %ctx.trace_id);
        Ok(deleted)
    }

    /// Copies configuration into a fresh Pending experiment with its own items and stats.
    pub async fn clone_experiment(&self, ctx: &Ctx, space_id: SpaceId, id: ExptId) -> EvalResult<Experiment> {
        let src = self.get(space_id, id)?;
        let base = format!("{}_copy", src.name);
        let mut name = base.clone();
        let mut n = 2;
        while self.store.experiment_name_exists(space_id, &name, None)? {
            name = format!("{}_{}", base, n);
            n += 1;
        }
        let refs = self.store.evaluator_links(id)?;
        let items = self
            .initial_items(src.expt_type, space_id, src.eval_set_version_id)
            .await?;
        let now = now_ms();
        let e = Experiment {
            id: self.ids.next_id(),
            name,
            created_by: ctx.user().to_string(),
            status: ExptStatus::Pending,
            status_message: None,
            latest_run_id: None,
            start_at: None,
            end_at: None,
            created_at: now,
            updated_at: now,
            version: 1,
            deleted: false,
            ..src
        };
        self.persist_new(&e, &refs, &items)?;
        tracing::info!(event = "experiment.cloned", source_id = id, expt_id = e.id, items = items.len());
        Ok(e)
    }

    /// Starts a new run. Re-running a finished experiment re-admits quota and
    /// sends its unsuccessful items back to Pending.
    pub async fn run(&self, ctx: &Ctx, space_id: SpaceId, id: ExptId, mode: EvalMode) -> EvalResult<RunLog> {
        for _ in 0..CAS_ATTEMPTS {
            let e = self.get(space_id, id)?;
            match e.status {
                ExptStatus::Pending | ExptStatus::Failed | ExptStatus::Terminated | ExptStatus::Drained => {}
                // A successful experiment can still carry failed items worth retrying.
                ExptStatus::Success if mode == EvalMode::FailRetry => {}
                s => return Err(invalid_state("run", s)),
            }
            match (e.expt_type, mode) {
                (ExptType::Online, EvalMode::Submit) => {
                    return Err(EvalError::InvalidParam("online experiments run through invoke".into()))
                }
                (ExptType::Offline, EvalMode::Invoke) => {
                    return Err(EvalError::InvalidParam("invoke requires an online experiment".into()))
                }
                _ => {}
            }

            self.quota.admit(e.space_id, e.id)?;
            let log = RunLog {
                expt_id: id,
                run_id: self.ids.next_id(),
                mode,
                status: ExptStatus::Processing,
                item_ids: Vec::new(),
                started_at: now_ms(),
                finished_at: None,
                message: None,
            };
            let mut t = StatusTransition::new(&e, ExptStatus::Processing).with_run(log.clone());
            if e.status.is_terminal() {
                t = t.resetting_unsuccess();
            }
            if !self.store.apply_status_transition(&t)? {
                if e.status.is_terminal() {
                    self.quota.release(e.space_id, e.id)?;
                }
                continue;
            }
            self.probe.invalidate(id);
            tracing::info!(
                event = "experiment.status",
                expt_id = id,
                from = e.status.as_str(),
                to = ExptStatus::Processing.as_str(),
                run_id = log.run_id,
                mode = mode.as_str(),
                trace_id = %ctx.trace_id,
            );
            let ev = ExptScheduleEvent {
                expt_id: id,
                run_id: log.run_id,
                mode,
                space_id: e.space_id,
                retry_count: 0,
            };
            publish_event(self.bus.as_ref(), &ev, &ctx.trace_id).await?;
            return Ok(log);
        }
        Err(EvalError::Internal(format!("concurrent status updates on experiment {}", id)))
    }

    /// Re-processes only the items that did not succeed.
    pub async fn retry_unsuccess(&self, ctx: &Ctx, space_id: SpaceId, id: ExptId) -> EvalResult<RunLog> {
        let e = self.get(space_id, id)?;
        if !e.status.is_terminal() {
            return Err(invalid_state("retry", e.status));
        }
        if e.status == ExptStatus::Success {
            let unsuccessful = self
                .store
                .list_item_results(id, &[RunState::Failed, RunState::Terminated], 1)?;
            if unsuccessful.is_empty() {
                return Err(EvalError::InvalidState("every item already succeeded".into()));
            }
        }
        self.run(ctx, space_id, id, EvalMode::FailRetry).await
    }

    pub async fn kill(&self, ctx: &Ctx, space_id: SpaceId, id: ExptId) -> EvalResult<Experiment> {
        self.get(space_id, id)?;
        self.settle(ctx, id, "kill", |e| match e.status {
            ExptStatus::Pending | ExptStatus::Processing => {
                Ok(Some((ExptStatus::Terminated, "killed by user".to_string())))
            }
            s => Err(invalid_state("kill", s)),
        })
        .await
    }

    /// Adds items to an online experiment and dispatches them. The first
    /// invoke of a Pending experiment starts its run.
    pub async fn invoke(
        &self,
        ctx: &Ctx,
        space_id: SpaceId,
        id: ExptId,
        items: Vec<NewItem>,
        ext: BTreeMap<String, String>,
    ) -> EvalResult<InvokeResult> {
        if items.is_empty() {
            return Err(EvalError::InvalidParam("no items to invoke".into()));
        }
        let mut e = self.get(space_id, id)?;
        if e.expt_type != ExptType::Online {
            return Err(EvalError::InvalidParam("invoke requires an online experiment".into()));
        }
        if e.status == ExptStatus::Pending {
            match self.run(ctx, space_id, id, EvalMode::Invoke).await {
                Ok(_) | Err(EvalError::InvalidState(_)) => {}
                Err(err) => return Err(err),
            }
            e = self.get(space_id, id)?;
        }
        let run_id = match (e.status, e.latest_run_id) {
            (ExptStatus::Processing, Some(run)) => run,
            (s, _) => return Err(invalid_state("invoke", s)),
        };

        let outcomes = self
            .eval_sets
            .batch_create_items(space_id, e.eval_set_version_id, items)
            .await?;
        let valid: Vec<ItemId> = outcomes
            .iter()
            .filter(|o| o.error.is_none())
            .filter_map(|o| o.item_id)
            .collect();
        let added = self.store.add_items(id, space_id, &valid)?;
        self.store.append_run_items(id, run_id, &valid)?;

        let ttl = self.cfg.idempotency_ttl();
        for item_id in &valid {
            if !self.idem.set_nx(&dispatch_key(id, *item_id, run_id), ttl)? {
                continue;
            }
            let ev = ItemEvalEvent {
                expt_id: id,
                run_id,
                item_id: *item_id,
                space_id,
                retry_count: 0,
                ext: ext.clone(),
            };
            publish_event(self.bus.as_ref(), &ev, &ctx.trace_id).await?;
        }
        tracing::info!(
            event = "experiment.invoked",
            expt_id = id,
            run_id,
            submitted = outcomes.len(),
            accepted = valid.len(),
            added,
        );
        Ok(InvokeResult { run_id, outcomes, added })
    }

    /// Closes an experiment. Already finished experiments are returned unchanged.
    pub async fn finish(&self, ctx: &Ctx, space_id: SpaceId, id: ExptId) -> EvalResult<Experiment> {
        self.get(space_id, id)?;
        let ratio = self.cfg.finish_failed_ratio;
        self.settle(ctx, id, "finish", |e| {
            if e.status.is_terminal() {
                return Ok(None);
            }
            let stats = self.store.get_stats(e.id)?.unwrap_or_default();
            Ok(Some((finish_status(&stats, ratio), "finished".to_string())))
        })
        .await
    }

    /// Natural end of an offline run: only fires once no item is Pending or Processing.
    pub async fn complete(&self, ctx: &Ctx, id: ExptId) -> EvalResult<Experiment> {
        let ratio = self.cfg.finish_failed_ratio;
        self.settle(ctx, id, "complete", |e| {
            if e.status != ExptStatus::Processing {
                return Ok(None);
            }
            let stats = self.store.get_stats(e.id)?.unwrap_or_default();
            if stats.unfinished() > 0 {
                return Ok(None);
            }
            Ok(Some((finish_status(&stats, ratio), "completed".to_string())))
        })
        .await
    }

    /// Deadline reached: stop dispatching and terminate what is left.
    pub async fn drain(&self, ctx: &Ctx, id: ExptId) -> EvalResult<Experiment> {
        self.settle(ctx, id, "drain", |e| {
            Ok((e.status == ExptStatus::Processing)
                .then(|| (ExptStatus::Drained, "max alive time exceeded".to_string())))
        })
        .await
    }

    pub async fn fail_experiment(&self, ctx: &Ctx, id: ExptId, reason: &str) -> EvalResult<Experiment> {
        self.settle(ctx, id, "fail", |e| {
            Ok((!e.status.is_terminal()).then(|| (ExptStatus::Failed, reason.to_string())))
        })
        .await
    }

    /// CAS loop for terminal transitions. `decide` returns the target status,
    /// `None` to leave the experiment as it is, or an error to refuse.
    async fn settle<F>(&self, ctx: &Ctx, id: ExptId, op: &str, decide: F) -> EvalResult<Experiment>
    where
        F: Fn(&Experiment) -> EvalResult<Option<(ExptStatus, String)>>,
    {
        for _ in 0..CAS_ATTEMPTS {
            let e = self
                .store
                .get_experiment(id)?
                .filter(|e| !e.deleted)
                .ok_or_else(|| EvalError::not_found(ResourceKind::Experiment, id))?;
            let (to, message) = match decide(&e)? {
                None => return Ok(e),
                Some(d) => d,
            };
            let t = StatusTransition::new(&e, to).with_message(message.clone());
            if !self.store.apply_status_transition(&t)? {
                continue;
            }
            self.probe.invalidate(id);
            if to.is_terminal() {
                self.quota.release(e.space_id, id)?;
                let ev = AggregateCalculateEvent {
                    expt_id: id,
                    space_id: e.space_id,
                };
                if let Err(err) = publish_event(self.bus.as_ref(), &ev, &ctx.trace_id).await {
                    tracing::warn!(event = "aggregate.enqueue_failed", expt_id = id, error = %err);
                }
            }
            tracing::info!(
                event = "experiment.status",
                expt_id = id,
                op,
                from = e.status.as_str(),
                to = to.as_str(),
                message = %message,
                trace_id = %ctx.trace_id,
            );
            return self
                .store
                .get_experiment(id)?
                .ok_or_else(|| EvalError::not_found(ResourceKind::Experiment, id));
        }
        Err(EvalError::Internal(format!("concurrent status updates on experiment {}", id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(success: i64, failed: i64, terminated: i64) -> ExptStats {
        ExptStats {
            success_cnt: success,
            failed_cnt: failed,
            terminated_cnt: terminated,
            total_cnt: success + failed + terminated,
            ..Default::default()
        }
    }

    #[test]
    fn test_finish_status_rules() {
        assert_eq!(finish_status(&stats(0, 0, 0), None), ExptStatus::Success);
        assert_eq!(finish_status(&stats(2, 1, 0), None), ExptStatus::Success);
        assert_eq!(finish_status(&stats(0, 3, 0), None), ExptStatus::Failed);
        assert_eq!(finish_status(&stats(0, 0, 3), None), ExptStatus::Success);
        assert_eq!(finish_status(&stats(2, 1, 0), Some(0.25)), ExptStatus::Failed);
        assert_eq!(finish_status(&stats(3, 1, 0), Some(0.25)), ExptStatus::Success);
    }
}
