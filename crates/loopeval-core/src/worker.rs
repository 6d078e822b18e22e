use crate::config::EngineConfig;
use crate::context::Ctx;
use crate::dataset::{missing_item, Turn};
use crate::dispatcher::EventHandler;
use crate::errors::{ErrorDetail, ErrorKind, EvalError, EvalResult};
use crate::evaluator::service::RunScope;
use crate::evaluator::{EvaluatorInput, EvaluatorService, EvaluatorVersion};
use crate::events::{publish_event_after, Envelope, EventBus, EventType, ItemEvalEvent};
use crate::field_mapping::{build_evaluator_input, build_target_input, Fields};
use crate::idempotency::{dispatch_key, item_eval_key, IdempotencyStore};
use crate::manager::ExperimentManager;
use crate::model::{
    now_ms, EvaluatorCell, EvaluatorVersionId, Experiment, ExptStatus, ExptType, ItemId, RunState, StatsDelta,
    TokenUsage, TurnId, TurnResult,
};
use crate::status_cache::StatusProbe;
use crate::storage::{ClaimOutcome, Store};
use crate::target::service::EvalTargetService;
use crate::target::{EvalTargetVersion, RecordScope, TargetInput};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemRun {
    /// Another delivery of the same event holds the key.
    Duplicate,
    /// Event no longer applies: experiment stopped, newer run, or item not Pending.
    Skipped,
    /// The experiment is at `item_concurrency`; the scheduler will re-dispatch.
    AtCapacity,
    Succeeded,
    Failed,
    Retrying { retry_count: u32 },
    /// The experiment stopped mid-item; nothing further was written.
    Abandoned,
}

enum TurnFlow {
    Done { ok: bool, failure: Option<ErrorDetail> },
    Abandon,
}

/// Evaluates one dataset item: target call then evaluator fan-out, turn by turn.
#[derive(Clone)]
pub struct ItemEvaluator {
    store: Store,
    manager: ExperimentManager,
    targets: EvalTargetService,
    evaluators: EvaluatorService,
    idem: Arc<dyn IdempotencyStore>,
    bus: Arc<dyn EventBus>,
    probe: StatusProbe,
    cfg: Arc<EngineConfig>,
}

impl ItemEvaluator {
    pub fn new(
        manager: ExperimentManager,
        targets: EvalTargetService,
        evaluators: EvaluatorService,
        idem: Arc<dyn IdempotencyStore>,
        bus: Arc<dyn EventBus>,
        cfg: Arc<EngineConfig>,
    ) -> Self {
        Self {
            store: manager.store().clone(),
            probe: manager.probe().clone(),
            manager,
            targets,
            evaluators,
            idem,
            bus,
            cfg,
        }
    }

    pub async fn process(&self, ctx: &Ctx, ev: &ItemEvalEvent) -> EvalResult<ItemRun> {
        let key = item_eval_key(ev.expt_id, ev.item_id, None, ev.run_id);
        if !self.idem.set_nx(&key, self.cfg.idempotency_ttl())? {
            return Ok(ItemRun::Duplicate);
        }
        match self.claim_and_run(ctx, ev, &key).await {
            Ok(r) => Ok(r),
            Err(err) => {
                if let Err(e) = self.idem.del(&key) {
                    tracing::error!(event = "item.key_release_failed", expt_id = ev.expt_id, error = %e);
                }
                Err(err)
            }
        }
    }

    async fn claim_and_run(&self, ctx: &Ctx, ev: &ItemEvalEvent, key: &str) -> EvalResult<ItemRun> {
        if self.probe.cached(ev.expt_id)? != ExptStatus::Processing {
            return Ok(ItemRun::Skipped);
        }
        let expt = self.manager.get(ev.space_id, ev.expt_id)?;
        if expt.latest_run_id != Some(ev.run_id) {
            return Ok(ItemRun::Skipped);
        }
        let claimed = match self
            .store
            .claim_item(expt.id, ev.item_id, ev.run_id, expt.item_concurrency)?
        {
            ClaimOutcome::Claimed(item) => item,
            ClaimOutcome::AtCapacity => {
                self.idem.del(key)?;
                self.idem.del(&dispatch_key(expt.id, ev.item_id, ev.run_id))?;
                tracing::debug!(event = "item.at_capacity", expt_id = expt.id, item_id = ev.item_id);
                return Ok(ItemRun::AtCapacity);
            }
            ClaimOutcome::NotPending(_) | ClaimOutcome::Missing => return Ok(ItemRun::Skipped),
        };
        // Re-dispatched events start at zero; the row keeps the attempts spent in this run.
        let retry_count = ev.retry_count.max(claimed.retry_count);
        tracing::debug!(
            event = "item.claimed",
            expt_id = expt.id,
            item_id = ev.item_id,
            run_id = ev.run_id,
            retry_count
        );

        match self.run_claimed(ctx, ev, &expt, key, retry_count).await {
            Ok(r) => Ok(r),
            Err(err) => {
                if let Err(e) = self.store.release_claim(expt.id, ev.item_id) {
                    tracing::error!(event = "item.release_failed", expt_id = expt.id, item_id = ev.item_id, error = %e);
                }
                Err(err)
            }
        }
    }

    async fn run_claimed(
        &self,
        ctx: &Ctx,
        ev: &ItemEvalEvent,
        expt: &Experiment,
        key: &str,
        retry_count: u32,
    ) -> EvalResult<ItemRun> {
        let item_id = ev.item_id;
        let found = self
            .manager
            .eval_sets()
            .batch_get_items(expt.space_id, expt.eval_set_version_id, &[item_id])
            .await?;
        let Some(item) = found.into_iter().next() else {
            return self.fail_item(ctx, expt, item_id, missing_item(item_id)).await;
        };

        let versions = self
            .evaluators
            .batch_get_versions(expt.space_id, &expt.evaluator_version_ids)?;
        let mut ordered = Vec::with_capacity(expt.evaluator_version_ids.len());
        for id in &expt.evaluator_version_ids {
            match versions.iter().find(|v| v.id == *id) {
                Some(v) => ordered.push(v.clone()),
                None => {
                    let detail = ErrorDetail::new(ErrorKind::NotFound, format!("evaluator_version {}", id));
                    return self.fail_item(ctx, expt, item_id, detail).await;
                }
            }
        }
        let target = match expt.target_version_id {
            None => None,
            Some(tv) => match self.targets.get_version(ctx, expt.space_id, tv, false).await {
                Ok(v) => Some(v),
                Err(e @ EvalError::NotFound { .. }) => return self.fail_item(ctx, expt, item_id, e.detail()).await,
                Err(e) => return Err(e),
            },
        };

        let done: HashSet<TurnId> = self
            .store
            .get_turn_results(expt.id, item_id)?
            .into_iter()
            .filter(|t| t.run_id == ev.run_id && t.is_success())
            .map(|t| t.turn_id)
            .collect();

        let mut all_ok = true;
        let mut retriable = false;
        let mut last_failure = None;
        for (idx, turn) in item.turns.iter().enumerate() {
            if done.contains(&turn.turn_id) {
                continue;
            }
            if self.probe.fresh(expt.id)? != ExptStatus::Processing {
                return self.abandon(expt, item_id);
            }
            self.store.heartbeat_item(expt.id, item_id)?;
            match self
                .run_turn(ctx, ev, expt, target.as_ref(), &ordered, turn, idx as i64)
                .await?
            {
                TurnFlow::Abandon => return self.abandon(expt, item_id),
                TurnFlow::Done { ok: true, .. } => {}
                TurnFlow::Done { ok: false, failure } => {
                    all_ok = false;
                    if let Some(f) = failure {
                        retriable |= f.is_retriable();
                        last_failure = Some(f);
                    }
                }
            }
        }

        if all_ok {
            if !self
                .store
                .transition_item(expt.id, item_id, RunState::Processing, RunState::Success, None)?
            {
                return self.abandon(expt, item_id);
            }
            tracing::info!(event = "item.terminal", expt_id = expt.id, item_id, state = "success");
            self.after_terminal(ctx, expt, item_id, ev.run_id).await?;
            return Ok(ItemRun::Succeeded);
        }

        let failure = last_failure
            .unwrap_or_else(|| ErrorDetail::new(ErrorKind::Internal, "turn failed without an error"));
        if retriable && retry_count < self.cfg.retry.max_retries {
            let next = retry_count + 1;
            if !self.store.fail_item_for_retry(expt.id, item_id, &failure, next)? {
                return self.abandon(expt, item_id);
            }
            self.idem.del(key)?;
            self.idem
                .set(&dispatch_key(expt.id, item_id, ev.run_id), self.cfg.idempotency_ttl())?;
            let delay = self.cfg.backoff().delay(retry_count);
            let retry = ItemEvalEvent {
                retry_count: next,
                ..ev.clone()
            };
            publish_event_after(self.bus.as_ref(), &retry, &ctx.trace_id, delay).await?;
            tracing::warn!(
                event = "item.retry_scheduled",
                expt_id = expt.id,
                item_id,
                retry_count = next,
                delay_ms = delay.as_millis() as u64,
                error = %failure.message,
            );
            return Ok(ItemRun::Retrying { retry_count: next });
        }

        let detail = if retriable {
            ErrorDetail::new(
                ErrorKind::ExhaustedRetries,
                format!("exhausted retries: {}", failure.message),
            )
        } else {
            failure
        };
        self.fail_item(ctx, expt, item_id, detail).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_turn(
        &self,
        ctx: &Ctx,
        ev: &ItemEvalEvent,
        expt: &Experiment,
        target: Option<&EvalTargetVersion>,
        versions: &[EvaluatorVersion],
        turn: &Turn,
        turn_idx: i64,
    ) -> EvalResult<TurnFlow> {
        let timeout = self.turn_timeout(expt);
        let mut usage = TokenUsage::default();
        let (target_fields, target_ref, target_error) = match target {
            None => (Fields::new(), None, None),
            Some(tv) => {
                let input = TargetInput {
                    fields: build_target_input(&expt.target_field_mapping, &turn.fields),
                    ext: ev.ext.clone(),
                };
                let scope = RecordScope {
                    expt_id: Some(expt.id),
                    item_id: Some(ev.item_id),
                    turn_id: Some(turn.turn_id),
                };
                let rec = self.targets.run_version(ctx, tv, input, scope, timeout).await?;
                match rec.output {
                    Some(out) => {
                        usage = usage.add(out.usage);
                        (out.fields, Some(rec.id), None)
                    }
                    None => (Fields::new(), Some(rec.id), rec.error),
                }
            }
        };

        let mut failure = target_error.clone();
        let cells = if target_error.is_some() && self.cfg.skip_on_target_fail {
            BTreeMap::new()
        } else {
            let scored = self
                .score_turn(ctx, ev, expt, versions, turn, &target_fields, timeout)
                .await?;
            let mut cells = BTreeMap::new();
            for (id, cell, u) in scored {
                usage = usage.add(u);
                if let Some(e) = &cell.error {
                    failure.get_or_insert_with(|| e.clone());
                }
                cells.insert(id, cell);
            }
            cells
        };

        let ok = failure.is_none();
        let row = TurnResult {
            expt_id: expt.id,
            item_id: ev.item_id,
            turn_id: turn.turn_id,
            turn_idx,
            run_id: ev.run_id,
            status: if ok { RunState::Success } else { RunState::Failed },
            target_output_ref: target_ref,
            target_error,
            evaluator_results: cells,
            updated_at: now_ms(),
        };
        let tokens = StatsDelta::tokens(usage.input_tokens, usage.output_tokens);
        if !self.store.upsert_turn_result(&row, tokens)? {
            return Ok(TurnFlow::Abandon);
        }
        Ok(TurnFlow::Done { ok, failure })
    }

    /// Runs every evaluator on one turn, at most `evaluator_concurrency` at a time.
    #[allow(clippy::too_many_arguments)]
    async fn score_turn(
        &self,
        ctx: &Ctx,
        ev: &ItemEvalEvent,
        expt: &Experiment,
        versions: &[EvaluatorVersion],
        turn: &Turn,
        target_fields: &Fields,
        timeout: Duration,
    ) -> EvalResult<Vec<(EvaluatorVersionId, EvaluatorCell, TokenUsage)>> {
        let sem = Arc::new(Semaphore::new(expt.evaluator_concurrency.max(1) as usize));
        let mut handles = Vec::with_capacity(versions.len());
        for v in versions {
            let (turn_input, target_output) =
                build_evaluator_input(expt.mapping_for(v.id), &turn.fields, target_fields);
            let input = EvaluatorInput {
                turn_input,
                target_output,
                ext: ev.ext.clone(),
            };
            let scope = RunScope {
                expt_id: Some(expt.id),
                run_id: Some(ev.run_id),
                item_id: Some(ev.item_id),
                turn_id: Some(turn.turn_id),
            };
            let svc = self.evaluators.clone();
            let version = v.clone();
            let ctx = ctx.clone();
            let sem = sem.clone();
            handles.push(tokio::spawn(async move {
                let _permit = sem
                    .acquire_owned()
                    .await
                    .map_err(|e| EvalError::Internal(format!("evaluator semaphore: {}", e)))?;
                svc.run_version(&ctx, &version, input, scope, timeout).await
            }));
        }

        let mut out = Vec::with_capacity(handles.len());
        for (v, h) in versions.iter().zip(handles) {
            let rec = h
                .await
                .map_err(|e| EvalError::Internal(format!("evaluator task: {}", e)))??;
            let usage = rec.output.as_ref().map(|o| o.usage).unwrap_or_default();
            let cell = EvaluatorCell {
                record_id: Some(rec.id),
                score: rec.score(),
                reasoning: rec.output.as_ref().and_then(|o| o.reasoning.clone()),
                correction: None,
                error: rec.error.clone(),
            };
            out.push((v.id, cell, usage));
        }
        Ok(out)
    }

    /// `min(turn_timeout, time left before the experiment deadline)`.
    fn turn_timeout(&self, expt: &Experiment) -> Duration {
        let base = self.cfg.turn_timeout();
        match expt.deadline_ms() {
            Some(dl) => base.min(Duration::from_millis((dl - now_ms()).max(1) as u64)),
            None => base,
        }
    }

    async fn fail_item(&self, ctx: &Ctx, expt: &Experiment, item_id: ItemId, detail: ErrorDetail) -> EvalResult<ItemRun> {
        if !self
            .store
            .transition_item(expt.id, item_id, RunState::Processing, RunState::Failed, Some(&detail))?
        {
            return self.abandon(expt, item_id);
        }
        tracing::warn!(
            event = "item.terminal",
            expt_id = expt.id,
            item_id,
            state = "failed",
            code = detail.code,
            error = %detail.message,
        );
        let run_id = expt.latest_run_id.unwrap_or_default();
        self.after_terminal(ctx, expt, item_id, run_id).await?;
        Ok(ItemRun::Failed)
    }

    fn abandon(&self, expt: &Experiment, item_id: ItemId) -> EvalResult<ItemRun> {
        // Kill already terminated the row; this only catches a reaped claim.
        self.store
            .transition_item(expt.id, item_id, RunState::Processing, RunState::Terminated, None)?;
        tracing::info!(event = "item.abandoned", expt_id = expt.id, item_id);
        Ok(ItemRun::Abandoned)
    }

    async fn after_terminal(&self, ctx: &Ctx, expt: &Experiment, item_id: ItemId, run_id: i64) -> EvalResult<()> {
        self.idem.del(&dispatch_key(expt.id, item_id, run_id))?;
        if expt.expt_type != ExptType::Offline {
            return Ok(());
        }
        let stats = self.store.get_stats(expt.id)?.unwrap_or_default();
        if stats.unfinished() == 0 {
            self.manager.complete(ctx, expt.id).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl EventHandler for ItemEvaluator {
    fn event_type(&self) -> EventType {
        EventType::ItemEval
    }

    async fn handle(&self, env: &Envelope) -> EvalResult<()> {
        let ev: ItemEvalEvent = env.decode()?;
        let ctx = Ctx::system().with_trace_id(env.trace_id.clone());
        match self.process(&ctx, &ev).await {
            Ok(_) | Err(EvalError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn on_exhausted(&self, env: &Envelope, err: &EvalError) -> EvalResult<()> {
        let ev: ItemEvalEvent = env.decode()?;
        let ctx = Ctx::system().with_trace_id(env.trace_id.clone());
        let detail = ErrorDetail::new(ErrorKind::ExhaustedRetries, err.to_string());
        let mut moved = false;
        for from in [RunState::Processing, RunState::Pending] {
            if self
                .store
                .transition_item(ev.expt_id, ev.item_id, from, RunState::Failed, Some(&detail))?
            {
                moved = true;
                break;
            }
        }
        if !moved {
            return Ok(());
        }
        tracing::error!(event = "item.terminal", expt_id = ev.expt_id, item_id = ev.item_id, state = "failed", error = %err);
        match self.store.get_experiment(ev.expt_id)? {
            Some(expt) if !expt.deleted => self.after_terminal(&ctx, &expt, ev.item_id, ev.run_id).await,
            _ => Ok(()),
        }
    }
}
