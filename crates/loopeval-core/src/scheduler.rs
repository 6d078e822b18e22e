use crate::config::EngineConfig;
use crate::context::{new_trace_id, Ctx};
use crate::dispatcher::EventHandler;
use crate::errors::{EvalError, EvalResult};
use crate::events::{publish_event, publish_event_after, Envelope, EventBus, EventType, ExptScheduleEvent, ItemEvalEvent};
use crate::idempotency::{dispatch_key, item_eval_key, reschedule_key, IdempotencyStore};
use crate::lock::{DistributedLock, LockToken};
use crate::manager::ExperimentManager;
use crate::model::{now_ms, EvalMode, Experiment, ExptStatus, ExptType, ItemId, RunState};
use crate::storage::Store;
use async_trait::async_trait;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Another instance owns the drain.
    Locked,
    /// Not Processing, or the event belongs to an older run.
    Inactive,
    /// The deadline passed and the experiment was drained.
    Drained,
    /// Nothing left to do; the experiment was completed.
    Completed,
    Dispatched { dispatched: usize, reaped: usize },
}

/// Turns `ExptScheduleEvent`s into bounded batches of `ItemEvalEvent`s.
#[derive(Clone)]
pub struct Scheduler {
    store: Store,
    manager: ExperimentManager,
    idem: Arc<dyn IdempotencyStore>,
    lock: Arc<dyn DistributedLock>,
    bus: Arc<dyn EventBus>,
    cfg: Arc<EngineConfig>,
    holder: String,
}

impl Scheduler {
    pub fn new(
        manager: ExperimentManager,
        idem: Arc<dyn IdempotencyStore>,
        lock: Arc<dyn DistributedLock>,
        bus: Arc<dyn EventBus>,
        cfg: Arc<EngineConfig>,
    ) -> Self {
        Self {
            store: manager.store().clone(),
            manager,
            idem,
            lock,
            bus,
            cfg,
            holder: format!("scheduler-{}", new_trace_id()),
        }
    }

    pub async fn drain(&self, ctx: &Ctx, ev: &ExptScheduleEvent) -> EvalResult<DrainOutcome> {
        // This delivery consumes the pending re-poll, so the next one can be queued.
        self.idem.del(&reschedule_key(ev.expt_id, ev.run_id))?;
        let name = format!("expt:{}", ev.expt_id);
        let token = match self.lock.acquire(&name, &self.holder, self.cfg.lock_lease())? {
            Some(t) => t,
            None => {
                tracing::debug!(event = "scheduler.lock_busy", expt_id = ev.expt_id, run_id = ev.run_id);
                return Ok(DrainOutcome::Locked);
            }
        };
        let res = self.drain_locked(ctx, ev, &token).await;
        if let Err(e) = self.lock.release(&token) {
            tracing::warn!(event = "scheduler.unlock_failed", expt_id = ev.expt_id, error = %e);
        }
        res
    }

    async fn drain_locked(&self, ctx: &Ctx, ev: &ExptScheduleEvent, token: &LockToken) -> EvalResult<DrainOutcome> {
        let e = match self.store.get_experiment(ev.expt_id)? {
            Some(e) if !e.deleted => e,
            _ => return Ok(DrainOutcome::Inactive),
        };
        if e.status != ExptStatus::Processing || e.latest_run_id != Some(ev.run_id) {
            return Ok(DrainOutcome::Inactive);
        }
        if matches!(e.deadline_ms(), Some(dl) if now_ms() >= dl) {
            self.manager.drain(ctx, e.id).await?;
            return Ok(DrainOutcome::Drained);
        }

        let stale_before = now_ms() - self.cfg.stale_item_after_ms as i64;
        let reaped = self.store.reap_stale_items(e.id, stale_before, RunState::Pending)?;
        for item in &reaped {
            self.idem.del(&dispatch_key(e.id, *item, ev.run_id))?;
            self.idem.del(&item_eval_key(e.id, *item, None, ev.run_id))?;
        }
        if !reaped.is_empty() {
            tracing::warn!(event = "scheduler.reaped", expt_id = e.id, items = reaped.len());
        }

        let stats = self.store.get_stats(e.id)?.unwrap_or_default();
        if e.expt_type == ExptType::Offline && stats.unfinished() == 0 {
            self.manager.complete(ctx, e.id).await?;
            return Ok(DrainOutcome::Completed);
        }

        let budget = (e.item_concurrency as i64 - stats.processing_cnt).max(0) as usize;
        let dispatched = if budget > 0 {
            self.dispatch(ctx, &e, ev, budget).await?
        } else {
            0
        };

        if !self.lock.refresh(token, self.cfg.lock_lease())? {
            tracing::warn!(event = "scheduler.lease_lost", expt_id = e.id);
        }
        self.reschedule(ctx, ev).await?;
        tracing::debug!(
            event = "scheduler.drained",
            expt_id = e.id,
            run_id = ev.run_id,
            mode = ev.mode.as_str(),
            budget,
            dispatched,
            processing = stats.processing_cnt,
        );
        Ok(DrainOutcome::Dispatched {
            dispatched,
            reaped: reaped.len(),
        })
    }

    /// Pending items of the run, in dataset order.
    fn candidates(&self, e: &Experiment, ev: &ExptScheduleEvent) -> EvalResult<Vec<ItemId>> {
        match ev.mode {
            EvalMode::Invoke => {
                let ids = self
                    .store
                    .get_run_log(e.id, ev.run_id)?
                    .map(|l| l.item_ids)
                    .unwrap_or_default();
                Ok(self
                    .store
                    .mget_item_results(e.id, &ids)?
                    .into_iter()
                    .filter(|r| r.run_state == RunState::Pending)
                    .map(|r| r.item_id)
                    .collect())
            }
            EvalMode::Submit | EvalMode::FailRetry => {
                let window = (e.item_concurrency as usize).saturating_mul(2).max(16);
                Ok(self
                    .store
                    .list_item_results(e.id, &[RunState::Pending], window)?
                    .into_iter()
                    .map(|r| r.item_id)
                    .collect())
            }
        }
    }

    async fn dispatch(&self, ctx: &Ctx, e: &Experiment, ev: &ExptScheduleEvent, budget: usize) -> EvalResult<usize> {
        let ttl = self.cfg.idempotency_ttl();
        let mut slots = budget;
        let mut dispatched = 0;
        for item_id in self.candidates(e, ev)? {
            if slots == 0 {
                break;
            }
            slots -= 1;
            // An item already in flight keeps its slot.
            if !self.idem.set_nx(&dispatch_key(e.id, item_id, ev.run_id), ttl)? {
                continue;
            }
            let item_ev = ItemEvalEvent {
                expt_id: e.id,
                run_id: ev.run_id,
                item_id,
                space_id: e.space_id,
                retry_count: 0,
                ext: Default::default(),
            };
            publish_event(self.bus.as_ref(), &item_ev, &ctx.trace_id).await?;
            dispatched += 1;
        }
        Ok(dispatched)
    }

    async fn reschedule(&self, ctx: &Ctx, ev: &ExptScheduleEvent) -> EvalResult<()> {
        let interval = self.cfg.schedule_interval();
        if !self
            .idem
            .set_nx(&reschedule_key(ev.expt_id, ev.run_id), interval.saturating_mul(20))?
        {
            return Ok(());
        }
        let next = ExptScheduleEvent {
            retry_count: 0,
            ..ev.clone()
        };
        publish_event_after(self.bus.as_ref(), &next, &ctx.trace_id, interval).await
    }
}

#[async_trait]
impl EventHandler for Scheduler {
    fn event_type(&self) -> EventType {
        EventType::ExptSchedule
    }

    async fn handle(&self, env: &Envelope) -> EvalResult<()> {
        let ev: ExptScheduleEvent = env.decode()?;
        let ctx = Ctx::system().with_trace_id(env.trace_id.clone());
        match self.drain(&ctx, &ev).await {
            Ok(_) | Err(EvalError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn on_exhausted(&self, env: &Envelope, err: &EvalError) -> EvalResult<()> {
        let ev: ExptScheduleEvent = env.decode()?;
        let ctx = Ctx::system().with_trace_id(env.trace_id.clone());
        self.manager
            .fail_experiment(&ctx, ev.expt_id, &err.to_string())
            .await
            .map(|_| ())
    }
}
