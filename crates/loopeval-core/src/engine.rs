//! Wiring: one store, one bus, and the handlers that consume it.

use crate::aggregate::ResultAggregator;
use crate::config::EngineConfig;
use crate::context::{new_trace_id, Ctx};
use crate::dataset::{EvalSetProvider, MemoryEvalSets};
use crate::dispatcher::{Dispatcher, RetryPolicy};
use crate::errors::{EvalError, EvalResult};
use crate::evaluator::{EvaluatorRegistry, EvaluatorService};
use crate::events::{publish_event, EventBus, ExptScheduleEvent, MemoryEventBus};
use crate::gc::Janitor;
use crate::idempotency::{dispatch_key, item_eval_key, IdempotencyStore, SqliteIdempotency};
use crate::idgen::{IdGenerator, SnowflakeIds};
use crate::lock::SqliteLock;
use crate::manager::ExperimentManager;
use crate::model::{EvalMode, Experiment, ExptAggregateResult, ExptId, ExptStatus, RunState, SpaceId};
use crate::moderation::{AllowAll, ContentModerator};
use crate::quota::QuotaService;
use crate::result_view::ResultView;
use crate::scheduler::Scheduler;
use crate::service::ExperimentService;
use crate::status_cache::StatusProbe;
use crate::storage::Store;
use crate::target::service::EvalTargetService;
use crate::target::TargetRegistry;
use crate::worker::ItemEvaluator;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

const WAIT_POLL: Duration = Duration::from_millis(20);
const RESUME_SCAN: usize = 100_000;

pub struct EngineBuilder {
    store: Store,
    cfg: EngineConfig,
    eval_sets: Option<Arc<dyn EvalSetProvider>>,
    targets: TargetRegistry,
    evaluators: EvaluatorRegistry,
    moderator: Arc<dyn ContentModerator>,
    bus: Option<Arc<dyn EventBus>>,
    ids: Option<Arc<dyn IdGenerator>>,
}

impl EngineBuilder {
    pub fn new(store: Store, cfg: EngineConfig) -> Self {
        Self {
            store,
            cfg,
            eval_sets: None,
            targets: TargetRegistry::new(),
            evaluators: EvaluatorRegistry::new(),
            moderator: Arc::new(AllowAll),
            bus: None,
            ids: None,
        }
    }

    pub fn eval_sets(mut self, provider: Arc<dyn EvalSetProvider>) -> Self {
        self.eval_sets = Some(provider);
        self
    }

    pub fn targets(mut self, registry: TargetRegistry) -> Self {
        self.targets = registry;
        self
    }

    pub fn evaluators(mut self, registry: EvaluatorRegistry) -> Self {
        self.evaluators = registry;
        self
    }

    pub fn moderator(mut self, moderator: Arc<dyn ContentModerator>) -> Self {
        self.moderator = moderator;
        self
    }

    pub fn bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn build(self) -> EvalResult<Engine> {
        let cfg = Arc::new(self.cfg.validated()?);
        let store = self.store;
        store.init_schema()?;
        let ids = self.ids.unwrap_or_else(|| Arc::new(SnowflakeIds::default()));
        let eval_sets = self
            .eval_sets
            .unwrap_or_else(|| Arc::new(MemoryEvalSets::new(ids.clone())));
        let bus = self.bus.unwrap_or_else(|| Arc::new(MemoryEventBus::new()));
        let idem: Arc<dyn IdempotencyStore> = Arc::new(SqliteIdempotency::new(store.clone()));
        let lock = Arc::new(SqliteLock::new(store.clone()));
        let quota = QuotaService::new(store.clone(), cfg.default_space_quota);
        let probe = StatusProbe::new(store.clone(), cfg.status_cache_ttl());

        let manager = ExperimentManager::new(
            store.clone(),
            quota.clone(),
            bus.clone(),
            idem.clone(),
            ids.clone(),
            eval_sets.clone(),
            self.moderator.clone(),
            probe,
            cfg.clone(),
        );
        let targets = EvalTargetService::new(
            store.clone(),
            Arc::new(self.targets),
            ids.clone(),
            cfg.turn_timeout(),
        );
        let evaluators = EvaluatorService::new(
            store.clone(),
            Arc::new(self.evaluators),
            ids.clone(),
            self.moderator,
            cfg.moderation_on_error,
            bus.clone(),
            cfg.turn_timeout(),
        );
        let scheduler = Scheduler::new(manager.clone(), idem.clone(), lock, bus.clone(), cfg.clone());
        let worker = ItemEvaluator::new(
            manager.clone(),
            targets.clone(),
            evaluators.clone(),
            idem.clone(),
            bus.clone(),
            cfg.clone(),
        );
        let aggregator = ResultAggregator::new(store.clone());
        let results = ResultView::new(store.clone(), eval_sets.clone());
        let janitor = Janitor::new(store.clone(), cfg.deleted_retention(), cfg.stale_item_after());
        let (shutdown, _) = watch::channel(false);

        Ok(Engine {
            store,
            cfg,
            bus,
            eval_sets,
            manager,
            scheduler,
            worker,
            aggregator,
            targets,
            evaluators,
            results,
            janitor,
            quota,
            idem,
            shutdown,
            handles: Mutex::new(Vec::new()),
        })
    }
}

pub struct Engine {
    store: Store,
    cfg: Arc<EngineConfig>,
    bus: Arc<dyn EventBus>,
    eval_sets: Arc<dyn EvalSetProvider>,
    manager: ExperimentManager,
    scheduler: Scheduler,
    worker: ItemEvaluator,
    aggregator: ResultAggregator,
    targets: EvalTargetService,
    evaluators: EvaluatorService,
    results: ResultView,
    janitor: Janitor,
    quota: QuotaService,
    idem: Arc<dyn IdempotencyStore>,
    shutdown: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    pub fn bus(&self) -> &Arc<dyn EventBus> {
        &self.bus
    }

    pub fn eval_sets(&self) -> &Arc<dyn EvalSetProvider> {
        &self.eval_sets
    }

    pub fn manager(&self) -> &ExperimentManager {
        &self.manager
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn worker(&self) -> &ItemEvaluator {
        &self.worker
    }

    pub fn aggregator(&self) -> &ResultAggregator {
        &self.aggregator
    }

    pub fn targets(&self) -> &EvalTargetService {
        &self.targets
    }

    pub fn evaluators(&self) -> &EvaluatorService {
        &self.evaluators
    }

    pub fn results(&self) -> &ResultView {
        &self.results
    }

    pub fn janitor(&self) -> &Janitor {
        &self.janitor
    }

    pub fn quota(&self) -> &QuotaService {
        &self.quota
    }

    pub fn experiments(&self) -> ExperimentService {
        ExperimentService::new(self.manager.clone(), self.results.clone())
    }

    /// Reconciles quota, resumes running experiments and spawns the consumers.
    pub async fn start(&self) -> EvalResult<()> {
        self.quota.reconcile()?;

        let retry = RetryPolicy {
            max_retries: self.cfg.retry.max_retries,
            backoff: self.cfg.backoff(),
        };
        let w = &self.cfg.workers;
        let mut spawned = Dispatcher::new(self.bus.clone(), retry)
            .register(Arc::new(self.scheduler.clone()), w.schedule)
            .register(Arc::new(self.worker.clone()), w.item_eval)
            .register(Arc::new(self.aggregator.clone()), w.aggregate)
            .spawn(self.shutdown.subscribe());
        spawned.push(self.spawn_gc());

        let resumed = self.resume_running().await?;
        tracing::info!(
            event = "engine.started",
            schedule_workers = w.schedule,
            item_workers = w.item_eval,
            aggregate_workers = w.aggregate,
            resumed,
        );
        self.handles.lock().await.extend(spawned);
        Ok(())
    }

    /// Re-enqueues a schedule event for every Processing experiment.
    async fn resume_running(&self) -> EvalResult<usize> {
        let running = self.store.experiments_in_status(&[ExptStatus::Processing])?;
        let trace_id = new_trace_id();
        let mut n = 0;
        for e in running {
            let Some(run_id) = e.latest_run_id else { continue };
            let mode = self
                .store
                .get_run_log(e.id, run_id)?
                .map(|l| l.mode)
                .unwrap_or(EvalMode::Submit);
            // Events queued before the restart are gone; free their items for redispatch.
            for item in self.store.list_item_results(e.id, &[RunState::Pending], RESUME_SCAN)? {
                self.idem.del(&dispatch_key(e.id, item.item_id, run_id))?;
                self.idem.del(&item_eval_key(e.id, item.item_id, None, run_id))?;
            }
            let ev = ExptScheduleEvent {
                expt_id: e.id,
                run_id,
                mode,
                space_id: e.space_id,
                retry_count: 0,
            };
            publish_event(self.bus.as_ref(), &ev, &trace_id).await?;
            n += 1;
        }
        Ok(n)
    }

    fn spawn_gc(&self) -> JoinHandle<()> {
        let janitor = self.janitor.clone();
        let every = self.cfg.gc_interval();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every.max(Duration::from_millis(10)));
            tick.tick().await;
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = tick.tick() => {
                        if let Err(e) = janitor.run_once() {
                            tracing::warn!(event = "gc.failed", error = %e);
                        }
                    }
                }
            }
        })
    }

    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let handles: Vec<_> = self.handles.lock().await.drain(..).collect();
        for h in handles {
            if let Err(e) = h.await {
                tracing::warn!(event = "engine.join_failed", error = %e);
            }
        }
        tracing::info!(event = "engine.stopped");
    }

    /// Polls until the experiment reaches a terminal status.
    pub async fn wait_for_terminal(&self, space_id: SpaceId, id: ExptId, timeout: Duration) -> EvalResult<Experiment> {
        let start = Instant::now();
        loop {
            let e = self.manager.get(space_id, id)?;
            if e.status.is_terminal() {
                return Ok(e);
            }
            if start.elapsed() >= timeout {
                return Err(EvalError::UpstreamUnavailable(format!(
                    "experiment {} still {} after {} ms",
                    id,
                    e.status.as_str(),
                    timeout.as_millis()
                )));
            }
            tokio::time::sleep(WAIT_POLL).await;
        }
    }

    /// Terminal experiment plus aggregates written after it ended.
    pub async fn wait_for_aggregates(
        &self,
        space_id: SpaceId,
        id: ExptId,
        timeout: Duration,
    ) -> EvalResult<(Experiment, Vec<ExptAggregateResult>)> {
        let start = Instant::now();
        let e = self.wait_for_terminal(space_id, id, timeout).await?;
        let ended = e.end_at.unwrap_or_default();
        loop {
            let aggs = self.store.get_aggregates(id)?;
            let fresh = aggs.len() >= e.evaluator_version_ids.len() && aggs.iter().all(|a| a.updated_at >= ended);
            if fresh {
                return Ok((e, aggs));
            }
            if start.elapsed() >= timeout {
                return Err(EvalError::UpstreamUnavailable(format!(
                    "aggregates for experiment {} not ready after {} ms",
                    id,
                    timeout.as_millis()
                )));
            }
            tokio::time::sleep(WAIT_POLL).await;
        }
    }

    /// System context for callers without a session, such as the CLI.
    pub fn system_ctx(&self) -> Ctx {
        Ctx::system()
    }
}
