#![allow(dead_code)]

use async_trait::async_trait;
use loopeval_core::config::EngineConfig;
use loopeval_core::context::Ctx;
use loopeval_core::dataset::{FieldSchema, MemoryEvalSets, NewItem};
use loopeval_core::engine::{Engine, EngineBuilder};
use loopeval_core::errors::{EvalError, EvalResult};
use loopeval_core::evaluator::service::CreateEvaluator;
use loopeval_core::evaluator::{
    EvaluatorContent, EvaluatorDraft, EvaluatorExecutor, EvaluatorInput, EvaluatorKind, EvaluatorOutput,
    EvaluatorRegistry, EvaluatorVersion,
};
use loopeval_core::idgen::SequentialIds;
use loopeval_core::manager::CreateExperiment;
use loopeval_core::model::{AggregatorType, EvaluatorVersionId, ExptType, SpaceId, TokenUsage};
use loopeval_core::storage::Store;
use loopeval_core::target::service::CreateTarget;
use loopeval_core::target::{EvalTargetVersion, TargetInput, TargetKind, TargetOutput, TargetRegistry, TargetSource};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const SPACE: SpaceId = 100;
pub const WAIT: Duration = Duration::from_secs(20);

/// Scores from the turn itself: `score` is returned as-is, `fail` is
/// `"always"` or `"once"` (first call per `id` fails with a retriable error),
/// `delay_ms` sleeps before answering.
#[derive(Default)]
pub struct ScriptedEvaluator {
    seen: Mutex<HashMap<String, u32>>,
    pub calls: AtomicUsize,
}

impl ScriptedEvaluator {
    fn attempt(&self, id: &str) -> u32 {
        let mut seen = self.seen.lock().unwrap();
        let n = seen.entry(id.to_string()).or_insert(0);
        *n += 1;
        *n
    }
}

#[async_trait]
impl EvaluatorExecutor for ScriptedEvaluator {
    fn kind(&self) -> EvaluatorKind {
        EvaluatorKind::Code
    }

    async fn execute(
        &self,
        _ctx: &Ctx,
        _version: &EvaluatorVersion,
        input: &EvaluatorInput,
    ) -> EvalResult<EvaluatorOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let id = input.var("id").map(|v| v.to_string()).unwrap_or_default();
        let attempt = self.attempt(&id);
        if let Some(ms) = input.var("delay_ms").and_then(Value::as_u64) {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        match input.var("fail").and_then(Value::as_str) {
            Some("always") => return Err(EvalError::UpstreamUnavailable(format!("judge down for {}", id))),
            Some("once") if attempt == 1 => {
                return Err(EvalError::UpstreamUnavailable(format!("transient failure for {}", id)))
            }
            _ => {}
        }
        Ok(EvaluatorOutput {
            score: input.var("score").and_then(Value::as_f64),
            reasoning: Some(format!("scored {}", id)),
            usage: TokenUsage {
                input_tokens: 3,
                output_tokens: 1,
            },
        })
    }
}

/// Echoes its input with an `answer` field derived from `question`.
#[derive(Default)]
pub struct EchoTarget {
    pub calls: AtomicUsize,
}

#[async_trait]
impl TargetSource for EchoTarget {
    fn kind(&self) -> TargetKind {
        TargetKind::Code
    }

    async fn execute(&self, _ctx: &Ctx, _version: &EvalTargetVersion, input: &TargetInput) -> EvalResult<TargetOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut fields = input.fields.clone();
        let q = input.fields.get("question").and_then(Value::as_str).unwrap_or_default();
        fields.insert("answer".into(), json!(format!("echo: {}", q)));
        Ok(TargetOutput {
            fields,
            usage: TokenUsage {
                input_tokens: 5,
                output_tokens: 2,
            },
        })
    }
}

pub fn fast_config() -> EngineConfig {
    let mut cfg = EngineConfig::default();
    cfg.schedule_interval_ms = 10;
    cfg.status_cache_ttl_ms = 20;
    cfg.retry.max_retries = 2;
    cfg.retry.backoff_base_ms = 5;
    cfg.retry.backoff_cap_ms = 20;
    cfg.turn_timeout_ms = 5_000;
    cfg.lock_lease_ms = 2_000;
    cfg.workers.item_eval = 4;
    cfg
}

pub struct Harness {
    pub engine: Engine,
    ids: Arc<SequentialIds>,
    pub eval_sets: MemoryEvalSets,
    pub evaluator: Arc<ScriptedEvaluator>,
    pub target: Arc<EchoTarget>,
}

impl Harness {
    pub async fn start() -> Self {
        Self::start_with(fast_config()).await
    }

    pub async fn start_with(cfg: EngineConfig) -> Self {
        let store = Store::memory().unwrap();
        Self::start_on(store, cfg).await
    }

    pub async fn start_on(store: Store, cfg: EngineConfig) -> Self {
        let h = Self::unstarted(store, cfg);
        h.engine.start().await.unwrap();
        h
    }

    /// Engine with no consumers running; tests drive handlers by hand.
    pub fn unstarted(store: Store, cfg: EngineConfig) -> Self {
        let ids = Arc::new(SequentialIds::starting_at(1_000));
        Self::assemble(
            store,
            cfg,
            ids.clone(),
            MemoryEvalSets::new(ids),
            Arc::new(ScriptedEvaluator::default()),
            Arc::new(EchoTarget::default()),
        )
    }

    /// A second engine over `store` sharing this harness's datasets and executors,
    /// as a process restart would see them.
    pub async fn restart(&self, store: Store, cfg: EngineConfig) -> Self {
        let h = Self::assemble(
            store,
            cfg,
            self.ids.clone(),
            self.eval_sets.clone(),
            self.evaluator.clone(),
            self.target.clone(),
        );
        h.engine.start().await.unwrap();
        h
    }

    fn assemble(
        store: Store,
        cfg: EngineConfig,
        ids: Arc<SequentialIds>,
        eval_sets: MemoryEvalSets,
        evaluator: Arc<ScriptedEvaluator>,
        target: Arc<EchoTarget>,
    ) -> Self {
        let engine = EngineBuilder::new(store, cfg)
            .ids(ids.clone())
            .eval_sets(Arc::new(eval_sets.clone()))
            .evaluators(EvaluatorRegistry::new().with(evaluator.clone()))
            .targets(TargetRegistry::new().with(target.clone()))
            .build()
            .unwrap();
        Self {
            engine,
            ids,
            eval_sets,
            evaluator,
            target,
        }
    }

    pub fn ctx(&self) -> Ctx {
        Ctx::system()
    }

    /// One single-turn item per entry.
    pub fn dataset(&self, name: &str, turns: Vec<Value>) -> i64 {
        let items = turns
            .into_iter()
            .map(|t| NewItem {
                item_key: None,
                turns: vec![serde_json::from_value::<BTreeMap<String, Value>>(t).unwrap()],
            })
            .collect();
        let schema = vec![FieldSchema {
            key: "question".into(),
            name: "question".into(),
            content_type: "text".into(),
            description: String::new(),
        }];
        let (_, version) = self.eval_sets.seed(SPACE, name, schema, items).unwrap();
        version.id
    }

    pub async fn evaluator(&self, name: &str) -> EvaluatorVersionId {
        let svc = self.engine.evaluators();
        let e = svc
            .create(
                &self.ctx(),
                CreateEvaluator {
                    space_id: SPACE,
                    name: name.into(),
                    description: String::new(),
                    draft: EvaluatorDraft {
                        content: EvaluatorContent::Code {
                            language: "scripted".into(),
                            code: "score".into(),
                        },
                        aggregators: vec![AggregatorType::Average, AggregatorType::Sum],
                        value_set: None,
                    },
                },
            )
            .await
            .unwrap();
        svc.submit_version(&self.ctx(), SPACE, e.id, "v1", "")
            .await
            .unwrap()
            .id
    }

    pub async fn target(&self) -> i64 {
        self.engine
            .targets()
            .create(
                &self.ctx(),
                CreateTarget {
                    space_id: SPACE,
                    kind: TargetKind::Code,
                    source_id: "echo".into(),
                    source_version: "1".into(),
                    config: json!({}),
                },
            )
            .await
            .unwrap()
            .target_version_id
    }

    pub fn offline(&self, name: &str, set_version: i64, evaluators: Vec<EvaluatorVersionId>) -> CreateExperiment {
        CreateExperiment {
            space_id: SPACE,
            name: name.into(),
            description: String::new(),
            expt_type: ExptType::Offline,
            source_type: Default::default(),
            source_id: None,
            max_alive_time_ms: 0,
            item_concurrency: Some(2),
            evaluator_concurrency: Some(2),
            eval_set_version_id: set_version,
            target_version_id: None,
            evaluator_version_ids: evaluators,
            target_field_mapping: Default::default(),
            evaluator_field_mapping: Vec::new(),
        }
    }
}

/// Checks the stats identities that hold for every experiment.
pub fn assert_stats_balanced(engine: &Engine, expt_id: i64) {
    let s = engine.store().get_stats(expt_id).unwrap().unwrap();
    assert_eq!(
        s.pending_cnt + s.processing_cnt + s.success_cnt + s.failed_cnt + s.terminated_cnt,
        s.total_cnt,
        "unbalanced stats: {:?}",
        s
    );
}
