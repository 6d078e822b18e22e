use loopeval_core::config::EngineConfig;
use loopeval_core::context::Ctx;
use loopeval_core::dataset::{FieldSchema, MemoryEvalSets, NewItem};
use loopeval_core::engine::{Engine, EngineBuilder};
use loopeval_core::evaluator::service::CreateEvaluator;
use loopeval_core::evaluator::{templates, EvaluatorContent, EvaluatorDraft, EvaluatorInput, ModelConfig, PromptMessage};
use loopeval_core::idgen::SequentialIds;
use loopeval_core::manager::CreateExperiment;
use loopeval_core::model::{AggregatorType, EvaluatorVersionId, ExptStatus, ExptType, SpaceId};
use loopeval_core::storage::Store;
use loopeval_core::target::service::CreateTarget;
use loopeval_core::target::TargetKind;
use loopeval_evaluators::default_registries;
use loopeval_evaluators::llm::fake::FakeLlm;
use loopeval_evaluators::targets::StaticSources;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

const SPACE: SpaceId = 9;
const WAIT: Duration = Duration::from_secs(20);

struct Rig {
    engine: Engine,
    sets: MemoryEvalSets,
}

async fn rig(llm: Arc<FakeLlm>) -> Rig {
    let ids = Arc::new(SequentialIds::starting_at(1));
    let sets = MemoryEvalSets::new(ids.clone());
    let (evaluators, targets) = default_registries(llm, StaticSources::new());
    let mut cfg = EngineConfig::default();
    cfg.schedule_interval_ms = 10;
    cfg.status_cache_ttl_ms = 20;
    let engine = EngineBuilder::new(Store::memory().unwrap(), cfg)
        .ids(ids)
        .eval_sets(Arc::new(sets.clone()))
        .evaluators(evaluators)
        .targets(targets)
        .build()
        .unwrap();
    engine.start().await.unwrap();
    Rig { engine, sets }
}

impl Rig {
    fn dataset(&self, rows: Vec<Value>) -> i64 {
        let schema = ["input", "reference_output"]
            .iter()
            .map(|k| FieldSchema {
                key: k.to_string(),
                name: k.to_string(),
                content_type: "text".into(),
                description: String::new(),
            })
            .collect();
        let items = rows
            .into_iter()
            .map(|r| NewItem {
                item_key: None,
                turns: vec![serde_json::from_value::<BTreeMap<String, Value>>(r).unwrap()],
            })
            .collect();
        self.sets.seed(SPACE, "qa", schema, items).unwrap().1.id
    }

    async fn evaluator(&self, name: &str, draft: EvaluatorDraft) -> EvaluatorVersionId {
        let svc = self.engine.evaluators();
        let ctx = Ctx::system();
        let e = svc
            .create(
                &ctx,
                CreateEvaluator {
                    space_id: SPACE,
                    name: name.into(),
                    description: String::new(),
                    draft,
                },
            )
            .await
            .unwrap();
        svc.submit_version(&ctx, SPACE, e.id, "v1", "").await.unwrap().id
    }

    async fn target(&self, kind: TargetKind, config: Value) -> i64 {
        self.engine
            .targets()
            .create(
                &Ctx::system(),
                CreateTarget {
                    space_id: SPACE,
                    kind,
                    source_id: "under-test".into(),
                    source_version: "1".into(),
                    config,
                },
            )
            .await
            .unwrap()
            .target_version_id
    }

    async fn run(&self, set: i64, target: i64, evaluators: Vec<EvaluatorVersionId>) -> i64 {
        let req = CreateExperiment {
            space_id: SPACE,
            name: format!("run-{}", target),
            description: String::new(),
            expt_type: ExptType::Offline,
            source_type: Default::default(),
            source_id: None,
            max_alive_time_ms: 0,
            item_concurrency: Some(1),
            evaluator_concurrency: Some(2),
            eval_set_version_id: set,
            target_version_id: Some(target),
            evaluator_version_ids: evaluators,
            target_field_mapping: Default::default(),
            evaluator_field_mapping: Vec::new(),
        };
        let (e, _) = self.engine.manager().submit(&Ctx::system(), req).await.unwrap();
        e.id
    }
}

fn template_draft(key: &str) -> EvaluatorDraft {
    templates::find(key).unwrap().draft
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_rules_and_judge_over_template_target() {
    let llm = Arc::new(FakeLlm::new("{\"score\": 0.5, \"reason\": \"partially right\"}"));
    let r = rig(llm.clone()).await;
    let set = r.dataset(vec![
        json!({"input": "2+2", "reference_output": "4", "answer": "4"}),
        json!({"input": "3+3", "reference_output": "6", "answer": "six"}),
    ]);
    let target = r
        .target(TargetKind::Code, json!({"outputs": {"actual_output": "{{answer}}"}}))
        .await;
    let exact = r.evaluator("exact", template_draft("exact_match")).await;
    let mut judge_draft = template_draft("correctness");
    judge_draft.value_set = None;
    let judge = r.evaluator("judge", judge_draft).await;

    let expt = r.run(set, target, vec![exact, judge]).await;
    let (done, aggs) = r.engine.wait_for_aggregates(SPACE, expt, WAIT).await.unwrap();
    assert_eq!(done.status, ExptStatus::Success);

    let avg = |id| {
        aggs.iter()
            .find(|a| a.evaluator_version_id == id)
            .and_then(|a| a.get(AggregatorType::Average))
            .and_then(|r| r.value())
            .unwrap()
    };
    assert!((avg(exact) - 0.5).abs() < 1e-9);
    assert!((avg(judge) - 0.5).abs() < 1e-9);

    // The judge saw the rendered template with the target's answer.
    let sent = llm.requests();
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().any(|req| req.messages[1].content.contains("Answer: six")));

    r.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_prompt_target_feeds_rule_evaluator() {
    let llm = Arc::new(FakeLlm::new("unused").reply("The capital is Paris."));
    let r = rig(llm.clone()).await;
    let set = r.dataset(vec![json!({"input": "France", "reference_output": "Paris"})]);
    let target = r
        .target(
            TargetKind::LoopPrompt,
            json!({"messages": [{"role": "user", "content": "Capital of {{input}}?"}]}),
        )
        .await;
    let contains = r.evaluator("contains", template_draft("contains_reference")).await;

    let expt = r.run(set, target, vec![contains]).await;
    let (_, aggs) = r.engine.wait_for_aggregates(SPACE, expt, WAIT).await.unwrap();
    let avg = aggs[0].get(AggregatorType::Average).and_then(|r| r.value()).unwrap();
    assert_eq!(avg, 1.0);
    assert_eq!(llm.requests()[0].messages[0].content, "Capital of France?");

    let stats = r.engine.store().get_stats(expt).unwrap().unwrap();
    assert!(stats.input_tokens > 0);

    r.engine.shutdown().await;
}

#[tokio::test]
async fn test_debug_prompt_draft_without_persisting() {
    let llm = Arc::new(FakeLlm::new("{\"score\": 4, \"reason\": \"relevant\"}"));
    let r = rig(llm).await;
    let draft = EvaluatorDraft {
        content: EvaluatorContent::Prompt {
            messages: vec![PromptMessage {
                role: "user".into(),
                content: "Rate {{actual_output}}".into(),
            }],
            model: ModelConfig::default(),
            tools: Vec::new(),
        },
        aggregators: vec![AggregatorType::Average],
        value_set: Some(vec![1.0, 2.0, 3.0, 4.0, 5.0]),
    };
    let mut input = EvaluatorInput::default();
    input.target_output.insert("actual_output".into(), json!("an answer"));
    let out = r
        .engine
        .evaluators()
        .debug(&Ctx::system(), SPACE, draft, &input)
        .await
        .unwrap();
    assert_eq!(out.score, Some(4.0));
    assert_eq!(out.reasoning.as_deref(), Some("relevant"));
    r.engine.shutdown().await;
}
