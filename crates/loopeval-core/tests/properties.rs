mod common;

use common::{assert_stats_balanced, fast_config, Harness, SPACE, WAIT};
use loopeval_core::aggregate::compute;
use loopeval_core::errors::{ErrorKind, EvalError};
use loopeval_core::events::ItemEvalEvent;
use loopeval_core::model::{AggregatorType, EvalMode, ExptStatus, RunState};
use loopeval_core::storage::Store;
use loopeval_core::worker::ItemRun;
use serde_json::json;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stats_cover_every_item_and_settle() {
    let h = Harness::start().await;
    let turns = (0..7)
        .map(|i| json!({"id": format!("I{}", i), "score": i as f64 / 10.0}))
        .collect();
    let set = h.dataset("balanced", turns);
    let ev = h.evaluator("judge").await;
    let (e, _) = h
        .engine
        .manager()
        .submit(&h.ctx(), h.offline("balanced", set, vec![ev]))
        .await
        .unwrap();

    let created = h.engine.store().get_stats(e.id).unwrap().unwrap();
    assert_eq!(created.total_cnt, 7);
    assert_stats_balanced(&h.engine, e.id);

    let done = h.engine.wait_for_terminal(SPACE, e.id, WAIT).await.unwrap();
    assert!(done.status.is_terminal());
    let s = h.engine.store().get_stats(e.id).unwrap().unwrap();
    assert_eq!(s.total_cnt, 7);
    assert_eq!((s.pending_cnt, s.processing_cnt), (0, 0));
    assert_stats_balanced(&h.engine, e.id);

    h.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_turn_cells_only_reference_experiment_evaluators() {
    let h = Harness::start().await;
    let set = h.dataset(
        "cells",
        vec![json!({"id": "I1", "score": 1.0}), json!({"id": "I2", "score": 0.5})],
    );
    let a = h.evaluator("judge-a").await;
    let b = h.evaluator("judge-b").await;
    let _unused = h.evaluator("judge-c").await;
    let (e, _) = h
        .engine
        .manager()
        .submit(&h.ctx(), h.offline("cells", set, vec![a, b]))
        .await
        .unwrap();
    h.engine.wait_for_terminal(SPACE, e.id, WAIT).await.unwrap();

    let turns = h.engine.store().scan_turn_results(e.id, None, 100).unwrap();
    assert_eq!(turns.len(), 2);
    for t in turns {
        let keys: Vec<_> = t.evaluator_results.keys().copied().collect();
        assert_eq!(keys, {
            let mut k = vec![a, b];
            k.sort();
            k
        });
    }

    h.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_duplicate_ids_rejected_on_create() {
    let h = Harness::start().await;
    let set = h.dataset("dupes", vec![json!({"id": "I1"})]);
    let ev = h.evaluator("judge").await;
    let err = h
        .engine
        .manager()
        .create(&h.ctx(), h.offline("dupes", set, vec![ev, ev]))
        .await
        .unwrap_err();
    assert!(matches!(err, EvalError::InvalidParam(_)));
    assert!(h.engine.manager().check_name(SPACE, "dupes", None).unwrap());
    h.engine.shutdown().await;
}

#[tokio::test]
async fn test_replayed_item_event_counts_once() {
    let h = Harness::unstarted(Store::memory().unwrap(), fast_config());
    let set = h.dataset(
        "replay",
        vec![json!({"id": "I1", "score": 1.0}), json!({"id": "I2", "score": 1.0})],
    );
    let ev = h.evaluator("judge").await;
    let e = h
        .engine
        .manager()
        .create(&h.ctx(), h.offline("replay", set, vec![ev]))
        .await
        .unwrap();
    let run = h.engine.manager().run(&h.ctx(), SPACE, e.id, EvalMode::Submit).await.unwrap();
    let first = h.engine.store().list_item_results(e.id, &[], 1).unwrap()[0].item_id;

    let event = ItemEvalEvent {
        expt_id: e.id,
        run_id: run.run_id,
        item_id: first,
        space_id: SPACE,
        retry_count: 0,
        ext: BTreeMap::new(),
    };
    let mut outcomes = Vec::new();
    for _ in 0..4 {
        outcomes.push(h.engine.worker().process(&h.ctx(), &event).await.unwrap());
    }
    assert_eq!(outcomes[0], ItemRun::Succeeded);
    assert!(outcomes[1..].iter().all(|o| *o == ItemRun::Duplicate), "{:?}", outcomes);

    let s = h.engine.store().get_stats(e.id).unwrap().unwrap();
    assert_eq!((s.success_cnt, s.pending_cnt), (1, 1));
    assert_eq!(h.engine.store().get_turn_results(e.id, first).unwrap().len(), 1);
    assert_eq!(h.evaluator.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_redispatch_after_capacity_keeps_retry_budget() {
    let h = Harness::unstarted(Store::memory().unwrap(), fast_config());
    let set = h.dataset(
        "budget",
        vec![json!({"id": "A", "fail": "always"}), json!({"id": "B", "score": 1.0})],
    );
    let ev = h.evaluator("judge").await;
    let mut req = h.offline("budget", set, vec![ev]);
    req.item_concurrency = Some(1);
    let e = h.engine.manager().create(&h.ctx(), req).await.unwrap();
    let run = h.engine.manager().run(&h.ctx(), SPACE, e.id, EvalMode::Submit).await.unwrap();
    let items = h.engine.store().list_item_results(e.id, &[], 2).unwrap();
    let (a, b) = (items[0].item_id, items[1].item_id);

    let event = |retry_count| ItemEvalEvent {
        expt_id: e.id,
        run_id: run.run_id,
        item_id: a,
        space_id: SPACE,
        retry_count,
        ext: BTreeMap::new(),
    };
    let worker = h.engine.worker();
    assert_eq!(
        worker.process(&h.ctx(), &event(0)).await.unwrap(),
        ItemRun::Retrying { retry_count: 1 }
    );

    // B holds the only slot when A's retry lands.
    let store = h.engine.store();
    assert!(matches!(
        store.claim_item(e.id, b, run.run_id, 1).unwrap(),
        loopeval_core::storage::ClaimOutcome::Claimed(_)
    ));
    assert_eq!(worker.process(&h.ctx(), &event(1)).await.unwrap(), ItemRun::AtCapacity);
    assert!(store.release_claim(e.id, b).unwrap());

    // The scheduler re-dispatches with a fresh event.
    assert_eq!(
        worker.process(&h.ctx(), &event(0)).await.unwrap(),
        ItemRun::Retrying { retry_count: 2 }
    );
    assert_eq!(worker.process(&h.ctx(), &event(0)).await.unwrap(), ItemRun::Failed);

    let stored = store.get_item_result(e.id, a).unwrap().unwrap();
    assert_eq!(stored.run_state, RunState::Failed);
    let err = stored.error.unwrap();
    assert_eq!(err.kind, ErrorKind::ExhaustedRetries);
    assert!(err.message.starts_with("exhausted retries"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_processing_never_exceeds_item_concurrency() {
    let mut cfg = fast_config();
    cfg.workers.item_eval = 8;
    let h = Harness::start_with(cfg).await;
    let turns = (0..16)
        .map(|i| json!({"id": format!("I{}", i), "score": 1.0, "delay_ms": 20}))
        .collect();
    let set = h.dataset("bounded", turns);
    let ev = h.evaluator("judge").await;
    let mut req = h.offline("bounded", set, vec![ev]);
    req.item_concurrency = Some(3);
    let (e, _) = h.engine.manager().submit(&h.ctx(), req).await.unwrap();

    let started = Instant::now();
    let mut peak = 0;
    loop {
        let s = h.engine.store().get_stats(e.id).unwrap().unwrap();
        assert!(s.processing_cnt <= 3, "processing {} above bound", s.processing_cnt);
        peak = peak.max(s.processing_cnt);
        if h.engine.manager().get(SPACE, e.id).unwrap().status.is_terminal() {
            break;
        }
        assert!(started.elapsed() < WAIT);
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert!(peak >= 1);

    h.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_space_quota_bounds_live_experiments() {
    let mut cfg = fast_config();
    cfg.default_space_quota = 1;
    let h = Harness::start_with(cfg).await;
    let set = h.dataset("quota", vec![json!({"id": "I1", "score": 1.0, "delay_ms": 30})]);
    let ev = h.evaluator("judge").await;

    let (first, _) = h
        .engine
        .manager()
        .submit(&h.ctx(), h.offline("first", set, vec![ev]))
        .await
        .unwrap();
    let err = h
        .engine
        .manager()
        .submit(&h.ctx(), h.offline("second", set, vec![ev]))
        .await
        .unwrap_err();
    assert!(matches!(err, EvalError::QuotaDenied(_)), "{:?}", err);

    h.engine.wait_for_terminal(SPACE, first.id, WAIT).await.unwrap();
    assert_eq!(h.engine.quota().usage(SPACE).unwrap().in_use, 0);
    let (second, _) = h
        .engine
        .manager()
        .submit(&h.ctx(), h.offline("second", set, vec![ev]))
        .await
        .unwrap();
    assert_eq!(second.status, ExptStatus::Processing);

    h.engine.shutdown().await;
}

#[tokio::test]
async fn test_pending_experiment_holds_quota_until_terminal() {
    let mut cfg = fast_config();
    cfg.default_space_quota = 1;
    let h = Harness::unstarted(Store::memory().unwrap(), cfg);
    let set = h.dataset("idle", vec![json!({"id": "I1", "score": 1.0})]);
    let ev = h.evaluator("judge").await;

    let idle = h
        .engine
        .manager()
        .create(&h.ctx(), h.offline("idle", set, vec![ev]))
        .await
        .unwrap();
    assert_eq!(idle.status, ExptStatus::Pending);
    let err = h
        .engine
        .manager()
        .create(&h.ctx(), h.offline("waiting", set, vec![ev]))
        .await
        .unwrap_err();
    assert!(matches!(err, EvalError::QuotaDenied(_)), "{:?}", err);

    let holders = h.engine.quota().reconcile().unwrap();
    assert_eq!(holders.get(&SPACE), Some(&1));
    assert_eq!(h.engine.quota().usage(SPACE).unwrap().in_use, 1);

    h.engine.manager().kill(&h.ctx(), SPACE, idle.id).await.unwrap();
    assert_eq!(h.engine.quota().usage(SPACE).unwrap().in_use, 0);
    h.engine
        .manager()
        .create(&h.ctx(), h.offline("waiting", set, vec![ev]))
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_kill_pending_experiment_stops_everything() {
    let h = Harness::start().await;
    let set = h.dataset("pending", vec![json!({"id": "I1", "score": 1.0})]);
    let ev = h.evaluator("judge").await;
    let e = h
        .engine
        .manager()
        .create(&h.ctx(), h.offline("pending", set, vec![ev]))
        .await
        .unwrap();
    let killed = h.engine.manager().kill(&h.ctx(), SPACE, e.id).await.unwrap();
    assert_eq!(killed.status, ExptStatus::Terminated);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.engine.store().count_turn_results(e.id).unwrap(), 0);
    let err = h.engine.manager().kill(&h.ctx(), SPACE, e.id).await.unwrap_err();
    assert!(matches!(err, EvalError::InvalidState(_)));
    h.engine.shutdown().await;
}

#[test]
fn test_average_matches_mean_of_present_scores() {
    let scores = vec![Some(0.1), None, Some(0.7), Some(f64::NAN), Some(1.0), Some(0.4)];
    let out = compute(&scores, &[AggregatorType::Average, AggregatorType::Sum], None);
    let present = [0.1, 0.7, 1.0, 0.4];
    let expected = present.iter().sum::<f64>() / present.len() as f64;
    let avg = out
        .iter()
        .find(|r| r.aggregator_type == AggregatorType::Average)
        .and_then(|r| r.value())
        .unwrap();
    assert!((avg - expected).abs() < 1e-12);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stored_average_ignores_unscored_turns() {
    let h = Harness::start().await;
    let set = h.dataset(
        "avg",
        vec![
            json!({"id": "I1", "score": 0.2}),
            json!({"id": "I2", "score": 0.9}),
            json!({"id": "I3"}),
        ],
    );
    let ev = h.evaluator("judge").await;
    let (e, _) = h
        .engine
        .manager()
        .submit(&h.ctx(), h.offline("avg", set, vec![ev]))
        .await
        .unwrap();
    let (_, aggs) = h.engine.wait_for_aggregates(SPACE, e.id, WAIT).await.unwrap();
    let avg = aggs[0].get(AggregatorType::Average).unwrap().value().unwrap();
    assert!((avg - 0.55).abs() < 1e-9);
    let sum = aggs[0].get(AggregatorType::Sum).unwrap().value().unwrap();
    assert!((sum - 1.1).abs() < 1e-9);
    h.engine.shutdown().await;
}
