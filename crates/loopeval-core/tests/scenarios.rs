mod common;

use common::{assert_stats_balanced, Harness, SPACE, WAIT};
use loopeval_core::errors::{ErrorKind, EvalError};
use loopeval_core::model::{AggregatorType, ExptStatus, RunState};
use loopeval_core::service::{ExptRef, ListExperimentsRequest, RunExperimentRequest};
use serde_json::json;
use std::time::{Duration, Instant};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_happy_path_two_items() {
    let h = Harness::start().await;
    let set = h.dataset(
        "s1",
        vec![
            json!({"id": "I1", "question": "one", "score": 1.0}),
            json!({"id": "I2", "question": "two", "score": 0.0}),
        ],
    );
    let ev = h.evaluator("judge").await;
    let (e, run) = h
        .engine
        .manager()
        .submit(&h.ctx(), h.offline("happy", set, vec![ev]))
        .await
        .unwrap();
    assert_eq!(e.status, ExptStatus::Processing);
    assert_eq!(e.latest_run_id, Some(run.run_id));

    let (done, aggs) = h.engine.wait_for_aggregates(SPACE, e.id, WAIT).await.unwrap();
    assert_eq!(done.status, ExptStatus::Success);
    let stats = h.engine.store().get_stats(e.id).unwrap().unwrap();
    assert_eq!(stats.total_cnt, 2);
    assert_eq!(stats.success_cnt, 2);
    assert_eq!(stats.input_tokens, 6);
    assert_stats_balanced(&h.engine, e.id);

    let avg = aggs[0].get(AggregatorType::Average).unwrap().value().unwrap();
    assert!((avg - 0.5).abs() < 1e-9);

    h.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_duplicate_evaluator_ids_rejected() {
    let h = Harness::start().await;
    let set = h.dataset("s2", vec![json!({"id": "I1", "score": 1.0})]);
    let ev = h.evaluator("judge").await;
    let err = h
        .engine
        .manager()
        .submit(&h.ctx(), h.offline("dupes", set, vec![ev, ev]))
        .await
        .unwrap_err();
    match err {
        EvalError::InvalidParam(msg) => assert!(msg.contains("duplicate evaluator version ids"), "{}", msg),
        other => panic!("unexpected error {:?}", other),
    }

    let listed = h
        .engine
        .experiments()
        .list(&serde_json::from_value::<ListExperimentsRequest>(json!({"space_id": SPACE})).unwrap())
        .unwrap();
    assert_eq!(listed.total, 0);
    assert_eq!(h.engine.quota().usage(SPACE).unwrap().in_use, 0);

    h.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_transient_failure_is_retried() {
    let h = Harness::start().await;
    let set = h.dataset(
        "s3",
        vec![
            json!({"id": "I1", "score": 1.0}),
            json!({"id": "I2", "score": 1.0, "fail": "once"}),
            json!({"id": "I3", "score": 1.0}),
        ],
    );
    let ev = h.evaluator("judge").await;
    let (e, _) = h
        .engine
        .manager()
        .submit(&h.ctx(), h.offline("retry", set, vec![ev]))
        .await
        .unwrap();

    let done = h.engine.wait_for_terminal(SPACE, e.id, WAIT).await.unwrap();
    assert_eq!(done.status, ExptStatus::Success);
    let stats = h.engine.store().get_stats(e.id).unwrap().unwrap();
    assert_eq!(stats.success_cnt, 3);
    assert_eq!(h.engine.store().list_run_logs(e.id).unwrap().len(), 1);

    let items = h.engine.store().list_item_results(e.id, &[], 10).unwrap();
    let i2 = &items[1];
    assert_eq!(i2.retry_count, 1);
    let history = h.engine.store().item_history(e.id, i2.item_id).unwrap();
    let failed_at = history.iter().position(|t| t.to == RunState::Failed).unwrap();
    let success_at = history.iter().rposition(|t| t.to == RunState::Success).unwrap();
    assert!(failed_at < success_at, "{:?}", history);
    assert_eq!(history.iter().filter(|t| t.to == RunState::Success).count(), 1);

    h.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_exhausted_retries_mark_item_failed() {
    let h = Harness::start().await;
    let set = h.dataset(
        "s4",
        vec![
            json!({"id": "I1", "score": 1.0}),
            json!({"id": "I2", "score": 1.0, "fail": "always"}),
            json!({"id": "I3", "score": 1.0}),
        ],
    );
    let ev = h.evaluator("judge").await;
    let (e, _) = h
        .engine
        .manager()
        .submit(&h.ctx(), h.offline("exhausted", set, vec![ev]))
        .await
        .unwrap();

    let done = h.engine.wait_for_terminal(SPACE, e.id, WAIT).await.unwrap();
    assert_eq!(done.status, ExptStatus::Success);
    let stats = h.engine.store().get_stats(e.id).unwrap().unwrap();
    assert_eq!((stats.success_cnt, stats.failed_cnt), (2, 1));

    let items = h.engine.store().list_item_results(e.id, &[], 10).unwrap();
    let i2 = &items[1];
    assert_eq!(i2.run_state, RunState::Failed);
    assert_eq!(i2.error.as_ref().unwrap().kind, ErrorKind::ExhaustedRetries);
    // First attempt plus max_retries redeliveries.
    let i2_calls = h.engine.config().retry.max_retries as usize + 1;
    assert_eq!(
        h.evaluator.calls.load(std::sync::atomic::Ordering::SeqCst),
        2 + i2_calls
    );

    h.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_kill_mid_run() {
    let h = Harness::start().await;
    let turns = (0..100)
        .map(|i| json!({"id": format!("I{}", i), "score": 1.0, "delay_ms": 15}))
        .collect();
    let set = h.dataset("s5", turns);
    let ev = h.evaluator("judge").await;
    let (e, _) = h
        .engine
        .manager()
        .submit(&h.ctx(), h.offline("kill", set, vec![ev]))
        .await
        .unwrap();

    let started = Instant::now();
    loop {
        let s = h.engine.store().get_stats(e.id).unwrap().unwrap();
        if s.success_cnt >= 10 {
            break;
        }
        assert!(started.elapsed() < WAIT, "never reached 10 successes: {:?}", s);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let killed = h
        .engine
        .experiments()
        .kill(&h.ctx(), &ExptRef { space_id: SPACE, expt_id: e.id })
        .await
        .unwrap();
    assert_eq!(killed.status, ExptStatus::Terminated);

    let stats = h.engine.store().get_stats(e.id).unwrap().unwrap();
    assert_eq!(stats.processing_cnt, 0);
    assert_eq!(stats.pending_cnt, 0);
    assert_stats_balanced(&h.engine, e.id);

    tokio::time::sleep(Duration::from_millis(200)).await;
    let settled = h.engine.store().count_turn_results(e.id).unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(h.engine.store().count_turn_results(e.id).unwrap(), settled);
    assert!(settled < 100);

    h.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_clone_then_run_reproduces_aggregates() {
    let h = Harness::start().await;
    let set = h.dataset(
        "s6",
        vec![
            json!({"id": "I1", "score": 0.25}),
            json!({"id": "I2", "score": 0.75}),
            json!({"id": "I3", "score": 1.0}),
        ],
    );
    let ev = h.evaluator("judge").await;
    let (e, _) = h
        .engine
        .manager()
        .submit(&h.ctx(), h.offline("original", set, vec![ev]))
        .await
        .unwrap();
    let (_, original) = h.engine.wait_for_aggregates(SPACE, e.id, WAIT).await.unwrap();

    let svc = h.engine.experiments();
    let copy = svc
        .clone_experiment(&h.ctx(), &ExptRef { space_id: SPACE, expt_id: e.id })
        .await
        .unwrap();
    assert_ne!(copy.id, e.id);
    assert_eq!(copy.status, ExptStatus::Pending);
    assert_eq!(copy.name, "original_copy");
    let fresh = h.engine.store().get_stats(copy.id).unwrap().unwrap();
    assert_eq!((fresh.success_cnt, fresh.pending_cnt), (0, 3));

    svc.run(
        &h.ctx(),
        &RunExperimentRequest {
            space_id: SPACE,
            expt_id: copy.id,
            mode: None,
        },
    )
    .await
    .unwrap();
    let (_, cloned) = h.engine.wait_for_aggregates(SPACE, copy.id, WAIT).await.unwrap();
    assert_eq!(original[0].results, cloned[0].results);

    h.engine.shutdown().await;
}
