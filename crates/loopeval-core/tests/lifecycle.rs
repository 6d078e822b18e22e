mod common;

use common::{assert_stats_balanced, fast_config, Harness, SPACE, WAIT};
use loopeval_core::dataset::NewItem;
use loopeval_core::errors::EvalError;
use loopeval_core::evaluator::service::CorrectionRequest;
use loopeval_core::model::{AggregatorType, ExptStatus, ExptType, FieldMapping, RunState, TargetFieldMapping};
use loopeval_core::result_view::{BatchGetResultRequest, ResultFilter, ScoreRange};
use loopeval_core::service::{ExptRef, ExptRefs, InvokeExperimentRequest, UpdateExperimentRequest};
use loopeval_core::storage::Store;
use serde_json::json;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

async fn wait_until<F: Fn() -> bool>(what: &str, f: F) {
    let started = Instant::now();
    while !f() {
        assert!(started.elapsed() < WAIT, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_retry_reprocesses_only_unsuccessful_items() {
    let mut cfg = fast_config();
    cfg.retry.max_retries = 0;
    let h = Harness::start_with(cfg).await;
    let set = h.dataset(
        "retry",
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
    h.engine.wait_for_terminal(SPACE, e.id, WAIT).await.unwrap();
    let s = h.engine.store().get_stats(e.id).unwrap().unwrap();
    assert_eq!((s.success_cnt, s.failed_cnt), (2, 1));

    let svc = h.engine.experiments();
    let run = svc
        .retry(&h.ctx(), &ExptRef { space_id: SPACE, expt_id: e.id })
        .await
        .unwrap();
    assert_eq!(run.mode, loopeval_core::model::EvalMode::FailRetry);
    wait_until("retry to finish", || {
        h.engine.store().get_stats(e.id).unwrap().unwrap().success_cnt == 3
            && h.engine.manager().get(SPACE, e.id).unwrap().status.is_terminal()
    })
    .await;

    assert_eq!(h.engine.store().list_run_logs(e.id).unwrap().len(), 2);
    assert_eq!(h.evaluator.calls.load(std::sync::atomic::Ordering::SeqCst), 4);
    let err = svc
        .retry(&h.ctx(), &ExptRef { space_id: SPACE, expt_id: e.id })
        .await
        .unwrap_err();
    assert!(matches!(err, EvalError::InvalidState(_)));

    h.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_online_invoke_then_finish() {
    let h = Harness::start().await;
    let set = h.dataset("online", Vec::new());
    let ev = h.evaluator("judge").await;
    let mut req = h.offline("online", set, vec![ev]);
    req.expt_type = ExptType::Online;
    let e = h.engine.manager().create(&h.ctx(), req).await.unwrap();
    assert_eq!(e.status, ExptStatus::Pending);

    let svc = h.engine.experiments();
    let item = |id: &str, score: f64| NewItem {
        item_key: Some(id.into()),
        turns: vec![BTreeMap::from([("id".to_string(), json!(id)), ("score".to_string(), json!(score))])],
    };
    let res = svc
        .invoke(
            &h.ctx(),
            InvokeExperimentRequest {
                space_id: SPACE,
                expt_id: e.id,
                items: vec![item("A", 1.0), item("B", 0.0)],
                ext: BTreeMap::new(),
            },
        )
        .await
        .unwrap();
    assert_eq!(res.added, 2);
    assert!(res.outcomes.iter().all(|o| o.error.is_none()));

    wait_until("invoked items", || {
        h.engine.store().get_stats(e.id).unwrap().unwrap().success_cnt == 2
    })
    .await;
    // Online experiments stay open until finished.
    assert_eq!(h.engine.manager().get(SPACE, e.id).unwrap().status, ExptStatus::Processing);

    svc.invoke(
        &h.ctx(),
        InvokeExperimentRequest {
            space_id: SPACE,
            expt_id: e.id,
            items: vec![item("C", 0.5)],
            ext: BTreeMap::new(),
        },
    )
    .await
    .unwrap();
    wait_until("second invoke", || {
        h.engine.store().get_stats(e.id).unwrap().unwrap().success_cnt == 3
    })
    .await;

    let done = svc
        .finish(&h.ctx(), &ExptRef { space_id: SPACE, expt_id: e.id })
        .await
        .unwrap();
    assert_eq!(done.status, ExptStatus::Success);
    let again = svc
        .finish(&h.ctx(), &ExptRef { space_id: SPACE, expt_id: e.id })
        .await
        .unwrap();
    assert_eq!(again.status, ExptStatus::Success);
    let (_, aggs) = h.engine.wait_for_aggregates(SPACE, e.id, WAIT).await.unwrap();
    let avg = aggs[0].get(AggregatorType::Average).unwrap().value().unwrap();
    assert!((avg - 0.5).abs() < 1e-9);

    h.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_deadline_drains_experiment() {
    let h = Harness::start().await;
    let turns = (0..20)
        .map(|i| json!({"id": format!("I{}", i), "score": 1.0, "delay_ms": 40}))
        .collect();
    let set = h.dataset("deadline", turns);
    let ev = h.evaluator("judge").await;
    let mut req = h.offline("deadline", set, vec![ev]);
    req.item_concurrency = Some(1);
    req.max_alive_time_ms = 150;
    let (e, _) = h.engine.manager().submit(&h.ctx(), req).await.unwrap();

    let done = h.engine.wait_for_terminal(SPACE, e.id, WAIT).await.unwrap();
    assert_eq!(done.status, ExptStatus::Drained);
    let s = h.engine.store().get_stats(e.id).unwrap().unwrap();
    assert_eq!((s.pending_cnt, s.processing_cnt), (0, 0));
    assert!(s.terminated_cnt > 0);
    assert_stats_balanced(&h.engine, e.id);
    assert_eq!(h.engine.quota().usage(SPACE).unwrap().in_use, 0);

    h.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_restart_resumes_running_experiment() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("eval.db");
    let h = Harness::start_on(Store::open(&path).unwrap(), fast_config()).await;
    let turns = (0..6)
        .map(|i| json!({"id": format!("I{}", i), "score": 1.0, "delay_ms": 30}))
        .collect();
    let set = h.dataset("restart", turns);
    let ev = h.evaluator("judge").await;
    let mut req = h.offline("restart", set, vec![ev]);
    req.item_concurrency = Some(1);
    let (e, _) = h.engine.manager().submit(&h.ctx(), req).await.unwrap();
    wait_until("first success", || {
        h.engine.store().get_stats(e.id).unwrap().unwrap().success_cnt >= 1
    })
    .await;
    h.engine.shutdown().await;

    let resumed = h.restart(Store::open(&path).unwrap(), fast_config()).await;
    let done = resumed.engine.wait_for_terminal(SPACE, e.id, WAIT).await.unwrap();
    assert_eq!(done.status, ExptStatus::Success);
    let s = resumed.engine.store().get_stats(e.id).unwrap().unwrap();
    assert_eq!(s.success_cnt, 6);
    resumed.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_results_align_with_baseline_and_page() {
    let h = Harness::start().await;
    let set = h.dataset(
        "view",
        vec![
            json!({"id": "I1", "question": "q1", "score": 0.1}),
            json!({"id": "I2", "question": "q2", "score": 0.6}),
            json!({"id": "I3", "question": "q3", "score": 0.9}),
        ],
    );
    let ev = h.evaluator("judge").await;
    let (a, _) = h
        .engine
        .manager()
        .submit(&h.ctx(), h.offline("view-a", set, vec![ev]))
        .await
        .unwrap();
    h.engine.wait_for_terminal(SPACE, a.id, WAIT).await.unwrap();
    // Never run, so every cell is missing.
    let b = h
        .engine
        .manager()
        .create(&h.ctx(), h.offline("view-b", set, vec![ev]))
        .await
        .unwrap();

    let svc = h.engine.experiments();
    let mut req = BatchGetResultRequest {
        space_id: SPACE,
        expt_ids: vec![a.id, b.id],
        baseline_expt_id: Some(a.id),
        filters: BTreeMap::new(),
        cursor: None,
        limit: Some(2),
    };
    let page1 = svc.batch_get_results(&req).await.unwrap();
    assert_eq!(page1.rows.len(), 2);
    assert_eq!(page1.field_columns[0].key, "question");
    assert_eq!(page1.evaluator_columns.len(), 2);
    for row in &page1.rows {
        assert_eq!(row.cells.len(), 2);
        assert!(!row.cells[0].missing);
        assert!(row.cells[1].missing);
        assert_eq!(row.cells[1].item_state, Some(RunState::Pending));
    }
    assert_eq!(page1.rows[0].turn_input["question"], json!("q1"));

    req.cursor = page1.next_cursor.clone();
    let page2 = svc.batch_get_results(&req).await.unwrap();
    assert_eq!(page2.rows.len(), 1);
    assert_eq!(page2.rows[0].turn_input["question"], json!("q3"));
    assert!(page2.next_cursor.is_none());

    req.cursor = None;
    req.limit = None;
    req.filters.insert(
        a.id,
        ResultFilter {
            score_ranges: vec![ScoreRange {
                evaluator_version_id: ev,
                min: Some(0.5),
                max: None,
            }],
            ..Default::default()
        },
    );
    let filtered = svc.batch_get_results(&req).await.unwrap();
    assert_eq!(filtered.rows.len(), 2);

    req.cursor = Some("not-a-cursor".into());
    let err = svc.batch_get_results(&req).await.unwrap_err();
    assert!(matches!(err, EvalError::InvalidParam(_)));

    h.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_killed_baseline_still_lists_every_item() {
    let h = Harness::start().await;
    let set = h.dataset(
        "killed-view",
        vec![
            json!({"id": "I1", "question": "q1", "score": 1.0}),
            json!({"id": "I2", "question": "q2", "score": 0.5}),
        ],
    );
    let ev = h.evaluator("judge").await;
    let (a, _) = h
        .engine
        .manager()
        .submit(&h.ctx(), h.offline("killed-view", set, vec![ev]))
        .await
        .unwrap();
    let done = h.engine.wait_for_terminal(SPACE, a.id, WAIT).await.unwrap();
    assert_eq!(done.status, ExptStatus::Success);
    let b = h.engine.manager().clone_experiment(&h.ctx(), SPACE, a.id).await.unwrap();
    let killed = h.engine.manager().kill(&h.ctx(), SPACE, b.id).await.unwrap();
    assert_eq!(killed.status, ExptStatus::Terminated);

    let req = BatchGetResultRequest {
        space_id: SPACE,
        expt_ids: vec![b.id, a.id],
        baseline_expt_id: Some(b.id),
        filters: BTreeMap::new(),
        cursor: None,
        limit: None,
    };
    let page = h.engine.experiments().batch_get_results(&req).await.unwrap();
    assert_eq!(page.baseline_expt_id, b.id);
    assert_eq!(page.rows.len(), 2);
    assert_eq!(page.rows[0].turn_input["question"], json!("q1"));
    assert_eq!(page.rows[1].turn_input["question"], json!("q2"));
    for row in &page.rows {
        let (base, other) = (&row.cells[0], &row.cells[1]);
        assert_eq!(base.expt_id, b.id);
        assert!(base.missing);
        assert_eq!(base.item_state, Some(RunState::Terminated));
        assert!(!other.missing);
        assert_eq!(other.turn_status, Some(RunState::Success));
        assert!(other.evaluator_results.contains_key(&ev));
    }
    assert!(page.next_cursor.is_none());

    h.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_correction_updates_cell_and_aggregate() {
    let h = Harness::start().await;
    let set = h.dataset(
        "correct",
        vec![json!({"id": "I1", "score": 0.0}), json!({"id": "I2", "score": 0.0})],
    );
    let ev = h.evaluator("judge").await;
    let (e, _) = h
        .engine
        .manager()
        .submit(&h.ctx(), h.offline("correct", set, vec![ev]))
        .await
        .unwrap();
    let (_, before) = h.engine.wait_for_aggregates(SPACE, e.id, WAIT).await.unwrap();
    assert_eq!(before[0].get(AggregatorType::Average).unwrap().value(), Some(0.0));

    let turn = &h.engine.store().scan_turn_results(e.id, None, 1).unwrap()[0];
    let record_id = turn.evaluator_results[&ev].record_id.unwrap();
    let rec = h
        .engine
        .evaluators()
        .update_record(
            &h.ctx(),
            SPACE,
            record_id,
            CorrectionRequest {
                score: 1.0,
                explain: Some("judge was wrong".into()),
            },
        )
        .await
        .unwrap();
    assert_eq!(rec.score(), Some(1.0));

    let cell = &h.engine.store().get_turn_results(e.id, turn.item_id).unwrap()[0].evaluator_results[&ev];
    assert_eq!(cell.effective_score(), Some(1.0));
    wait_until("aggregate recomputed", || {
        h.engine.store().get_aggregates(e.id).unwrap()[0]
            .get(AggregatorType::Average)
            .and_then(|r| r.value())
            == Some(0.5)
    })
    .await;

    h.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_target_output_reaches_evaluator() {
    let h = Harness::start().await;
    let set = h.dataset("target", vec![json!({"id": "I1", "question": "ping", "score": 1.0})]);
    let ev = h.evaluator("judge").await;
    let tv = h.target().await;
    let mut req = h.offline("target", set, vec![ev]);
    req.target_version_id = Some(tv);
    req.target_field_mapping = TargetFieldMapping {
        from_eval_set: vec![
            FieldMapping {
                field_name: "question".into(),
                from_field_name: None,
                const_value: None,
            },
            FieldMapping {
                field_name: "id".into(),
                from_field_name: None,
                const_value: None,
            },
        ],
    };
    let (e, _) = h.engine.manager().submit(&h.ctx(), req).await.unwrap();
    h.engine.wait_for_terminal(SPACE, e.id, WAIT).await.unwrap();

    let turn = &h.engine.store().scan_turn_results(e.id, None, 1).unwrap()[0];
    let rec = h
        .engine
        .targets()
        .get_record(SPACE, turn.target_output_ref.unwrap())
        .unwrap();
    let out = rec.output.unwrap();
    assert_eq!(out.fields["answer"], json!("echo: ping"));
    // The mapping dropped `score`, so only the turn input carries it.
    assert!(!rec.input.fields.contains_key("score"));
    let s = h.engine.store().get_stats(e.id).unwrap().unwrap();
    assert_eq!((s.input_tokens, s.output_tokens), (8, 3));

    h.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_rename_delete_and_purge() {
    let mut cfg = fast_config();
    cfg.deleted_retention_secs = 0;
    let h = Harness::start_with(cfg).await;
    let set = h.dataset("crud", vec![json!({"id": "I1", "score": 1.0, "delay_ms": 50})]);
    let ev = h.evaluator("judge").await;
    let svc = h.engine.experiments();
    let a = h
        .engine
        .manager()
        .create(&h.ctx(), h.offline("crud-a", set, vec![ev]))
        .await
        .unwrap();
    let (b, _) = h
        .engine
        .manager()
        .submit(&h.ctx(), h.offline("crud-b", set, vec![ev]))
        .await
        .unwrap();

    let renamed = svc
        .update(
            &h.ctx(),
            UpdateExperimentRequest {
                space_id: SPACE,
                expt_id: a.id,
                name: Some("crud-renamed".into()),
                description: Some("first".into()),
            },
        )
        .await
        .unwrap();
    assert_eq!(renamed.name, "crud-renamed");
    let clash = svc
        .update(
            &h.ctx(),
            UpdateExperimentRequest {
                space_id: SPACE,
                expt_id: a.id,
                name: Some("crud-b".into()),
                description: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(clash, EvalError::NameExists(_)));

    let deleted = svc
        .batch_delete(
            &h.ctx(),
            &ExptRefs {
                space_id: SPACE,
                expt_ids: vec![a.id, b.id],
            },
        )
        .await
        .unwrap();
    assert_eq!(deleted.deleted.len(), 2);
    assert_eq!(h.engine.quota().usage(SPACE).unwrap().in_use, 0);
    let gone = h.engine.manager().get(SPACE, b.id).unwrap_err();
    assert!(matches!(gone, EvalError::NotFound { .. }));
    assert!(h.engine.manager().check_name(SPACE, "crud-b", None).unwrap());

    tokio::time::sleep(Duration::from_millis(100)).await;
    let report = h.engine.janitor().run_once().unwrap();
    assert_eq!(report.purged_experiments, 2);
    assert!(h.engine.store().get_experiment(b.id).unwrap().is_none());
    assert!(h.engine.store().get_stats(b.id).unwrap().is_none());

    h.engine.shutdown().await;
}
