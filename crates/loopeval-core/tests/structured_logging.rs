mod common;

use async_trait::async_trait;
use common::{Harness, SPACE, WAIT};
use loopeval_core::context::Ctx;
use loopeval_core::moderation::{enforce, ContentModerator, Verdict};
use loopeval_core::on_error::ErrorPolicy;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};

struct MockWriter(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for MockWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Runs `f` on a current-thread runtime with a JSON subscriber and returns the parsed lines.
fn capture<F, Fut>(f: F) -> Vec<Value>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let buffer = Arc::new(Mutex::new(Vec::new()));
    let sink = buffer.clone();
    let subscriber = tracing_subscriber::fmt()
        .json()
        .with_max_level(tracing::Level::DEBUG)
        .with_writer(move || MockWriter(sink.clone()))
        .finish();
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    tracing::subscriber::with_default(subscriber, || rt.block_on(f()));

    let output = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
    output
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

fn events<'a>(lines: &'a [Value], name: &str) -> Vec<&'a Value> {
    lines
        .iter()
        .filter(|l| l["fields"]["event"] == json!(name))
        .collect()
}

struct Unreachable;

#[async_trait]
impl ContentModerator for Unreachable {
    async fn check(&self, _ctx: &Ctx, _texts: &[&str]) -> anyhow::Result<Verdict> {
        anyhow::bail!("connection refused")
    }
}

#[test]
fn test_moderation_outage_logs_failsafe() {
    let lines = capture(|| async {
        enforce(&Unreachable, ErrorPolicy::Allow, &Ctx::system(), "experiment.create", &["hello"])
            .await
            .unwrap();
    });
    let hits = events(&lines, "loopeval.failsafe.triggered");
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0]["fields"]["operation"], json!("experiment.create"));
    assert_eq!(hits[0]["fields"]["action"], json!("allowed"));
    assert!(hits[0]["timestamp"].is_string());
}

#[test]
fn test_experiment_lifecycle_is_logged() {
    let lines = capture(|| async {
        let h = Harness::start().await;
        let set = h.dataset("logged", vec![json!({"id": "I1", "score": 1.0})]);
        let ev = h.evaluator("judge").await;
        let (e, _) = h
            .engine
            .manager()
            .submit(&h.ctx(), h.offline("logged", set, vec![ev]))
            .await
            .unwrap();
        h.engine.wait_for_aggregates(SPACE, e.id, WAIT).await.unwrap();
        h.engine.shutdown().await;
    });

    let transitions: Vec<&str> = events(&lines, "experiment.status")
        .iter()
        .filter_map(|l| l["fields"]["to"].as_str())
        .collect();
    assert_eq!(transitions, vec!["processing", "success"]);
    assert_eq!(events(&lines, "quota.admit").len(), 1);
    assert_eq!(events(&lines, "quota.release").len(), 1);
    assert_eq!(events(&lines, "item.claimed").len(), 1);
    assert_eq!(events(&lines, "item.terminal").len(), 1);
    assert!(!events(&lines, "aggregate.computed").is_empty());
    assert!(!events(&lines, "engine.started").is_empty());

    let metered: Vec<&str> = events(&lines, "loopeval.usage.metered")
        .iter()
        .filter_map(|l| l["fields"]["usage_type"].as_str())
        .collect();
    assert!(metered.contains(&"evaluator_call"));
}
