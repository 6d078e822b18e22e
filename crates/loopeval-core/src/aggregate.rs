use crate::dispatcher::EventHandler;
use crate::errors::{EvalError, EvalResult, ResourceKind};
use crate::events::{AggregateCalculateEvent, Envelope, EventType};
use crate::model::{
    AggregateData, AggregatorResult, AggregatorType, EvaluatorVersionId, ExptAggregateResult, ExptId,
    ScoreBucket,
};
use crate::storage::Store;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};

const SCAN_PAGE: usize = 500;

/// Aggregators used when a version declares none.
pub fn default_aggregators(value_set: Option<&[f64]>) -> Vec<AggregatorType> {
    let mut out = vec![
        AggregatorType::Average,
        AggregatorType::Sum,
        AggregatorType::Min,
        AggregatorType::Max,
    ];
    if value_set.is_some_and(|v| !v.is_empty()) {
        out.push(AggregatorType::Distribution);
    }
    out
}

fn bucket_label(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{}", v)
    }
}

fn distribution(scores: &[f64], value_set: Option<&[f64]>) -> Vec<ScoreBucket> {
    let total = scores.len() as i64;
    let ratio = |c: i64| if total == 0 { 0.0 } else { c as f64 / total as f64 };
    match value_set.filter(|v| !v.is_empty()) {
        Some(declared) => {
            let mut counts = vec![0i64; declared.len()];
            let mut other = 0i64;
            for s in scores {
                match declared.iter().position(|d| (d - s).abs() < 1e-9) {
                    Some(i) => counts[i] += 1,
                    None => other += 1,
                }
            }
            let mut buckets: Vec<ScoreBucket> = declared
                .iter()
                .zip(counts)
                .map(|(d, c)| ScoreBucket {
                    value: bucket_label(*d),
                    count: c,
                    ratio: ratio(c),
                })
                .collect();
            if other > 0 {
                buckets.push(ScoreBucket {
                    value: "other".into(),
                    count: other,
                    ratio: ratio(other),
                });
            }
            buckets
        }
        None => {
            let mut counts: BTreeMap<String, i64> = BTreeMap::new();
            for s in scores {
                *counts.entry(bucket_label(*s)).or_default() += 1;
            }
            counts
                .into_iter()
                .map(|(value, count)| ScoreBucket {
                    value,
                    count,
                    ratio: ratio(count),
                })
                .collect()
        }
    }
}

/// Computes the requested aggregators. Missing and NaN scores are skipped,
/// so `Average` is `sum / count` over the remaining values.
pub fn compute(scores: &[Option<f64>], types: &[AggregatorType], value_set: Option<&[f64]>) -> Vec<AggregatorResult> {
    let valid: Vec<f64> = scores.iter().flatten().copied().filter(|s| !s.is_nan()).collect();
    let count = valid.len() as i64;
    let value = |v: Option<f64>| AggregateData::Value { value: v, count };
    types
        .iter()
        .map(|t| {
            let data = match t {
                AggregatorType::Average => value(if valid.is_empty() {
                    None
                } else {
                    Some(valid.iter().sum::<f64>() / count as f64)
                }),
                AggregatorType::Sum => value(Some(valid.iter().sum())),
                AggregatorType::Min => value(valid.iter().copied().reduce(f64::min)),
                AggregatorType::Max => value(valid.iter().copied().reduce(f64::max)),
                AggregatorType::Distribution => AggregateData::Distribution {
                    buckets: distribution(&valid, value_set),
                },
            };
            AggregatorResult {
                aggregator_type: *t,
                data,
            }
        })
        .collect()
}

/// Streams turn results and writes one aggregate row per evaluator version.
#[derive(Clone)]
pub struct ResultAggregator {
    store: Store,
}

impl ResultAggregator {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn recompute(&self, expt_id: ExptId) -> EvalResult<Vec<ExptAggregateResult>> {
        let expt = self
            .store
            .get_experiment(expt_id)?
            .filter(|e| !e.deleted)
            .ok_or_else(|| EvalError::not_found(ResourceKind::Experiment, expt_id))?;
        let versions = self
            .store
            .mget_evaluator_versions(expt.space_id, &expt.evaluator_version_ids)?;

        let mut scores: HashMap<EvaluatorVersionId, Vec<Option<f64>>> = expt
            .evaluator_version_ids
            .iter()
            .map(|id| (*id, Vec::new()))
            .collect();
        let mut after = None;
        loop {
            let page = self.store.scan_turn_results(expt_id, after, SCAN_PAGE)?;
            for turn in &page {
                for (ev, cell) in &turn.evaluator_results {
                    if let Some(list) = scores.get_mut(ev) {
                        list.push(cell.effective_score());
                    }
                }
            }
            match page.last() {
                Some(last) if page.len() == SCAN_PAGE => after = Some((last.item_id, last.turn_id)),
                _ => break,
            }
        }

        for ev in &expt.evaluator_version_ids {
            let version = versions.iter().find(|v| v.id == *ev);
            let value_set = version.and_then(|v| v.value_set.as_deref());
            let types = match version {
                Some(v) if !v.aggregators.is_empty() => v.aggregators.clone(),
                _ => default_aggregators(value_set),
            };
            let empty = Vec::new();
            let results = compute(scores.get(ev).unwrap_or(&empty), &types, value_set);
            self.store
                .upsert_aggregate(expt_id, expt.space_id, *ev, &results)?;
        }
        tracing::info!(
            event = "aggregate.computed",
            expt_id,
            evaluators = expt.evaluator_version_ids.len(),
        );
        Ok(self.store.get_aggregates(expt_id)?)
    }
}

#[async_trait]
impl EventHandler for ResultAggregator {
    fn event_type(&self) -> EventType {
        EventType::AggregateCalculate
    }

    async fn handle(&self, env: &Envelope) -> EvalResult<()> {
        let ev: AggregateCalculateEvent = env.decode()?;
        match self.recompute(ev.expt_id) {
            Err(EvalError::NotFound { .. }) => Ok(()),
            other => other.map(|_| ()),
        }
    }

    async fn on_exhausted(&self, env: &Envelope, err: &EvalError) -> EvalResult<()> {
        // Aggregates are derived; the next recompute will replace them.
        tracing::error!(event = "aggregate.abandoned", trace_id = %env.trace_id, error = %err);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn val(r: &[AggregatorResult], t: AggregatorType) -> Option<f64> {
        r.iter().find(|x| x.aggregator_type == t).and_then(|x| x.value())
    }

    #[test]
    fn test_average_skips_missing_and_nan() {
        let scores = [Some(1.0), None, Some(f64::NAN), Some(0.0), Some(0.5)];
        let r = compute(&scores, &default_aggregators(None), None);
        assert!((val(&r, AggregatorType::Average).unwrap() - 0.5).abs() < 1e-9);
        assert_eq!(val(&r, AggregatorType::Sum), Some(1.5));
        assert_eq!(val(&r, AggregatorType::Min), Some(0.0));
        assert_eq!(val(&r, AggregatorType::Max), Some(1.0));
        match &r[0].data {
            AggregateData::Value { count, .. } => assert_eq!(*count, 3),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_empty_scores_have_no_average() {
        let r = compute(&[], &[AggregatorType::Average, AggregatorType::Max], None);
        assert_eq!(val(&r, AggregatorType::Average), None);
        assert_eq!(val(&r, AggregatorType::Max), None);
    }

    #[test]
    fn test_distribution_uses_declared_value_set() {
        let scores = [Some(1.0), Some(1.0), Some(0.0), Some(0.5)];
        let r = compute(&scores, &[AggregatorType::Distribution], Some(&[0.0, 1.0]));
        let AggregateData::Distribution { buckets } = &r[0].data else {
            panic!("expected distribution");
        };
        let labels: Vec<(&str, i64)> = buckets.iter().map(|b| (b.value.as_str(), b.count)).collect();
        assert_eq!(labels, vec![("0", 1), ("1", 2), ("other", 1)]);
        assert!((buckets[1].ratio - 0.5).abs() < 1e-9);
    }
}
