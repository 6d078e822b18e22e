use loopeval_core::model::{AggregateData, AggregatorType, ExptAggregateResult, ExptStats, Experiment, TurnResult};
use serde::Serialize;
use std::collections::BTreeMap;

/// One evaluator's outcome with its threshold verdict.
#[derive(Debug, Clone, Serialize)]
pub struct EvaluatorSummary {
    pub name: String,
    pub evaluator_version_id: i64,
    pub average: Option<f64>,
    pub scored: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    pub passed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub experiment: Experiment,
    pub stats: Option<ExptStats>,
    pub evaluators: Vec<EvaluatorSummary>,
    pub aggregates: Vec<ExptAggregateResult>,
}

impl RunReport {
    pub fn all_passed(&self) -> bool {
        self.evaluators.iter().all(|e| e.passed)
    }
}

fn scored_count(agg: &ExptAggregateResult) -> i64 {
    agg.results
        .iter()
        .find_map(|r| match &r.data {
            AggregateData::Value { count, .. } => Some(*count),
            AggregateData::Distribution { .. } => None,
        })
        .unwrap_or(0)
}

pub fn summarize(
    names: &BTreeMap<i64, String>,
    thresholds: &BTreeMap<String, f64>,
    aggregates: &[ExptAggregateResult],
) -> Vec<EvaluatorSummary> {
    names
        .iter()
        .map(|(id, name)| {
            let agg = aggregates.iter().find(|a| a.evaluator_version_id == *id);
            let average = agg
                .and_then(|a| a.get(AggregatorType::Average))
                .and_then(|r| r.value());
            let threshold = thresholds.get(name).copied();
            let passed = match threshold {
                Some(min) => average.map(|a| a + 1e-9 >= min).unwrap_or(false),
                None => true,
            };
            EvaluatorSummary {
                name: name.clone(),
                evaluator_version_id: *id,
                average,
                scored: agg.map(scored_count).unwrap_or(0),
                threshold,
                passed,
            }
        })
        .collect()
}

pub fn print_summary(report: &RunReport) {
    let e = &report.experiment;
    eprintln!("\nExperiment {} ({}) finished: {}", e.name, e.id, e.status.as_str());
    if let Some(s) = &report.stats {
        eprintln!(
            "Items: {} total, {} success, {} failed, {} terminated",
            s.total_cnt, s.success_cnt, s.failed_cnt, s.terminated_cnt
        );
        eprintln!("Tokens: {} in / {} out", s.input_tokens, s.output_tokens);
    }
    for ev in &report.evaluators {
        let icon = if ev.passed { "✅" } else { "❌" };
        let avg = ev
            .average
            .map(|a| format!("{:.3}", a))
            .unwrap_or_else(|| "n/a".into());
        let min = ev
            .threshold
            .map(|t| format!(" (min {:.3})", t))
            .unwrap_or_default();
        eprintln!("{} {:<24} avg {}{}  scored {}", icon, ev.name, avg, min, ev.scored);
    }
}

pub fn print_turns(turns: &[TurnResult], names: &BTreeMap<i64, String>) {
    for t in turns {
        let cells: Vec<String> = t
            .evaluator_results
            .iter()
            .map(|(id, cell)| {
                let name = names.get(id).cloned().unwrap_or_else(|| id.to_string());
                match (cell.effective_score(), &cell.error) {
                    (Some(s), _) => format!("{}={:.3}", name, s),
                    (None, Some(err)) => format!("{}=error({})", name, err.message),
                    (None, None) => format!("{}=-", name),
                }
            })
            .collect();
        eprintln!("item {} turn {} [{}] {}", t.item_id, t.turn_id, t.status.as_str(), cells.join("  "));
    }
}
