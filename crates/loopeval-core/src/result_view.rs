//! Pivoted, baseline-aligned result pages and aggregate lookups.

use crate::dataset::{EvalSetProvider, FieldSchema, Turn};
use crate::errors::{ErrorDetail, EvalError, EvalResult, ResourceKind};
use crate::field_mapping::Fields;
use crate::model::{
    EvaluatorCell, EvaluatorRef, EvaluatorVersionId, Experiment, ExptAggregateResult, ExptId, ItemId,
    ItemResult, RecordId, RunState, SpaceId, TurnId, TurnResult,
};
use crate::storage::Store;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

const DEFAULT_PAGE: usize = 50;
const MAX_PAGE: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct CursorKey {
    last_item_id: ItemId,
    last_turn_id: TurnId,
}

/// Opaque page cursor: hex of `{"last_item_id", "last_turn_id"}`.
pub fn encode_cursor(item_id: ItemId, turn_id: TurnId) -> EvalResult<String> {
    let raw = serde_json::to_vec(&CursorKey {
        last_item_id: item_id,
        last_turn_id: turn_id,
    })?;
    Ok(hex::encode(raw))
}

pub fn decode_cursor(cursor: &str) -> EvalResult<(ItemId, TurnId)> {
    let bad = || EvalError::InvalidParam("malformed cursor".into());
    let raw = hex::decode(cursor).map_err(|_| bad())?;
    let key: CursorKey = serde_json::from_slice(&raw).map_err(|_| bad())?;
    Ok((key.last_item_id, key.last_turn_id))
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreRange {
    pub evaluator_version_id: EvaluatorVersionId,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultFilter {
    /// Item states to keep; empty keeps all.
    #[serde(default)]
    pub run_states: Vec<RunState>,
    #[serde(default)]
    pub item_ids: Vec<ItemId>,
    #[serde(default)]
    pub score_ranges: Vec<ScoreRange>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchGetResultRequest {
    pub space_id: SpaceId,
    pub expt_ids: Vec<ExptId>,
    /// Rows follow this experiment; the first id when unset.
    #[serde(default)]
    pub baseline_expt_id: Option<ExptId>,
    #[serde(default)]
    pub filters: BTreeMap<ExptId, ResultFilter>,
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultCell {
    pub expt_id: ExptId,
    /// The experiment has no result for this turn.
    pub missing: bool,
    #[serde(default)]
    pub item_state: Option<RunState>,
    #[serde(default)]
    pub item_error: Option<ErrorDetail>,
    #[serde(default)]
    pub turn_status: Option<RunState>,
    #[serde(default)]
    pub target_output_ref: Option<RecordId>,
    #[serde(default)]
    pub target_error: Option<ErrorDetail>,
    #[serde(default)]
    pub evaluator_results: BTreeMap<EvaluatorVersionId, EvaluatorCell>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    pub item_id: ItemId,
    pub turn_id: TurnId,
    #[serde(default)]
    pub turn_input: Fields,
    /// One cell per requested experiment, in request order.
    pub cells: Vec<ResultCell>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentColumns {
    pub expt_id: ExptId,
    pub evaluators: Vec<EvaluatorRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchGetResultResponse {
    pub baseline_expt_id: ExptId,
    pub field_columns: Vec<FieldSchema>,
    pub evaluator_columns: Vec<ExperimentColumns>,
    pub rows: Vec<ResultRow>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentAggregates {
    pub expt_id: ExptId,
    pub results: Vec<ExptAggregateResult>,
}

impl ResultFilter {
    fn keeps(&self, item: Option<&ItemResult>, turn: Option<&TurnResult>, item_id: ItemId) -> bool {
        if !self.item_ids.is_empty() && !self.item_ids.contains(&item_id) {
            return false;
        }
        if !self.run_states.is_empty() {
            match item {
                Some(i) if self.run_states.contains(&i.run_state) => {}
                _ => return false,
            }
        }
        self.score_ranges.iter().all(|r| {
            let score = turn
                .and_then(|t| t.evaluator_results.get(&r.evaluator_version_id))
                .and_then(|c| c.effective_score());
            match score {
                None => false,
                Some(s) => r.min.map_or(true, |m| s >= m) && r.max.map_or(true, |m| s <= m),
            }
        })
    }
}

/// Per-experiment lookups for one page of items.
struct PageData {
    items: HashMap<ItemId, ItemResult>,
    turns: HashMap<(ItemId, TurnId), TurnResult>,
}

#[derive(Clone)]
pub struct ResultView {
    store: Store,
    eval_sets: Arc<dyn EvalSetProvider>,
}

impl ResultView {
    pub fn new(store: Store, eval_sets: Arc<dyn EvalSetProvider>) -> Self {
        Self { store, eval_sets }
    }

    fn live(&self, space_id: SpaceId, id: ExptId) -> EvalResult<Experiment> {
        self.store
            .get_experiment(id)?
            .filter(|e| !e.deleted && e.space_id == space_id)
            .ok_or_else(|| EvalError::not_found(ResourceKind::Experiment, id))
    }

    fn page_data(&self, expt_id: ExptId, item_ids: &[ItemId]) -> EvalResult<PageData> {
        let items = self
            .store
            .mget_item_results(expt_id, item_ids)?
            .into_iter()
            .map(|i| (i.item_id, i))
            .collect();
        let mut turns = HashMap::new();
        for item_id in item_ids {
            for t in self.store.get_turn_results(expt_id, *item_id)? {
                turns.insert((t.item_id, t.turn_id), t);
            }
        }
        Ok(PageData { items, turns })
    }

    /// One row per turn of every baseline item, in dataset order. Cells of
    /// each experiment are aligned by `(item_id, turn_id)` and flagged
    /// `missing` when that experiment has no turn result, baseline included.
    pub async fn batch_get_results(&self, req: &BatchGetResultRequest) -> EvalResult<BatchGetResultResponse> {
        let first = req
            .expt_ids
            .first()
            .copied()
            .ok_or_else(|| EvalError::InvalidParam("expt_ids is empty".into()))?;
        let baseline_id = req.baseline_expt_id.unwrap_or(first);
        let mut ids = req.expt_ids.clone();
        if !ids.contains(&baseline_id) {
            ids.insert(0, baseline_id);
        }
        let expts = ids
            .iter()
            .map(|id| self.live(req.space_id, *id))
            .collect::<EvalResult<Vec<_>>>()?;
        let baseline = expts
            .iter()
            .find(|e| e.id == baseline_id)
            .ok_or_else(|| EvalError::not_found(ResourceKind::Experiment, baseline_id))?;

        let field_columns = self
            .eval_sets
            .get_version(req.space_id, baseline.eval_set_version_id)
            .await?
            .schema;
        let mut evaluator_columns = Vec::with_capacity(expts.len());
        for e in &expts {
            let versions = self
                .store
                .mget_evaluator_versions(req.space_id, &e.evaluator_version_ids)?;
            let evaluators = e
                .evaluator_version_ids
                .iter()
                .filter_map(|id| versions.iter().find(|v| v.id == *id))
                .map(|v| EvaluatorRef {
                    evaluator_id: v.evaluator_id,
                    evaluator_version_id: v.id,
                    name: v.name.clone(),
                    version: v.version.clone(),
                })
                .collect();
            evaluator_columns.push(ExperimentColumns {
                expt_id: e.id,
                evaluators,
            });
        }

        let limit = req.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE);
        // The cursor item's page restarts at that item and skips its turns up to the cursor turn.
        let (mut after_idx, mut resume) = match &req.cursor {
            None => (None, None),
            Some(c) => {
                let (item_id, turn_id) = decode_cursor(c)?;
                let item = self
                    .store
                    .get_item_result(baseline_id, item_id)?
                    .ok_or_else(|| EvalError::InvalidParam("cursor does not match the baseline".into()))?;
                (Some(item.item_idx - 1), Some((item_id, turn_id)))
            }
        };
        let mut rows = Vec::new();
        let mut last = None;
        'pages: while rows.len() < limit {
            let page = self.store.page_item_results(baseline_id, after_idx, limit)?;
            let Some(tail) = page.last() else { break };
            after_idx = Some(tail.item_idx);
            let exhausted = page.len() < limit;

            let item_ids: Vec<ItemId> = page.iter().map(|i| i.item_id).collect();
            let mut data = HashMap::new();
            for e in &expts {
                data.insert(e.id, self.page_data(e.id, &item_ids)?);
            }
            let dataset: HashMap<ItemId, Vec<Turn>> = self
                .eval_sets
                .batch_get_items(req.space_id, baseline.eval_set_version_id, &item_ids)
                .await?
                .into_iter()
                .map(|i| (i.item_id, i.turns))
                .collect();

            for item in &page {
                let turns = row_turns(item.item_id, dataset.get(&item.item_id).map(Vec::as_slice), &data);
                for (turn_id, turn_input) in turns {
                    if let Some((ri, rt)) = resume {
                        if ri == item.item_id {
                            if turn_id == rt {
                                resume = None;
                            }
                            continue;
                        }
                        resume = None;
                    }
                    last = Some((item.item_id, turn_id));
                    let key = (item.item_id, turn_id);
                    let mut keep = true;
                    let mut cells = Vec::with_capacity(req.expt_ids.len());
                    for e in &expts {
                        let Some(d) = data.get(&e.id) else { continue };
                        let state = d.items.get(&key.0);
                        let turn = d.turns.get(&key);
                        if let Some(f) = req.filters.get(&e.id) {
                            keep &= f.keeps(state, turn, key.0);
                        }
                        if !req.expt_ids.contains(&e.id) {
                            continue;
                        }
                        cells.push(ResultCell {
                            expt_id: e.id,
                            missing: turn.is_none(),
                            item_state: state.map(|i| i.run_state),
                            item_error: state.and_then(|i| i.error.clone()),
                            turn_status: turn.map(|x| x.status),
                            target_output_ref: turn.and_then(|x| x.target_output_ref),
                            target_error: turn.and_then(|x| x.target_error.clone()),
                            evaluator_results: turn.map(|x| x.evaluator_results.clone()).unwrap_or_default(),
                        });
                    }
                    if keep {
                        rows.push(ResultRow {
                            item_id: key.0,
                            turn_id,
                            turn_input,
                            cells,
                        });
                        if rows.len() == limit {
                            break 'pages;
                        }
                    }
                }
            }
            if exhausted {
                break;
            }
        }

        let next_cursor = match (rows.len() == limit, last) {
            (true, Some((i, t))) => Some(encode_cursor(i, t)?),
            _ => None,
        };
        Ok(BatchGetResultResponse {
            baseline_expt_id: baseline_id,
            field_columns,
            evaluator_columns,
            rows,
            next_cursor,
        })
    }

    pub fn batch_get_aggregates(&self, space_id: SpaceId, ids: &[ExptId]) -> EvalResult<Vec<ExperimentAggregates>> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            self.live(space_id, *id)?;
            out.push(ExperimentAggregates {
                expt_id: *id,
                results: self.store.get_aggregates(*id)?,
            });
        }
        Ok(out)
    }
}

/// Turns a baseline item contributes rows for: the dataset's turns, else the
/// stored turn rows of any experiment. An item with neither gets a single
/// row at turn 0 so its item-level error stays visible.
fn row_turns(
    item_id: ItemId,
    turns: Option<&[Turn]>,
    data: &HashMap<ExptId, PageData>,
) -> Vec<(TurnId, Fields)> {
    if let Some(turns) = turns.filter(|t| !t.is_empty()) {
        return turns.iter().map(|t| (t.turn_id, t.fields.clone())).collect();
    }
    let mut stored: Vec<(i64, TurnId)> = data
        .values()
        .flat_map(|d| d.turns.values())
        .filter(|t| t.item_id == item_id)
        .map(|t| (t.turn_idx, t.turn_id))
        .collect();
    stored.sort_unstable();
    stored.dedup_by_key(|(_, id)| *id);
    if stored.is_empty() {
        return vec![(0, Fields::new())];
    }
    stored.into_iter().map(|(_, id)| (id, Fields::new())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_codec() {
        let c = encode_cursor(42, -7).unwrap();
        assert!(c.chars().all(|ch| ch.is_ascii_hexdigit()));
        assert_eq!(decode_cursor(&c).unwrap(), (42, -7));
        assert!(matches!(decode_cursor("zz"), Err(EvalError::InvalidParam(_))));
        assert!(matches!(decode_cursor(&hex::encode("{}")), Err(EvalError::InvalidParam(_))));
    }

    #[test]
    fn test_score_range_filter() {
        let mut turn = TurnResult {
            expt_id: 1,
            item_id: 2,
            turn_id: 3,
            turn_idx: 0,
            run_id: 9,
            status: RunState::Success,
            target_output_ref: None,
            target_error: None,
            evaluator_results: BTreeMap::new(),
            updated_at: 0,
        };
        turn.evaluator_results.insert(
            7,
            EvaluatorCell {
                score: Some(0.4),
                ..Default::default()
            },
        );
        let f = ResultFilter {
            score_ranges: vec![ScoreRange {
                evaluator_version_id: 7,
                min: Some(0.5),
                max: None,
            }],
            ..Default::default()
        };
        assert!(!f.keeps(None, Some(&turn), 2));
        let f = ResultFilter {
            score_ranges: vec![ScoreRange {
                evaluator_version_id: 7,
                min: Some(0.0),
                max: Some(0.5),
            }],
            ..Default::default()
        };
        assert!(f.keeps(None, Some(&turn), 2));
        assert!(!f.keeps(None, None, 2));
    }
}
