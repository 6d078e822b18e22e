use super::experiment_repo::{insert_items_tx, recount_stats_tx};
use super::store::{from_json, opt_from_json, parse_col, placeholders, to_json, Store};
use crate::errors::ErrorDetail;
use crate::model::{
    now_ms, AggregatorResult, EvaluatorCell, EvaluatorVersionId, ExptAggregateResult, ExptId,
    ExptStats, ItemId, ItemResult, ItemTransition, RunId, RunState, SpaceId, StatsDelta, TurnId,
    TurnResult,
};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, OptionalExtension, Row, Transaction};
use std::collections::BTreeMap;

const ITEM_COLS: &str =
    "expt_id, space_id, item_id, item_idx, run_state, run_id, error_json, retry_count, updated_at";
const TURN_COLS: &str = "expt_id, item_id, turn_id, turn_idx, run_id, status, target_record_id,
    target_error_json, evaluator_results_json, updated_at";
const STATS_COLS: &str = "expt_id, space_id, pending_cnt, processing_cnt, success_cnt, failed_cnt,
    terminated_cnt, total_cnt, input_tokens, output_tokens";

fn row_to_item(row: &Row<'_>) -> rusqlite::Result<ItemResult> {
    Ok(ItemResult {
        expt_id: row.get(0)?,
        space_id: row.get(1)?,
        item_id: row.get(2)?,
        item_idx: row.get(3)?,
        run_state: parse_col(4, &row.get::<_, String>(4)?, RunState::parse)?,
        run_id: row.get(5)?,
        error: opt_from_json(6, row.get(6)?)?,
        retry_count: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn row_to_turn(row: &Row<'_>) -> rusqlite::Result<TurnResult> {
    let cells: BTreeMap<EvaluatorVersionId, EvaluatorCell> =
        from_json(8, &row.get::<_, String>(8)?)?;
    Ok(TurnResult {
        expt_id: row.get(0)?,
        item_id: row.get(1)?,
        turn_id: row.get(2)?,
        turn_idx: row.get(3)?,
        run_id: row.get(4)?,
        status: parse_col(5, &row.get::<_, String>(5)?, RunState::parse)?,
        target_output_ref: row.get(6)?,
        target_error: opt_from_json(7, row.get(7)?)?,
        evaluator_results: cells,
        updated_at: row.get(9)?,
    })
}

fn row_to_stats(row: &Row<'_>) -> rusqlite::Result<ExptStats> {
    Ok(ExptStats {
        expt_id: row.get(0)?,
        space_id: row.get(1)?,
        pending_cnt: row.get(2)?,
        processing_cnt: row.get(3)?,
        success_cnt: row.get(4)?,
        failed_cnt: row.get(5)?,
        terminated_cnt: row.get(6)?,
        total_cnt: row.get(7)?,
        input_tokens: row.get(8)?,
        output_tokens: row.get(9)?,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    Claimed(ItemResult),
    NotPending(RunState),
    AtCapacity,
    Missing,
}

fn incr_stats_tx(tx: &Transaction<'_>, expt_id: ExptId, d: StatsDelta) -> anyhow::Result<()> {
    if d.is_zero() {
        return Ok(());
    }
    tx.execute(
        "UPDATE expt_stats SET
            pending_cnt = pending_cnt + ?1,
            processing_cnt = processing_cnt + ?2,
            success_cnt = success_cnt + ?3,
            failed_cnt = failed_cnt + ?4,
            terminated_cnt = terminated_cnt + ?5,
            input_tokens = input_tokens + ?6,
            output_tokens = output_tokens + ?7,
            updated_at = ?8
         WHERE expt_id = ?9",
        params![
            d.pending,
            d.processing,
            d.success,
            d.failed,
            d.terminated,
            d.input_tokens,
            d.output_tokens,
            now_ms(),
            expt_id
        ],
    )?;
    Ok(())
}

fn log_transition_tx(
    tx: &Transaction<'_>,
    expt_id: ExptId,
    item_id: ItemId,
    run_id: Option<RunId>,
    from: RunState,
    to: RunState,
    at: i64,
) -> anyhow::Result<()> {
    tx.execute(
        "INSERT INTO item_run_logs (expt_id, item_id, run_id, from_state, to_state, at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![expt_id, item_id, run_id, from.as_str(), to.as_str(), at],
    )?;
    Ok(())
}

fn item_state_tx(
    tx: &Transaction<'_>,
    expt_id: ExptId,
    item_id: ItemId,
) -> anyhow::Result<Option<(RunState, Option<RunId>)>> {
    let row: Option<(String, Option<RunId>)> = tx
        .query_row(
            "SELECT run_state, run_id FROM item_results WHERE expt_id = ?1 AND item_id = ?2",
            params![expt_id, item_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    match row {
        None => Ok(None),
        Some((s, run)) => {
            let st = RunState::parse(&s).ok_or_else(|| anyhow::anyhow!("unknown run_state {:?}", s))?;
            Ok(Some((st, run)))
        }
    }
}

impl Store {
    /// Appends Pending items to an existing experiment; returns how many were new.
    pub fn add_items(&self, expt_id: ExptId, space_id: SpaceId, items: &[ItemId]) -> anyhow::Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let next_idx: i64 = tx.query_row(
            "SELECT COALESCE(MAX(item_idx) + 1, 0) FROM item_results WHERE expt_id = ?1",
            params![expt_id],
            |r| r.get(0),
        )?;
        let n = insert_items_tx(&tx, expt_id, space_id, items, next_idx)?;
        tx.commit()?;
        Ok(n)
    }

    pub fn get_item_result(&self, expt_id: ExptId, item_id: ItemId) -> anyhow::Result<Option<ItemResult>> {
        let conn = self.lock()?;
        let r = conn
            .query_row(
                &format!("SELECT {} FROM item_results WHERE expt_id = ?1 AND item_id = ?2", ITEM_COLS),
                params![expt_id, item_id],
                row_to_item,
            )
            .optional()?;
        Ok(r)
    }

    /// Item rows in dataset order; all states when `states` is empty.
    pub fn list_item_results(
        &self,
        expt_id: ExptId,
        states: &[RunState],
        limit: usize,
    ) -> anyhow::Result<Vec<ItemResult>> {
        let conn = self.lock()?;
        let mut args: Vec<Value> = vec![Value::Integer(expt_id)];
        let state_sql = if states.is_empty() {
            String::new()
        } else {
            args.extend(states.iter().map(|s| Value::Text(s.as_str().into())));
            format!(" AND run_state IN ({})", placeholders(states.len()))
        };
        args.push(Value::Integer(limit as i64));
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM item_results WHERE expt_id = ?{} ORDER BY item_idx LIMIT ?",
            ITEM_COLS, state_sql
        ))?;
        let rows = stmt.query_map(params_from_iter(args), row_to_item)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Item rows with `item_idx > after_idx`, in dataset order.
    pub fn page_item_results(
        &self,
        expt_id: ExptId,
        after_idx: Option<i64>,
        limit: usize,
    ) -> anyhow::Result<Vec<ItemResult>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM item_results WHERE expt_id = ?1 AND item_idx > ?2 ORDER BY item_idx LIMIT ?3",
            ITEM_COLS
        ))?;
        let rows = stmt.query_map(
            params![expt_id, after_idx.unwrap_or(i64::MIN), limit as i64],
            row_to_item,
        )?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn mget_item_results(&self, expt_id: ExptId, ids: &[ItemId]) -> anyhow::Result<Vec<ItemResult>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.lock()?;
        let mut args: Vec<Value> = vec![Value::Integer(expt_id)];
        args.extend(ids.iter().map(|i| Value::Integer(*i)));
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM item_results WHERE expt_id = ? AND item_id IN ({}) ORDER BY item_idx",
            ITEM_COLS,
            placeholders(ids.len())
        ))?;
        let rows = stmt.query_map(params_from_iter(args), row_to_item)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Pending -> Processing, admitted only while fewer than `item_concurrency`
    /// items of the experiment are Processing.
    pub fn claim_item(
        &self,
        expt_id: ExptId,
        item_id: ItemId,
        run_id: RunId,
        item_concurrency: u32,
    ) -> anyhow::Result<ClaimOutcome> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let state = match item_state_tx(&tx, expt_id, item_id)? {
            None => return Ok(ClaimOutcome::Missing),
            Some((s, _)) => s,
        };
        if state != RunState::Pending {
            return Ok(ClaimOutcome::NotPending(state));
        }
        let processing: i64 = tx.query_row(
            "SELECT processing_cnt FROM expt_stats WHERE expt_id = ?1",
            params![expt_id],
            |r| r.get(0),
        )?;
        if processing >= item_concurrency as i64 {
            return Ok(ClaimOutcome::AtCapacity);
        }
        let now = now_ms();
        tx.execute(
            "UPDATE item_results SET run_state = 'processing', run_id = ?1, updated_at = ?2
             WHERE expt_id = ?3 AND item_id = ?4 AND run_state = 'pending'",
            params![run_id, now, expt_id, item_id],
        )?;
        log_transition_tx(&tx, expt_id, item_id, Some(run_id), RunState::Pending, RunState::Processing, now)?;
        incr_stats_tx(&tx, expt_id, StatsDelta::transition(RunState::Pending, RunState::Processing))?;
        let item = tx.query_row(
            &format!("SELECT {} FROM item_results WHERE expt_id = ?1 AND item_id = ?2", ITEM_COLS),
            params![expt_id, item_id],
            row_to_item,
        )?;
        tx.commit()?;
        Ok(ClaimOutcome::Claimed(item))
    }

    /// CAS `from -> to` on an item row, with history and stats in the same transaction.
    pub fn transition_item(
        &self,
        expt_id: ExptId,
        item_id: ItemId,
        from: RunState,
        to: RunState,
        error: Option<&ErrorDetail>,
    ) -> anyhow::Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let run_id = match item_state_tx(&tx, expt_id, item_id)? {
            Some((s, run)) if s == from => run,
            _ => return Ok(false),
        };
        let now = now_ms();
        let err_json = match error {
            Some(e) => Some(to_json(e)?),
            None => None,
        };
        tx.execute(
            "UPDATE item_results SET run_state = ?1, error_json = ?2, updated_at = ?3
             WHERE expt_id = ?4 AND item_id = ?5 AND run_state = ?6",
            params![to.as_str(), err_json, now, expt_id, item_id, from.as_str()],
        )?;
        log_transition_tx(&tx, expt_id, item_id, run_id, from, to, now)?;
        incr_stats_tx(&tx, expt_id, StatsDelta::transition(from, to))?;
        tx.commit()?;
        Ok(true)
    }

    /// Processing -> Failed -> Pending in one step, keeping both history rows.
    pub fn fail_item_for_retry(
        &self,
        expt_id: ExptId,
        item_id: ItemId,
        error: &ErrorDetail,
        retry_count: u32,
    ) -> anyhow::Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let run_id = match item_state_tx(&tx, expt_id, item_id)? {
            Some((RunState::Processing, run)) => run,
            _ => return Ok(false),
        };
        let now = now_ms();
        tx.execute(
            "UPDATE item_results SET run_state = 'pending', error_json = ?1, retry_count = ?2, updated_at = ?3
             WHERE expt_id = ?4 AND item_id = ?5 AND run_state = 'processing'",
            params![to_json(error)?, retry_count, now, expt_id, item_id],
        )?;
        log_transition_tx(&tx, expt_id, item_id, run_id, RunState::Processing, RunState::Failed, now)?;
        log_transition_tx(&tx, expt_id, item_id, run_id, RunState::Failed, RunState::Pending, now)?;
        incr_stats_tx(&tx, expt_id, StatsDelta::transition(RunState::Processing, RunState::Pending))?;
        tx.commit()?;
        Ok(true)
    }

    /// Returns a claimed item to Pending after an unhandled worker error.
    pub fn release_claim(&self, expt_id: ExptId, item_id: ItemId) -> anyhow::Result<bool> {
        self.transition_item(expt_id, item_id, RunState::Processing, RunState::Pending, None)
    }

    pub fn item_history(&self, expt_id: ExptId, item_id: ItemId) -> anyhow::Result<Vec<ItemTransition>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT expt_id, item_id, run_id, from_state, to_state, at FROM item_run_logs
             WHERE expt_id = ?1 AND item_id = ?2 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![expt_id, item_id], |r| {
            Ok(ItemTransition {
                expt_id: r.get(0)?,
                item_id: r.get(1)?,
                run_id: r.get(2)?,
                from: parse_col(3, &r.get::<_, String>(3)?, RunState::parse)?,
                to: parse_col(4, &r.get::<_, String>(4)?, RunState::parse)?,
                at: r.get(5)?,
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Writes a turn row and its token delta, only while the item is still
    /// Processing under the same run. Returns false when the claim was lost.
    pub fn upsert_turn_result(&self, t: &TurnResult, tokens: StatsDelta) -> anyhow::Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        match item_state_tx(&tx, t.expt_id, t.item_id)? {
            Some((RunState::Processing, Some(run))) if run == t.run_id => {}
            _ => return Ok(false),
        }
        let space_id: SpaceId = tx.query_row(
            "SELECT space_id FROM item_results WHERE expt_id = ?1 AND item_id = ?2",
            params![t.expt_id, t.item_id],
            |r| r.get(0),
        )?;
        let target_err = match &t.target_error {
            Some(e) => Some(to_json(e)?),
            None => None,
        };
        tx.execute(
            "INSERT INTO turn_results (expt_id, item_id, turn_id, turn_idx, space_id, run_id, status,
                target_record_id, target_error_json, evaluator_results_json, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(expt_id, item_id, turn_id) DO UPDATE SET
                turn_idx = excluded.turn_idx, run_id = excluded.run_id, status = excluded.status,
                target_record_id = excluded.target_record_id, target_error_json = excluded.target_error_json,
                evaluator_results_json = excluded.evaluator_results_json, updated_at = excluded.updated_at",
            params![
                t.expt_id,
                t.item_id,
                t.turn_id,
                t.turn_idx,
                space_id,
                t.run_id,
                t.status.as_str(),
                t.target_output_ref,
                target_err,
                to_json(&t.evaluator_results)?,
                t.updated_at
            ],
        )?;
        incr_stats_tx(&tx, t.expt_id, tokens)?;
        tx.commit()?;
        Ok(true)
    }

    pub fn get_turn_results(&self, expt_id: ExptId, item_id: ItemId) -> anyhow::Result<Vec<TurnResult>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM turn_results WHERE expt_id = ?1 AND item_id = ?2 ORDER BY turn_idx",
            TURN_COLS
        ))?;
        let rows = stmt.query_map(params![expt_id, item_id], row_to_turn)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn get_turn_result(
        &self,
        expt_id: ExptId,
        item_id: ItemId,
        turn_id: TurnId,
    ) -> anyhow::Result<Option<TurnResult>> {
        let conn = self.lock()?;
        let r = conn
            .query_row(
                &format!(
                    "SELECT {} FROM turn_results WHERE expt_id = ?1 AND item_id = ?2 AND turn_id = ?3",
                    TURN_COLS
                ),
                params![expt_id, item_id, turn_id],
                row_to_turn,
            )
            .optional()?;
        Ok(r)
    }

    /// Keyset scan over turn rows ordered by `(item_id, turn_id)`.
    pub fn scan_turn_results(
        &self,
        expt_id: ExptId,
        after: Option<(ItemId, TurnId)>,
        limit: usize,
    ) -> anyhow::Result<Vec<TurnResult>> {
        let conn = self.lock()?;
        let (ai, at) = after.unwrap_or((i64::MIN, i64::MIN));
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM turn_results
             WHERE expt_id = ?1 AND (item_id > ?2 OR (item_id = ?2 AND turn_id > ?3))
             ORDER BY item_id, turn_id LIMIT ?4",
            TURN_COLS
        ))?;
        let rows = stmt.query_map(params![expt_id, ai, at, limit as i64], row_to_turn)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn count_turn_results(&self, expt_id: ExptId) -> anyhow::Result<i64> {
        let conn = self.lock()?;
        let n = conn.query_row(
            "SELECT COUNT(*) FROM turn_results WHERE expt_id = ?1",
            params![expt_id],
            |r| r.get(0),
        )?;
        Ok(n)
    }

    /// Replaces one evaluator cell in a stored turn row.
    pub fn update_turn_cell(
        &self,
        expt_id: ExptId,
        item_id: ItemId,
        turn_id: TurnId,
        evaluator_version_id: EvaluatorVersionId,
        cell: &EvaluatorCell,
    ) -> anyhow::Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let current: Option<String> = tx
            .query_row(
                "SELECT evaluator_results_json FROM turn_results
                 WHERE expt_id = ?1 AND item_id = ?2 AND turn_id = ?3",
                params![expt_id, item_id, turn_id],
                |r| r.get(0),
            )
            .optional()?;
        let Some(current) = current else {
            return Ok(false);
        };
        let mut cells: BTreeMap<EvaluatorVersionId, EvaluatorCell> = from_json(0, &current)?;
        if !cells.contains_key(&evaluator_version_id) {
            return Ok(false);
        }
        cells.insert(evaluator_version_id, cell.clone());
        tx.execute(
            "UPDATE turn_results SET evaluator_results_json = ?1, updated_at = ?2
             WHERE expt_id = ?3 AND item_id = ?4 AND turn_id = ?5",
            params![to_json(&cells)?, now_ms(), expt_id, item_id, turn_id],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Moves Processing items untouched since `before_ms` to `to`; returns their ids.
    pub fn reap_stale_items(&self, expt_id: ExptId, before_ms: i64, to: RunState) -> anyhow::Result<Vec<ItemId>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let now = now_ms();
        let stale: Vec<ItemId> = {
            let mut stmt = tx.prepare(
                "SELECT item_id FROM item_results
                 WHERE expt_id = ?1 AND run_state = 'processing' AND updated_at < ?2",
            )?;
            let rows = stmt.query_map(params![expt_id, before_ms], |r| r.get(0))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        if stale.is_empty() {
            return Ok(stale);
        }
        tx.execute(
            "INSERT INTO item_run_logs (expt_id, item_id, run_id, from_state, to_state, at)
             SELECT expt_id, item_id, run_id, run_state, ?1, ?2 FROM item_results
             WHERE expt_id = ?3 AND run_state = 'processing' AND updated_at < ?4",
            params![to.as_str(), now, expt_id, before_ms],
        )?;
        tx.execute(
            "UPDATE item_results SET run_state = ?1, updated_at = ?2
             WHERE expt_id = ?3 AND run_state = 'processing' AND updated_at < ?4",
            params![to.as_str(), now, expt_id, before_ms],
        )?;
        recount_stats_tx(&tx, expt_id, now)?;
        tx.commit()?;
        Ok(stale)
    }

    /// Touches a Processing item so the reaper leaves it alone.
    pub fn heartbeat_item(&self, expt_id: ExptId, item_id: ItemId) -> anyhow::Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE item_results SET updated_at = ?1
             WHERE expt_id = ?2 AND item_id = ?3 AND run_state = 'processing'",
            params![now_ms(), expt_id, item_id],
        )?;
        Ok(())
    }

    pub fn get_stats(&self, expt_id: ExptId) -> anyhow::Result<Option<ExptStats>> {
        let conn = self.lock()?;
        let s = conn
            .query_row(
                &format!("SELECT {} FROM expt_stats WHERE expt_id = ?1", STATS_COLS),
                params![expt_id],
                row_to_stats,
            )
            .optional()?;
        Ok(s)
    }

    pub fn mget_stats(&self, ids: &[ExptId]) -> anyhow::Result<Vec<ExptStats>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM expt_stats WHERE expt_id IN ({})",
            STATS_COLS,
            placeholders(ids.len())
        ))?;
        let args: Vec<Value> = ids.iter().map(|i| Value::Integer(*i)).collect();
        let rows = stmt.query_map(params_from_iter(args), row_to_stats)?;
        let mut found = Vec::new();
        for r in rows {
            found.push(r?);
        }
        Ok(ids
            .iter()
            .filter_map(|id| found.iter().find(|s| s.expt_id == *id).cloned())
            .collect())
    }

    pub fn upsert_aggregate(
        &self,
        expt_id: ExptId,
        space_id: SpaceId,
        evaluator_version_id: EvaluatorVersionId,
        results: &[AggregatorResult],
    ) -> anyhow::Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO expt_aggr_results (expt_id, evaluator_version_id, space_id, results_json, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(expt_id, evaluator_version_id) DO UPDATE SET
                results_json = excluded.results_json, updated_at = excluded.updated_at",
            params![expt_id, evaluator_version_id, space_id, to_json(&results)?, now_ms()],
        )?;
        Ok(())
    }

    pub fn get_aggregates(&self, expt_id: ExptId) -> anyhow::Result<Vec<ExptAggregateResult>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT expt_id, evaluator_version_id, results_json, updated_at FROM expt_aggr_results
             WHERE expt_id = ?1 ORDER BY evaluator_version_id",
        )?;
        let rows = stmt.query_map(params![expt_id], |r| {
            Ok(ExptAggregateResult {
                expt_id: r.get(0)?,
                evaluator_version_id: r.get(1)?,
                results: from_json(2, &r.get::<_, String>(2)?)?,
                updated_at: r.get(3)?,
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Experiment, ExptStatus, ExptType, SourceType};
    use crate::storage::StatusTransition;

    fn expt(id: ExptId) -> Experiment {
        Experiment {
            id,
            space_id: 1,
            name: format!("e{}", id),
            description: String::new(),
            created_by: "u".into(),
            status: ExptStatus::Pending,
            status_message: None,
            expt_type: ExptType::Offline,
            source_type: SourceType::Evaluation,
            source_id: None,
            max_alive_time_ms: 0,
            item_concurrency: 1,
            evaluator_concurrency: 1,
            eval_set_id: 1,
            eval_set_version_id: 1,
            target_id: None,
            target_version_id: None,
            evaluator_version_ids: vec![7],
            target_field_mapping: Default::default(),
            evaluator_field_mapping: vec![],
            latest_run_id: None,
            start_at: None,
            end_at: None,
            created_at: 0,
            updated_at: 0,
            version: 1,
            deleted: false,
        }
    }

    fn store_with(items: &[ItemId]) -> Store {
        let store = Store::memory_with_schema().unwrap();
        store.insert_experiment(&expt(1), &[], items).unwrap();
        store
    }

    #[test]
    fn test_claim_respects_concurrency() {
        let store = store_with(&[10, 11]);
        assert!(matches!(
            store.claim_item(1, 10, 5, 1).unwrap(),
            ClaimOutcome::Claimed(_)
        ));
        assert_eq!(store.claim_item(1, 11, 5, 1).unwrap(), ClaimOutcome::AtCapacity);
        assert_eq!(
            store.claim_item(1, 10, 5, 1).unwrap(),
            ClaimOutcome::NotPending(RunState::Processing)
        );
        assert_eq!(store.claim_item(1, 99, 5, 1).unwrap(), ClaimOutcome::Missing);

        let stats = store.get_stats(1).unwrap().unwrap();
        assert_eq!(stats.processing_cnt, 1);
        assert_eq!(stats.pending_cnt, 1);
        assert_eq!(stats.total_cnt, 2);
    }

    #[test]
    fn test_turn_write_requires_live_claim() {
        let store = store_with(&[10]);
        let mut turn = TurnResult {
            expt_id: 1,
            item_id: 10,
            turn_id: 100,
            turn_idx: 0,
            run_id: 5,
            status: RunState::Success,
            target_output_ref: None,
            target_error: None,
            evaluator_results: BTreeMap::new(),
            updated_at: 0,
        };
        assert!(!store.upsert_turn_result(&turn, StatsDelta::default()).unwrap());

        store.claim_item(1, 10, 5, 4).unwrap();
        assert!(store.upsert_turn_result(&turn, StatsDelta::tokens(3, 4)).unwrap());
        turn.run_id = 6;
        assert!(!store.upsert_turn_result(&turn, StatsDelta::default()).unwrap());

        let stats = store.get_stats(1).unwrap().unwrap();
        assert_eq!((stats.input_tokens, stats.output_tokens), (3, 4));
        assert_eq!(store.count_turn_results(1).unwrap(), 1);
    }

    #[test]
    fn test_retry_fail_records_both_transitions() {
        let store = store_with(&[10]);
        store.claim_item(1, 10, 5, 4).unwrap();
        let err = ErrorDetail::new(crate::errors::ErrorKind::UpstreamUnavailable, "llm down");
        assert!(store.fail_item_for_retry(1, 10, &err, 1).unwrap());

        let hist: Vec<(RunState, RunState)> = store
            .item_history(1, 10)
            .unwrap()
            .into_iter()
            .map(|t| (t.from, t.to))
            .collect();
        assert_eq!(
            hist,
            vec![
                (RunState::Pending, RunState::Processing),
                (RunState::Processing, RunState::Failed),
                (RunState::Failed, RunState::Pending),
            ]
        );
        let item = store.get_item_result(1, 10).unwrap().unwrap();
        assert_eq!(item.run_state, RunState::Pending);
        assert_eq!(item.retry_count, 1);
    }

    #[test]
    fn test_terminal_transition_terminates_unfinished_items() {
        let store = store_with(&[10, 11, 12]);
        store.claim_item(1, 10, 5, 4).unwrap();
        store
            .transition_item(1, 10, RunState::Processing, RunState::Success, None)
            .unwrap();
        store.claim_item(1, 11, 5, 4).unwrap();

        let e = store.get_experiment(1).unwrap().unwrap();
        assert!(store
            .apply_status_transition(&StatusTransition::new(&e, ExptStatus::Terminated))
            .unwrap());
        // stale version loses
        assert!(!store
            .apply_status_transition(&StatusTransition::new(&e, ExptStatus::Success))
            .unwrap());

        let s = store.get_stats(1).unwrap().unwrap();
        assert_eq!(s.success_cnt, 1);
        assert_eq!(s.terminated_cnt, 2);
        assert_eq!(s.pending_cnt + s.processing_cnt, 0);
        assert_eq!(s.counted(), s.total_cnt);
    }

    #[test]
    fn test_scan_is_keyset_ordered() {
        let store = store_with(&[10, 11]);
        for item in [10, 11] {
            store.claim_item(1, item, 5, 4).unwrap();
            for turn in [2, 1] {
                let t = TurnResult {
                    expt_id: 1,
                    item_id: item,
                    turn_id: turn,
                    turn_idx: 0,
                    run_id: 5,
                    status: RunState::Success,
                    target_output_ref: None,
                    target_error: None,
                    evaluator_results: BTreeMap::new(),
                    updated_at: 0,
                };
                store.upsert_turn_result(&t, StatsDelta::default()).unwrap();
            }
        }
        let first = store.scan_turn_results(1, None, 3).unwrap();
        let keys: Vec<_> = first.iter().map(|t| (t.item_id, t.turn_id)).collect();
        assert_eq!(keys, vec![(10, 1), (10, 2), (11, 1)]);
        let rest = store.scan_turn_results(1, Some((11, 1)), 3).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!((rest[0].item_id, rest[0].turn_id), (11, 2));
    }

    #[test]
    fn test_item_pages_follow_dataset_order() {
        let store = store_with(&[30, 10, 20]);
        let first = store.page_item_results(1, None, 2).unwrap();
        let ids: Vec<_> = first.iter().map(|i| i.item_id).collect();
        assert_eq!(ids, vec![30, 10]);
        let rest = store.page_item_results(1, Some(first[1].item_idx), 2).unwrap();
        assert_eq!(rest.iter().map(|i| i.item_id).collect::<Vec<_>>(), vec![20]);
    }
}
