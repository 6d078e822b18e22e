use super::store::{from_json, opt_from_json, parse_col, placeholders, to_json, Store};
use crate::errors::EvalError;
use crate::model::{
    now_ms, EvalMode, Experiment, ExptId, ExptStatus, ExptType, ItemId, RunId, RunLog, RunState,
    SourceType, SpaceId,
};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, OptionalExtension, Row, Transaction};
use serde::{Deserialize, Serialize};

pub(crate) const EXPT_COLS: &str = "id, space_id, name, description, created_by, status, status_message,
    expt_type, source_type, source_id, max_alive_time_ms, item_concurrency, evaluator_concurrency,
    eval_set_id, eval_set_version_id, target_id, target_version_id, evaluator_version_ids_json,
    target_field_mapping_json, evaluator_field_mapping_json, latest_run_id, start_at, end_at,
    created_at, updated_at, version, deleted_at";

fn row_to_experiment(row: &Row<'_>) -> rusqlite::Result<Experiment> {
    let deleted_at: Option<i64> = row.get(26)?;
    Ok(Experiment {
        id: row.get(0)?,
        space_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        created_by: row.get(4)?,
        status: parse_col(5, &row.get::<_, String>(5)?, ExptStatus::parse)?,
        status_message: row.get(6)?,
        expt_type: parse_col(7, &row.get::<_, String>(7)?, ExptType::parse)?,
        source_type: parse_col(8, &row.get::<_, String>(8)?, SourceType::parse)?,
        source_id: row.get(9)?,
        max_alive_time_ms: row.get(10)?,
        item_concurrency: row.get(11)?,
        evaluator_concurrency: row.get(12)?,
        eval_set_id: row.get(13)?,
        eval_set_version_id: row.get(14)?,
        target_id: row.get(15)?,
        target_version_id: row.get(16)?,
        evaluator_version_ids: from_json(17, &row.get::<_, String>(17)?)?,
        target_field_mapping: from_json(18, &row.get::<_, String>(18)?)?,
        evaluator_field_mapping: from_json(19, &row.get::<_, String>(19)?)?,
        latest_run_id: row.get(20)?,
        start_at: row.get(21)?,
        end_at: row.get(22)?,
        created_at: row.get(23)?,
        updated_at: row.get(24)?,
        version: row.get(25)?,
        deleted: deleted_at.is_some(),
    })
}

fn row_to_run_log(row: &Row<'_>) -> rusqlite::Result<RunLog> {
    Ok(RunLog {
        expt_id: row.get(0)?,
        run_id: row.get(1)?,
        mode: parse_col(2, &row.get::<_, String>(2)?, EvalMode::parse)?,
        status: parse_col(3, &row.get::<_, String>(3)?, ExptStatus::parse)?,
        item_ids: from_json(4, &row.get::<_, String>(4)?)?,
        started_at: row.get(5)?,
        finished_at: row.get(6)?,
        message: row.get(7)?,
    })
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExptFilter {
    #[serde(default)]
    pub statuses: Vec<ExptStatus>,
    #[serde(default)]
    pub expt_type: Option<ExptType>,
    /// Case-sensitive substring match on the name.
    #[serde(default)]
    pub name_like: Option<String>,
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default)]
    pub eval_set_id: Option<i64>,
    #[serde(default)]
    pub target_id: Option<i64>,
    #[serde(default)]
    pub source_type: Option<SourceType>,
    #[serde(default)]
    pub source_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrderField {
    #[default]
    CreatedAt,
    Name,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct OrderBy {
    #[serde(default)]
    pub field: OrderField,
    #[serde(default)]
    pub asc: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 20,
        }
    }
}

/// Everything that happens atomically with an experiment status change.
#[derive(Debug, Clone)]
pub struct StatusTransition {
    pub expt_id: ExptId,
    pub expected_status: ExptStatus,
    pub expected_version: i64,
    pub to: ExptStatus,
    pub message: Option<String>,
    /// Appended run log; becomes `latest_run_id`.
    pub start_run: Option<RunLog>,
    /// Failed and Terminated items go back to Pending and lose their turn rows.
    pub reset_unsuccess_items: bool,
}

impl StatusTransition {
    pub fn new(expt: &Experiment, to: ExptStatus) -> Self {
        Self {
            expt_id: expt.id,
            expected_status: expt.status,
            expected_version: expt.version,
            to,
            message: None,
            start_run: None,
            reset_unsuccess_items: false,
        }
    }

    pub fn with_message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    pub fn with_run(mut self, log: RunLog) -> Self {
        self.start_run = Some(log);
        self
    }

    pub fn resetting_unsuccess(mut self) -> Self {
        self.reset_unsuccess_items = true;
        self
    }
}

/// Evaluator reference as stored next to an experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvaluatorLink {
    pub evaluator_id: i64,
    pub evaluator_version_id: i64,
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _) if f.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

impl Store {
    /// Persists a Pending experiment together with its refs, an initial stats row
    /// and one Pending item row per dataset item.
    pub fn insert_experiment(
        &self,
        e: &Experiment,
        refs: &[EvaluatorLink],
        items: &[ItemId],
    ) -> anyhow::Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let res = tx.execute(
            &format!(
                "INSERT INTO experiments ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12,
                 ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, NULL)",
                EXPT_COLS
            ),
            params![
                e.id,
                e.space_id,
                e.name,
                e.description,
                e.created_by,
                e.status.as_str(),
                e.status_message,
                e.expt_type.as_str(),
                e.source_type.as_str(),
                e.source_id,
                e.max_alive_time_ms,
                e.item_concurrency,
                e.evaluator_concurrency,
                e.eval_set_id,
                e.eval_set_version_id,
                e.target_id,
                e.target_version_id,
                to_json(&e.evaluator_version_ids)?,
                to_json(&e.target_field_mapping)?,
                to_json(&e.evaluator_field_mapping)?,
                e.latest_run_id,
                e.start_at,
                e.end_at,
                e.created_at,
                e.updated_at,
                e.version,
            ],
        );
        if let Err(err) = res {
            if is_unique_violation(&err) {
                return Err(EvalError::NameExists(e.name.clone()).into());
            }
            return Err(err.into());
        }

        for r in refs {
            tx.execute(
                "INSERT INTO expt_evaluator_refs (expt_id, space_id, evaluator_id, evaluator_version_id)
                 VALUES (?1, ?2, ?3, ?4)",
                params![e.id, e.space_id, r.evaluator_id, r.evaluator_version_id],
            )?;
        }

        tx.execute(
            "INSERT INTO expt_stats (expt_id, space_id, pending_cnt, total_cnt, updated_at)
             VALUES (?1, ?2, 0, 0, ?3)",
            params![e.id, e.space_id, e.created_at],
        )?;
        insert_items_tx(&tx, e.id, e.space_id, items, 0)?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_experiment(&self, id: ExptId) -> anyhow::Result<Option<Experiment>> {
        let conn = self.lock()?;
        let e = conn
            .query_row(
                &format!("SELECT {} FROM experiments WHERE id = ?1", EXPT_COLS),
                params![id],
                row_to_experiment,
            )
            .optional()?;
        Ok(e)
    }

    /// Live (not soft-deleted) experiments of a space, in request order.
    pub fn mget_experiments(&self, space_id: SpaceId, ids: &[ExptId]) -> anyhow::Result<Vec<Experiment>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM experiments WHERE space_id = ? AND deleted_at IS NULL AND id IN ({})",
            EXPT_COLS,
            placeholders(ids.len())
        );
        let mut args: Vec<Value> = vec![Value::Integer(space_id)];
        args.extend(ids.iter().map(|i| Value::Integer(*i)));
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), row_to_experiment)?;
        let mut found = Vec::new();
        for r in rows {
            found.push(r?);
        }
        let mut out = Vec::with_capacity(found.len());
        for id in ids {
            if let Some(e) = found.iter().find(|e| e.id == *id) {
                out.push(e.clone());
            }
        }
        Ok(out)
    }

    pub fn experiment_name_exists(
        &self,
        space_id: SpaceId,
        name: &str,
        exclude: Option<ExptId>,
    ) -> anyhow::Result<bool> {
        let conn = self.lock()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM experiments
             WHERE space_id = ?1 AND name = ?2 AND deleted_at IS NULL AND id != ?3",
            params![space_id, name, exclude.unwrap_or(-1)],
            |r| r.get(0),
        )?;
        Ok(n > 0)
    }

    pub fn list_experiments(
        &self,
        space_id: SpaceId,
        filter: &ExptFilter,
        order: OrderBy,
        page: Page,
    ) -> anyhow::Result<(Vec<Experiment>, i64)> {
        let mut clauses = vec!["space_id = ?".to_string(), "deleted_at IS NULL".to_string()];
        let mut args: Vec<Value> = vec![Value::Integer(space_id)];
        if !filter.statuses.is_empty() {
            clauses.push(format!("status IN ({})", placeholders(filter.statuses.len())));
            args.extend(filter.statuses.iter().map(|s| Value::Text(s.as_str().into())));
        }
        if let Some(t) = filter.expt_type {
            clauses.push("expt_type = ?".into());
            args.push(Value::Text(t.as_str().into()));
        }
        if let Some(n) = filter.name_like.as_deref().filter(|n| !n.is_empty()) {
            clauses.push("instr(name, ?) > 0".into());
            args.push(Value::Text(n.into()));
        }
        if let Some(c) = &filter.created_by {
            clauses.push("created_by = ?".into());
            args.push(Value::Text(c.clone()));
        }
        if let Some(id) = filter.eval_set_id {
            clauses.push("eval_set_id = ?".into());
            args.push(Value::Integer(id));
        }
        if let Some(id) = filter.target_id {
            clauses.push("target_id = ?".into());
            args.push(Value::Integer(id));
        }
        if let Some(st) = filter.source_type {
            clauses.push("source_type = ?".into());
            args.push(Value::Text(st.as_str().into()));
        }
        if let Some(sid) = &filter.source_id {
            clauses.push("source_id = ?".into());
            args.push(Value::Text(sid.clone()));
        }
        let where_sql = clauses.join(" AND ");
        let order_sql = match (order.field, order.asc) {
            (OrderField::CreatedAt, true) => "created_at ASC, id ASC",
            (OrderField::CreatedAt, false) => "created_at DESC, id DESC",
            (OrderField::Name, true) => "name ASC, id ASC",
            (OrderField::Name, false) => "name DESC, id DESC",
        };

        let conn = self.lock()?;
        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM experiments WHERE {}", where_sql),
            params_from_iter(args.clone()),
            |r| r.get(0),
        )?;
        args.push(Value::Integer(page.limit as i64));
        args.push(Value::Integer(page.offset as i64));
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM experiments WHERE {} ORDER BY {} LIMIT ? OFFSET ?",
            EXPT_COLS, where_sql, order_sql
        ))?;
        let rows = stmt.query_map(params_from_iter(args), row_to_experiment)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok((out, total))
    }

    /// Ids of live experiments in the given statuses, across all spaces.
    pub fn experiments_in_status(&self, statuses: &[ExptStatus]) -> anyhow::Result<Vec<Experiment>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM experiments WHERE deleted_at IS NULL AND status IN ({}) ORDER BY id",
            EXPT_COLS,
            placeholders(statuses.len())
        ))?;
        let args: Vec<Value> = statuses.iter().map(|s| Value::Text(s.as_str().into())).collect();
        let rows = stmt.query_map(params_from_iter(args), row_to_experiment)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// CAS on `version`; returns false when another writer got there first.
    pub fn update_experiment_meta(
        &self,
        id: ExptId,
        expected_version: i64,
        name: Option<&str>,
        description: Option<&str>,
    ) -> anyhow::Result<bool> {
        let conn = self.lock()?;
        let res = conn.execute(
            "UPDATE experiments
             SET name = COALESCE(?1, name), description = COALESCE(?2, description),
                 version = version + 1, updated_at = ?3
             WHERE id = ?4 AND version = ?5 AND deleted_at IS NULL",
            params![name, description, now_ms(), id, expected_version],
        );
        match res {
            Ok(n) => Ok(n == 1),
            Err(err) if is_unique_violation(&err) => {
                Err(EvalError::NameExists(name.unwrap_or_default().to_string()).into())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Tombstones experiments; returns the ids that were live.
    pub fn soft_delete_experiments(&self, space_id: SpaceId, ids: &[ExptId]) -> anyhow::Result<Vec<ExptId>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let now = now_ms();
        let mut deleted = Vec::new();
        for id in ids {
            let n = tx.execute(
                "UPDATE experiments SET deleted_at = ?1, version = version + 1, updated_at = ?1
                 WHERE id = ?2 AND space_id = ?3 AND deleted_at IS NULL",
                params![now, id, space_id],
            )?;
            if n == 1 {
                deleted.push(*id);
            }
        }
        tx.commit()?;
        Ok(deleted)
    }

    pub fn deleted_experiments(&self, before_ms: i64, limit: usize) -> anyhow::Result<Vec<ExptId>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id FROM experiments WHERE deleted_at IS NOT NULL AND deleted_at <= ?1
             ORDER BY deleted_at LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![before_ms, limit as i64], |r| r.get(0))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Removes a tombstoned experiment and every row it owns.
    pub fn purge_experiment(&self, id: ExptId) -> anyhow::Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let live: Option<Option<i64>> = tx
            .query_row("SELECT deleted_at FROM experiments WHERE id = ?1", params![id], |r| r.get(0))
            .optional()?;
        if !matches!(live, Some(Some(_))) {
            return Ok(false);
        }
        for table in [
            "expt_evaluator_refs",
            "expt_run_logs",
            "item_results",
            "item_run_logs",
            "turn_results",
            "expt_stats",
            "expt_aggr_results",
            "evaluator_records",
            "target_records",
            "quota_holders",
        ] {
            tx.execute(&format!("DELETE FROM {} WHERE expt_id = ?1", table), params![id])?;
        }
        tx.execute("DELETE FROM experiments WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(true)
    }

    pub fn evaluator_links(&self, expt_id: ExptId) -> anyhow::Result<Vec<EvaluatorLink>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT evaluator_id, evaluator_version_id FROM expt_evaluator_refs
             WHERE expt_id = ?1 ORDER BY rowid",
        )?;
        let rows = stmt.query_map(params![expt_id], |r| {
            Ok(EvaluatorLink {
                evaluator_id: r.get(0)?,
                evaluator_version_id: r.get(1)?,
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Applies a status CAS plus its side effects in one transaction.
    /// Returns false (and writes nothing) when the expected status/version no longer match.
    pub fn apply_status_transition(&self, t: &StatusTransition) -> anyhow::Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let now = now_ms();
        let n = tx.execute(
            "UPDATE experiments SET status = ?1, status_message = ?2, version = version + 1, updated_at = ?3
             WHERE id = ?4 AND status = ?5 AND version = ?6 AND deleted_at IS NULL",
            params![
                t.to.as_str(),
                t.message,
                now,
                t.expt_id,
                t.expected_status.as_str(),
                t.expected_version
            ],
        )?;
        if n == 0 {
            return Ok(false);
        }

        let space_id: SpaceId = tx.query_row(
            "SELECT space_id FROM experiments WHERE id = ?1",
            params![t.expt_id],
            |r| r.get(0),
        )?;

        if t.reset_unsuccess_items {
            reset_unsuccess_items_tx(&tx, t.expt_id, now)?;
        }

        if let Some(log) = &t.start_run {
            tx.execute(
                "INSERT INTO expt_run_logs (expt_id, run_id, space_id, mode, status, item_ids_json, started_at, message)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    t.expt_id,
                    log.run_id,
                    space_id,
                    log.mode.as_str(),
                    log.status.as_str(),
                    to_json(&log.item_ids)?,
                    log.started_at,
                    log.message
                ],
            )?;
            tx.execute(
                "UPDATE experiments SET latest_run_id = ?1, start_at = ?2, end_at = NULL WHERE id = ?3",
                params![log.run_id, log.started_at, t.expt_id],
            )?;
        }

        if t.to.is_terminal() {
            terminate_unfinished_items_tx(&tx, t.expt_id, now)?;
            tx.execute(
                "UPDATE experiments SET end_at = ?1 WHERE id = ?2",
                params![now, t.expt_id],
            )?;
            tx.execute(
                "UPDATE expt_run_logs SET status = ?1, finished_at = ?2, message = COALESCE(?3, message)
                 WHERE expt_id = ?4 AND finished_at IS NULL",
                params![t.to.as_str(), now, t.message, t.expt_id],
            )?;
        } else if t.to == ExptStatus::Processing {
            tx.execute(
                "UPDATE expt_run_logs SET status = ?1 WHERE expt_id = ?2 AND finished_at IS NULL",
                params![t.to.as_str(), t.expt_id],
            )?;
        }

        tx.commit()?;
        Ok(true)
    }

    pub fn get_run_log(&self, expt_id: ExptId, run_id: RunId) -> anyhow::Result<Option<RunLog>> {
        let conn = self.lock()?;
        let log = conn
            .query_row(
                "SELECT expt_id, run_id, mode, status, item_ids_json, started_at, finished_at, message
                 FROM expt_run_logs WHERE expt_id = ?1 AND run_id = ?2",
                params![expt_id, run_id],
                row_to_run_log,
            )
            .optional()?;
        Ok(log)
    }

    pub fn list_run_logs(&self, expt_id: ExptId) -> anyhow::Result<Vec<RunLog>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT expt_id, run_id, mode, status, item_ids_json, started_at, finished_at, message
             FROM expt_run_logs WHERE expt_id = ?1 ORDER BY run_id",
        )?;
        let rows = stmt.query_map(params![expt_id], row_to_run_log)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Adds item ids to the open run log of an experiment (online Invoke).
    pub fn append_run_items(&self, expt_id: ExptId, run_id: RunId, items: &[ItemId]) -> anyhow::Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let current: Option<String> = tx
            .query_row(
                "SELECT item_ids_json FROM expt_run_logs WHERE expt_id = ?1 AND run_id = ?2",
                params![expt_id, run_id],
                |r| r.get(0),
            )
            .optional()?;
        let mut ids: Vec<ItemId> = opt_from_json(0, current)?.unwrap_or_default();
        for i in items {
            if !ids.contains(i) {
                ids.push(*i);
            }
        }
        tx.execute(
            "UPDATE expt_run_logs SET item_ids_json = ?1 WHERE expt_id = ?2 AND run_id = ?3",
            params![to_json(&ids)?, expt_id, run_id],
        )?;
        tx.commit()?;
        Ok(())
    }
}

/// Inserts Pending item rows, skipping ones that already exist, and bumps the stats
/// totals by the number actually inserted.
pub(crate) fn insert_items_tx(
    tx: &Transaction<'_>,
    expt_id: ExptId,
    space_id: SpaceId,
    items: &[ItemId],
    start_idx: i64,
) -> anyhow::Result<usize> {
    let now = now_ms();
    let mut inserted = 0usize;
    for (i, item_id) in items.iter().enumerate() {
        inserted += tx.execute(
            "INSERT OR IGNORE INTO item_results (expt_id, space_id, item_id, item_idx, run_state, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                expt_id,
                space_id,
                item_id,
                start_idx + i as i64,
                RunState::Pending.as_str(),
                now
            ],
        )?;
    }
    if inserted > 0 {
        tx.execute(
            "UPDATE expt_stats SET pending_cnt = pending_cnt + ?1, total_cnt = total_cnt + ?1, updated_at = ?2
             WHERE expt_id = ?3",
            params![inserted as i64, now, expt_id],
        )?;
    }
    Ok(inserted)
}

fn bulk_item_move_tx(
    tx: &Transaction<'_>,
    expt_id: ExptId,
    from: &[RunState],
    to: RunState,
    now: i64,
) -> anyhow::Result<usize> {
    let from_sql = placeholders(from.len());
    let mut args: Vec<Value> = vec![
        Value::Text(to.as_str().into()),
        Value::Integer(now),
        Value::Integer(expt_id),
    ];
    args.extend(from.iter().map(|s| Value::Text(s.as_str().into())));
    tx.execute(
        &format!(
            "INSERT INTO item_run_logs (expt_id, item_id, run_id, from_state, to_state, at)
             SELECT expt_id, item_id, run_id, run_state, ?1, ?2 FROM item_results
             WHERE expt_id = ?3 AND run_state IN ({})",
            from_sql
        ),
        params_from_iter(args.clone()),
    )?;
    let n = tx.execute(
        &format!(
            "UPDATE item_results SET run_state = ?1, updated_at = ?2
             WHERE expt_id = ?3 AND run_state IN ({})",
            from_sql
        ),
        params_from_iter(args),
    )?;
    Ok(n)
}

fn terminate_unfinished_items_tx(tx: &Transaction<'_>, expt_id: ExptId, now: i64) -> anyhow::Result<()> {
    let n = bulk_item_move_tx(
        tx,
        expt_id,
        &[RunState::Pending, RunState::Processing],
        RunState::Terminated,
        now,
    )?;
    if n > 0 {
        recount_stats_tx(tx, expt_id, now)?;
    }
    Ok(())
}

fn reset_unsuccess_items_tx(tx: &Transaction<'_>, expt_id: ExptId, now: i64) -> anyhow::Result<()> {
    tx.execute(
        "DELETE FROM turn_results WHERE expt_id = ?1 AND item_id IN (
            SELECT item_id FROM item_results WHERE expt_id = ?1 AND run_state IN ('failed', 'terminated'))",
        params![expt_id],
    )?;
    let n = bulk_item_move_tx(
        tx,
        expt_id,
        &[RunState::Failed, RunState::Terminated],
        RunState::Pending,
        now,
    )?;
    tx.execute(
        "UPDATE item_results SET error_json = NULL, retry_count = 0
         WHERE expt_id = ?1 AND run_state = 'pending'",
        params![expt_id],
    )?;
    if n > 0 {
        recount_stats_tx(tx, expt_id, now)?;
    }
    Ok(())
}

/// Rebuilds state counters from item rows; token totals are left untouched.
pub(crate) fn recount_stats_tx(tx: &Transaction<'_>, expt_id: ExptId, now: i64) -> anyhow::Result<()> {
    tx.execute(
        "UPDATE expt_stats SET
            pending_cnt = (SELECT COUNT(*) FROM item_results WHERE expt_id = ?1 AND run_state = 'pending'),
            processing_cnt = (SELECT COUNT(*) FROM item_results WHERE expt_id = ?1 AND run_state = 'processing'),
            success_cnt = (SELECT COUNT(*) FROM item_results WHERE expt_id = ?1 AND run_state = 'success'),
            failed_cnt = (SELECT COUNT(*) FROM item_results WHERE expt_id = ?1 AND run_state = 'failed'),
            terminated_cnt = (SELECT COUNT(*) FROM item_results WHERE expt_id = ?1 AND run_state = 'terminated'),
            total_cnt = (SELECT COUNT(*) FROM item_results WHERE expt_id = ?1),
            updated_at = ?2
         WHERE expt_id = ?1",
        params![expt_id, now],
    )?;
    Ok(())
}
