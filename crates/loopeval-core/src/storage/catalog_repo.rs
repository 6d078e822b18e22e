use super::store::{from_json, opt_from_json, parse_col, placeholders, to_json, Store};
use crate::errors::EvalError;
use crate::evaluator::{Evaluator, EvaluatorKind, EvaluatorRecord, EvaluatorVersion};
use crate::model::{now_ms, EvaluatorId, EvaluatorVersionId, RecordId, RecordStatus, SpaceId, TargetId};
use crate::target::{EvalTarget, EvalTargetVersion, RecordScope, TargetKind, TargetRecord};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, OptionalExtension, Row};

const EVALUATOR_COLS: &str = "id, space_id, name, description, kind, draft_json, latest_version,
    created_by, created_at, updated_at, deleted_at";
const VERSION_COLS: &str = "v.id, v.evaluator_id, v.space_id, e.name, v.version, v.description,
    v.content_json, v.aggregators_json, v.value_set_json, v.content_hash, v.created_by, v.created_at";
const EVAL_RECORD_COLS: &str = "id, space_id, evaluator_version_id, expt_id, run_id, item_id, turn_id,
    input_json, output_json, status, error_json, correction_json, trace_id, created_by, created_at, updated_at";
const TARGET_VERSION_COLS: &str = "v.id, v.target_id, v.space_id, t.kind, t.source_id, v.source_version,
    v.config_json, v.source_info_json, v.created_at";
const TARGET_RECORD_COLS: &str = "id, space_id, target_id, target_version_id, expt_id, item_id, turn_id,
    input_json, output_json, status, error_json, latency_ms, trace_id, created_at";

fn row_to_evaluator(row: &Row<'_>) -> rusqlite::Result<Evaluator> {
    let deleted_at: Option<i64> = row.get(10)?;
    Ok(Evaluator {
        id: row.get(0)?,
        space_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        kind: parse_col(4, &row.get::<_, String>(4)?, EvaluatorKind::parse)?,
        draft: from_json(5, &row.get::<_, String>(5)?)?,
        latest_version: row.get(6)?,
        created_by: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
        deleted: deleted_at.is_some(),
    })
}

fn row_to_version(row: &Row<'_>) -> rusqlite::Result<EvaluatorVersion> {
    Ok(EvaluatorVersion {
        id: row.get(0)?,
        evaluator_id: row.get(1)?,
        space_id: row.get(2)?,
        name: row.get(3)?,
        version: row.get(4)?,
        description: row.get(5)?,
        content: from_json(6, &row.get::<_, String>(6)?)?,
        aggregators: from_json(7, &row.get::<_, String>(7)?)?,
        value_set: opt_from_json(8, row.get(8)?)?,
        content_hash: row.get(9)?,
        created_by: row.get(10)?,
        created_at: row.get(11)?,
    })
}

fn row_to_eval_record(row: &Row<'_>) -> rusqlite::Result<EvaluatorRecord> {
    Ok(EvaluatorRecord {
        id: row.get(0)?,
        space_id: row.get(1)?,
        evaluator_version_id: row.get(2)?,
        expt_id: row.get(3)?,
        run_id: row.get(4)?,
        item_id: row.get(5)?,
        turn_id: row.get(6)?,
        input: from_json(7, &row.get::<_, String>(7)?)?,
        output: opt_from_json(8, row.get(8)?)?,
        status: parse_col(9, &row.get::<_, String>(9)?, RecordStatus::parse)?,
        error: opt_from_json(10, row.get(10)?)?,
        correction: opt_from_json(11, row.get(11)?)?,
        trace_id: row.get(12)?,
        created_by: row.get(13)?,
        created_at: row.get(14)?,
        updated_at: row.get(15)?,
    })
}

fn row_to_target(row: &Row<'_>) -> rusqlite::Result<EvalTarget> {
    Ok(EvalTarget {
        id: row.get(0)?,
        space_id: row.get(1)?,
        kind: parse_col(2, &row.get::<_, String>(2)?, TargetKind::parse)?,
        source_id: row.get(3)?,
        created_by: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn row_to_target_version(row: &Row<'_>) -> rusqlite::Result<EvalTargetVersion> {
    Ok(EvalTargetVersion {
        id: row.get(0)?,
        target_id: row.get(1)?,
        space_id: row.get(2)?,
        kind: parse_col(3, &row.get::<_, String>(3)?, TargetKind::parse)?,
        source_id: row.get(4)?,
        source_version: row.get(5)?,
        config: from_json(6, &row.get::<_, String>(6)?)?,
        source_info: opt_from_json(7, row.get(7)?)?,
        created_at: row.get(8)?,
    })
}

fn row_to_target_record(row: &Row<'_>) -> rusqlite::Result<TargetRecord> {
    Ok(TargetRecord {
        id: row.get(0)?,
        space_id: row.get(1)?,
        target_id: row.get(2)?,
        target_version_id: row.get(3)?,
        scope: RecordScope {
            expt_id: row.get(4)?,
            item_id: row.get(5)?,
            turn_id: row.get(6)?,
        },
        input: from_json(7, &row.get::<_, String>(7)?)?,
        output: opt_from_json(8, row.get(8)?)?,
        status: parse_col(9, &row.get::<_, String>(9)?, RecordStatus::parse)?,
        error: opt_from_json(10, row.get(10)?)?,
        latency_ms: row.get(11)?,
        trace_id: row.get(12)?,
        created_at: row.get(13)?,
    })
}

fn collect<T>(rows: impl Iterator<Item = rusqlite::Result<T>>) -> anyhow::Result<Vec<T>> {
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

fn id_args(space_id: SpaceId, ids: &[i64]) -> Vec<Value> {
    let mut args = vec![Value::Integer(space_id)];
    args.extend(ids.iter().map(|i| Value::Integer(*i)));
    args
}

fn unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _) if f.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

impl Store {
    // ---- evaluators ----

    pub fn insert_evaluator(&self, e: &Evaluator) -> anyhow::Result<()> {
        let conn = self.lock()?;
        let res = conn.execute(
            "INSERT INTO evaluators (id, space_id, name, description, kind, draft_json, latest_version,
                created_by, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                e.id,
                e.space_id,
                e.name,
                e.description,
                e.kind.as_str(),
                to_json(&e.draft)?,
                e.latest_version,
                e.created_by,
                e.created_at,
                e.updated_at
            ],
        );
        match res {
            Ok(_) => Ok(()),
            Err(err) if unique_violation(&err) => Err(EvalError::NameExists(e.name.clone()).into()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn get_evaluator(&self, space_id: SpaceId, id: EvaluatorId) -> anyhow::Result<Option<Evaluator>> {
        let conn = self.lock()?;
        let r = conn
            .query_row(
                &format!(
                    "SELECT {} FROM evaluators WHERE space_id = ?1 AND id = ?2 AND deleted_at IS NULL",
                    EVALUATOR_COLS
                ),
                params![space_id, id],
                row_to_evaluator,
            )
            .optional()?;
        Ok(r)
    }

    pub fn mget_evaluators(&self, space_id: SpaceId, ids: &[EvaluatorId]) -> anyhow::Result<Vec<Evaluator>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM evaluators WHERE space_id = ? AND deleted_at IS NULL AND id IN ({}) ORDER BY id",
            EVALUATOR_COLS,
            placeholders(ids.len())
        ))?;
        let rows = stmt.query_map(params_from_iter(id_args(space_id, ids)), row_to_evaluator)?;
        collect(rows)
    }

    pub fn list_evaluators(
        &self,
        space_id: SpaceId,
        name_like: Option<&str>,
        kind: Option<EvaluatorKind>,
        offset: usize,
        limit: usize,
    ) -> anyhow::Result<(Vec<Evaluator>, i64)> {
        let conn = self.lock()?;
        let where_sql = "space_id = ?1 AND deleted_at IS NULL
            AND (?2 IS NULL OR instr(name, ?2) > 0) AND (?3 IS NULL OR kind = ?3)";
        let kind_s = kind.map(|k| k.as_str());
        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM evaluators WHERE {}", where_sql),
            params![space_id, name_like, kind_s],
            |r| r.get(0),
        )?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM evaluators WHERE {} ORDER BY updated_at DESC, id DESC LIMIT ?4 OFFSET ?5",
            EVALUATOR_COLS, where_sql
        ))?;
        let rows = stmt.query_map(
            params![space_id, name_like, kind_s, limit as i64, offset as i64],
            row_to_evaluator,
        )?;
        Ok((collect(rows)?, total))
    }

    pub fn evaluator_name_exists(
        &self,
        space_id: SpaceId,
        name: &str,
        exclude: Option<EvaluatorId>,
    ) -> anyhow::Result<bool> {
        let conn = self.lock()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM evaluators
             WHERE space_id = ?1 AND name = ?2 AND deleted_at IS NULL AND id != ?3",
            params![space_id, name, exclude.unwrap_or(-1)],
            |r| r.get(0),
        )?;
        Ok(n > 0)
    }

    /// Rewrites name, description and draft of a live evaluator.
    pub fn update_evaluator(&self, e: &Evaluator) -> anyhow::Result<bool> {
        let conn = self.lock()?;
        let res = conn.execute(
            "UPDATE evaluators SET name = ?1, description = ?2, draft_json = ?3, updated_at = ?4
             WHERE id = ?5 AND space_id = ?6 AND deleted_at IS NULL",
            params![
                e.name,
                e.description,
                to_json(&e.draft)?,
                e.updated_at,
                e.id,
                e.space_id
            ],
        );
        match res {
            Ok(n) => Ok(n == 1),
            Err(err) if unique_violation(&err) => Err(EvalError::NameExists(e.name.clone()).into()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn delete_evaluator(&self, space_id: SpaceId, id: EvaluatorId) -> anyhow::Result<bool> {
        let conn = self.lock()?;
        let n = conn.execute(
            "UPDATE evaluators SET deleted_at = ?1 WHERE id = ?2 AND space_id = ?3 AND deleted_at IS NULL",
            params![now_ms(), id, space_id],
        )?;
        Ok(n == 1)
    }

    /// Inserts an immutable version and advances the evaluator's `latest_version`.
    pub fn insert_evaluator_version(&self, v: &EvaluatorVersion) -> anyhow::Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let res = tx.execute(
            "INSERT INTO evaluator_versions (id, evaluator_id, space_id, version, description, content_json,
                aggregators_json, value_set_json, content_hash, created_by, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                v.id,
                v.evaluator_id,
                v.space_id,
                v.version,
                v.description,
                to_json(&v.content)?,
                to_json(&v.aggregators)?,
                match &v.value_set {
                    Some(vs) => Some(to_json(vs)?),
                    None => None,
                },
                v.content_hash,
                v.created_by,
                v.created_at
            ],
        );
        if let Err(err) = res {
            if unique_violation(&err) {
                return Err(EvalError::NameExists(format!("version {}", v.version)).into());
            }
            return Err(err.into());
        }
        tx.execute(
            "UPDATE evaluators SET latest_version = ?1, updated_at = ?2 WHERE id = ?3",
            params![v.version, v.created_at, v.evaluator_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Versions by id; versions of deleted evaluators still resolve.
    pub fn mget_evaluator_versions(
        &self,
        space_id: SpaceId,
        ids: &[EvaluatorVersionId],
    ) -> anyhow::Result<Vec<EvaluatorVersion>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM evaluator_versions v JOIN evaluators e ON e.id = v.evaluator_id
             WHERE v.space_id = ? AND v.id IN ({})",
            VERSION_COLS,
            placeholders(ids.len())
        ))?;
        let rows = stmt.query_map(params_from_iter(id_args(space_id, ids)), row_to_version)?;
        let found = collect(rows)?;
        Ok(ids
            .iter()
            .filter_map(|id| found.iter().find(|v| v.id == *id).cloned())
            .collect())
    }

    pub fn list_evaluator_versions(
        &self,
        space_id: SpaceId,
        evaluator_id: EvaluatorId,
    ) -> anyhow::Result<Vec<EvaluatorVersion>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM evaluator_versions v JOIN evaluators e ON e.id = v.evaluator_id
             WHERE v.space_id = ?1 AND v.evaluator_id = ?2 ORDER BY v.created_at DESC, v.id DESC",
            VERSION_COLS
        ))?;
        let rows = stmt.query_map(params![space_id, evaluator_id], row_to_version)?;
        collect(rows)
    }

    pub fn insert_evaluator_record(&self, r: &EvaluatorRecord) -> anyhow::Result<()> {
        let conn = self.lock()?;
        conn.execute(
            &format!(
                "INSERT INTO evaluator_records ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11,
                 ?12, ?13, ?14, ?15, ?16)",
                EVAL_RECORD_COLS
            ),
            params![
                r.id,
                r.space_id,
                r.evaluator_version_id,
                r.expt_id,
                r.run_id,
                r.item_id,
                r.turn_id,
                to_json(&r.input)?,
                match &r.output {
                    Some(o) => Some(to_json(o)?),
                    None => None,
                },
                r.status.as_str(),
                match &r.error {
                    Some(e) => Some(to_json(e)?),
                    None => None,
                },
                match &r.correction {
                    Some(c) => Some(to_json(c)?),
                    None => None,
                },
                r.trace_id,
                r.created_by,
                r.created_at,
                r.updated_at
            ],
        )?;
        Ok(())
    }

    pub fn update_evaluator_record_correction(&self, r: &EvaluatorRecord) -> anyhow::Result<bool> {
        let conn = self.lock()?;
        let n = conn.execute(
            "UPDATE evaluator_records SET correction_json = ?1, updated_at = ?2 WHERE id = ?3 AND space_id = ?4",
            params![
                match &r.correction {
                    Some(c) => Some(to_json(c)?),
                    None => None,
                },
                r.updated_at,
                r.id,
                r.space_id
            ],
        )?;
        Ok(n == 1)
    }

    pub fn mget_evaluator_records(
        &self,
        space_id: SpaceId,
        ids: &[RecordId],
    ) -> anyhow::Result<Vec<EvaluatorRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM evaluator_records WHERE space_id = ? AND id IN ({}) ORDER BY id",
            EVAL_RECORD_COLS,
            placeholders(ids.len())
        ))?;
        let rows = stmt.query_map(params_from_iter(id_args(space_id, ids)), row_to_eval_record)?;
        collect(rows)
    }

    // ---- targets ----

    /// Inserts the target if `(space, kind, source_id)` is new; returns the stored row either way.
    pub fn upsert_target(&self, t: &EvalTarget) -> anyhow::Result<EvalTarget> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO eval_targets (id, space_id, kind, source_id, created_by, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![t.id, t.space_id, t.kind.as_str(), t.source_id, t.created_by, t.created_at],
        )?;
        let row = conn.query_row(
            "SELECT id, space_id, kind, source_id, created_by, created_at FROM eval_targets
             WHERE space_id = ?1 AND kind = ?2 AND source_id = ?3",
            params![t.space_id, t.kind.as_str(), t.source_id],
            row_to_target,
        )?;
        Ok(row)
    }

    /// Inserts the version if `(target, source_version)` is new; returns the stored id.
    pub fn upsert_target_version(&self, v: &EvalTargetVersion) -> anyhow::Result<i64> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO eval_target_versions (id, target_id, space_id, source_version, config_json,
                source_info_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                v.id,
                v.target_id,
                v.space_id,
                v.source_version,
                to_json(&v.config)?,
                match &v.source_info {
                    Some(i) => Some(to_json(i)?),
                    None => None,
                },
                v.created_at
            ],
        )?;
        let id = conn.query_row(
            "SELECT id FROM eval_target_versions WHERE target_id = ?1 AND source_version = ?2",
            params![v.target_id, v.source_version],
            |r| r.get(0),
        )?;
        Ok(id)
    }

    pub fn targets_by_source(
        &self,
        space_id: SpaceId,
        kind: TargetKind,
        source_ids: &[String],
    ) -> anyhow::Result<Vec<EvalTarget>> {
        if source_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT id, space_id, kind, source_id, created_by, created_at FROM eval_targets
             WHERE space_id = ? AND kind = ? AND source_id IN ({}) ORDER BY id",
            placeholders(source_ids.len())
        ))?;
        let mut args = vec![Value::Integer(space_id), Value::Text(kind.as_str().into())];
        args.extend(source_ids.iter().map(|s| Value::Text(s.clone())));
        let rows = stmt.query_map(params_from_iter(args), row_to_target)?;
        collect(rows)
    }

    pub fn get_target(&self, space_id: SpaceId, id: TargetId) -> anyhow::Result<Option<EvalTarget>> {
        let conn = self.lock()?;
        let r = conn
            .query_row(
                "SELECT id, space_id, kind, source_id, created_by, created_at FROM eval_targets
                 WHERE space_id = ?1 AND id = ?2",
                params![space_id, id],
                row_to_target,
            )
            .optional()?;
        Ok(r)
    }

    pub fn mget_target_versions(&self, space_id: SpaceId, ids: &[i64]) -> anyhow::Result<Vec<EvalTargetVersion>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM eval_target_versions v JOIN eval_targets t ON t.id = v.target_id
             WHERE v.space_id = ? AND v.id IN ({})",
            TARGET_VERSION_COLS,
            placeholders(ids.len())
        ))?;
        let rows = stmt.query_map(params_from_iter(id_args(space_id, ids)), row_to_target_version)?;
        let found = collect(rows)?;
        Ok(ids
            .iter()
            .filter_map(|id| found.iter().find(|v| v.id == *id).cloned())
            .collect())
    }

    pub fn list_target_versions(&self, space_id: SpaceId, target_id: TargetId) -> anyhow::Result<Vec<EvalTargetVersion>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM eval_target_versions v JOIN eval_targets t ON t.id = v.target_id
             WHERE v.space_id = ?1 AND v.target_id = ?2 ORDER BY v.id",
            TARGET_VERSION_COLS
        ))?;
        let rows = stmt.query_map(params![space_id, target_id], row_to_target_version)?;
        collect(rows)
    }

    pub fn insert_target_record(&self, r: &TargetRecord) -> anyhow::Result<()> {
        let conn = self.lock()?;
        conn.execute(
            &format!(
                "INSERT INTO target_records ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                TARGET_RECORD_COLS
            ),
            params![
                r.id,
                r.space_id,
                r.target_id,
                r.target_version_id,
                r.scope.expt_id,
                r.scope.item_id,
                r.scope.turn_id,
                to_json(&r.input)?,
                match &r.output {
                    Some(o) => Some(to_json(o)?),
                    None => None,
                },
                r.status.as_str(),
                match &r.error {
                    Some(e) => Some(to_json(e)?),
                    None => None,
                },
                r.latency_ms,
                r.trace_id,
                r.created_at
            ],
        )?;
        Ok(())
    }

    pub fn mget_target_records(&self, space_id: SpaceId, ids: &[RecordId]) -> anyhow::Result<Vec<TargetRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM target_records WHERE space_id = ? AND id IN ({}) ORDER BY id",
            TARGET_RECORD_COLS,
            placeholders(ids.len())
        ))?;
        let rows = stmt.query_map(params_from_iter(id_args(space_id, ids)), row_to_target_record)?;
        collect(rows)
    }
}
