use crate::errors::{EvalError, EvalResult};
use crate::model::{now_ms, ExptId, ExptStatus, SpaceId};
use crate::storage::Store;
use rusqlite::{params, OptionalExtension};
use std::collections::HashMap;

/// Per-space admission counter for live experiments.
///
/// A slot is taken when an experiment is created or cloned, not when it first
/// runs, so a Pending experiment that never ran still holds one. The number of
/// Processing experiments in a space therefore never exceeds its cap, and
/// `reconcile` rebuilds holders from Pending plus Processing experiments.
#[derive(Clone)]
pub struct QuotaService {
    store: Store,
    default_cap: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaUsage {
    pub cap: i64,
    pub in_use: i64,
}

impl QuotaService {
    pub fn new(store: Store, default_cap: u32) -> Self {
        Self { store, default_cap }
    }

    pub fn set_cap(&self, space_id: SpaceId, cap: u32) -> EvalResult<()> {
        let conn = self.store.lock()?;
        conn.execute(
            "INSERT INTO space_quotas (space_id, cap, in_use) VALUES (?1, ?2, 0)
             ON CONFLICT(space_id) DO UPDATE SET cap = excluded.cap",
            params![space_id, cap],
        )?;
        Ok(())
    }

    /// Takes a slot for `expt_id`. Admitting an experiment that already holds one is a no-op.
    pub fn admit(&self, space_id: SpaceId, expt_id: ExptId) -> EvalResult<()> {
        let mut conn = self.store.lock()?;
        let tx = conn.transaction()?;
        let held: Option<i64> = tx
            .query_row(
                "SELECT expt_id FROM quota_holders WHERE expt_id = ?1",
                params![expt_id],
                |r| r.get(0),
            )
            .optional()?;
        if held.is_some() {
            return Ok(());
        }
        tx.execute(
            "INSERT OR IGNORE INTO space_quotas (space_id, cap, in_use) VALUES (?1, ?2, 0)",
            params![space_id, self.default_cap],
        )?;
        let n = tx.execute(
            "UPDATE space_quotas SET in_use = in_use + 1 WHERE space_id = ?1 AND in_use < cap",
            params![space_id],
        )?;
        if n == 0 {
            let (cap, in_use): (i64, i64) = tx.query_row(
                "SELECT cap, in_use FROM space_quotas WHERE space_id = ?1",
                params![space_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )?;
            tracing::warn!(event = "quota.denied", space_id, expt_id, cap, in_use);
            return Err(EvalError::QuotaDenied(format!(
                "space {} is running {} of {} allowed experiments",
                space_id, in_use, cap
            )));
        }
        tx.execute(
            "INSERT INTO quota_holders (expt_id, space_id, admitted_at) VALUES (?1, ?2, ?3)",
            params![expt_id, space_id, now_ms()],
        )?;
        tx.commit()?;
        tracing::info!(event = "quota.admit", space_id, expt_id);
        Ok(())
    }

    /// Frees the slot held by `expt_id`, if any.
    pub fn release(&self, space_id: SpaceId, expt_id: ExptId) -> EvalResult<()> {
        let mut conn = self.store.lock()?;
        let tx = conn.transaction()?;
        let n = tx.execute("DELETE FROM quota_holders WHERE expt_id = ?1", params![expt_id])?;
        if n > 0 {
            tx.execute(
                "UPDATE space_quotas SET in_use = MAX(in_use - 1, 0) WHERE space_id = ?1",
                params![space_id],
            )?;
            tracing::info!(event = "quota.release", space_id, expt_id);
        }
        tx.commit()?;
        Ok(())
    }

    pub fn usage(&self, space_id: SpaceId) -> EvalResult<QuotaUsage> {
        let conn = self.store.lock()?;
        let row: Option<(i64, i64)> = conn
            .query_row(
                "SELECT cap, in_use FROM space_quotas WHERE space_id = ?1",
                params![space_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        let (cap, in_use) = row.unwrap_or((self.default_cap as i64, 0));
        Ok(QuotaUsage { cap, in_use })
    }

    /// Rebuilds holders and counters from live non-terminal experiments.
    /// Returns the number of holders per space after reconciliation.
    pub fn reconcile(&self) -> EvalResult<HashMap<SpaceId, i64>> {
        let live = self
            .store
            .experiments_in_status(&[ExptStatus::Pending, ExptStatus::Processing])?;
        let mut conn = self.store.lock()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM quota_holders", [])?;
        tx.execute("UPDATE space_quotas SET in_use = 0", [])?;
        let now = now_ms();
        let mut per_space: HashMap<SpaceId, i64> = HashMap::new();
        for e in &live {
            tx.execute(
                "INSERT INTO quota_holders (expt_id, space_id, admitted_at) VALUES (?1, ?2, ?3)",
                params![e.id, e.space_id, now],
            )?;
            *per_space.entry(e.space_id).or_default() += 1;
        }
        for (space_id, n) in &per_space {
            tx.execute(
                "INSERT INTO space_quotas (space_id, cap, in_use) VALUES (?1, ?2, ?3)
                 ON CONFLICT(space_id) DO UPDATE SET in_use = excluded.in_use",
                params![space_id, self.default_cap, n],
            )?;
        }
        tx.commit()?;
        tracing::info!(event = "quota.reconciled", spaces = per_space.len(), holders = live.len());
        Ok(per_space)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    #[test]
    fn test_cap_is_enforced_and_admit_is_idempotent() {
        let q = QuotaService::new(Store::memory_with_schema().unwrap(), 2);
        q.admit(1, 10).unwrap();
        q.admit(1, 10).unwrap();
        q.admit(1, 11).unwrap();
        let err = q.admit(1, 12).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QuotaDenied);
        assert_eq!(q.usage(1).unwrap().in_use, 2);

        q.release(1, 10).unwrap();
        q.release(1, 10).unwrap();
        assert_eq!(q.usage(1).unwrap().in_use, 1);
        q.admit(1, 12).unwrap();
    }

    #[test]
    fn test_spaces_are_independent() {
        let q = QuotaService::new(Store::memory_with_schema().unwrap(), 1);
        q.admit(1, 10).unwrap();
        q.admit(2, 20).unwrap();
        q.set_cap(1, 3).unwrap();
        q.admit(1, 11).unwrap();
        assert_eq!(q.usage(1).unwrap(), QuotaUsage { cap: 3, in_use: 2 });
    }
}
