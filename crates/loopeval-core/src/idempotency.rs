use crate::errors::EvalResult;
use crate::model::{now_ms, ExptId, ItemId, RunId, TurnId};
use crate::storage::Store;
use rusqlite::params;
use std::time::Duration;

/// Short-lived key presence with TTL. `set_nx` decides a single winner per key.
pub trait IdempotencyStore: Send + Sync {
    fn set_nx(&self, key: &str, ttl: Duration) -> EvalResult<bool>;
    fn exists(&self, key: &str) -> EvalResult<bool>;
    fn set(&self, key: &str, ttl: Duration) -> EvalResult<()>;
    fn del(&self, key: &str) -> EvalResult<()>;
}

/// Key for one delivery of an item-eval event.
pub fn item_eval_key(expt_id: ExptId, item_id: ItemId, turn_id: Option<TurnId>, run_id: RunId) -> String {
    match turn_id {
        Some(t) => format!("item_eval:{}:{}:{}:{}", expt_id, item_id, t, run_id),
        None => format!("item_eval:{}:{}:-:{}", expt_id, item_id, run_id),
    }
}

/// Key the scheduler holds while an item-eval event is in flight.
pub fn dispatch_key(expt_id: ExptId, item_id: ItemId, run_id: RunId) -> String {
    format!("item:{}:{}:{}", expt_id, item_id, run_id)
}

/// Key guarding a single pending re-poll of an experiment run.
pub fn reschedule_key(expt_id: ExptId, run_id: RunId) -> String {
    format!("resched:{}:{}", expt_id, run_id)
}

#[derive(Clone)]
pub struct SqliteIdempotency {
    store: Store,
}

impl SqliteIdempotency {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Drops expired keys; returns how many were removed.
    pub fn sweep(&self) -> EvalResult<usize> {
        let conn = self.store.lock()?;
        let n = conn.execute(
            "DELETE FROM idempotency_keys WHERE expires_at <= ?1",
            params![now_ms()],
        )?;
        Ok(n)
    }
}

fn expiry(ttl: Duration) -> i64 {
    now_ms() + ttl.as_millis().min(i64::MAX as u128) as i64
}

impl IdempotencyStore for SqliteIdempotency {
    fn set_nx(&self, key: &str, ttl: Duration) -> EvalResult<bool> {
        let conn = self.store.lock()?;
        // an expired key counts as absent
        let n = conn.execute(
            "INSERT INTO idempotency_keys (key, expires_at) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET expires_at = excluded.expires_at
             WHERE idempotency_keys.expires_at <= ?3",
            params![key, expiry(ttl), now_ms()],
        )?;
        Ok(n == 1)
    }

    fn exists(&self, key: &str) -> EvalResult<bool> {
        let conn = self.store.lock()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM idempotency_keys WHERE key = ?1 AND expires_at > ?2",
            params![key, now_ms()],
            |r| r.get(0),
        )?;
        Ok(n > 0)
    }

    fn set(&self, key: &str, ttl: Duration) -> EvalResult<()> {
        let conn = self.store.lock()?;
        conn.execute(
            "INSERT INTO idempotency_keys (key, expires_at) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET expires_at = excluded.expires_at",
            params![key, expiry(ttl)],
        )?;
        Ok(())
    }

    fn del(&self, key: &str) -> EvalResult<()> {
        let conn = self.store.lock()?;
        conn.execute("DELETE FROM idempotency_keys WHERE key = ?1", params![key])?;
        Ok(())
    }
}
