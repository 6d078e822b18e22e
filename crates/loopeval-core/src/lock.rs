use crate::errors::EvalResult;
use crate::model::now_ms;
use crate::storage::Store;
use rusqlite::{params, OptionalExtension};
use std::time::Duration;

/// Proof of ownership. `token` is a fencing counter that grows on every acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    pub name: String,
    pub holder: String,
    pub token: i64,
}

pub trait DistributedLock: Send + Sync {
    fn acquire(&self, name: &str, holder: &str, lease: Duration) -> EvalResult<Option<LockToken>>;
    /// No-op when the token is stale.
    fn release(&self, token: &LockToken) -> EvalResult<()>;
    /// Extends the lease; false if the lock was lost.
    fn refresh(&self, token: &LockToken, lease: Duration) -> EvalResult<bool>;
}

#[derive(Clone)]
pub struct SqliteLock {
    store: Store,
}

impl SqliteLock {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

fn lease_ms(lease: Duration) -> i64 {
    lease.as_millis().min(i64::MAX as u128) as i64
}

impl DistributedLock for SqliteLock {
    fn acquire(&self, name: &str, holder: &str, lease: Duration) -> EvalResult<Option<LockToken>> {
        let mut conn = self.store.lock()?;
        let tx = conn.transaction()?;
        let now = now_ms();
        let current: Option<(Option<String>, i64, i64)> = tx
            .query_row(
                "SELECT holder, token, expires_at FROM dist_locks WHERE name = ?1",
                params![name],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .optional()?;
        let token = match current {
            None => {
                tx.execute(
                    "INSERT INTO dist_locks (name, holder, token, expires_at) VALUES (?1, ?2, 1, ?3)",
                    params![name, holder, now + lease_ms(lease)],
                )?;
                1
            }
            Some((Some(_), _, expires_at)) if expires_at > now => return Ok(None),
            Some((_, token, _)) => {
                tx.execute(
                    "UPDATE dist_locks SET holder = ?1, token = ?2, expires_at = ?3 WHERE name = ?4",
                    params![holder, token + 1, now + lease_ms(lease), name],
                )?;
                token + 1
            }
        };
        tx.commit()?;
        Ok(Some(LockToken {
            name: name.to_string(),
            holder: holder.to_string(),
            token,
        }))
    }

    fn release(&self, token: &LockToken) -> EvalResult<()> {
        let conn = self.store.lock()?;
        // keep the row so the fencing counter survives
        conn.execute(
            "UPDATE dist_locks SET holder = NULL, expires_at = 0
             WHERE name = ?1 AND token = ?2 AND holder = ?3",
            params![token.name, token.token, token.holder],
        )?;
        Ok(())
    }

    fn refresh(&self, token: &LockToken, lease: Duration) -> EvalResult<bool> {
        let conn = self.store.lock()?;
        let now = now_ms();
        let n = conn.execute(
            "UPDATE dist_locks SET expires_at = ?1
             WHERE name = ?2 AND token = ?3 AND holder = ?4 AND expires_at > ?5",
            params![now + lease_ms(lease), token.name, token.token, token.holder, now],
        )?;
        Ok(n == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock() -> SqliteLock {
        SqliteLock::new(Store::memory_with_schema().unwrap())
    }

    #[test]
    fn test_mutual_exclusion_and_release() {
        let l = lock();
        let lease = Duration::from_secs(30);
        let a = l.acquire("expt:1", "a", lease).unwrap().unwrap();
        assert!(l.acquire("expt:1", "b", lease).unwrap().is_none());
        l.release(&a).unwrap();
        let b = l.acquire("expt:1", "b", lease).unwrap().unwrap();
        assert!(b.token > a.token);
    }

    #[test]
    fn test_stale_token_cannot_release_or_refresh() {
        let l = lock();
        let a = l.acquire("expt:1", "a", Duration::from_millis(0)).unwrap().unwrap();
        let b = l.acquire("expt:1", "b", Duration::from_secs(30)).unwrap().unwrap();
        l.release(&a).unwrap();
        assert!(!l.refresh(&a, Duration::from_secs(30)).unwrap());
        assert!(l.acquire("expt:1", "c", Duration::from_secs(30)).unwrap().is_none());
        assert!(l.refresh(&b, Duration::from_secs(30)).unwrap());
    }
}
