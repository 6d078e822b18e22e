use crate::errors::{EvalError, EvalResult, ResourceKind};
use crate::model::{ExptId, ExptStatus};
use crate::storage::Store;
use moka::sync::Cache;
use std::time::Duration;

/// Bounded-staleness view of experiment status used by workers to notice Kill.
#[derive(Clone)]
pub struct StatusProbe {
    store: Store,
    cache: Cache<ExptId, ExptStatus>,
}

impl StatusProbe {
    pub fn new(store: Store, ttl: Duration) -> Self {
        Self {
            store,
            cache: Cache::builder().max_capacity(10_000).time_to_live(ttl).build(),
        }
    }

    /// Possibly stale by up to the cache TTL.
    pub fn cached(&self, id: ExptId) -> EvalResult<ExptStatus> {
        if let Some(s) = self.cache.get(&id) {
            return Ok(s);
        }
        self.fresh(id)
    }

    /// Reads through to the store and refreshes the cache.
    pub fn fresh(&self, id: ExptId) -> EvalResult<ExptStatus> {
        let e = self
            .store
            .get_experiment(id)?
            .filter(|e| !e.deleted)
            .ok_or_else(|| EvalError::not_found(ResourceKind::Experiment, id))?;
        self.cache.insert(id, e.status);
        Ok(e.status)
    }

    pub fn invalidate(&self, id: ExptId) {
        self.cache.invalidate(&id);
    }
}
