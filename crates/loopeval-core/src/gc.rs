use crate::errors::EvalResult;
use crate::idempotency::SqliteIdempotency;
use crate::model::{now_ms, ExptStatus, RunState};
use crate::storage::Store;
use std::time::Duration;

const PURGE_BATCH: usize = 100;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JanitorReport {
    pub purged_experiments: usize,
    pub expired_keys: usize,
    pub reaped_items: usize,
}

/// Background cleanup: purges tombstoned experiments, expires idempotency
/// keys and terminates items stranded on finished experiments.
#[derive(Clone)]
pub struct Janitor {
    store: Store,
    idem: SqliteIdempotency,
    retention: Duration,
    stale_after: Duration,
}

impl Janitor {
    pub fn new(store: Store, retention: Duration, stale_after: Duration) -> Self {
        Self {
            idem: SqliteIdempotency::new(store.clone()),
            store,
            retention,
            stale_after,
        }
    }

    pub fn run_once(&self) -> EvalResult<JanitorReport> {
        let mut report = JanitorReport::default();
        let before = now_ms() - self.retention.as_millis() as i64;
        for id in self.store.deleted_experiments(before, PURGE_BATCH)? {
            if self.store.purge_experiment(id)? {
                report.purged_experiments += 1;
            }
        }
        report.expired_keys = self.idem.sweep()?;

        let stale_before = now_ms() - self.stale_after.as_millis() as i64;
        let finished = self.store.experiments_in_status(&[
            ExptStatus::Success,
            ExptStatus::Failed,
            ExptStatus::Terminated,
            ExptStatus::Drained,
        ])?;
        for e in finished {
            report.reaped_items += self
                .store
                .reap_stale_items(e.id, stale_before, RunState::Terminated)?
                .len();
        }

        if report != JanitorReport::default() {
            tracing::info!(
                event = "gc.completed",
                purged = report.purged_experiments,
                expired_keys = report.expired_keys,
                reaped = report.reaped_items,
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idempotency::IdempotencyStore;

    #[test]
    fn test_sweeps_expired_keys() {
        let store = Store::memory_with_schema().unwrap();
        let idem = SqliteIdempotency::new(store.clone());
        idem.set("gone", Duration::from_millis(0)).unwrap();
        idem.set("kept", Duration::from_secs(60)).unwrap();
        let janitor = Janitor::new(store, Duration::ZERO, Duration::from_secs(60));
        let report = janitor.run_once().unwrap();
        assert_eq!(report.expired_keys, 1);
        assert!(idem.exists("kept").unwrap());
    }
}
