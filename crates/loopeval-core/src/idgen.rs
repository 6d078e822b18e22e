use std::sync::atomic::{AtomicI64, Ordering};

pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> i64;

    fn next_ids(&self, n: usize) -> Vec<i64> {
        (0..n).map(|_| self.next_id()).collect()
    }
}

/// Time-ordered ids: millis since epoch shifted left 12 bits plus a sequence.
/// Strictly increasing within a process even when the clock stalls.
pub struct SnowflakeIds {
    last: AtomicI64,
    node: i64,
}

impl SnowflakeIds {
    pub fn new(node: u16) -> Self {
        Self {
            last: AtomicI64::new(0),
            node: (node as i64) & 0x3,
        }
    }
}

impl Default for SnowflakeIds {
    fn default() -> Self {
        Self::new(0)
    }
}

impl IdGenerator for SnowflakeIds {
    fn next_id(&self) -> i64 {
        let candidate = (crate::model::now_ms() << 12) | (self.node << 10);
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let next = if candidate > prev { candidate } else { prev + 1 };
            match self
                .last
                .compare_exchange_weak(prev, next, Ordering::SeqCst, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }
}

/// Deterministic sequence for tests.
pub struct SequentialIds(AtomicI64);

impl SequentialIds {
    pub fn starting_at(n: i64) -> Self {
        Self(AtomicI64::new(n))
    }
}

impl IdGenerator for SequentialIds {
    fn next_id(&self) -> i64 {
        self.0.fetch_add(1, Ordering::SeqCst)
    }
}
