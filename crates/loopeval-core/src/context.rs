use std::time::{Duration, Instant};

/// Authenticated caller. Authorization itself happens upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: String,
}

impl Session {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }

    pub fn system() -> Self {
        Self::new("system")
    }
}

/// Per-operation context passed explicitly through every call.
#[derive(Debug, Clone)]
pub struct Ctx {
    pub session: Session,
    pub trace_id: String,
    pub deadline: Option<Instant>,
}

impl Ctx {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            trace_id: new_trace_id(),
            deadline: None,
        }
    }

    pub fn system() -> Self {
        Self::new(Session::system())
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    pub fn with_timeout(mut self, d: Duration) -> Self {
        self.deadline = Some(Instant::now() + d);
        self
    }

    /// Remaining time before the deadline, capped by `cap`.
    pub fn budget(&self, cap: Duration) -> Duration {
        match self.deadline {
            Some(dl) => dl.saturating_duration_since(Instant::now()).min(cap),
            None => cap,
        }
    }

    pub fn expired(&self) -> bool {
        matches!(self.deadline, Some(dl) if Instant::now() >= dl)
    }

    pub fn user(&self) -> &str {
        &self.session.user_id
    }
}

pub fn new_trace_id() -> String {
    use sha2::{Digest, Sha256};
    use std::sync::atomic::{AtomicU64, Ordering};
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let seq = SEQ.fetch_add(1, Ordering::Relaxed);
    let mut h = Sha256::new();
    h.update(chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default().to_le_bytes());
    h.update(seq.to_le_bytes());
    h.update(std::process::id().to_le_bytes());
    hex::encode(&h.finalize()[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_capped_by_deadline() {
        let ctx = Ctx::system().with_timeout(Duration::from_millis(50));
        assert!(ctx.budget(Duration::from_secs(10)) <= Duration::from_millis(50));
        let open = Ctx::system();
        assert_eq!(open.budget(Duration::from_secs(3)), Duration::from_secs(3));
    }

    #[test]
    fn test_trace_ids_differ() {
        assert_ne!(new_trace_id(), new_trace_id());
        assert_eq!(new_trace_id().len(), 16);
    }
}
