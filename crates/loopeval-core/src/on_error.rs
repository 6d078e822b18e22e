// on_error.rs - Fail-safe policy for calls to external collaborators
//
// Content moderation is the main user: a moderation outage should not block
// experiment or evaluator authoring unless the operator asks for that.

use serde::{Deserialize, Serialize};

/// What to do when a collaborator call fails (as opposed to answering "no").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Fail-closed: refuse the operation.
    Block,

    /// Fail-open: proceed and log a fail-safe event.
    #[default]
    Allow,
}

impl ErrorPolicy {
    pub fn blocks_on_error(&self) -> bool {
        matches!(self, ErrorPolicy::Block)
    }

    pub fn allows_on_error(&self) -> bool {
        matches!(self, ErrorPolicy::Allow)
    }

    pub fn apply_to_error(&self, error: &dyn std::fmt::Display) -> ErrorPolicyResult {
        match self {
            ErrorPolicy::Block => ErrorPolicyResult::Blocked {
                reason: format!("collaborator error (fail-closed): {}", error),
            },
            ErrorPolicy::Allow => ErrorPolicyResult::Allowed {
                warning: format!("collaborator error (fail-open): {}", error),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorPolicyResult {
    Blocked { reason: String },
    Allowed { warning: String },
}

impl ErrorPolicyResult {
    pub fn is_allowed(&self) -> bool {
        matches!(self, ErrorPolicyResult::Allowed { .. })
    }

    pub fn message(&self) -> &str {
        match self {
            ErrorPolicyResult::Blocked { reason } => reason,
            ErrorPolicyResult::Allowed { warning } => warning,
        }
    }
}

/// Logs a fail-safe trigger as a structured event.
pub fn log_fail_safe(reason: &str, operation: &str) {
    tracing::warn!(
        event = "loopeval.failsafe.triggered",
        reason = %reason,
        operation = %operation,
        action = "allowed",
        "Fail-safe triggered: {}", reason
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_fail_open() {
        assert_eq!(ErrorPolicy::default(), ErrorPolicy::Allow);
        assert!(ErrorPolicy::default().allows_on_error());
    }

    #[test]
    fn test_apply_to_error() {
        let err = anyhow::anyhow!("connection reset");
        let blocked = ErrorPolicy::Block.apply_to_error(&err);
        assert!(!blocked.is_allowed());
        assert!(blocked.message().contains("fail-closed"));
        let allowed = ErrorPolicy::Allow.apply_to_error(&err);
        assert!(allowed.is_allowed());
        assert!(allowed.message().contains("connection reset"));
    }

    #[test]
    fn test_serde_names() {
        let p: ErrorPolicy = serde_json::from_str("\"block\"").unwrap();
        assert_eq!(p, ErrorPolicy::Block);
        assert_eq!(serde_json::to_string(&ErrorPolicy::Allow).unwrap(), "\"allow\"");
    }
}
