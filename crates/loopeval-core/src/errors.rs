use serde::{Deserialize, Serialize};
use std::fmt;

pub type EvalResult<T> = std::result::Result<T, EvalError>;

/// Stable classification of engine errors. Codes are part of the wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidParam,
    NotFound,
    NoPermission,
    NameExists,
    QuotaDenied,
    BenefitDenied,
    InvalidState,
    ExhaustedRetries,
    UpstreamUnavailable,
    RiskContentDetected,
    Internal,
}

impl ErrorKind {
    pub fn code(self) -> i32 {
        match self {
            ErrorKind::InvalidParam => 601_204_001,
            ErrorKind::NotFound => 601_204_002,
            ErrorKind::NoPermission => 601_204_003,
            ErrorKind::NameExists => 601_204_004,
            ErrorKind::QuotaDenied => 601_204_005,
            ErrorKind::BenefitDenied => 601_204_006,
            ErrorKind::InvalidState => 601_204_007,
            ErrorKind::ExhaustedRetries => 601_204_008,
            ErrorKind::UpstreamUnavailable => 601_204_009,
            ErrorKind::RiskContentDetected => 601_204_010,
            ErrorKind::Internal => 601_204_999,
        }
    }

    pub fn is_retriable(self) -> bool {
        matches!(self, ErrorKind::UpstreamUnavailable | ErrorKind::Internal)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidParam => "invalid_param",
            ErrorKind::NotFound => "not_found",
            ErrorKind::NoPermission => "no_permission",
            ErrorKind::NameExists => "name_exists",
            ErrorKind::QuotaDenied => "quota_denied",
            ErrorKind::BenefitDenied => "benefit_denied",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::ExhaustedRetries => "exhausted_retries",
            ErrorKind::UpstreamUnavailable => "upstream_unavailable",
            ErrorKind::RiskContentDetected => "risk_content_detected",
            ErrorKind::Internal => "internal",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Experiment,
    EvalSet,
    EvalSetVersion,
    EvalSetItem,
    Evaluator,
    EvaluatorVersion,
    Target,
    TargetVersion,
    Record,
    RunLog,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceKind::Experiment => "experiment",
            ResourceKind::EvalSet => "eval_set",
            ResourceKind::EvalSetVersion => "eval_set_version",
            ResourceKind::EvalSetItem => "eval_set_item",
            ResourceKind::Evaluator => "evaluator",
            ResourceKind::EvaluatorVersion => "evaluator_version",
            ResourceKind::Target => "target",
            ResourceKind::TargetVersion => "target_version",
            ResourceKind::Record => "record",
            ResourceKind::RunLog => "run_log",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    #[error("invalid param: {0}")]
    InvalidParam(String),
    #[error("{kind} not found: {id}")]
    NotFound { kind: ResourceKind, id: String },
    #[error("no permission: {0}")]
    NoPermission(String),
    #[error("name already exists: {0}")]
    NameExists(String),
    #[error("quota denied: {0}")]
    QuotaDenied(String),
    #[error("benefit denied: {0}")]
    BenefitDenied(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("exhausted retries: {0}")]
    ExhaustedRetries(String),
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("risk content detected: {0}")]
    RiskContentDetected(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl EvalError {
    pub fn not_found(kind: ResourceKind, id: impl fmt::Display) -> Self {
        EvalError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            EvalError::InvalidParam(_) => ErrorKind::InvalidParam,
            EvalError::NotFound { .. } => ErrorKind::NotFound,
            EvalError::NoPermission(_) => ErrorKind::NoPermission,
            EvalError::NameExists(_) => ErrorKind::NameExists,
            EvalError::QuotaDenied(_) => ErrorKind::QuotaDenied,
            EvalError::BenefitDenied(_) => ErrorKind::BenefitDenied,
            EvalError::InvalidState(_) => ErrorKind::InvalidState,
            EvalError::ExhaustedRetries(_) => ErrorKind::ExhaustedRetries,
            EvalError::UpstreamUnavailable(_) => ErrorKind::UpstreamUnavailable,
            EvalError::RiskContentDetected(_) => ErrorKind::RiskContentDetected,
            EvalError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn code(&self) -> i32 {
        self.kind().code()
    }

    pub fn is_retriable(&self) -> bool {
        self.kind().is_retriable()
    }

    /// The extra message carried next to the stable code.
    pub fn extra(&self) -> String {
        match self {
            EvalError::NotFound { kind, id } => format!("{} {}", kind, id),
            EvalError::InvalidParam(m)
            | EvalError::NoPermission(m)
            | EvalError::NameExists(m)
            | EvalError::QuotaDenied(m)
            | EvalError::BenefitDenied(m)
            | EvalError::InvalidState(m)
            | EvalError::ExhaustedRetries(m)
            | EvalError::UpstreamUnavailable(m)
            | EvalError::RiskContentDetected(m)
            | EvalError::Internal(m) => m.clone(),
        }
    }

    pub fn detail(&self) -> ErrorDetail {
        ErrorDetail {
            code: self.code(),
            kind: self.kind(),
            message: self.extra(),
        }
    }
}

impl From<anyhow::Error> for EvalError {
    fn from(e: anyhow::Error) -> Self {
        match e.downcast::<EvalError>() {
            Ok(inner) => inner,
            Err(other) => EvalError::Internal(format!("{:#}", other)),
        }
    }
}

impl From<rusqlite::Error> for EvalError {
    fn from(e: rusqlite::Error) -> Self {
        EvalError::Internal(format!("sqlite: {}", e))
    }
}

impl From<serde_json::Error> for EvalError {
    fn from(e: serde_json::Error) -> Self {
        EvalError::Internal(format!("json: {}", e))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("config error: {0}")]
pub struct ConfigError(pub String);

impl From<ConfigError> for EvalError {
    fn from(e: ConfigError) -> Self {
        EvalError::InvalidParam(e.0)
    }
}

/// Serializable error attached to persisted rows (item errors, per-turn errors).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: i32,
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorDetail {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            code: kind.code(),
            kind,
            message: message.into(),
        }
    }

    pub fn is_retriable(&self) -> bool {
        self.kind.is_retriable()
    }
}

impl From<&EvalError> for ErrorDetail {
    fn from(e: &EvalError) -> Self {
        e.detail()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_unique() {
        let kinds = [
            ErrorKind::InvalidParam,
            ErrorKind::NotFound,
            ErrorKind::NoPermission,
            ErrorKind::NameExists,
            ErrorKind::QuotaDenied,
            ErrorKind::BenefitDenied,
            ErrorKind::InvalidState,
            ErrorKind::ExhaustedRetries,
            ErrorKind::UpstreamUnavailable,
            ErrorKind::RiskContentDetected,
            ErrorKind::Internal,
        ];
        let codes: std::collections::HashSet<i32> = kinds.iter().map(|k| k.code()).collect();
        assert_eq!(codes.len(), kinds.len());
    }

    #[test]
    fn test_only_transient_kinds_retry() {
        assert!(EvalError::UpstreamUnavailable("llm".into()).is_retriable());
        assert!(EvalError::Internal("db".into()).is_retriable());
        assert!(!EvalError::InvalidParam("x".into()).is_retriable());
        assert!(!EvalError::NoPermission("x".into()).is_retriable());
        assert!(!EvalError::ExhaustedRetries("x".into()).is_retriable());
    }

    #[test]
    fn test_anyhow_roundtrip_keeps_kind() {
        let err: anyhow::Error = EvalError::NameExists("demo".into()).into();
        let back: EvalError = err.into();
        assert_eq!(back.kind(), ErrorKind::NameExists);

        let plain: EvalError = anyhow::anyhow!("disk full").into();
        assert_eq!(plain.kind(), ErrorKind::Internal);
        assert!(plain.extra().contains("disk full"));
    }

    #[test]
    fn test_not_found_extra_names_resource() {
        let e = EvalError::not_found(ResourceKind::EvaluatorVersion, 7);
        assert_eq!(e.extra(), "evaluator_version 7");
        assert_eq!(e.to_string(), "evaluator_version not found: 7");
    }
}
