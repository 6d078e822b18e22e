use crate::errors::ConfigError;
use crate::on_error::ErrorPolicy;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;

/// Upper bound for the experiment-status cache; workers must observe Kill quickly.
pub const MAX_STATUS_CACHE_TTL_MS: u64 = 5_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub schedule: usize,
    pub item_eval: usize,
    pub aggregate: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            schedule: 2,
            item_eval: 8,
            aggregate: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_ms: 200,
            backoff_cap_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub workers: WorkerConfig,
    pub retry: RetryConfig,
    pub idempotency_ttl_secs: u64,
    pub lock_lease_ms: u64,
    /// How long the scheduler waits before re-polling a running experiment.
    pub schedule_interval_ms: u64,
    pub status_cache_ttl_ms: u64,
    pub turn_timeout_ms: u64,
    pub skip_on_target_fail: bool,
    /// Finish marks an experiment Failed above this failed/total ratio.
    pub finish_failed_ratio: Option<f64>,
    pub default_space_quota: u32,
    pub gc_interval_secs: u64,
    /// Soft-deleted experiments are purged once older than this.
    pub deleted_retention_secs: u64,
    /// Processing items idle longer than this are reaped.
    pub stale_item_after_ms: u64,
    /// What to do when the moderation service itself fails.
    pub moderation_on_error: ErrorPolicy,
    pub default_item_concurrency: u32,
    pub default_evaluator_concurrency: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: WorkerConfig::default(),
            retry: RetryConfig::default(),
            idempotency_ttl_secs: 600,
            lock_lease_ms: 10_000,
            schedule_interval_ms: 500,
            status_cache_ttl_ms: 2_000,
            turn_timeout_ms: 60_000,
            skip_on_target_fail: true,
            finish_failed_ratio: None,
            default_space_quota: 10,
            gc_interval_secs: 60,
            deleted_retention_secs: 3_600,
            stale_item_after_ms: 300_000,
            moderation_on_error: ErrorPolicy::Allow,
            default_item_concurrency: 4,
            default_evaluator_concurrency: 2,
        }
    }
}

const KNOWN_KEYS: &[&str] = &[
    "workers",
    "workers.schedule",
    "workers.item_eval",
    "workers.aggregate",
    "retry",
    "retry.max_retries",
    "retry.backoff_base_ms",
    "retry.backoff_cap_ms",
    "idempotency_ttl_secs",
    "lock_lease_ms",
    "schedule_interval_ms",
    "status_cache_ttl_ms",
    "turn_timeout_ms",
    "skip_on_target_fail",
    "finish_failed_ratio",
    "default_space_quota",
    "gc_interval_secs",
    "deleted_retention_secs",
    "stale_item_after_ms",
    "moderation_on_error",
    "default_item_concurrency",
    "default_evaluator_concurrency",
];

/// Closest known key, if any is reasonably close.
pub fn suggest_key(unknown: &str) -> Option<&'static str> {
    KNOWN_KEYS
        .iter()
        .map(|k| (*k, strsim::jaro_winkler(unknown, k)))
        .filter(|(_, score)| *score > 0.85)
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(k, _)| k)
}

impl EngineConfig {
    pub fn from_yaml_str(raw: &str, strict: bool) -> Result<Self, ConfigError> {
        let mut ignored = Vec::new();
        let de = serde_yaml::Deserializer::from_str(raw);
        let cfg: EngineConfig = serde_ignored::deserialize(de, |path| ignored.push(path.to_string()))
            .map_err(|e| ConfigError(format!("failed to parse engine config: {}", e)))?;

        if !ignored.is_empty() {
            let described: Vec<String> = ignored
                .iter()
                .map(|k| match suggest_key(k) {
                    Some(s) => format!("{} (did you mean {}?)", k, s),
                    None => k.clone(),
                })
                .collect();
            if strict {
                return Err(ConfigError(format!(
                    "unknown engine config keys: {}",
                    described.join(", ")
                )));
            }
            tracing::warn!(event = "config.unknown_keys", keys = %described.join(", "));
        }
        cfg.validated()
    }

    pub fn load(path: &Path, strict: bool) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_yaml_str(&raw, strict)
    }

    /// Applies `LOOPEVAL_*` overrides on top of the current values.
    pub fn with_env(mut self) -> Self {
        fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
            env::var(key).ok().and_then(|v| v.parse().ok())
        }
        if let Some(n) = parse_env("LOOPEVAL_ITEM_WORKERS") {
            self.workers.item_eval = n;
        }
        if let Some(n) = parse_env("LOOPEVAL_SCHEDULE_WORKERS") {
            self.workers.schedule = n;
        }
        if let Some(n) = parse_env("LOOPEVAL_MAX_RETRIES") {
            self.retry.max_retries = n;
        }
        if let Some(n) = parse_env("LOOPEVAL_TURN_TIMEOUT_MS") {
            self.turn_timeout_ms = n;
        }
        if let Some(n) = parse_env("LOOPEVAL_STATUS_CACHE_TTL_MS") {
            self.status_cache_ttl_ms = n;
        }
        if let Some(n) = parse_env("LOOPEVAL_DEFAULT_QUOTA") {
            self.default_space_quota = n;
        }
        if let Some(n) = parse_env::<f64>("LOOPEVAL_FINISH_FAILED_RATIO") {
            self.finish_failed_ratio = Some(n);
        }
        self
    }

    pub fn validated(mut self) -> Result<Self, ConfigError> {
        if self.status_cache_ttl_ms > MAX_STATUS_CACHE_TTL_MS {
            tracing::warn!(
                event = "config.clamped",
                key = "status_cache_ttl_ms",
                requested = self.status_cache_ttl_ms,
                max = MAX_STATUS_CACHE_TTL_MS
            );
            self.status_cache_ttl_ms = MAX_STATUS_CACHE_TTL_MS;
        }
        if let Some(r) = self.finish_failed_ratio {
            if !(0.0..=1.0).contains(&r) {
                return Err(ConfigError(format!("finish_failed_ratio must be within [0, 1], got {}", r)));
            }
        }
        if self.retry.backoff_base_ms == 0 || self.retry.backoff_cap_ms < self.retry.backoff_base_ms {
            return Err(ConfigError("retry backoff requires 0 < base <= cap".into()));
        }
        if self.default_item_concurrency == 0 || self.default_evaluator_concurrency == 0 {
            return Err(ConfigError("default concurrency must be at least 1".into()));
        }
        self.workers.schedule = self.workers.schedule.max(1);
        self.workers.item_eval = self.workers.item_eval.max(1);
        self.workers.aggregate = self.workers.aggregate.max(1);
        Ok(self)
    }

    pub fn idempotency_ttl(&self) -> Duration {
        Duration::from_secs(self.idempotency_ttl_secs)
    }

    pub fn lock_lease(&self) -> Duration {
        Duration::from_millis(self.lock_lease_ms)
    }

    pub fn schedule_interval(&self) -> Duration {
        Duration::from_millis(self.schedule_interval_ms)
    }

    pub fn status_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.status_cache_ttl_ms.min(MAX_STATUS_CACHE_TTL_MS))
    }

    pub fn turn_timeout(&self) -> Duration {
        Duration::from_millis(self.turn_timeout_ms)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_secs)
    }

    pub fn deleted_retention(&self) -> Duration {
        Duration::from_secs(self.deleted_retention_secs)
    }

    pub fn stale_item_after(&self) -> Duration {
        Duration::from_millis(self.stale_item_after_ms)
    }

    pub fn backoff(&self) -> crate::events::BackoffPolicy {
        crate::events::BackoffPolicy {
            base: Duration::from_millis(self.retry.backoff_base_ms),
            cap: Duration::from_millis(self.retry.backoff_cap_ms),
        }
    }
}
