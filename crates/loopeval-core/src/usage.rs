//! Usage metering. Lines are picked up by the log pipeline for billing.

/// Logs one metered usage event.
///
/// `usage_type` is the category (`target_call`, `evaluator_call`, `tokens`...).
pub fn log_usage_event(usage_type: &str, count: u64) {
    if count == 0 {
        return;
    }
    tracing::info!(
        target: "loopeval_billing",
        event = "loopeval.usage.metered",
        usage_type = %usage_type,
        count = count,
    );
}
