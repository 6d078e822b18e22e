use crate::context::Ctx;
use crate::errors::{EvalError, EvalResult};
use crate::on_error::{log_fail_safe, ErrorPolicy};
use async_trait::async_trait;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Reject { reason: String },
}

/// External content-moderation collaborator.
#[async_trait]
pub trait ContentModerator: Send + Sync {
    /// `Err` means the moderator could not be reached; a rejection is `Ok(Reject)`.
    async fn check(&self, ctx: &Ctx, texts: &[&str]) -> anyhow::Result<Verdict>;
}

pub struct AllowAll;

#[async_trait]
impl ContentModerator for AllowAll {
    async fn check(&self, _ctx: &Ctx, _texts: &[&str]) -> anyhow::Result<Verdict> {
        Ok(Verdict::Pass)
    }
}

/// Applies a moderation verdict: rejections fail with `RiskContentDetected`,
/// transport failures follow `policy`.
pub async fn enforce(
    moderator: &dyn ContentModerator,
    policy: ErrorPolicy,
    ctx: &Ctx,
    operation: &str,
    texts: &[&str],
) -> EvalResult<()> {
    let texts: Vec<&str> = texts.iter().copied().filter(|t| !t.trim().is_empty()).collect();
    if texts.is_empty() {
        return Ok(());
    }
    match moderator.check(ctx, &texts).await {
        Ok(Verdict::Pass) => Ok(()),
        Ok(Verdict::Reject { reason }) => {
            tracing::info!(event = "moderation.rejected", operation, trace_id = %ctx.trace_id, reason = %reason);
            Err(EvalError::RiskContentDetected(reason))
        }
        Err(e) => {
            let decision = policy.apply_to_error(&e);
            if decision.is_allowed() {
                log_fail_safe(decision.message(), operation);
                Ok(())
            } else {
                Err(EvalError::UpstreamUnavailable(decision.message().to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Down;
    #[async_trait]
    impl ContentModerator for Down {
        async fn check(&self, _ctx: &Ctx, _texts: &[&str]) -> anyhow::Result<Verdict> {
            anyhow::bail!("moderation service timeout")
        }
    }

    struct Denylist(&'static str);
    #[async_trait]
    impl ContentModerator for Denylist {
        async fn check(&self, _ctx: &Ctx, texts: &[&str]) -> anyhow::Result<Verdict> {
            if texts.iter().any(|t| t.contains(self.0)) {
                Ok(Verdict::Reject {
                    reason: format!("contains {}", self.0),
                })
            } else {
                Ok(Verdict::Pass)
            }
        }
    }

    #[tokio::test]
    async fn test_transport_failure_fails_open_by_default() {
        let ctx = Ctx::system();
        enforce(&Down, ErrorPolicy::Allow, &ctx, "create", &["hello"]).await.unwrap();
        let err = enforce(&Down, ErrorPolicy::Block, &ctx, "create", &["hello"])
            .await
            .unwrap_err();
        assert!(err.is_retriable());
    }

    #[tokio::test]
    async fn test_rejection_always_fails() {
        let ctx = Ctx::system();
        let err = enforce(&Denylist("bad"), ErrorPolicy::Allow, &ctx, "create", &["a bad name"])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::RiskContentDetected);
        enforce(&Denylist("bad"), ErrorPolicy::Allow, &ctx, "create", &["fine", ""])
            .await
            .unwrap();
    }
}
