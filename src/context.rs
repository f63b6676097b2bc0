//! Operation context: cancellation and deadline carried across every
//! externally visible operation. Handlers check it at each suspension point.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default)]
pub struct OpContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl OpContext {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        OpContext {
            cancel: CancellationToken::new(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// Child context sharing this context's deadline; cancelling the parent
    /// cancels the child but not the other way around.
    pub fn child(&self) -> Self {
        OpContext {
            cancel: self.cancel.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Fails with [`crate::Error::Cancelled`] once the token fired or the
    /// deadline passed.
    pub fn check(&self) -> crate::Result<()> {
        if self.cancel.is_cancelled() {
            return Err(crate::Error::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(crate::Error::Cancelled);
            }
        }
        Ok(())
    }

    /// Resolves when the context is cancelled or its deadline passes.
    /// Use inside `tokio::select!` against the actual work.
    pub async fn done(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.cancel.cancelled().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_background_never_done() {
        let ctx = OpContext::background();
        assert!(ctx.check().is_ok());
    }

    #[tokio::test]
    async fn test_cancel_propagates_to_child() {
        let ctx = OpContext::background();
        let child = ctx.child();
        ctx.cancel();
        assert!(child.check().is_err());
        child.done().await; // resolves immediately
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_expiry() {
        let ctx = OpContext::with_timeout(Duration::from_millis(10));
        assert!(ctx.check().is_ok());
        tokio::time::advance(Duration::from_millis(20)).await;
        assert!(ctx.check().is_err());
    }
}
