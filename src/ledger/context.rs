//! Request context: caller cancellation plus an optional deadline.
//!
//! Every transactional scope runs under a context. When the context fires
//! the scope's in-flight work is dropped and the transaction is rolled back.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::error::{CancelReason, LedgerError};

#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl RequestContext {
    /// Context that never fires on its own
    pub fn new() -> Self {
        Self::default()
    }

    /// Context bound to a caller-owned cancellation token
    pub fn with_cancellation(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            deadline: None,
        }
    }

    /// Add a timeout. An earlier existing deadline wins.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        self.deadline = Some(match self.deadline {
            Some(existing) if existing <= candidate => existing,
            _ => candidate,
        });
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, zero once it has passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Fail fast if the context has already fired.
    pub fn check(&self) -> Result<(), LedgerError> {
        if self.cancel.is_cancelled() {
            return Err(LedgerError::Cancelled(CancelReason::Cancelled));
        }
        if let Some(deadline) = self.deadline
            && Instant::now() >= deadline
        {
            return Err(LedgerError::Cancelled(CancelReason::DeadlineExceeded));
        }
        Ok(())
    }

    /// Resolves once the token is cancelled or the deadline passes.
    pub async fn done(&self) -> CancelReason {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.cancel.cancelled() => CancelReason::Cancelled,
                _ = tokio::time::sleep_until(deadline) => CancelReason::DeadlineExceeded,
            },
            None => {
                self.cancel.cancelled().await;
                CancelReason::Cancelled
            }
        }
    }

    /// Drive `work` until it finishes or the context fires, whichever is first.
    ///
    /// On firing, `work` is dropped before this returns.
    pub async fn run<F, T>(&self, work: F) -> Result<T, LedgerError>
    where
        F: Future<Output = Result<T, LedgerError>>,
    {
        self.check()?;
        tokio::select! {
            biased;
            reason = self.done() => Err(LedgerError::Cancelled(reason)),
            result = work => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_completes_without_signal() {
        let ctx = RequestContext::new();
        let value = ctx.run(async { Ok::<_, LedgerError>(42) }).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_pre_cancelled_context_fails_fast() {
        let token = CancellationToken::new();
        token.cancel();
        let ctx = RequestContext::with_cancellation(token);

        let err = ctx.run(async { Ok::<_, LedgerError>(()) }).await.unwrap_err();
        assert!(matches!(err, LedgerError::Cancelled(CancelReason::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_interrupts_pending_work() {
        let ctx = RequestContext::new().with_timeout(Duration::from_millis(50));

        let err = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, LedgerError>(())
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::Cancelled(CancelReason::DeadlineExceeded)
        ));
    }

    #[tokio::test]
    async fn test_earlier_deadline_wins() {
        let ctx = RequestContext::new()
            .with_timeout(Duration::from_millis(10))
            .with_timeout(Duration::from_secs(10));
        let deadline = ctx.deadline().unwrap();
        assert!(deadline <= Instant::now() + Duration::from_millis(10));
        assert!(ctx.remaining().unwrap() <= Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remaining_saturates_at_zero() {
        assert_eq!(RequestContext::new().remaining(), None);

        let ctx = RequestContext::new().with_timeout(Duration::from_millis(30));
        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(ctx.remaining(), Some(Duration::ZERO));
    }
}
