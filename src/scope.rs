//! Per-request cancellation scope (C7).
//!
//! Generalizes the semaphore/timeout pattern in `utils::limiters::Limiters`
//! into a cancellation root for a single request: disconnect, the abort
//! endpoint, deadline expiry, and upstream errors all trigger the same
//! `CancellationToken`, and every suspension point (embedding call, store
//! query, chat stream read, SSE write) races against it.

use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::utils::error::ApiError;

/// Owns the cancellation root and deadline for one request.
#[derive(Clone)]
pub struct RequestScope {
    token: CancellationToken,
    deadline: Instant,
}

impl RequestScope {
    pub fn new(deadline: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Instant::now() + deadline,
        }
    }

    /// A child scope that is cancelled whenever the parent is, but can also
    /// be cancelled independently (used to bound a single sub-operation).
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves when the scope is cancelled; never resolves otherwise. Used
    /// by long-lived generators (the chat stream) that need to race
    /// cancellation against each pulled item rather than wrapping the whole
    /// loop in a single `run`.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Runs `fut` to completion unless the scope is cancelled or its
    /// deadline expires first, in which case `fut` is dropped (aborting any
    /// in-flight I/O it owns) and an error is returned.
    pub async fn run<F, T>(&self, fut: F) -> Result<T, ApiError>
    where
        F: std::future::Future<Output = Result<T, ApiError>>,
    {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(ApiError::Cancelled),
            _ = tokio::time::sleep(self.remaining()) => Err(ApiError::DeadlineExceeded),
            res = fut => res,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn cancel_short_circuits_pending_work() {
        let scope = RequestScope::new(StdDuration::from_secs(30));
        let scope_clone = scope.clone();

        let handle = tokio::spawn(async move {
            scope_clone
                .run(async {
                    tokio::time::sleep(StdDuration::from_secs(30)).await;
                    Ok::<_, ApiError>(())
                })
                .await
        });

        scope.cancel();
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(ApiError::Cancelled)));
    }

    #[tokio::test]
    async fn deadline_expiry_is_reported() {
        let scope = RequestScope::new(StdDuration::from_millis(20));
        let result = scope
            .run(async {
                tokio::time::sleep(StdDuration::from_secs(5)).await;
                Ok::<_, ApiError>(())
            })
            .await;
        assert!(matches!(result, Err(ApiError::DeadlineExceeded)));
    }

    #[tokio::test]
    async fn successful_future_passes_through() {
        let scope = RequestScope::new(StdDuration::from_secs(5));
        let result = scope.run(async { Ok::<_, ApiError>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }
}
