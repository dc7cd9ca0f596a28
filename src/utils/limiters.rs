use anyhow::Result;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Per-process concurrency bound for the embedding backend. Each request
/// acquires one permit; a slow embedding call blocks only requests competing
/// for the same permit, never the whole server (§5).
///
/// The store and chat-generation calls need no equivalent semaphore here:
/// `sqlx`'s own pool (`DatabaseConfig::pool_max_size`) already bounds store
/// concurrency, and the chat-generation path is a single in-flight HTTP
/// stream per request with no shared backend-side limit to protect.
#[derive(Clone)]
pub struct Limiters {
    pub embedding: Arc<Semaphore>,
    pub acquire_timeout: Duration,
}

impl Limiters {
    pub fn new(embedding: usize, acquire_timeout: Duration) -> Self {
        Self {
            embedding: Arc::new(Semaphore::new(embedding.max(1))),
            acquire_timeout,
        }
    }

    pub async fn acquire_timed(
        sem: Arc<Semaphore>,
        acquire_timeout: Duration,
        op: &'static str,
    ) -> Result<(OwnedSemaphorePermit, Duration)> {
        let start = Instant::now();

        let permit = tokio::time::timeout(acquire_timeout, sem.acquire_owned())
            .await
            .map_err(|_| anyhow::anyhow!("limiter acquire timeout for op={}", op))??;

        Ok((permit, start.elapsed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn acquire_timed_reports_wait_time() {
        let sem = Arc::new(Semaphore::new(1));
        let (_permit, wait) =
            Limiters::acquire_timed(sem.clone(), StdDuration::from_millis(100), "test")
                .await
                .unwrap();
        assert!(wait < StdDuration::from_millis(100));
    }

    #[tokio::test]
    async fn acquire_timed_times_out_when_exhausted() {
        let sem = Arc::new(Semaphore::new(1));
        let _held = sem.clone().acquire_owned().await.unwrap();
        let result = Limiters::acquire_timed(sem, StdDuration::from_millis(20), "test").await;
        assert!(result.is_err());
    }
}
