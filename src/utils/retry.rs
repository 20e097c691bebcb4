//! Retry policy
//!
//! Bounded attempts with exponential backoff and random jitter, carried as
//! configuration rather than hard-coded sleep loops. Used on the deposit
//! submission path, where a transient protocol failure is worth retrying but
//! an exhausted policy must surface the last error unchanged.

use crate::config::RetryConfig;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Executable retry schedule.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_backoff: Duration,
    max_jitter: Duration,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_backoff: Duration::from_millis(config.base_backoff_ms),
            max_jitter: Duration::from_millis(config.max_jitter_ms),
        }
    }

    /// Backoff before the given retry (1-based), doubled per attempt plus
    /// jitter.
    fn backoff(&self, retry: u32) -> Duration {
        let base = self.base_backoff.saturating_mul(1u32 << (retry - 1).min(16));
        let jitter_ms = if self.max_jitter.is_zero() {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.max_jitter.as_millis() as u64)
        };
        base + Duration::from_millis(jitter_ms)
    }

    /// Run `operation` until it succeeds or the attempts are exhausted,
    /// returning the final error unchanged.
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut operation: F) -> Result<T, E>
    where
        E: std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.max_attempts => {
                    let backoff = self.backoff(attempt);
                    warn!(
                        "{} failed (attempt {}/{}): {}; retrying in {}ms",
                        label,
                        attempt,
                        self.max_attempts,
                        e,
                        backoff.as_millis()
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
