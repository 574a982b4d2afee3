use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::apis::SourceError;

/// Bounded exponential backoff around a fallible async operation.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Add up to 25% random extra delay on each wait.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Same attempt budget, no waiting between attempts.
    pub fn without_delay(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    /// Wait before retry number `retry` (1-based): `base * 2^(retry-1)`, capped.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        let delay = self.base_delay.saturating_mul(factor).min(self.max_delay);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let quarter = (delay.as_millis() / 4) as u64;
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..=quarter))
    }

    /// Retry `op` while it fails with a transient error.
    pub async fn run<T, F, Fut>(&self, label: &str, op: F) -> Result<T, SourceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SourceError>>,
    {
        self.run_if(label, SourceError::is_transient, op).await
    }

    /// Retry `op` while `retryable` accepts its error. Errors the predicate
    /// rejects surface after a single attempt; exhausting the budget wraps the
    /// last error in [`SourceError::Unavailable`].
    pub async fn run_if<T, F, Fut, P>(
        &self,
        label: &str,
        retryable: P,
        mut op: F,
    ) -> Result<T, SourceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SourceError>>,
        P: Fn(&SourceError) -> bool,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if !retryable(&e) => return Err(e),
                Err(e) if attempt >= max_attempts => {
                    tracing::warn!(%label, attempts = attempt, error = %e, "giving up after retries");
                    return Err(SourceError::Unavailable {
                        attempts: attempt,
                        last: Box::new(e),
                    });
                }
                Err(e) => {
                    let delay = self.delay_for(attempt);
                    tracing::warn!(
                        %label,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
