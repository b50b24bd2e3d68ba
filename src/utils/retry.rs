use std::future::Future;
use std::time::Duration;

use anyhow::{anyhow, Result};
use rand::Rng;

/// Caps every computed delay.
pub const MAX_DELAY_MS: u64 = 30_000;

/// Exponential backoff with ±10% jitter.
///
/// Used two ways: `execute` retries one operation in place, while `record_failure` /
/// `record_success` track consecutive failures of a periodic loop and stretch its sleep.
#[derive(Debug, Clone)]
pub struct ExponentialBackoffRetry {
    base_delay_ms: u64,
    max_retries: u32,
    current_attempt: u32,
    consecutive_failures: u32,
}

impl ExponentialBackoffRetry {
    pub fn new(base_delay_ms: u64, max_retries: u32) -> Self {
        Self {
            base_delay_ms,
            max_retries,
            current_attempt: 0,
            consecutive_failures: 0,
        }
    }

    /// Runs `operation` until it succeeds or `max_retries` retries are spent.
    pub async fn execute<F, Fut, T>(&mut self, label: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            self.current_attempt = attempt;

            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    if attempt < self.max_retries {
                        let delay_ms = self.calculate_delay(attempt);
                        tracing::warn!(
                            "{} failed (attempt {}/{}): {} - retrying in {}ms",
                            label,
                            attempt + 1,
                            self.max_retries + 1,
                            e,
                            delay_ms
                        );
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(anyhow!(
            "{} failed after {} attempts: {}",
            label,
            self.max_retries + 1,
            last_error.unwrap_or_else(|| anyhow!("unknown error"))
        ))
    }

    fn calculate_delay(&self, attempt: u32) -> u64 {
        let exponential_delay = self
            .base_delay_ms
            .saturating_mul(2_u64.saturating_pow(attempt.min(20)));
        let jitter_range = (exponential_delay as f64 * 0.1) as u64;

        let mut rng = rand::thread_rng();
        let jitter = rng.gen_range(0..=jitter_range * 2) as i64 - jitter_range as i64;

        let final_delay = (exponential_delay as i64 + jitter).max(0) as u64;
        final_delay.min(MAX_DELAY_MS)
    }

    /// Registers a failed tick and returns how long the loop should wait before the next one.
    pub fn record_failure(&mut self) -> Duration {
        let delay = self.calculate_delay(self.consecutive_failures);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        Duration::from_millis(delay)
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn current_attempt(&self) -> u32 {
        self.current_attempt
    }

    pub fn exhausted(&self) -> bool {
        self.current_attempt >= self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_operation_with_retries() -> Result<()> {
        let mut retry = ExponentialBackoffRetry::new(5, 3);
        let mut attempt_count = 0;

        let result = retry
            .execute("flaky upload", || {
                attempt_count += 1;
                let current = attempt_count;
                async move {
                    if current < 3 {
                        Err(anyhow!("temporary failure"))
                    } else {
                        Ok::<i32, anyhow::Error>(42)
                    }
                }
            })
            .await?;

        assert_eq!(result, 42);
        assert_eq!(attempt_count, 3);
        assert_eq!(retry.current_attempt(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_operation_exhausts_retries() {
        let mut retry = ExponentialBackoffRetry::new(5, 2);
        let result = retry
            .execute("broken upload", || async { Err::<i32, _>(anyhow!("permanent failure")) })
            .await;

        assert!(result.is_err());
        assert!(retry.exhausted());
    }

    #[test]
    fn test_failure_streak_grows_and_caps() {
        let mut backoff = ExponentialBackoffRetry::new(1000, 0);

        let first = backoff.record_failure().as_millis() as u64;
        assert!((900..=1100).contains(&first));
        let second = backoff.record_failure().as_millis() as u64;
        assert!((1800..=2200).contains(&second));

        for _ in 0..10 {
            backoff.record_failure();
        }
        assert!(backoff.record_failure().as_millis() as u64 <= MAX_DELAY_MS);
        assert_eq!(backoff.consecutive_failures(), 13);

        backoff.record_success();
        assert_eq!(backoff.consecutive_failures(), 0);
    }
}
