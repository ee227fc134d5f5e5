//! Retry with exponential backoff for transient store failures.

use std::time::Duration;
use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};
use tracing::warn;
use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: f64, // 0.0 - 1.0
}

impl Default for RetryConfig { fn default() -> Self { Self { max_retries: 3, base_delay_ms: 20, max_delay_ms: 500, jitter: 0.25 } } }

impl RetryConfig {
    pub fn none() -> Self { Self { max_retries: 0, ..Default::default() } }

    fn delay_for(&self, attempt: usize) -> Duration {
        let base = Duration::from_millis(self.base_delay_ms);
        let exp = base.mul_f64(2f64.powi(attempt as i32));
        let mut delay = std::cmp::min(exp, Duration::from_millis(self.max_delay_ms));
        if self.jitter > 0.0 {
            let jitter_ms = (delay.as_millis() as f64 * self.jitter) as i64;
            let offset: i64 = thread_rng().gen_range(-jitter_ms..=jitter_ms);
            delay = Duration::from_millis((delay.as_millis() as i64 + offset).max(0) as u64);
        }
        delay
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or retries are exhausted.
pub async fn retry_async<F, Fut, T>(cfg: &RetryConfig, what: &str, mut op: F) -> Result<T>
where
    F: FnMut(usize) -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) if !e.is_retryable() || attempt >= cfg.max_retries => return Err(e),
            Err(e) => {
                let delay = cfg.delay_for(attempt);
                warn!(op = what, attempt, ?delay, error = %e, "retrying store operation");
                crate::metrics::CV_METRICS.store_retries_total.add(1, &[]);
                tokio::time::sleep(delay).await;
            }
        }
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CvError;

    fn fast() -> RetryConfig { RetryConfig { max_retries: 3, base_delay_ms: 1, max_delay_ms: 5, jitter: 0.0 } }

    #[tokio::test]
    async fn retries_store_errors_until_success() {
        let mut attempts = 0;
        let res = retry_async(&fast(), "get", |_i| {
            attempts += 1;
            let n = attempts;
            async move { if n < 3 { Err(CvError::Store("flaky".into())) } else { Ok(42) } }
        }).await;
        assert_eq!(res.unwrap(), 42);
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn does_not_retry_configuration_errors() {
        let mut attempts = 0;
        let res: Result<()> = retry_async(&fast(), "get", |_i| {
            attempts += 1;
            async { Err(CvError::Configuration("bad".into())) }
        }).await;
        assert!(matches!(res, Err(CvError::Configuration(_))));
        assert_eq!(attempts, 1);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let mut attempts = 0;
        let res: Result<()> = retry_async(&fast(), "put", |_i| {
            attempts += 1;
            async { Err(CvError::Store("down".into())) }
        }).await;
        assert!(res.is_err());
        assert_eq!(attempts, 4);
    }
}
