//! Backoff for remote delivery attempts.

use std::future::Future;
use anyhow::{anyhow, Result};
use tokio::time::{sleep, Duration};
use rand::Rng;

use crate::logging::{self, obj, v_num, v_str, Domain, Level};

#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 200,
            max_delay_ms: 5000,
            jitter_factor: 0.3,
        }
    }
}

impl RetryConfig {
    /// Doubling delay capped at `max_delay_ms`, spread by up to
    /// `jitter_factor` either way.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let capped = (self.base_delay_ms as f64 * 2.0_f64.powi(attempt as i32)).min(self.max_delay_ms as f64);
        let spread = capped * self.jitter_factor;
        let jitter = if spread > 0.0 {
            rand::thread_rng().gen_range(-spread..=spread)
        } else {
            0.0
        };
        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }
}

/// Retry a fallible async operation with exponential backoff, giving up
/// early on errors `retryable` rejects.
pub async fn retry_async_if<F, Fut, T, P>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
    retryable: P,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&anyhow::Error) -> bool,
{
    let attempts = config.max_retries + 1;
    let mut last_error = None;
    for attempt in 0..attempts {
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if !retryable(&e) => return Err(e),
            Err(e) => e,
        };
        if attempt + 1 < attempts {
            let delay = config.backoff(attempt);
            logging::log(
                Level::Debug,
                Domain::Remote,
                "retry_scheduled",
                obj(&[
                    ("op", v_str(operation_name)),
                    ("attempt", v_num((attempt + 1) as f64)),
                    ("of", v_num(attempts as f64)),
                    ("delay_ms", v_num(delay.as_millis() as f64)),
                    ("error", v_str(&err.to_string())),
                ]),
            );
            sleep(delay).await;
        }
        last_error = Some(err);
    }
    Err(last_error.unwrap_or_else(|| anyhow!("{}: no attempts made", operation_name)))
}

/// Timeouts, throttling and gateway/server hiccups; anything else is the
/// endpoint refusing the batch.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
}
