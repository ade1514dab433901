//! Retry utilities for transient registry failures.
//!
//! Exponential backoff with a cap. Only errors that report themselves as
//! transient are retried; everything else (including digest mismatches)
//! surfaces on the first failure.

use std::future::Future;
use std::time::Duration;

use dockboot_core::config::RetrySettings;
use dockboot_core::error::{ConvertError, Result};
use tracing::{debug, warn};

/// Standard exponential backoff multiplier.
const BACKOFF_MULTIPLIER: f64 = 2.0;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the initial attempt).
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries (caps exponential growth).
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryConfig {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            initial_delay: Duration::from_millis(settings.initial_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            backoff_multiplier: BACKOFF_MULTIPLIER,
        }
    }
}

impl RetryConfig {
    /// No waiting between attempts. Used by tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: BACKOFF_MULTIPLIER,
        }
    }

    /// Delay that follows `delay`.
    pub fn next_delay(&self, delay: Duration) -> Duration {
        Duration::from_secs_f64(
            (delay.as_secs_f64() * self.backoff_multiplier).min(self.max_delay.as_secs_f64()),
        )
    }
}

/// Run `operation` until it succeeds, fails permanently, or attempts run out.
pub async fn retry_with_backoff<T, F, Fut>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(
                        operation = %operation_name,
                        attempts = attempt,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) => {
                if !e.is_transient() {
                    return Err(e);
                }
                if attempt >= config.max_attempts {
                    warn!(
                        operation = %operation_name,
                        attempts = attempt,
                        error = %e,
                        "Operation failed after max attempts"
                    );
                    return Err(e);
                }

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    max_attempts = config.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Operation failed, will retry"
                );

                tokio::time::sleep(delay).await;
                delay = config.next_delay(delay);
            }
        }
    }
}

/// Classify a reqwest failure.
pub fn classify_http_error(context: &str, err: &reqwest::Error) -> ConvertError {
    // Timeouts, connect failures and truncated bodies all land here.
    if err.is_decode() || err.is_builder() {
        ConvertError::Protocol(format!("{}: {}", context, err))
    } else {
        ConvertError::TransientNetwork(format!("{}: {}", context, err))
    }
}
