//! Exponential backoff for startup calls
//!
//! The operator talks to two external systems before it can reconcile
//! anything: the Kubernetes API (CRD install) and vCenter (login and scope
//! resolution). Both can be briefly unavailable when the pod starts, so those
//! calls go through [`retry_with_backoff`]. Reconcile-time backend calls are
//! never retried here; the controller's requeue is the retry.

use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// Backoff settings
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = unlimited)
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Growth factor between consecutive delays
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Limit the number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Settings for connecting at startup: roughly two minutes of attempts
    /// before giving up and letting the pod restart
    pub fn startup() -> Self {
        Self {
            max_attempts: 8,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }

    /// Delay after `attempt` failed attempts, before jitter
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }

    fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts > 0 && attempt >= self.max_attempts
    }
}

/// Run `operation` until it succeeds or attempts run out
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_with_backoff_if(config, operation_name, operation, |_| true).await
}

/// Like [`retry_with_backoff`], but gives up at once when `is_transient`
/// says an error will not go away by waiting
pub async fn retry_with_backoff_if<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
    is_transient: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        let e = match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        if !is_transient(&e) {
            error!(operation = %operation_name, attempt, error = %e, "permanent failure, not retrying");
            return Err(e);
        }
        if config.exhausted(attempt) {
            error!(operation = %operation_name, attempt, error = %e, "giving up after max attempts");
            return Err(e);
        }

        // 0.5x to 1.5x so restarted replicas do not retry in lockstep
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let delay = Duration::from_secs_f64(config.delay_for(attempt).as_secs_f64() * jitter);

        warn!(
            operation = %operation_name,
            attempt,
            error = %e,
            delay_ms = delay.as_millis() as u64,
            "attempt failed, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}
