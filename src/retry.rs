//! Retry utilities with exponential backoff and jitter.
//!
//! One backoff policy is shared by every retrying path in the engine: watch
//! reconnection, failed mirror applies, controller requeues and status pushes.
//! The defaults match the reconnection policy of the kube-runtime watcher, so
//! a failed apply never retries more aggressively than the watch feeding it.
//!
//! # Example
//!
//! ```ignore
//! use reflex::retry::{retry_with_backoff, RetryConfig};
//!
//! let list = retry_with_backoff(
//!     &RetryConfig::with_max_attempts(3),
//!     "list_cluster_configs",
//!     || async { api.list(&Default::default()).await },
//! ).await?;
//! ```

use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use tracing::{error, warn};

/// Bounded exponential backoff policy.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Multiplier applied per consecutive failure
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(800),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Create a config that retries forever
    pub fn infinite() -> Self {
        Self::default()
    }

    /// Delay before the next attempt after `failures` consecutive failures.
    ///
    /// `failures == 0` yields zero; the result never exceeds `max_delay`.
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exp = self
            .backoff_multiplier
            .powi(failures.saturating_sub(1).min(64) as i32);
        let secs = (self.initial_delay.as_secs_f64() * exp).min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(secs)
    }

    /// [`Self::delay_for`] with 0.5x-1.5x jitter, still capped at `max_delay`
    pub fn jittered_delay_for(&self, failures: u32) -> Duration {
        let base = self.delay_for(failures);
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_secs_f64((base.as_secs_f64() * jitter).min(self.max_delay.as_secs_f64()))
    }
}

/// Consecutive failure counts per object key, for controller error policies.
///
/// Delays follow [`RetryConfig::delay_for`], without jitter.
#[derive(Debug, Default)]
pub struct KeyedBackoff {
    config: RetryConfig,
    failures: DashMap<String, u32>,
}

impl KeyedBackoff {
    /// Track failures under `config`
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            failures: DashMap::new(),
        }
    }

    /// Record a failure of `key` and return the delay before its next attempt
    pub fn failed(&self, key: &str) -> Duration {
        let mut count = self.failures.entry(key.to_string()).or_insert(0);
        *count = count.saturating_add(1);
        self.config.delay_for(*count)
    }

    /// Forget the failures of `key`
    pub fn succeeded(&self, key: &str) {
        self.failures.remove(key);
    }

    /// Consecutive failures recorded for `key`
    pub fn failures(&self, key: &str) -> u32 {
        self.failures.get(key).map(|c| *c).unwrap_or(0)
    }
}

/// Execute an async operation with exponential backoff and jitter.
///
/// Retries until success, or until `max_attempts` is reached when set, in
/// which case the last error is returned.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                let delay = config.jittered_delay_for(attempt);
                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            backoff_multiplier: 2.0,
        }
    }

    #[test]
    fn delay_grows_exponentially_and_is_capped() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_for(0), Duration::ZERO);
        assert_eq!(config.delay_for(1), Duration::from_millis(800));
        assert_eq!(config.delay_for(2), Duration::from_millis(1600));
        assert_eq!(config.delay_for(3), Duration::from_millis(3200));
        assert_eq!(config.delay_for(20), Duration::from_secs(30));
        assert_eq!(config.delay_for(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn jitter_never_exceeds_max_delay() {
        let config = RetryConfig::default();
        for failures in 1..40 {
            assert!(config.jittered_delay_for(failures) <= config.max_delay);
        }
    }

    #[test]
    fn keyed_backoff_grows_per_key_and_resets_on_success() {
        let backoff = KeyedBackoff::new(RetryConfig::default());

        assert_eq!(backoff.failed("team-a/web"), Duration::from_millis(800));
        assert_eq!(backoff.failed("team-a/web"), Duration::from_millis(1600));
        assert_eq!(backoff.failed("team-a/db"), Duration::from_millis(800));
        assert_eq!(backoff.failures("team-a/web"), 2);

        backoff.succeeded("team-a/web");
        assert_eq!(backoff.failures("team-a/web"), 0);
        assert_eq!(backoff.failed("team-a/web"), Duration::from_millis(800));
        assert_eq!(backoff.failures("team-a/db"), 1);
    }

    #[tokio::test]
    async fn succeeds_after_failures() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<&str, &str> = retry_with_backoff(&fast(), "apply_mirror", || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("conflict")
                } else {
                    Ok("applied")
                }
            }
        })
        .await;

        assert_eq!(result, Ok("applied"));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<(), &str> = retry_with_backoff(&fast(), "list_configs", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err("connection refused")
            }
        })
        .await;

        assert_eq!(result, Err("connection refused"));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }
}
