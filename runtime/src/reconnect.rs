//! Bounded, fixed-delay retry for establishing broker links.
//!
//! Connection attempts are driven by an iterative loop with an explicit attempt counter.
//! After `max_attempts` failures the last error is returned and nothing else is tried.
//!
//! # Example
//!
//! ```rust
//! use brokered_rpc_runtime::reconnect::{ReconnectPolicy, retry_connect};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), String> {
//! let policy = ReconnectPolicy::builder()
//!     .max_attempts(5)
//!     .delay(Duration::from_secs(5))
//!     .build();
//!
//! let link = retry_connect(&policy, |_attempt| async {
//!     // Your connection attempt here
//!     Ok::<_, String>(42)
//! }, |_err| true).await?;
//! # Ok(())
//! # }
//! ```

use brokered_rpc_core::config::RpcSettings;
use std::time::Duration;
use tokio::time::sleep;

/// Reconnection policy.
///
/// # Default Values
///
/// - `max_attempts`: 5
/// - `delay`: 5 seconds between attempts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Total connection attempts before giving up
    pub max_attempts: usize,
    /// Fixed delay between two attempts
    pub delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_secs(5),
        }
    }
}

impl ReconnectPolicy {
    /// Create a new policy builder.
    #[must_use]
    pub const fn builder() -> ReconnectPolicyBuilder {
        ReconnectPolicyBuilder {
            max_attempts: None,
            delay: None,
        }
    }

    /// Policy matching the runtime settings.
    #[must_use]
    pub const fn from_settings(settings: &RpcSettings) -> Self {
        Self {
            max_attempts: settings.reconnect_attempts,
            delay: settings.reconnect_delay,
        }
    }
}

/// Builder for [`ReconnectPolicy`].
#[derive(Debug, Clone)]
pub struct ReconnectPolicyBuilder {
    max_attempts: Option<usize>,
    delay: Option<Duration>,
}

impl ReconnectPolicyBuilder {
    /// Set the attempt budget.
    #[must_use]
    pub const fn max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Set the delay between attempts.
    #[must_use]
    pub const fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Build the [`ReconnectPolicy`].
    #[must_use]
    pub fn build(self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.max_attempts.unwrap_or(5).max(1),
            delay: self.delay.unwrap_or(Duration::from_secs(5)),
        }
    }
}

/// Run `operation` until it succeeds, the error is not retryable, or the budget is spent.
///
/// `operation` receives the 1-based attempt number. The delay is only slept between
/// attempts, never after the last one.
///
/// # Errors
///
/// Returns the last error once `policy.max_attempts` attempts have failed, or the first
/// error for which `is_retryable` returns `false`.
pub async fn retry_connect<F, Fut, T, E, P>(
    policy: &ReconnectPolicy,
    mut operation: F,
    is_retryable: P,
) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 1;

    loop {
        match operation(attempt).await {
            Ok(result) => {
                if attempt > 1 {
                    tracing::info!(attempt, "Connection established after retry");
                }
                return Ok(result);
            }
            Err(err) => {
                if !is_retryable(&err) {
                    tracing::debug!(error = %err, "Connection attempt aborted");
                    return Err(err);
                }

                if attempt >= policy.max_attempts {
                    tracing::error!(
                        attempt,
                        error = %err,
                        "Connection failed after max attempts"
                    );
                    return Err(err);
                }

                tracing::warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = policy.delay.as_millis(),
                    error = %err,
                    "Connection attempt failed, retrying..."
                );

                sleep(policy.delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn builder_defaults_match_policy_defaults() {
        assert_eq!(ReconnectPolicy::builder().build(), ReconnectPolicy::default());
    }

    #[test]
    fn zero_attempts_is_clamped_to_one() {
        let policy = ReconnectPolicy::builder().max_attempts(0).build();
        assert_eq!(policy.max_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_failures() {
        let policy = ReconnectPolicy::builder()
            .max_attempts(5)
            .delay(Duration::from_secs(5))
            .build();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = Arc::clone(&counter);

        let result = retry_connect(
            &policy,
            |attempt| {
                let c = Arc::clone(&counter_clone);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    if attempt < 3 { Err(format!("attempt {attempt} failed")) } else { Ok(attempt) }
                }
            },
            |_| true,
        )
        .await;

        assert_eq!(result, Ok(3));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_after_exactly_max_attempts() {
        let policy = ReconnectPolicy::builder()
            .max_attempts(5)
            .delay(Duration::from_secs(5))
            .build();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = Arc::clone(&counter);
        let started = tokio::time::Instant::now();

        let result = retry_connect(
            &policy,
            |_| {
                let c = Arc::clone(&counter_clone);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>("unreachable")
                }
            },
            |_| true,
        )
        .await;

        assert_eq!(result, Err("unreachable"));
        assert_eq!(counter.load(Ordering::SeqCst), 5);
        // Four gaps between five attempts, no sleep after the last one
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(20) && elapsed < Duration::from_secs(21));
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_error_fails_immediately() {
        let policy = ReconnectPolicy::default();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = Arc::clone(&counter);

        let result = retry_connect(
            &policy,
            |_| {
                let c = Arc::clone(&counter_clone);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>("closed")
                }
            },
            |err: &&str| *err != "closed",
        )
        .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
