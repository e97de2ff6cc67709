//! Bounded retries with exponential backoff and jitter.
//!
//! The delay before retry `n` (1-based, counting failed attempts) is
//! `min(max_delay, initial_delay * backoff_multiplier^(n-1))`, perturbed
//! uniformly by `±jitter_factor` of itself.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    pub initial_delay_ms: u64,
    /// Maximum delay cap in milliseconds.
    pub max_delay_ms: u64,
    /// Growth factor applied per failed attempt.
    pub backoff_multiplier: f64,
    /// Fraction of the computed delay that is randomized, in `[0, 1]`.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Creates a new retry policy with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy that makes exactly one attempt.
    #[must_use]
    pub fn no_retry() -> Self {
        Self::default().with_max_attempts(1)
    }

    /// Sets the maximum attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the initial delay.
    #[must_use]
    pub fn with_initial_delay_ms(mut self, delay: u64) -> Self {
        self.initial_delay_ms = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the backoff multiplier.
    #[must_use]
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Sets the jitter factor.
    #[must_use]
    pub fn with_jitter_factor(mut self, factor: f64) -> Self {
        self.jitter_factor = factor;
        self
    }

    /// Attempts actually allowed; zero is treated as one.
    #[must_use]
    pub fn effective_max_attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Un-jittered delay after the given failed attempt (1-based).
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let multiplier = self.backoff_multiplier.max(0.0);
        #[allow(clippy::cast_precision_loss)]
        let raw = self.initial_delay_ms as f64 * multiplier.powi(exponent);
        #[allow(clippy::cast_precision_loss)]
        let capped = raw.min(self.max_delay_ms as f64);
        Duration::from_millis(to_millis(capped))
    }

    /// Delay after the given failed attempt with jitter applied.
    #[must_use]
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let factor = self.jitter_factor.clamp(0.0, 1.0);
        #[allow(clippy::cast_precision_loss)]
        let base_ms = base.as_millis() as f64;
        if factor == 0.0 || base_ms == 0.0 {
            return base;
        }

        let spread = base_ms * factor;
        let jittered = rand::thread_rng().gen_range((base_ms - spread)..=(base_ms + spread));
        Duration::from_millis(to_millis(jittered))
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn to_millis(value: f64) -> u64 {
    if value.is_nan() || value <= 0.0 {
        0
    } else if value >= u64::MAX as f64 {
        u64::MAX
    } else {
        value.round() as u64
    }
}

/// Outcome of a retried operation.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryOutcome<T, E> {
    /// Whether any attempt succeeded.
    pub success: bool,
    /// The successful value; present iff `success`.
    pub result: Option<T>,
    /// The last error; present iff not `success`.
    pub error: Option<E>,
    /// Number of attempts made.
    pub attempts_made: u32,
}

impl<T, E> RetryOutcome<T, E> {
    fn succeeded(result: T, attempts_made: u32) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
            attempts_made,
        }
    }

    fn failed(error: E, attempts_made: u32) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error),
            attempts_made,
        }
    }

    /// Converts the outcome into a plain `Result`.
    ///
    /// # Errors
    ///
    /// Returns the last error when every attempt failed.
    pub fn into_result(self) -> Result<T, E> {
        match (self.result, self.error) {
            (Some(value), _) => Ok(value),
            (None, Some(error)) => Err(error),
            (None, None) => unreachable!("retry outcome carries neither result nor error"),
        }
    }
}

/// Observer called before each retry with `(error, failed_attempt, delay_ms)`.
pub type RetryObserver = Arc<dyn Fn(&str, u32, u64) + Send + Sync>;

/// Runs an async operation under a [`RetryPolicy`].
///
/// Attempts are strictly sequential. The executor never panics on operation
/// failure; exhaustion is reported through [`RetryOutcome`].
#[derive(Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    observer: Option<RetryObserver>,
}

impl std::fmt::Debug for RetryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("policy", &self.policy)
            .field("has_observer", &self.observer.is_some())
            .finish()
    }
}

impl RetryExecutor {
    /// Creates an executor for the given policy.
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            observer: None,
        }
    }

    /// Attaches a retry observer.
    #[must_use]
    pub fn with_observer<F>(mut self, observer: F) -> Self
    where
        F: Fn(&str, u32, u64) + Send + Sync + 'static,
    {
        self.observer = Some(Arc::new(observer));
        self
    }

    /// Returns the policy.
    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Executes `operation`, retrying every failure.
    ///
    /// `context` is attached to log records and is not used for control flow.
    pub async fn execute<T, E, F, Fut>(&self, operation: F, context: &str) -> RetryOutcome<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.execute_when(operation, context, |_| true).await
    }

    /// Executes `operation`, retrying only failures accepted by `retryable`.
    ///
    /// A rejected failure ends the run immediately with the attempts made so
    /// far.
    pub async fn execute_when<T, E, F, Fut, P>(
        &self,
        mut operation: F,
        context: &str,
        retryable: P,
    ) -> RetryOutcome<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
        P: Fn(&E) -> bool,
    {
        let max_attempts = self.policy.effective_max_attempts();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let error = match operation().await {
                Ok(result) => return RetryOutcome::succeeded(result, attempt),
                Err(e) => e,
            };

            if attempt >= max_attempts {
                tracing::warn!(
                    context,
                    attempts = attempt,
                    error = %error,
                    "Giving up after final attempt"
                );
                return RetryOutcome::failed(error, attempt);
            }
            if !retryable(&error) {
                tracing::debug!(context, attempt, error = %error, "Error is not retryable");
                return RetryOutcome::failed(error, attempt);
            }

            let delay = self.policy.jittered_delay(attempt);
            let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
            tracing::debug!(
                context,
                attempt,
                max_attempts,
                delay_ms,
                error = %error,
                "Retrying after error"
            );
            if let Some(observer) = &self.observer {
                observer(&error.to_string(), attempt, delay_ms);
            }
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new()
            .with_max_attempts(max_attempts)
            .with_initial_delay_ms(1)
            .with_jitter_factor(0.0)
    }

    #[test]
    fn test_retry_policy_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_delay_ms, 1000);
        assert_eq!(policy.max_delay_ms, 30_000);
    }

    #[test]
    fn test_base_delay_exponential() {
        let policy = RetryPolicy::new()
            .with_initial_delay_ms(100)
            .with_backoff_multiplier(2.0);

        assert_eq!(policy.base_delay(1), Duration::from_millis(100));
        assert_eq!(policy.base_delay(2), Duration::from_millis(200));
        assert_eq!(policy.base_delay(3), Duration::from_millis(400));
    }

    #[test]
    fn test_base_delay_capped_at_max() {
        let policy = RetryPolicy::new()
            .with_initial_delay_ms(1000)
            .with_max_delay_ms(5000);

        assert_eq!(policy.base_delay(10), Duration::from_millis(5000));
        assert_eq!(policy.base_delay(u32::MAX), Duration::from_millis(5000));
    }

    #[test]
    fn test_jittered_delay_within_bounds() {
        let policy = RetryPolicy::new()
            .with_initial_delay_ms(1000)
            .with_jitter_factor(0.25);

        for _ in 0..50 {
            let delay = policy.jittered_delay(1).as_millis();
            assert!((750..=1250).contains(&delay), "delay {delay} out of range");
        }
    }

    #[test]
    fn test_zero_jitter_is_deterministic() {
        let policy = RetryPolicy::new().with_initial_delay_ms(300).with_jitter_factor(0.0);
        assert_eq!(policy.jittered_delay(2), Duration::from_millis(600));
    }

    #[tokio::test]
    async fn test_success_first_try() {
        let executor = RetryExecutor::new(fast_policy(3));
        let outcome: RetryOutcome<i32, String> =
            executor.execute(|| async { Ok(42) }, "test").await;

        assert!(outcome.success);
        assert_eq!(outcome.result, Some(42));
        assert_eq!(outcome.attempts_made, 1);
    }

    #[tokio::test]
    async fn test_fails_twice_then_succeeds() {
        let calls = AtomicU32::new(0);
        let executor = RetryExecutor::new(fast_policy(3));

        let outcome: RetryOutcome<&str, String> = executor
            .execute(
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    async move {
                        if n < 3 {
                            Err(format!("attempt {n}"))
                        } else {
                            Ok("done")
                        }
                    }
                },
                "test",
            )
            .await;

        assert!(outcome.success);
        assert_eq!(outcome.attempts_made, 3);
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn test_always_fails_invokes_observer_between_attempts() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let executor = RetryExecutor::new(fast_policy(3)).with_observer(move |err, attempt, delay| {
            seen_clone.lock().push((err.to_string(), attempt, delay));
        });

        let outcome: RetryOutcome<(), String> = executor
            .execute(|| async { Err("always fails".to_string()) }, "test")
            .await;

        assert!(!outcome.success);
        assert_eq!(outcome.attempts_made, 3);
        assert_eq!(outcome.error.as_deref(), Some("always fails"));

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].1, 1);
        assert_eq!(seen[1].1, 2);
        assert_eq!(seen[1].2, 2);
    }

    #[tokio::test]
    async fn test_non_retryable_error_stops_immediately() {
        let calls = AtomicU32::new(0);
        let executor = RetryExecutor::new(fast_policy(5));

        let outcome: RetryOutcome<(), String> = executor
            .execute_when(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err("fatal".to_string()) }
                },
                "test",
                |e| e != "fatal",
            )
            .await;

        assert_eq!(outcome.attempts_made, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_zero_max_attempts_runs_once() {
        let executor = RetryExecutor::new(fast_policy(0));
        let outcome: RetryOutcome<(), String> =
            executor.execute(|| async { Err("x".to_string()) }, "test").await;

        assert_eq!(outcome.attempts_made, 1);
        assert_eq!(outcome.into_result(), Err("x".to_string()));
    }
}
