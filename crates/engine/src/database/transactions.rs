//! Conflict retry for closure transactions
//!
//! A commit that loses a version race fails with `ConcurrentModification`
//! and leaves no partial state behind, so the closure can run again against
//! fresh data. Aborts caused by a concurrent schema change are not retried,
//! nor are unique violations or validation failures.

use std::time::Duration;

/// How often and how patiently `Database::transaction_with_retry` reruns a
/// closure whose commit hit a record version conflict
///
/// ```ignore
/// let retry = RetryConfig::new()
///     .with_max_retries(5)
///     .with_backoff(Duration::from_millis(5), Duration::from_millis(200));
/// db.transaction_with_retry(retry, |session| { ... })?;
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Reruns allowed after the first conflicting commit
    pub max_retries: usize,
    /// Pause before the first rerun, doubled for each one after it
    pub base_delay: Duration,
    /// Ceiling on a single pause
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_retries: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
        }
    }
}

impl RetryConfig {
    /// Three reruns, 10ms doubling up to 100ms
    pub fn new() -> Self {
        Self::default()
    }

    /// Report the first conflict to the caller
    pub fn no_retry() -> Self {
        RetryConfig {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Allow `max_retries` reruns
    pub fn with_max_retries(self, max_retries: usize) -> Self {
        RetryConfig { max_retries, ..self }
    }

    /// Pause schedule between reruns
    pub fn with_backoff(self, base_delay: Duration, max_delay: Duration) -> Self {
        RetryConfig {
            base_delay,
            max_delay,
            ..self
        }
    }

    /// Pause before rerun number `retry` (zero-based)
    pub(crate) fn backoff(&self, retry: usize) -> Duration {
        let factor = 2u32.saturating_pow(retry.min(31) as u32);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}
