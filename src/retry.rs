//! Retry gating and backoff computation for recoverable failures.
//!
//! The policy is applied at the dispatch boundary, never inside adapters: an
//! adapter only classifies failures, the dispatcher decides whether and when to
//! try again.

use std::collections::HashMap;
use std::time::Duration;

use crate::error::ErrorRecord;

/// Attempt budget and backoff curve for recoverable errors.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use tsumugi::retry::RetryPolicy;
/// use tsumugi::error::{ErrorKind, ErrorRecord};
///
/// let policy = RetryPolicy::default();
/// let record = ErrorRecord::new(ErrorKind::ServerError, "openai", "boom");
/// assert!(policy.should_retry(0, &record));
/// assert_eq!(policy.delay(1, &record), policy.delay(1, &record));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum total attempts, including the initial one.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on each subsequent attempt.
    pub base_delay: Duration,
    /// Upper bound on the computed delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Disables retries entirely.
    pub fn disabled() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Whether attempt `attempt` (0-based) may be retried after `record`.
    pub fn should_retry(&self, attempt: u32, record: &ErrorRecord) -> bool {
        record.recoverable && attempt + 1 < self.max_attempts
    }

    /// Backoff before retrying attempt `attempt` (0-based).
    ///
    /// A provider-supplied `retry_after` wins over the exponential curve and is
    /// honored exactly, regardless of the attempt number or the configured cap.
    pub fn delay(&self, attempt: u32, record: &ErrorRecord) -> Duration {
        if let Some(seconds) = record.retry_after {
            return Duration::from_secs(seconds);
        }
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Extracts the `Retry-After` header (in seconds) if present.
///
/// Providers occasionally instruct clients to wait before re-sending requests.
/// When the header is numeric this helper parses it into whole seconds;
/// HTTP-date values are ignored because vendors primarily use the numeric form.
pub(crate) fn retry_after_from_headers(headers: &HashMap<String, String>) -> Option<u64> {
    headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("retry-after"))
        .and_then(|(_, value)| value.trim().parse::<u64>().ok())
}
