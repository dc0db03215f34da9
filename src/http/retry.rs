//! Retry/backoff policy: a pure decision function over attempt index and
//! classified error.

use std::collections::BTreeSet;
use std::time::Duration;

use crate::error::{ApiError, Error};

/// Default number of retries after the first attempt.
pub const MAX_RETRIES: usize = 3;

/// Default base delay for exponential backoff, in milliseconds.
pub const BASE_DELAY_MS: u64 = 1000;

/// Default ceiling for the exponential part of the delay, in milliseconds.
pub const MAX_DELAY_MS: u64 = 10_000;

/// Upper bound of the random jitter, as a fraction of the capped delay.
pub const JITTER_FRACTION: f64 = 0.3;

const RETRYABLE_STATUSES: [u16; 4] = [429, 502, 503, 504];

const RETRYABLE_MESSAGES: [&str; 7] = [
    "failed to fetch",
    "fetch failed",
    "timeout",
    "aborted",
    "dns resolution failed",
    "network error",
    "connection reset",
];

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub retryable_statuses: BTreeSet<u16>,
    /// Lowercased phrases matched as substrings of failure messages.
    pub retryable_messages: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            base_delay: Duration::from_millis(BASE_DELAY_MS),
            max_delay: Duration::from_millis(MAX_DELAY_MS),
            retryable_statuses: RETRYABLE_STATUSES.into_iter().collect(),
            retryable_messages: RETRYABLE_MESSAGES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the backoff delays. `max_delay` is raised to `base_delay` if lower.
    pub fn with_delays(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay.max(base_delay);
        self
    }

    pub fn with_retryable_statuses(mut self, statuses: impl IntoIterator<Item = u16>) -> Self {
        self.retryable_statuses = statuses.into_iter().collect();
        self
    }

    pub fn with_retryable_messages<S: AsRef<str>>(
        mut self,
        phrases: impl IntoIterator<Item = S>,
    ) -> Self {
        self.retryable_messages = phrases
            .into_iter()
            .map(|s| s.as_ref().to_lowercase())
            .collect();
        self
    }

    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.retryable_statuses.contains(&status)
    }

    /// Case-insensitive substring match against the configured phrases.
    pub fn is_retryable_message(&self, message: &str) -> bool {
        let message = message.to_lowercase();
        self.retryable_messages
            .iter()
            .any(|phrase| message.contains(phrase.as_str()))
    }

    /// Whether a classified error is transient.
    pub fn is_retryable(&self, error: &Error) -> bool {
        match error {
            Error::Api(ApiError::Network { message, .. }) => self.is_retryable_message(message),
            Error::Api(api) => self.is_retryable_status(api.status()),
            Error::Transport(_) | Error::Encode(_) | Error::Decode(_) | Error::Storage(_) => {
                false
            }
        }
    }

    /// Whether attempt `attempt` (0-based) may be followed by another one.
    pub fn should_retry(&self, error: &Error, attempt: usize) -> bool {
        attempt < self.max_retries && self.is_retryable(error)
    }

    /// `min(base * 2^attempt, max)` without jitter.
    pub fn capped_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Backoff delay with `jitter` in `[0, 1]` scaled to at most 30% extra.
    pub fn delay_with_jitter(&self, attempt: u32, jitter: f64) -> Duration {
        let capped = self.capped_delay(attempt);
        let extra = capped.as_nanos() as f64 * JITTER_FRACTION * jitter.clamp(0.0, 1.0);
        capped + Duration::from_nanos(extra.round() as u64)
    }

    /// Backoff delay with uniformly random jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with_jitter(attempt, rand::random::<f64>())
    }
}
