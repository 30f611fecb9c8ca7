//! Retry policy and backoff computation
//!
//! The attempt loop asks the policy for a decision after every failure.
//! A custom predicate can veto, approve, or approve-with-explicit-delay;
//! a plain approval uses the computed exponential backoff.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{FetchError, STATUS_TRANSPORT};

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the computed backoff delay
    Retry,
    /// Retry after this explicit delay instead of the computed one
    After(Duration),
    /// Give up and surface the error
    Stop,
}

/// Custom retry predicate: `(error, attempt)` → decision
pub type ShouldRetry = Arc<dyn Fn(&FetchError, u32) -> RetryDecision + Send + Sync>;

/// Retry configuration
#[derive(Clone)]
pub struct RetryConfig {
    /// Total attempts allowed; `0` disables retry (one attempt, no retries)
    pub max_attempts: u32,
    /// Base delay for backoff
    pub base_delay: Duration,
    /// Ceiling for any computed delay
    pub max_delay: Duration,
    /// Double the delay each attempt when true; flat `base_delay` otherwise
    pub use_exponential_backoff: bool,
    /// Statuses worth retrying for parse/response failures
    pub retryable_status_codes: HashSet<u16>,
    /// Custom predicate; `None` uses the default rules
    pub should_retry: Option<ShouldRetry>,
}

impl std::fmt::Debug for RetryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryConfig")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("use_exponential_backoff", &self.use_exponential_backoff)
            .field("retryable_status_codes", &self.retryable_status_codes)
            .field("should_retry", &self.should_retry.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            use_exponential_backoff: true,
            retryable_status_codes: [408, 425, 429, STATUS_TRANSPORT, 500, 502, 503, 504]
                .into_iter()
                .collect(),
            should_retry: None,
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// No retries at all
    pub fn disabled() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_exponential_backoff(mut self, enabled: bool) -> Self {
        self.use_exponential_backoff = enabled;
        self
    }

    pub fn with_retryable_status_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.retryable_status_codes = codes.into_iter().collect();
        self
    }

    pub fn with_should_retry(mut self, predicate: ShouldRetry) -> Self {
        self.should_retry = Some(predicate);
        self
    }

    /// Total attempts the loop may make (always at least one)
    pub fn attempt_ceiling(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Backoff delay before the attempt following `attempt` (1-based)
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        if self.use_exponential_backoff {
            let multiplier = 2_u32.saturating_pow(attempt.saturating_sub(1));
            (self.base_delay * multiplier).min(self.max_delay)
        } else {
            self.base_delay.min(self.max_delay)
        }
    }

    /// Decision for a failed attempt (1-based). Exhausted attempts always
    /// stop; otherwise the custom predicate, or the default rules, decide.
    pub fn decision(&self, error: &FetchError, attempt: u32) -> RetryDecision {
        if attempt >= self.attempt_ceiling() {
            return RetryDecision::Stop;
        }
        match &self.should_retry {
            Some(predicate) => predicate(error, attempt),
            None => self.default_decision(error),
        }
    }

    /// Default rules: aborts never retry; errors without a status never
    /// retry; synthesized 499 (transport) retries; anything else retries
    /// only if its status is configured retryable.
    fn default_decision(&self, error: &FetchError) -> RetryDecision {
        if error.is_aborted() {
            return RetryDecision::Stop;
        }
        let Some(status) = error.status() else {
            return RetryDecision::Stop;
        };
        if status == STATUS_TRANSPORT || self.retryable_status_codes.contains(&status) {
            RetryDecision::Retry
        } else {
            RetryDecision::Stop
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorContext;
    use http::Method;

    fn response_error(status: u16) -> FetchError {
        FetchError::response(status, ErrorContext::new(Method::GET, "/r"))
    }

    #[test]
    fn test_exponential_backoff_doubles_and_caps() {
        let config = RetryConfig::default()
            .with_base_delay(Duration::from_millis(10))
            .with_max_delay(Duration::from_millis(25));
        assert_eq!(config.backoff_delay(1), Duration::from_millis(10));
        assert_eq!(config.backoff_delay(2), Duration::from_millis(20));
        assert_eq!(config.backoff_delay(3), Duration::from_millis(25));
    }

    #[test]
    fn test_flat_backoff() {
        let config = RetryConfig::default()
            .with_exponential_backoff(false)
            .with_base_delay(Duration::from_millis(10));
        assert_eq!(config.backoff_delay(5), Duration::from_millis(10));
    }

    #[test]
    fn test_default_decision_rules() {
        let config = RetryConfig::default().with_max_attempts(5);

        let transport = FetchError::transport("reset", false, ErrorContext::default(), None);
        assert_eq!(config.decision(&transport, 1), RetryDecision::Retry);

        assert_eq!(config.decision(&response_error(503), 1), RetryDecision::Retry);
        assert_eq!(config.decision(&response_error(404), 1), RetryDecision::Stop);

        let aborted = FetchError::aborted(false, None, ErrorContext::default());
        assert_eq!(config.decision(&aborted, 1), RetryDecision::Stop);

        let rate_limited = FetchError::RateLimited {
            capacity: 1,
            context: ErrorContext::default(),
        };
        // No status → never retried by the default rules
        assert_eq!(config.decision(&rate_limited, 1), RetryDecision::Stop);
    }

    #[test]
    fn test_exhausted_attempts_stop() {
        let config = RetryConfig::default().with_max_attempts(3);
        assert_eq!(config.decision(&response_error(503), 3), RetryDecision::Stop);
        assert_eq!(config.decision(&response_error(503), 2), RetryDecision::Retry);
    }

    #[test]
    fn test_zero_attempts_disables_retry() {
        let config = RetryConfig::disabled();
        assert_eq!(config.attempt_ceiling(), 1);
        assert_eq!(config.decision(&response_error(503), 1), RetryDecision::Stop);
    }

    #[test]
    fn test_numeric_override_replaces_computed_delay() {
        let config = RetryConfig::default().with_max_attempts(3).with_should_retry(
            Arc::new(|_, _| RetryDecision::After(Duration::from_millis(7))),
        );
        assert_eq!(
            config.decision(&response_error(500), 1),
            RetryDecision::After(Duration::from_millis(7))
        );
    }
}
