use std::sync::Mutex;
use std::time::Duration;

use crate::config::{RetryPolicy, RetryThrottleSettings};

/// Integer scale applied to token arithmetic so fractional token ratios
/// never accumulate float drift.
const TOKEN_SCALE: i64 = 1000;

/// A leaky token bucket gating automatic retries.
///
/// Each retryable failure drains one token, each success restores
/// `token_ratio` tokens (saturating at `max_tokens`), and retries are only
/// permitted while more than half the tokens remain. One throttle is shared
/// per transport across all its calls.
#[derive(Debug)]
pub struct RetryThrottle {
    max_tokens: i64,
    token_ratio: i64,
    tokens: Mutex<i64>,
}

impl RetryThrottle {
    pub fn new(settings: &RetryThrottleSettings) -> Self {
        let max_tokens = i64::from(settings.max_tokens) * TOKEN_SCALE;
        let token_ratio = (settings.token_ratio.clamp(0.0, 1.0) * TOKEN_SCALE as f64) as i64;
        RetryThrottle {
            max_tokens,
            token_ratio,
            tokens: Mutex::new(max_tokens),
        }
    }

    /// Record a call that ended in a retryable failure.
    pub fn on_failure(&self) {
        let mut tokens = self.tokens.lock().expect("throttle lock poisoned");
        *tokens = (*tokens - TOKEN_SCALE).max(0);
    }

    /// Record a call that succeeded (or failed non-retryably).
    pub fn on_success(&self) {
        let mut tokens = self.tokens.lock().expect("throttle lock poisoned");
        *tokens = (*tokens + self.token_ratio).min(self.max_tokens);
    }

    /// Whether a retry may currently be attempted.
    pub fn is_retry_allowed(&self) -> bool {
        let tokens = self.tokens.lock().expect("throttle lock poisoned");
        *tokens > self.max_tokens / 2
    }
}

/// The backoff before retry attempt `attempt` (1-based: the delay between
/// the first failure and the second attempt is `initial_backoff`).
pub(crate) fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    let factor = policy.backoff_multiplier.max(1.0).powi(exponent as i32);
    let backoff = policy.initial_backoff.as_secs_f64() * factor;
    Duration::from_secs_f64(backoff.min(policy.max_backoff.as_secs_f64()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn throttle(max_tokens: u32, token_ratio: f64) -> RetryThrottle {
        RetryThrottle::new(&RetryThrottleSettings {
            max_tokens,
            token_ratio,
        })
    }

    #[test]
    fn starts_full_and_allows_retries() {
        let throttle = throttle(10, 0.1);
        assert!(throttle.is_retry_allowed());
    }

    #[test]
    fn failures_drain_below_half_and_block_retries() {
        let throttle = throttle(10, 0.1);
        // 10 tokens, threshold 5: five failures reach the threshold.
        for _ in 0..5 {
            throttle.on_failure();
        }
        assert!(!throttle.is_retry_allowed());
    }

    #[test]
    fn tokens_never_go_negative() {
        let throttle = throttle(2, 0.5);
        for _ in 0..10 {
            throttle.on_failure();
        }
        // Two successes at 0.5 tokens each only reach the threshold of 1.
        throttle.on_success();
        throttle.on_success();
        assert!(!throttle.is_retry_allowed());
        throttle.on_success();
        assert!(throttle.is_retry_allowed());
    }

    #[test]
    fn success_saturates_at_max() {
        let throttle = throttle(10, 1.0);
        for _ in 0..100 {
            throttle.on_success();
        }
        // A single failure must not cross the threshold from a full bucket.
        throttle.on_failure();
        assert!(throttle.is_retry_allowed());
    }

    #[test]
    fn fractional_ratio_accumulates_exactly() {
        let throttle = throttle(10, 0.1);
        for _ in 0..5 {
            throttle.on_failure();
        }
        assert!(!throttle.is_retry_allowed());
        // 0.1 tokens per success: ten successes restore one token.
        for _ in 0..10 {
            throttle.on_success();
        }
        assert!(throttle.is_retry_allowed());
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
            backoff_multiplier: 2.0,
            retryable_codes: vec![],
        };
        assert_eq!(backoff_delay(&policy, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(&policy, 2), Duration::from_millis(200));
        assert_eq!(backoff_delay(&policy, 3), Duration::from_millis(350));
        assert_eq!(backoff_delay(&policy, 4), Duration::from_millis(350));
    }
}
