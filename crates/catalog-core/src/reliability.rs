//! Retry, backoff, and circuit-breaker policy data
//!
//! These are plain, serializable configuration structs — the behavior that
//! interprets them (computing the next delay, tripping a breaker) lives in
//! `catalog-engine`. Keeping the policy shape here lets the DAG compiler
//! validate and normalize retry policies without depending on the engine.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff strategy between step attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Fixed,
    Exponential,
}

/// Retry policy for a step (`spec.md` §4.3): `{maxAttempts, backoff,
/// initialDelayMs, maxDelayMs}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: BackoffStrategy,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff: BackoffStrategy::Fixed,
            initial_delay_ms: 0,
            max_delay_ms: 0,
        }
    }
}

impl RetryPolicy {
    pub fn exponential(max_attempts: u32, initial_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: BackoffStrategy::Exponential,
            initial_delay_ms,
            max_delay_ms,
        }
    }

    pub fn no_retry() -> Self {
        Self::default()
    }

    /// Delay before the given attempt number (1-indexed: the delay before
    /// retry attempt 2, 3, ...). Exponential backoff doubles per attempt and
    /// clamps to `max_delay_ms`; jitter is applied by the caller (engine
    /// layer) so this stays a pure, deterministic function for testing.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(2);
        let millis = match self.backoff {
            BackoffStrategy::Fixed => self.initial_delay_ms,
            BackoffStrategy::Exponential => {
                let factor = 1u64.checked_shl(exponent.min(32)).unwrap_or(u64::MAX);
                self.initial_delay_ms.saturating_mul(factor)
            }
        };
        Duration::from_millis(millis.min(self.max_delay_ms.max(self.initial_delay_ms)))
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Circuit breaker state (mirrors `everruns-durable::reliability::CircuitState`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Circuit breaker configuration, attachable to a `Service` step's health
/// policy. Not named explicitly in `spec.md` §4.3 but carried as part of the
/// ambient reliability stack for external service calls (see SPEC_FULL.md §9).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub reset_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout_ms: 30_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_doubles_and_clamps() {
        let policy = RetryPolicy::exponential(5, 100, 1_000);
        assert_eq!(policy.delay_for_attempt(1), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(400));
        // 100 * 2^3 = 800, still under max
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(800));
        // 100 * 2^4 = 1600, clamped to max_delay_ms
        assert_eq!(policy.delay_for_attempt(6), Duration::from_millis(1_000));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff: BackoffStrategy::Fixed,
            initial_delay_ms: 250,
            max_delay_ms: 250,
        };
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(250));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(250));
    }

    #[test]
    fn should_retry_respects_max_attempts() {
        let policy = RetryPolicy::exponential(3, 10, 100);
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }
}
