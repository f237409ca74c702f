//! Reconnect policy for the publish path
//!
//! A failed connection is retried at most `max_retries` times. The wait before
//! each attempt comes from a pluggable backoff: a fixed delay (5s by default)
//! or `base^attempt` seconds, capped.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Wait before a reconnect attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackoffPolicy {
    /// Same wait before every attempt
    Fixed { delay_ms: u64 },
    /// `base^attempt` seconds, never more than `max_delay_ms`
    Exponential { base: f64, max_delay_ms: u64 },
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Fixed { delay_ms: 5000 }
    }
}

impl BackoffPolicy {
    /// Wait before the given attempt (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            BackoffPolicy::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            BackoffPolicy::Exponential { base, max_delay_ms } => {
                let secs = base.max(1.0).powi(attempt.min(64) as i32);
                let ms = (secs * 1000.0).min(max_delay_ms as f64);
                Duration::from_millis(ms as u64)
            }
        }
    }
}

/// Bounded retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: BackoffPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// What to do after a connection failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait `delay`, then run reconnect attempt number `attempt`
    Retry { attempt: u32, delay: Duration },
    /// Every allowed attempt has failed
    GiveUp { attempts: u32 },
}

/// Counts reconnect attempts for one publish
#[derive(Debug, Clone)]
pub struct RetryTracker {
    policy: RetryPolicy,
    count: u32,
}

impl RetryTracker {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, count: 0 }
    }

    /// Attempts made since the last successful connection
    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Record a failure and decide whether to try again
    pub fn on_failure(&mut self) -> RetryDecision {
        if self.count >= self.policy.max_retries {
            return RetryDecision::GiveUp {
                attempts: self.count,
            };
        }
        self.count += 1;
        RetryDecision::Retry {
            attempt: self.count,
            delay: self.policy.backoff.delay(self.count),
        }
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }
}
