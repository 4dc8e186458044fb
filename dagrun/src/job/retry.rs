//! Retry policy and backoff.

use rand::random;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{Error, Result};

/// Delay between a failed attempt and the next one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// Retry immediately.
    None,
    /// Constant delay.
    Fixed { delay_ms: u64 },
    /// `base_ms * factor^(attempt - 1)`, capped at `max_ms`.
    Exponential {
        base_ms: u64,
        factor: u32,
        max_ms: u64,
        /// Add up to 25% random jitter.
        #[serde(default)]
        jitter: bool,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Exponential {
            base_ms: 1000,
            factor: 2,
            max_ms: 300_000,
            jitter: false,
        }
    }
}

/// How often a job may be attempted and how long to wait in between.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::default(),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, never retried.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::None,
        }
    }

    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::validation("max_attempts must be at least 1"));
        }
        if let Backoff::Exponential { factor: 0, .. } = self.backoff {
            return Err(Error::validation("exponential backoff factor must be at least 1"));
        }
        Ok(())
    }

    /// Whether another attempt is allowed after `attempts` have run.
    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Delay before the next attempt, after `attempt` (1-based) failed.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match &self.backoff {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
            Backoff::Exponential {
                base_ms,
                factor,
                max_ms,
                jitter,
            } => {
                let exp = attempt.saturating_sub(1);
                let multiplier = (*factor as u64).checked_pow(exp).unwrap_or(u64::MAX);
                let capped = base_ms.saturating_mul(multiplier).min(*max_ms);
                let jitter_ms = if *jitter {
                    random::<u64>() % (capped / 4 + 1)
                } else {
                    0
                };
                Duration::from_millis(capped.saturating_add(jitter_ms).min(*max_ms))
            }
        }
    }
}
