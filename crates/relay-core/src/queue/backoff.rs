//! Backoff policy between failed attempts.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Delay growth strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    /// Same delay before every retry.
    Fixed,

    /// Delay doubles with each failed attempt.
    Exponential,
}

/// Backoff applied between a failed attempt and the retry it schedules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub kind: BackoffKind,
    pub delay: Duration,
}

impl BackoffPolicy {
    pub const fn fixed(delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            delay,
        }
    }

    pub const fn exponential(delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            delay,
        }
    }

    /// Delay before the next attempt, given how many attempts have already
    /// been made (1-indexed: the first failure passes 1).
    ///
    /// Exponential growth is `delay * 2^(attempts_made - 1)`, saturating so
    /// an absurd attempt ceiling cannot overflow.
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        match self.kind {
            BackoffKind::Fixed => self.delay,
            BackoffKind::Exponential => {
                let exponent = attempts_made.saturating_sub(1).min(31);
                self.delay.saturating_mul(2u32.saturating_pow(exponent))
            }
        }
    }
}
