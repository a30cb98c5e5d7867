// src/events/backoff.rs
//! Delivery retry policy
//!
//! `delay(n) = min(base * 2^(n-1), max)` for the n-th failed attempt, plus up
//! to 10% random jitter. Once `max_attempts` attempts have failed the
//! delivery is dead.

use crate::utils::config::DeliverySettings;
use chrono::{DateTime, Utc};
use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { at: DateTime<Utc> },
    Dead,
}

impl RetryPolicy {
    pub fn from_settings(settings: &DeliverySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            base_delay: Duration::from_secs(settings.base_delay_secs),
            max_delay: Duration::from_secs(settings.max_delay_secs),
            jitter: settings.jitter,
        }
    }

    /// Deterministic part of the delay after failed attempt `attempt` (1-based)
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.base_delay_for(attempt);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let max_jitter_ms = (delay.as_millis() / 10) as u64;
        if max_jitter_ms == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..=max_jitter_ms))
    }

    /// `attempts_made` includes the attempt that just failed
    pub fn decide(&self, attempts_made: u32, failed_at: DateTime<Utc>) -> RetryDecision {
        if attempts_made >= self.max_attempts {
            return RetryDecision::Dead;
        }
        let delay = chrono::Duration::from_std(self.delay_for(attempts_made))
            .unwrap_or_else(|_| chrono::Duration::seconds(self.max_delay.as_secs() as i64));
        RetryDecision::Retry {
            at: failed_at + delay,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&DeliverySettings::default())
    }
}
