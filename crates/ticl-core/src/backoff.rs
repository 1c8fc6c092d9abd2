//! Exponential backoff with jitter
//!
//! The generator doubles its multiplier on every [`next_delay`] call, up to a
//! configured maximum, and can be restored from a persisted
//! [`BackoffState`] to exactly where a previous process left off.
//!
//! [`next_delay`]: ExponentialBackoffGenerator::next_delay

use core::time::Duration;
use serde::{Deserialize, Serialize};

use crate::smearer::Smearer;

/// Persisted form of a backoff generator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffState {
    pub current_multiplier: u32,
    pub initial_delay_ms: u64,
}

/// Produces jittered, geometrically growing retry delays
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExponentialBackoffGenerator {
    initial_delay: Duration,
    max_factor: u32,
    current_multiplier: u32,
}

impl ExponentialBackoffGenerator {
    /// Create a generator, optionally resuming from `saved`
    ///
    /// A saved multiplier larger than `max_factor` is clamped, so a
    /// configuration change between runs can only shorten the next delay.
    pub fn new(initial_delay: Duration, max_factor: u32, saved: Option<BackoffState>) -> Self {
        let max_factor = max_factor.max(1);
        match saved {
            Some(state) => Self {
                initial_delay: Duration::from_millis(state.initial_delay_ms),
                max_factor,
                current_multiplier: state.current_multiplier.clamp(1, max_factor),
            },
            None => Self {
                initial_delay,
                max_factor,
                current_multiplier: 1,
            },
        }
    }

    /// Un-jittered delay the next call to [`Self::next_delay`] is based on
    pub fn base_delay(&self) -> Duration {
        self.initial_delay * self.current_multiplier
    }

    /// Upper bound of [`Self::base_delay`]
    pub fn max_delay(&self) -> Duration {
        self.initial_delay * self.max_factor
    }

    /// Returns the current jittered delay and advances the multiplier
    pub fn next_delay(&mut self, smearer: &mut Smearer) -> Duration {
        let delay = smearer.smeared(self.base_delay());
        self.current_multiplier = self.current_multiplier.saturating_mul(2).min(self.max_factor);
        delay
    }

    /// Return to the initial delay
    pub fn reset(&mut self) {
        self.current_multiplier = 1;
    }

    pub fn marshal(&self) -> BackoffState {
        BackoffState {
            current_multiplier: self.current_multiplier,
            initial_delay_ms: self.initial_delay.as_millis() as u64,
        }
    }
}
