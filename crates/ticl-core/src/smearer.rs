//! Random perturbation of scheduling delays
//!
//! Every delay the client computes passes through a [`Smearer`] so that
//! clients following the same logical schedule do not hit the server in
//! lockstep.

use core::fmt;
use core::time::Duration;
use rand_core::RngCore;

/// Applies a uniform random perturbation of up to `smear_percent` to delays
pub struct Smearer {
    rng: Box<dyn RngCore + Send>,
    smear_fraction: f64,
}

impl Smearer {
    /// Create a smearer; `smear_percent` must be in `0..=100`
    pub fn new(rng: Box<dyn RngCore + Send>, smear_percent: u32) -> Self {
        Self {
            rng,
            smear_fraction: f64::from(smear_percent.min(100)) / 100.0,
        }
    }

    /// Returns `delay * (1 + f * u)` where `u` is uniform in `[-1, 1)`
    pub fn smeared(&mut self, delay: Duration) -> Duration {
        let normalized = self.next_unit() * 2.0 - 1.0;
        let factor = 1.0 + normalized * self.smear_fraction;
        Duration::from_millis((delay.as_millis() as f64 * factor) as u64)
    }

    /// Uniform sample in `[0, 1)` with 53 bits of precision
    fn next_unit(&mut self) -> f64 {
        (self.rng.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }
}

impl fmt::Debug for Smearer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Smearer")
            .field("smear_fraction", &self.smear_fraction)
            .finish_non_exhaustive()
    }
}
