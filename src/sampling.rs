//! # Lottery Sampling
//!
//! Decides how many hits one observed event is worth. Early in the day every
//! event counts; once a counter has traffic, one event in `sample_factor` is
//! credited with `sample_factor` hits and the rest are dropped. The estimate
//! stays unbiased while the write rate stays bounded.

use crate::config::SamplingConfig;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Seedable lottery shared by every recording thread.
#[derive(Debug)]
pub struct Sampler {
    config: SamplingConfig,
    rng: Mutex<StdRng>,
}

impl Sampler {
    /// Sampler seeded from OS entropy.
    pub fn new(config: SamplingConfig) -> Self {
        Sampler {
            config,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Sampler whose decisions are fully determined by `seed`.
    pub fn seeded(config: SamplingConfig, seed: u64) -> Self {
        Sampler {
            config,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn config(&self) -> &SamplingConfig {
        &self.config
    }

    /// Hits represented by one sampled event once `day_total` hits are known.
    pub fn sample_factor(&self, day_total: u64) -> u64 {
        let scaled = (self.config.ratio * day_total as f64).ceil();
        let scaled = if scaled >= u64::MAX as f64 {
            u64::MAX
        } else {
            scaled as u64
        };
        scaled
            .max(self.config.min_factor)
            .min(self.config.max_factor)
    }

    /// Number of hits to credit for this event: `0` to skip it, `1` for the
    /// first hit of the day, otherwise `sample_factor` on a winning draw.
    pub fn decide_sample_delta(&self, day_total: u64) -> u64 {
        if !self.config.enabled || day_total == 0 {
            return 1;
        }

        let factor = self.sample_factor(day_total);
        if factor <= 1 {
            return 1;
        }

        if self.rng.lock().gen_range(1..=factor) == 1 {
            factor
        } else {
            0
        }
    }
}
