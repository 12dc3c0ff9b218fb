//! Random source port: jitter, heading perturbation and scenario
//! generation go through this seam so tests can run on a fixed seed.

use rand::rngs::StdRng;
use rand::{Rng as _, SeedableRng};
use rand_distr::{Distribution, Normal};

pub trait Rng {
    /// Uniform real in `[low, high)`.
    fn uniform(&mut self, low: f64, high: f64) -> f64;

    /// Uniform integer in `[low, high]`.
    fn uniform_int(&mut self, low: i64, high: i64) -> i64;

    /// Normally distributed sample.
    fn normal(&mut self, mean: f64, std_dev: f64) -> f64;
}

/// Thread-local system randomness.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemRng;

impl Rng for SystemRng {
    fn uniform(&mut self, low: f64, high: f64) -> f64 {
        if low >= high {
            return low;
        }
        rand::rng().random_range(low..high)
    }

    fn uniform_int(&mut self, low: i64, high: i64) -> i64 {
        if low >= high {
            return low;
        }
        rand::rng().random_range(low..=high)
    }

    fn normal(&mut self, mean: f64, std_dev: f64) -> f64 {
        sample_normal(&mut rand::rng(), mean, std_dev)
    }
}

/// Deterministic randomness for tests and reproducible scenario runs.
#[derive(Clone, Debug)]
pub struct SeededRng(StdRng);

impl SeededRng {
    pub fn new(seed: u64) -> Self {
        Self(StdRng::seed_from_u64(seed))
    }
}

impl Rng for SeededRng {
    fn uniform(&mut self, low: f64, high: f64) -> f64 {
        if low >= high {
            return low;
        }
        self.0.random_range(low..high)
    }

    fn uniform_int(&mut self, low: i64, high: i64) -> i64 {
        if low >= high {
            return low;
        }
        self.0.random_range(low..=high)
    }

    fn normal(&mut self, mean: f64, std_dev: f64) -> f64 {
        sample_normal(&mut self.0, mean, std_dev)
    }
}

fn sample_normal<R: rand::Rng>(rng: &mut R, mean: f64, std_dev: f64) -> f64 {
    match Normal::new(mean, std_dev) {
        Ok(dist) => dist.sample(rng),
        // degenerate deviation, nothing to sample
        Err(_) => mean,
    }
}
