use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Randomized election timeout counted in driver ticks.
///
/// Owns its RNG so tests can pin the sequence of timeouts with a seed.
#[derive(Debug)]
pub struct ElectionTimer {
    min: u64,
    max: u64,
    timeout: u64,
    elapsed: u64,
    rng: StdRng,
}

impl ElectionTimer {
    pub fn new(min: u64, max: u64, rng: StdRng) -> Self {
        let mut timer = Self {
            min: min.max(1),
            max: max.max(min.max(1)),
            timeout: 0,
            elapsed: 0,
            rng,
        };
        timer.reset();
        timer
    }

    pub fn from_seed(min: u64, max: u64, seed: u64) -> Self {
        Self::new(min, max, StdRng::seed_from_u64(seed))
    }

    /// Restart the countdown with a fresh random timeout
    pub fn reset(&mut self) {
        self.elapsed = 0;
        self.timeout = self.rng.gen_range(self.min..=self.max);
    }

    /// Advance one tick, true once the timeout has expired
    pub fn tick(&mut self) -> bool {
        self.elapsed += 1;
        self.elapsed >= self.timeout
    }

    pub fn timeout(&self) -> u64 {
        self.timeout
    }

    /// Ticks since the last reset
    pub fn elapsed(&self) -> u64 {
        self.elapsed
    }

    /// Lower bound of the range, also used as the leader lease window
    pub fn min(&self) -> u64 {
        self.min
    }
}
