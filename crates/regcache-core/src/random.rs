use std::sync::{Mutex, MutexGuard};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Thread-safe uniform random source.
///
/// Wraps one `StdRng` behind a mutex so every caller shares a single
/// generator. Sampling quality only; not for secrets.
pub struct RandomSource {
    rng: Mutex<StdRng>,
}

impl RandomSource {
    /// Creates a source seeded from the OS entropy pool.
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Creates a deterministic source, for reproducible tests.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StdRng> {
        // A panic while holding the lock cannot leave the generator invalid
        self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns a value in `[min, max)`; bounds may be given in either order.
    ///
    /// # Panics
    /// Panics if `low == high`.
    pub fn between(&self, low: i64, high: i64) -> i64 {
        let (min, max) = if low > high { (high, low) } else { (low, high) };
        assert!(max > min, "invalid range: low and high are both {}", low);
        self.lock().gen_range(min..max)
    }

    /// Returns a value in `[0, n)`.
    ///
    /// # Panics
    /// Panics if `n == 0`.
    pub fn intn(&self, n: usize) -> usize {
        assert!(n > 0, "intn called with n == 0");
        self.lock().gen_range(0..n)
    }

    /// Returns a value in `[0.0, 1.0)`.
    pub fn float(&self) -> f64 {
        self.lock().gen::<f64>()
    }

    /// Returns a value in `[a, b)`, or `a` when `b < a`.
    pub fn between_f(&self, a: f64, b: f64) -> f64 {
        if b < a {
            return a;
        }
        a + (b - a) * self.float()
    }
}

impl Default for RandomSource {
    fn default() -> Self {
        Self::new()
    }
}
