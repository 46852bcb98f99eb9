// Copyright 2020 Joyent, Inc.

use std::time::Instant;

use rand::Rng;

/// Monotonic time source used by the failure-rate accounting. The trait
/// exists so conformance tests can drive the error-rate window with a
/// synthetic clock instead of waiting out wall time.
pub trait Clock: Send + Sync + 'static {
    /// Seconds elapsed on some fixed monotonic scale.
    fn now(&self) -> f64;
}

/// Production clock: seconds since the clock was created.
pub struct MonotonicClock {
    start: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        MonotonicClock {
            start: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

/// Uniform randomness source behind the timer jitter and the merge-time
/// error amnesty. Tests pin it to a constant to make both deterministic.
pub trait Entropy: Send + Sync + 'static {
    /// A uniform sample in `[0, 1)`.
    fn uniform(&self) -> f64;
}

pub struct ThreadRngEntropy;

impl Entropy for ThreadRngEntropy {
    fn uniform(&self) -> f64 {
        rand::thread_rng().gen::<f64>()
    }
}

/// `base * (1 + U(-frac, +frac))`
pub fn jitter(entropy: &dyn Entropy, base: f64, frac: f64) -> f64 {
    base * (1.0 + frac * (2.0 * entropy.uniform() - 1.0))
}
