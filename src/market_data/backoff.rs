use std::time::Duration;

use rand::Rng;

/// Bounded exponential backoff with jitter.
///
/// The n-th delay is drawn from `[base/2, base]` where
/// `base = min(initial * 2^n, max)`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max: max.max(initial), attempt: 0 }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt.min(16));
        let base = self.initial.saturating_mul(factor).min(self.max);
        self.attempt = self.attempt.saturating_add(1);

        let half = base / 2;
        let spread = (base - half).as_millis() as u64;
        if spread == 0 {
            return base;
        }
        half + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
    }

    /// Called once the feed is delivering data again.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
