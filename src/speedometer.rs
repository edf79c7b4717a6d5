//! A sliding-window, exponentially-weighted byte-rate estimator.
//!
//! Each call to [`Speedometer::update`] folds a byte count into a running
//! rate estimate, decayed by how much wall-clock time has elapsed since the
//! last sample. [`Speedometer::rate`] additionally decays the estimate
//! towards zero for time elapsed since the last update, so an idle
//! connection's reported speed falls off rather than staying pinned at its
//! last value. Precision only needs to match observable rates to within
//! about 5%, so this naive windowed EWMA (rather than a ring buffer of
//! per-second buckets) is sufficient.

use std::time::{Duration, Instant};

/// The window over which the moving average decays.
const WINDOW: Duration = Duration::from_secs(5);

/// A byte-rate estimator with a 5-second decay window.
#[derive(Debug)]
pub struct Speedometer {
    rate: f64,
    last_update: Instant,
}

impl Speedometer {
    pub fn new() -> Self {
        Self {
            rate: 0.0,
            last_update: Instant::now(),
        }
    }

    /// Folds `bytes` transferred since the last sample into the running
    /// rate estimate.
    pub fn update(&mut self, bytes: u64) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_update);
        self.decay_to(now);

        let elapsed_secs = elapsed.as_secs_f64().max(1e-3);
        let instant_rate = bytes as f64 / elapsed_secs;
        let alpha = Self::decay_factor(elapsed);
        self.rate += alpha * (instant_rate - self.rate);
    }

    /// Returns the current estimated rate in bytes per second, decaying the
    /// last known value for any time elapsed since the last [`update`].
    ///
    /// [`update`]: Speedometer::update
    pub fn rate(&mut self) -> f64 {
        let now = Instant::now();
        self.decay_to(now);
        self.rate
    }

    /// Applies exponential decay for time elapsed since `last_update` up to
    /// `now`, without folding in a new sample.
    fn decay_to(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_update);
        if elapsed > WINDOW {
            let alpha = Self::decay_factor(elapsed);
            self.rate *= 1.0 - alpha;
        }
        self.last_update = now;
    }

    fn decay_factor(elapsed: Duration) -> f64 {
        let x = elapsed.as_secs_f64() / WINDOW.as_secs_f64();
        1.0 - (-x).exp()
    }
}

impl Default for Speedometer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn idle_speedometer_reads_zero() {
        let mut s = Speedometer::new();
        assert_eq!(s.rate(), 0.0);
    }

    #[test]
    fn single_burst_is_reflected_in_rate() {
        let mut s = Speedometer::new();
        sleep(Duration::from_millis(50));
        s.update(16 * 1024);
        assert!(s.rate() > 0.0);
    }

    #[test]
    fn idle_period_decays_rate_towards_zero() {
        let mut s = Speedometer::new();
        sleep(Duration::from_millis(50));
        s.update(1_000_000);
        let hot = s.rate();
        assert!(hot > 0.0);

        sleep(Duration::from_secs(6));
        let cold = s.rate();
        assert!(cold < hot, "rate should decay after an idle window");
    }
}
