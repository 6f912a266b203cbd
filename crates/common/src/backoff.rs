//! Exponential reconnect backoff with a capped maximum and random jitter.

use {rand::Rng, std::time::Duration};

/// Reconnect delay generator.
///
/// Each call to [`Backoff::next_delay`] returns the current delay (with
/// jitter applied) and then grows the base delay by `multiplier`, never past
/// `max`. Call [`Backoff::reset`] after a successful connection.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    jitter: f64,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let max = max.max(initial);
        Self {
            initial,
            max,
            multiplier: 2.0,
            jitter: 0.0,
            current: initial,
            attempts: 0,
        }
    }

    /// Growth factor applied after every delay. Values below 1.0 are clamped;
    /// NaN falls back to 1.0 and infinity jumps straight to `max`.
    #[must_use]
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = if multiplier.is_nan() {
            1.0
        } else {
            multiplier.max(1.0)
        };
        self
    }

    /// Fraction (0.0..=1.0) of the delay that may be added or removed at random.
    /// NaN disables jitter.
    #[must_use]
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = if jitter.is_nan() {
            0.0
        } else {
            jitter.clamp(0.0, 1.0)
        };
        self
    }

    /// Number of delays handed out since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempts = 0;
    }

    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.attempts = self.attempts.saturating_add(1);
        self.current = self.scale(base, self.multiplier);
        self.apply_jitter(base)
    }

    /// `base * factor` capped at `max`; overflow saturates to `max`.
    fn scale(&self, base: Duration, factor: f64) -> Duration {
        Duration::try_from_secs_f64(base.as_secs_f64() * factor)
            .map_or(self.max, |d| d.min(self.max))
    }

    fn apply_jitter(&self, base: Duration) -> Duration {
        if self.jitter == 0.0 || base.is_zero() {
            return base;
        }
        let factor = rand::rng().random_range(-self.jitter..=self.jitter);
        self.scale(base, 1.0 + factor)
    }
}
