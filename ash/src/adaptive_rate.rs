use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct RateConfig {
    pub base_rate: f64,
    pub min_rate: f64,
    pub max_rate: f64,
    pub low_session_threshold: usize,
    pub high_session_threshold: usize,
    /// Minimum gap between effective-rate adjustments, damping
    /// oscillation (spec §4.4 default 10s).
    pub adjustment_interval: Duration,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            base_rate: 0.5,
            min_rate: 0.1,
            max_rate: 1.0,
            low_session_threshold: 50,
            high_session_threshold: 500,
            adjustment_interval: Duration::from_secs(10),
        }
    }
}

/// Recomputes the ASH sampler's rate-limited-residual keep probability
/// on every tick (spec §4.4). Invariant 3: the returned rate is always in
/// `[min_rate, max_rate]`.
pub struct AdaptiveRate {
    cfg: RateConfig,
    current: f64,
    last_adjustment: Option<Instant>,
}

impl AdaptiveRate {
    pub fn new(cfg: RateConfig) -> Self {
        let current = cfg.base_rate.clamp(cfg.min_rate, cfg.max_rate);
        Self {
            cfg,
            current,
            last_adjustment: None,
        }
    }

    pub fn current(&self) -> f64 {
        self.current
    }

    /// Below `low_session_threshold`, the rate is forced to 1.0
    /// immediately, bypassing the EMA damping — this is a safety valve
    /// for low-load periods, not a "smoothly approach 1.0" case. Above
    /// `high_session_threshold` (strictly; equality uses `base_rate`,
    /// per spec's boundary behavior), the rate decays proportionally to
    /// the excess, then is blended into the previous effective rate via
    /// an EMA (α=0.3) at most once per `adjustment_interval`.
    pub fn update(&mut self, live_session_count: usize) -> f64 {
        if live_session_count < self.cfg.low_session_threshold {
            self.current = 1.0_f64.clamp(self.cfg.min_rate, self.cfg.max_rate);
            self.last_adjustment = Some(Instant::now());
            return self.current;
        }

        let raw = self.raw_rate(live_session_count);
        let now = Instant::now();
        let should_adjust = self
            .last_adjustment
            .map_or(true, |t| now.duration_since(t) >= self.cfg.adjustment_interval);

        if should_adjust {
            const ALPHA: f64 = 0.3;
            self.current = (ALPHA * raw + (1.0 - ALPHA) * self.current)
                .clamp(self.cfg.min_rate, self.cfg.max_rate);
            self.last_adjustment = Some(now);
        }
        self.current
    }

    fn raw_rate(&self, live_session_count: usize) -> f64 {
        let rate = if live_session_count > self.cfg.high_session_threshold {
            let excess = (live_session_count - self.cfg.high_session_threshold) as f64;
            self.cfg.base_rate * (1.0 - excess / self.cfg.high_session_threshold as f64).max(0.1)
        } else {
            // Includes the exact-equality boundary: neither the boost nor
            // the decay branch applies, so `base_rate` is used as-is.
            self.cfg.base_rate
        };
        rate.clamp(self.cfg.min_rate, self.cfg.max_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> RateConfig {
        RateConfig {
            base_rate: 0.5,
            min_rate: 0.1,
            max_rate: 1.0,
            low_session_threshold: 50,
            high_session_threshold: 500,
            adjustment_interval: Duration::from_secs(10),
        }
    }

    #[test]
    fn below_low_threshold_forces_full_rate() {
        let mut r = AdaptiveRate::new(cfg());
        assert_eq!(r.update(30), 1.0);
    }

    #[test]
    fn exactly_at_high_threshold_uses_base_rate() {
        let mut r = AdaptiveRate::new(cfg());
        assert_eq!(r.raw_rate(500), 0.5);
    }

    #[test]
    fn above_high_threshold_decays() {
        let r = AdaptiveRate::new(cfg());
        let rate = r.raw_rate(1000);
        assert!(rate < 0.5);
        assert!(rate >= cfg().min_rate);
    }

    #[test]
    fn rate_never_leaves_configured_bounds() {
        let mut r = AdaptiveRate::new(cfg());
        for n in [0, 10, 49, 50, 100, 499, 500, 501, 1000, 10_000] {
            let rate = r.update(n);
            assert!(rate >= cfg().min_rate && rate <= cfg().max_rate, "rate {rate} out of bounds for n={n}");
        }
    }

    #[test]
    fn adjustments_are_throttled() {
        let mut r = AdaptiveRate::new(cfg());
        let first = r.update(600);
        let second = r.update(10_000); // wildly different load, same instant
        assert_eq!(first, second, "second call within the adjustment interval should not move the rate");
    }
}
