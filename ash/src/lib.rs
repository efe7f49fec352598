//! Active Session History sampling (spec §4.4): periodically snapshots
//! live database sessions at an adaptively-damped rate, keeping
//! always-include and default-include sessions unconditionally, and rolls
//! up the resulting stream into fixed-resolution windows.

mod adaptive_rate;
mod aggregator;
mod feature_detection;
mod ring_buffer;
mod rules;
mod sampler;
mod snapshot;

pub use adaptive_rate::{AdaptiveRate, RateConfig};
pub use aggregator::{WindowAggregate, WindowAggregator, WindowAggregatorConfig};
pub use feature_detection::{Capabilities, CapabilityProbe, FeatureDetector};
pub use ring_buffer::SnapshotRingBuffer;
pub use rules::{classify, IncludeDecision};
pub use sampler::{AshConfig, AshSampler, SamplerError, SessionSource, TickOutcome};
pub use snapshot::{RawSession, SessionSnapshot, SessionState};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("ash.rate.min_rate ({min}) must be <= ash.rate.max_rate ({max})")]
    RateBoundsInverted { min: f64, max: f64 },
    #[error("ash.rate.{field} must be within [0.0, 1.0], got {value}")]
    RateOutOfRange { field: &'static str, value: f64 },
    #[error("ash.rate.low_session_threshold ({low}) must be < ash.rate.high_session_threshold ({high})")]
    SessionThresholdsInverted { low: usize, high: usize },
    #[error("ash.ring_buffer_capacity must be positive")]
    NonPositiveCapacity,
    #[error("ash.windows.window_durations must be non-empty and contain only positive durations")]
    InvalidWindowDurations,
}

impl AshConfig {
    /// Rejects configurations that would otherwise fail silently at
    /// runtime or panic deep inside `AdaptiveRate`/`SnapshotRingBuffer`
    /// (spec §6): negative/zero durations, out-of-range rates, and
    /// inverted thresholds are caught here, at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("base_rate", self.rate.base_rate),
            ("min_rate", self.rate.min_rate),
            ("max_rate", self.rate.max_rate),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::RateOutOfRange { field, value });
            }
        }
        if self.rate.min_rate > self.rate.max_rate {
            return Err(ConfigError::RateBoundsInverted {
                min: self.rate.min_rate,
                max: self.rate.max_rate,
            });
        }
        if self.rate.low_session_threshold >= self.rate.high_session_threshold {
            return Err(ConfigError::SessionThresholdsInverted {
                low: self.rate.low_session_threshold,
                high: self.rate.high_session_threshold,
            });
        }
        if self.ring_buffer_capacity == 0 {
            return Err(ConfigError::NonPositiveCapacity);
        }
        if self.windows.window_durations.is_empty()
            || self.windows.window_durations.iter().any(|d| d.is_zero())
        {
            return Err(ConfigError::InvalidWindowDurations);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(AshConfig::default().validate().is_ok());
    }

    #[test]
    fn inverted_rate_bounds_are_rejected() {
        let mut cfg = AshConfig::default();
        cfg.rate.min_rate = 0.9;
        cfg.rate.max_rate = 0.1;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::RateBoundsInverted { .. })
        ));
    }

    #[test]
    fn zero_ring_buffer_capacity_is_rejected() {
        let mut cfg = AshConfig::default();
        cfg.ring_buffer_capacity = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::NonPositiveCapacity)));
    }

    #[test]
    fn empty_window_durations_are_rejected() {
        let mut cfg = AshConfig::default();
        cfg.windows.window_durations.clear();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidWindowDurations)
        ));
    }
}
