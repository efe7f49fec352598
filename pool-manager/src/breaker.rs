use std::time::{Duration, Instant};

/// The per-pool circuit breaker's three states (spec §4.3). This is a
/// distinct FSM from the pipeline's `CircuitBreaker` processor (§4.6):
/// this one guards *connection acquisition*, that one guards *record
/// flow*. They share a shape because both are the textbook breaker, not
/// because they are the same component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
    pub half_open_successes: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            half_open_successes: 1,
        }
    }
}

pub struct PoolBreaker {
    config: BreakerConfig,
    state: CircuitState,
    consecutive_errors: u32,
    half_open_successes: u32,
    opened_at: Option<Instant>,
}

impl PoolBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            consecutive_errors: 0,
            half_open_successes: 0,
            opened_at: None,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Call before attempting to acquire a connection. Transitions
    /// `Open` -> `HalfOpen` once the cooldown has elapsed.
    pub fn poll(&mut self) -> CircuitState {
        if self.state == CircuitState::Open {
            if let Some(opened_at) = self.opened_at {
                if opened_at.elapsed() >= self.config.cooldown {
                    self.state = CircuitState::HalfOpen;
                    self.half_open_successes = 0;
                }
            }
        }
        self.state
    }

    pub fn record_success(&mut self) {
        match self.state {
            CircuitState::Closed => self.consecutive_errors = 0,
            CircuitState::HalfOpen => {
                self.half_open_successes += 1;
                if self.half_open_successes >= self.config.half_open_successes {
                    self.state = CircuitState::Closed;
                    self.consecutive_errors = 0;
                    self.opened_at = None;
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&mut self) {
        match self.state {
            CircuitState::Closed => {
                self.consecutive_errors += 1;
                if self.consecutive_errors >= self.config.failure_threshold {
                    self.trip();
                }
            }
            CircuitState::HalfOpen => self.trip(),
            CircuitState::Open => {}
        }
    }

    fn trip(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.consecutive_errors = 0;
        self.half_open_successes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trips_after_threshold_failures() {
        let mut b = PoolBreaker::new(BreakerConfig {
            failure_threshold: 3,
            cooldown: Duration::from_millis(20),
            half_open_successes: 2,
        });
        b.record_failure();
        b.record_failure();
        assert_eq!(b.poll(), CircuitState::Closed);
        b.record_failure();
        assert_eq!(b.poll(), CircuitState::Open);
    }

    #[test]
    fn half_open_recovers_to_closed() {
        let mut b = PoolBreaker::new(BreakerConfig {
            failure_threshold: 1,
            cooldown: Duration::from_millis(5),
            half_open_successes: 2,
        });
        b.record_failure();
        assert_eq!(b.poll(), CircuitState::Open);
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(b.poll(), CircuitState::HalfOpen);
        b.record_success();
        assert_eq!(b.state(), CircuitState::HalfOpen);
        b.record_success();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let mut b = PoolBreaker::new(BreakerConfig {
            failure_threshold: 1,
            cooldown: Duration::from_millis(5),
            half_open_successes: 1,
        });
        b.record_failure();
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(b.poll(), CircuitState::HalfOpen);
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Open);
    }
}
