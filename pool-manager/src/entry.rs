use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::breaker::{BreakerConfig, CircuitState, PoolBreaker};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_open: u32,
    pub max_idle: u32,
    pub max_lifetime: Option<Duration>,
    pub max_idle_time: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_open: 10,
            max_idle: 5,
            max_lifetime: None,
            max_idle_time: None,
        }
    }
}

/// A handle returned by `PoolEntry::try_acquire`; releases its slot back
/// to the pool on drop. Stands in for a live database connection, which
/// is out of this collector's scope (spec §1) — the manager only tracks
/// the *bookkeeping* a real driver would report.
pub struct ConnectionGuard {
    entry: Arc<PoolEntry>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.entry.in_use.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A managed database connection group (spec §3's "Pool entry"). Created
/// lazily by `ConnectionPoolManager::get_pool`, health-checked on a
/// background cadence, and removed on explicit close or manager shutdown.
pub struct PoolEntry {
    pub name: String,
    pub driver: String,
    pub config: PoolConfig,
    pub created_at: Instant,
    last_used: Mutex<Instant>,
    healthy: std::sync::atomic::AtomicBool,
    last_health_check: Mutex<Option<Instant>>,
    error_count: AtomicU64,
    in_use: AtomicU32,
    breaker: Mutex<PoolBreaker>,
}

impl PoolEntry {
    pub fn new(name: String, driver: String, config: PoolConfig, breaker_config: BreakerConfig) -> Self {
        let now = Instant::now();
        Self {
            name,
            driver,
            config,
            created_at: now,
            last_used: Mutex::new(now),
            healthy: std::sync::atomic::AtomicBool::new(true),
            last_health_check: Mutex::new(None),
            error_count: AtomicU64::new(0),
            in_use: AtomicU32::new(0),
            breaker: Mutex::new(PoolBreaker::new(breaker_config)),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Release);
        *self.last_health_check.lock() = Some(Instant::now());
    }

    pub fn last_health_check(&self) -> Option<Instant> {
        *self.last_health_check.lock()
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    pub fn in_use(&self) -> u32 {
        self.in_use.load(Ordering::Relaxed)
    }

    pub fn utilization(&self) -> f64 {
        if self.config.max_open == 0 {
            return 0.0;
        }
        self.in_use() as f64 / self.config.max_open as f64
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.lock().poll()
    }

    pub fn record_success(&self) {
        self.breaker.lock().record_success();
    }

    pub fn record_error(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
        self.breaker.lock().record_failure();
    }

    /// Acquires a pseudo-connection slot, enforcing `max_open` (invariant
    /// 7: `OpenConnections <= MaxOpenConnections`) and the circuit
    /// breaker. Returns `None` when the breaker is open or the pool is
    /// saturated.
    pub fn try_acquire(self: &Arc<Self>) -> Option<ConnectionGuard> {
        if self.breaker.lock().poll() == CircuitState::Open {
            return None;
        }
        let acquired = self
            .in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                if n >= self.config.max_open {
                    None
                } else {
                    Some(n + 1)
                }
            });
        if acquired.is_err() {
            return None;
        }
        *self.last_used.lock() = Instant::now();
        Some(ConnectionGuard {
            entry: Arc::clone(self),
        })
    }

    pub fn last_used(&self) -> Instant {
        *self.last_used.lock()
    }
}
