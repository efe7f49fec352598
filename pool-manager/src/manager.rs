use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use collector_common::Metrics;
use dashmap::DashMap;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::breaker::{BreakerConfig, CircuitState};
use crate::entry::{ConnectionGuard, PoolConfig, PoolEntry};
use crate::error::PoolManagerError;

/// Pings a pool to verify its backing database is reachable. Actual
/// driver/connection-string handling is an external collaborator (spec
/// §1); implementors plug in whatever client library backs a given
/// `driver` name.
#[async_trait]
pub trait PoolProbe: Send + Sync {
    async fn ping(&self, name: &str, driver: &str) -> Result<(), String>;
}

/// A probe that always succeeds; used in tests and `--dry-run`.
pub struct AlwaysHealthyProbe;

#[async_trait]
impl PoolProbe for AlwaysHealthyProbe {
    async fn ping(&self, _name: &str, _driver: &str) -> Result<(), String> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub global_max_connections: u32,
    pub health_check_interval: Duration,
    pub metrics_interval: Duration,
    pub enable_auto_scaling: bool,
    pub breaker: BreakerConfig,
    /// Utilization ratio above which auto-scaling bumps a pool's
    /// `max_open`, when `enable_auto_scaling` is set.
    pub auto_scale_high_watermark: f64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            global_max_connections: 500,
            health_check_interval: Duration::from_secs(30),
            metrics_interval: Duration::from_secs(10),
            enable_auto_scaling: false,
            breaker: BreakerConfig::default(),
            auto_scale_high_watermark: 0.9,
        }
    }
}

/// Owns every named connection pool in the process (spec §4.3). Shared
/// across receivers; each individual pool remains single-owner.
pub struct ConnectionPoolManager {
    pools: DashMap<String, Arc<PoolEntry>>,
    config: ManagerConfig,
    metrics: Metrics,
    probe: Arc<dyn PoolProbe>,
    shutdown: Arc<AtomicBool>,
    shutdown_notify: Arc<Notify>,
}

impl ConnectionPoolManager {
    pub fn new(config: ManagerConfig, metrics: Metrics, probe: Arc<dyn PoolProbe>) -> Self {
        Self {
            pools: DashMap::new(),
            config,
            metrics,
            probe,
            shutdown: Arc::new(AtomicBool::new(false)),
            shutdown_notify: Arc::new(Notify::new()),
        }
    }

    fn committed_max_open(&self) -> u32 {
        self.pools.iter().map(|p| p.config.max_open).sum()
    }

    /// Returns the named pool, creating it if absent. Creation is
    /// rejected with `OverGlobalLimit` if it would push the sum of every
    /// pool's `max_open` past `GlobalMaxConnections`.
    pub fn get_pool(
        &self,
        name: &str,
        driver: &str,
        config: PoolConfig,
    ) -> Result<Arc<PoolEntry>, PoolManagerError> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(PoolManagerError::ShuttingDown);
        }
        if let Some(entry) = self.pools.get(name) {
            return Ok(entry.clone());
        }

        let requested = self.committed_max_open() + config.max_open;
        if requested > self.config.global_max_connections {
            return Err(PoolManagerError::OverGlobalLimit {
                requested,
                ceiling: self.config.global_max_connections,
            });
        }

        let entry = Arc::new(PoolEntry::new(
            name.to_owned(),
            driver.to_owned(),
            config,
            self.config.breaker,
        ));
        self.pools.insert(name.to_owned(), Arc::clone(&entry));
        self.metrics.incr_with_tag("pool.created", "pool", name);
        Ok(entry)
    }

    pub fn remove_pool(&self, name: &str) -> Option<Arc<PoolEntry>> {
        self.pools.remove(name).map(|(_, v)| v)
    }

    pub fn acquire(&self, name: &str) -> Result<ConnectionGuard, PoolManagerError> {
        let entry = {
            let entry = self
                .pools
                .get(name)
                .ok_or_else(|| PoolManagerError::NotFound(name.to_owned()))?;
            entry.clone()
        };
        if entry.circuit_state() == CircuitState::Open {
            return Err(PoolManagerError::CircuitOpen(name.to_owned()));
        }
        entry
            .try_acquire()
            .ok_or_else(|| PoolManagerError::PoolExhausted(name.to_owned()))
    }

    pub fn pool_names(&self) -> Vec<String> {
        self.pools.iter().map(|e| e.key().clone()).collect()
    }

    pub fn pool_state(&self, name: &str) -> Option<PoolState> {
        self.pools.get(name).map(|e| PoolState {
            open: e.in_use(),
            in_use: e.in_use(),
            idle: e.config.max_open.saturating_sub(e.in_use()),
            healthy: e.is_healthy(),
            circuit_state: e.circuit_state(),
            error_count: e.error_count(),
        })
    }

    /// Background loop pinging every pool on `health_check_interval` and
    /// marking it unhealthy on failure. Cancellable via `shutdown()`.
    pub fn spawn_health_check_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.health_check_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => this.run_health_checks().await,
                    _ = this.shutdown_notify.notified() => break,
                }
            }
        })
    }

    async fn run_health_checks(&self) {
        let names: Vec<(String, String)> = self
            .pools
            .iter()
            .map(|e| (e.name.clone(), e.driver.clone()))
            .collect();
        for (name, driver) in names {
            let deadline = tokio::time::timeout(Duration::from_secs(5), self.probe.ping(&name, &driver)).await;
            let Some(entry) = self.pools.get(&name) else {
                continue;
            };
            match deadline {
                Ok(Ok(())) => {
                    entry.set_healthy(true);
                    entry.record_success();
                }
                Ok(Err(_)) | Err(_) => {
                    entry.set_healthy(false);
                    entry.record_error();
                    self.metrics.incr_with_tag("pool.health_check_failed", "pool", &name);
                }
            }
        }
    }

    /// Background loop recording open/in-use/idle/wait stats and, when
    /// `enable_auto_scaling` is set, bumping `max_open` when utilization
    /// crosses `auto_scale_high_watermark`.
    pub fn spawn_metrics_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.metrics_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => this.report_metrics(),
                    _ = this.shutdown_notify.notified() => break,
                }
            }
        })
    }

    fn report_metrics(&self) {
        for entry in self.pools.iter() {
            let tag = entry.name.clone();
            self.metrics.gauge("pool.in_use", entry.in_use() as u64);
            self.metrics
                .gauge("pool.idle", entry.config.max_open.saturating_sub(entry.in_use()) as u64);
            if self.config.enable_auto_scaling && entry.utilization() >= self.config.auto_scale_high_watermark {
                log::info!(
                    "pool {} utilization {:.2} crossed auto-scale watermark",
                    tag,
                    entry.utilization()
                );
                self.metrics.incr_with_tag("pool.auto_scale_triggered", "pool", &tag);
            }
        }
    }

    /// Closes all pools. Idempotent; subsequent `get_pool` calls fail
    /// with `ShuttingDown`.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.shutdown_notify.notify_waiters();
        self.pools.clear();
    }
}

#[derive(Debug, Clone)]
pub struct PoolState {
    pub open: u32,
    pub in_use: u32,
    pub idle: u32,
    pub healthy: bool,
    pub circuit_state: CircuitState,
    pub error_count: u64,
}
