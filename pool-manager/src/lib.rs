//! Owns a set of named database connection pools: health checking,
//! metrics, auto-scaling, and per-pool circuit breaking (spec §4.3). Real
//! connection establishment is an external collaborator (§1); this crate
//! tracks the bookkeeping — open/in-use counts, health, error counts — a
//! real driver pool would expose.

mod breaker;
mod entry;
mod error;
mod manager;

pub use breaker::{BreakerConfig, CircuitState};
pub use entry::{ConnectionGuard, PoolConfig, PoolEntry};
pub use error::PoolManagerError;
pub use manager::{AlwaysHealthyProbe, ConnectionPoolManager, ManagerConfig, PoolProbe, PoolState};

#[cfg(test)]
mod tests {
    use super::*;
    use collector_common::Metrics;
    use std::sync::Arc;
    use std::time::Duration;

    fn manager() -> Arc<ConnectionPoolManager> {
        Arc::new(ConnectionPoolManager::new(
            ManagerConfig {
                global_max_connections: 20,
                ..Default::default()
            },
            Metrics::noop(),
            Arc::new(AlwaysHealthyProbe),
        ))
    }

    #[test]
    fn get_pool_is_idempotent_by_name() {
        let m = manager();
        let a = m.get_pool("primary", "postgres", PoolConfig::default()).unwrap();
        let b = m.get_pool("primary", "postgres", PoolConfig::default()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn rejects_over_global_ceiling() {
        let m = manager();
        m.get_pool(
            "a",
            "postgres",
            PoolConfig {
                max_open: 15,
                ..Default::default()
            },
        )
        .unwrap();
        let err = m
            .get_pool(
                "b",
                "postgres",
                PoolConfig {
                    max_open: 10,
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, PoolManagerError::OverGlobalLimit { .. }));
    }

    #[test]
    fn acquire_never_exceeds_max_open() {
        let m = manager();
        m.get_pool(
            "a",
            "postgres",
            PoolConfig {
                max_open: 2,
                ..Default::default()
            },
        )
        .unwrap();
        let g1 = m.acquire("a").unwrap();
        let g2 = m.acquire("a").unwrap();
        assert!(matches!(m.acquire("a"), Err(PoolManagerError::PoolExhausted(_))));
        drop(g1);
        assert!(m.acquire("a").is_ok());
        drop(g2);
    }

    #[test]
    fn circuit_opens_after_repeated_errors() {
        let m = manager();
        let entry = m
            .get_pool(
                "a",
                "postgres",
                PoolConfig {
                    max_open: 5,
                    ..Default::default()
                },
            )
            .unwrap();
        for _ in 0..5 {
            entry.record_error();
        }
        assert_eq!(entry.circuit_state(), CircuitState::Open);
        assert!(matches!(m.acquire("a"), Err(PoolManagerError::CircuitOpen(_))));
    }

    #[test]
    fn shutdown_rejects_further_pools() {
        let m = manager();
        m.shutdown();
        assert!(matches!(
            m.get_pool("a", "postgres", PoolConfig::default()),
            Err(PoolManagerError::ShuttingDown)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn health_check_loop_marks_unhealthy_on_probe_failure() {
        struct FlakyProbe;
        #[async_trait::async_trait]
        impl PoolProbe for FlakyProbe {
            async fn ping(&self, _name: &str, _driver: &str) -> Result<(), String> {
                Err("connection refused".to_owned())
            }
        }

        let m = Arc::new(ConnectionPoolManager::new(
            ManagerConfig {
                health_check_interval: Duration::from_millis(10),
                ..Default::default()
            },
            Metrics::noop(),
            Arc::new(FlakyProbe),
        ));
        let entry = m.get_pool("a", "postgres", PoolConfig::default()).unwrap();
        let _handle = m.spawn_health_check_loop();
        tokio::time::advance(Duration::from_millis(50)).await;
        tokio::task::yield_now().await;
        assert!(!entry.is_healthy());
        m.shutdown();
    }
}
