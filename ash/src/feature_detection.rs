use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

/// Extensions/settings the ASH sampler adapts its queries around (spec
/// §4.4). Detection failures degrade gracefully: every capability here
/// defaults to absent, which routes the sampler to a less informative
/// but base-permission-only query.
#[derive(Debug, Clone, Default)]
pub struct Capabilities {
    pub server_version: Option<String>,
    pub pg_stat_statements: bool,
    pub pg_wait_sampling: bool,
    pub auto_explain: bool,
    pub pg_qualstats: bool,
    pub track_io_timing: bool,
    pub track_activity_query_size: bool,
}

/// Probes a live database for extensions and settings. Actual queries
/// against `pg_extension`/`SHOW <setting>` are an external collaborator
/// (spec §1); implementors supply the driver-specific probe.
#[async_trait]
pub trait CapabilityProbe: Send + Sync {
    async fn probe(&self) -> Result<Capabilities, String>;
}

/// Caches `CapabilityProbe` output for `ttl` (default 5 min), and forces
/// a re-probe on the next call after a sampling failure via
/// `mark_check_needed`, so the sampler upgrades itself automatically once
/// a previously-missing extension becomes available (spec §4.4).
pub struct FeatureDetector {
    probe: std::sync::Arc<dyn CapabilityProbe>,
    ttl: Duration,
    state: Mutex<State>,
}

struct State {
    capabilities: Capabilities,
    last_check: Option<Instant>,
    force_recheck: bool,
}

impl FeatureDetector {
    pub fn new(probe: std::sync::Arc<dyn CapabilityProbe>, ttl: Duration) -> Self {
        Self {
            probe,
            ttl,
            state: Mutex::new(State {
                capabilities: Capabilities::default(),
                last_check: None,
                force_recheck: true,
            }),
        }
    }

    /// Returns cached capabilities, re-probing if the cache is stale or a
    /// prior sampling failure requested a recheck.
    pub async fn capabilities(&self) -> Capabilities {
        let needs_probe = {
            let state = self.state.lock();
            state.force_recheck
                || state
                    .last_check
                    .map_or(true, |t| t.elapsed() >= self.ttl)
        };

        if !needs_probe {
            return self.state.lock().capabilities.clone();
        }

        match self.probe.probe().await {
            Ok(caps) => {
                let mut state = self.state.lock();
                state.capabilities = caps.clone();
                state.last_check = Some(Instant::now());
                state.force_recheck = false;
                caps
            }
            Err(_) => {
                // Degrade gracefully: keep the last known-good
                // capabilities, but leave `last_check` untouched so the
                // next call retries rather than serving a long-stale
                // "probe failed" cache entry.
                self.state.lock().capabilities.clone()
            }
        }
    }

    /// Called when a sampling tick fails, so the next tick re-probes
    /// rather than waiting out the full TTL (spec §4.4: "repeated
    /// failures update the feature detector's lastCheck to force
    /// re-probing on recovery").
    pub fn mark_check_needed(&self) {
        self.state.lock().force_recheck = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingProbe {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CapabilityProbe for CountingProbe {
        async fn probe(&self) -> Result<Capabilities, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Capabilities {
                pg_stat_statements: true,
                ..Default::default()
            })
        }
    }

    #[tokio::test]
    async fn caches_within_ttl() {
        let probe = Arc::new(CountingProbe {
            calls: AtomicUsize::new(0),
        });
        let detector = FeatureDetector::new(probe.clone(), Duration::from_secs(300));
        detector.capabilities().await;
        detector.capabilities().await;
        detector.capabilities().await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn mark_check_needed_forces_reprobe() {
        let probe = Arc::new(CountingProbe {
            calls: AtomicUsize::new(0),
        });
        let detector = FeatureDetector::new(probe.clone(), Duration::from_secs(300));
        detector.capabilities().await;
        detector.mark_check_needed();
        detector.capabilities().await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), 2);
    }
}
