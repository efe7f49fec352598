use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::Utc;
use collector_common::Metrics;
use rand::Rng;
use thiserror::Error;

use crate::adaptive_rate::{AdaptiveRate, RateConfig};
use crate::aggregator::{WindowAggregator, WindowAggregatorConfig};
use crate::feature_detection::FeatureDetector;
use crate::ring_buffer::SnapshotRingBuffer;
use crate::rules::{classify, IncludeDecision};
use crate::snapshot::{RawSession, SessionSnapshot, SessionState};

/// Pulls the current set of candidate sessions off a live database. The
/// concrete `pg_stat_activity` / `performance_schema.threads` query is an
/// external collaborator (spec §1); this trait is the seam.
#[async_trait]
pub trait SessionSource: Send + Sync {
    async fn sample(&self) -> Result<Vec<RawSession>, String>;
}

#[derive(Debug, Error)]
pub enum SamplerError {
    #[error("session source sample failed: {0}")]
    SourceFailed(String),
}

#[derive(Debug, Clone)]
pub struct AshConfig {
    pub rate: RateConfig,
    pub long_running_threshold: StdDuration,
    pub include_idle_sessions: bool,
    pub ring_buffer_capacity: usize,
    pub windows: WindowAggregatorConfig,
}

impl Default for AshConfig {
    fn default() -> Self {
        Self {
            rate: RateConfig::default(),
            long_running_threshold: StdDuration::from_secs(5 * 60),
            include_idle_sessions: false,
            ring_buffer_capacity: 10_000,
            windows: WindowAggregatorConfig::default(),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct TickOutcome {
    pub sampled: usize,
    pub candidates: usize,
    pub rate: f64,
}

/// The Active Session History sampler (spec §4.4): one tick per cadence
/// produces a snapshot set, keeps always/default-include sessions
/// unconditionally, and rolls the dice on the remainder at the current
/// adaptive rate.
pub struct AshSampler {
    source: Arc<dyn SessionSource>,
    config: AshConfig,
    rate: parking_lot::Mutex<AdaptiveRate>,
    pub buffer: SnapshotRingBuffer,
    pub aggregator: WindowAggregator,
    pub features: FeatureDetector,
    metrics: Metrics,
}

impl AshSampler {
    pub fn new(
        source: Arc<dyn SessionSource>,
        config: AshConfig,
        features: FeatureDetector,
        metrics: Metrics,
    ) -> Self {
        let buffer = SnapshotRingBuffer::new(config.ring_buffer_capacity);
        let aggregator = WindowAggregator::new(config.windows.clone());
        Self {
            source,
            rate: parking_lot::Mutex::new(AdaptiveRate::new(config.rate)),
            config,
            buffer,
            aggregator,
            features,
            metrics,
        }
    }

    pub fn current_rate(&self) -> f64 {
        self.rate.lock().current()
    }

    /// Runs one sampling tick. A failed sample logs and is skipped rather
    /// than propagated as a fatal error (spec §4.4): the collector must
    /// keep running across a transient database hiccup.
    pub async fn tick(&self) -> TickOutcome {
        let raw_sessions = match self.source.sample().await {
            Ok(sessions) => sessions,
            Err(e) => {
                log::warn!("ASH sample failed, skipping tick: {e}");
                self.features.mark_check_needed();
                self.metrics.incr("ash.sample_failed");
                return TickOutcome::default();
            }
        };

        let now = Utc::now();
        let live_count = raw_sessions.len();
        let rate = self.rate.lock().update(live_count);
        let long_running = chrono::Duration::from_std(self.config.long_running_threshold).unwrap_or_default();

        let mut sampled = 0usize;
        for raw in &raw_sessions {
            let (decision, multiplier) = classify(raw, self.config.include_idle_sessions, long_running, now);
            let keep = match decision {
                IncludeDecision::AlwaysInclude | IncludeDecision::DefaultInclude => true,
                IncludeDecision::RateLimited => {
                    let probability = (rate * multiplier).clamp(0.0, 1.0);
                    rand::thread_rng().gen_bool(probability)
                }
            };
            if !keep {
                continue;
            }
            let snapshot = to_snapshot(raw, now);
            self.buffer.push(snapshot.clone());
            self.aggregator.ingest(&snapshot);
            sampled += 1;
        }

        self.aggregator.tick(now);
        self.metrics.gauge("ash.live_sessions", live_count as u64);
        self.metrics.gauge("ash.sampled_sessions", sampled as u64);
        self.metrics.gauge("ash.sample_rate_permille", (rate * 1000.0) as u64);

        TickOutcome {
            sampled,
            candidates: live_count,
            rate,
        }
    }
}

fn to_snapshot(raw: &RawSession, sample_time: chrono::DateTime<Utc>) -> SessionSnapshot {
    SessionSnapshot {
        sample_time,
        pid: raw.pid,
        session_id: raw.session_id.clone(),
        database: raw.database.clone(),
        username: raw.username.clone(),
        application_name: raw.application_name.clone(),
        client_addr: raw.client_addr.clone(),
        connection_start: raw.connection_start,
        query_start: raw.query_start,
        query_fingerprint: raw.query_text.as_deref().map(fingerprint),
        state: SessionState::classify(&raw.state_text),
        state_text: raw.state_text.clone(),
        wait_event_type: raw.wait_event_type.clone(),
        wait_event_name: raw.wait_event_name.clone(),
        blocking_pid: raw.blocking_pid,
        backend_type: raw.backend_type.clone(),
    }
}

fn fingerprint(query_text: &str) -> String {
    use md5::{Digest, Md5};
    let digest = Md5::digest(query_text.as_bytes());
    hex::encode(&digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature_detection::{Capabilities, CapabilityProbe};

    struct FixedSource(Vec<RawSession>);

    #[async_trait]
    impl SessionSource for FixedSource {
        async fn sample(&self) -> Result<Vec<RawSession>, String> {
            Ok(self.0.clone())
        }
    }

    struct NoopProbe;
    #[async_trait]
    impl CapabilityProbe for NoopProbe {
        async fn probe(&self) -> Result<Capabilities, String> {
            Ok(Capabilities::default())
        }
    }

    fn raw(pid: i64, state_text: &str) -> RawSession {
        RawSession {
            pid,
            session_id: pid.to_string(),
            database: "db".into(),
            username: "u".into(),
            application_name: "app".into(),
            client_addr: None,
            connection_start: Utc::now(),
            query_start: None,
            query_text: None,
            state_text: state_text.to_owned(),
            wait_event_type: None,
            wait_event_name: None,
            blocking_pid: None,
            backend_type: "client backend".into(),
        }
    }

    #[tokio::test]
    async fn always_include_sessions_survive_even_at_zero_rate() {
        let mut cfg = AshConfig::default();
        cfg.rate.base_rate = 0.0;
        cfg.rate.min_rate = 0.0;
        let mut blocked = raw(1, "active");
        blocked.blocking_pid = Some(99);

        let source = Arc::new(FixedSource(vec![blocked]));
        let sampler = AshSampler::new(
            source,
            cfg,
            FeatureDetector::new(Arc::new(NoopProbe), StdDuration::from_secs(300)),
            Metrics::noop(),
        );
        let outcome = sampler.tick().await;
        assert_eq!(outcome.sampled, 1);
        assert_eq!(sampler.buffer.len(), 1);
    }

    #[tokio::test]
    async fn failed_sample_skips_tick_without_panicking() {
        struct FailingSource;
        #[async_trait]
        impl SessionSource for FailingSource {
            async fn sample(&self) -> Result<Vec<RawSession>, String> {
                Err("connection refused".into())
            }
        }
        let sampler = AshSampler::new(
            Arc::new(FailingSource),
            AshConfig::default(),
            FeatureDetector::new(Arc::new(NoopProbe), StdDuration::from_secs(300)),
            Metrics::noop(),
        );
        let outcome = sampler.tick().await;
        assert_eq!(outcome.sampled, 0);
        assert_eq!(outcome.candidates, 0);
    }
}
