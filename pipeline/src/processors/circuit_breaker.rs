use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bounded_map::{BoundedMap, EvictionPolicy};
use collector_common::Metrics;
use parking_lot::Mutex;
use pipeline_types::{Attributes, AttributeValue, DataPoint, MetricBatch};

use crate::error::PipelineError;
use crate::processors::Processor;

/// Guards *record flow*, one FSM per observed `database_name` (spec
/// §4.6). A distinct shape from `pool-manager`'s per-pool breaker, which
/// guards *connection acquisition* — same textbook states, different
/// home, not shared code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub failure_window: Duration,
    pub timeout_duration: Duration,
    pub half_open_successes: u32,
    pub reporting_interval: Duration,
    /// TTL on the per-database bounded map so ephemeral databases do not
    /// leak entries (spec §4.6).
    pub state_cap: usize,
    pub state_ttl: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 10,
            failure_window: Duration::from_secs(60),
            timeout_duration: Duration::from_secs(30),
            half_open_successes: 5,
            reporting_interval: Duration::from_secs(10),
            state_cap: 10_000,
            state_ttl: Duration::from_secs(3600),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.failure_threshold == 0 {
            return Err(PipelineError::fatal("circuit_breaker.failure_threshold must be positive"));
        }
        if self.failure_window.is_zero() || self.timeout_duration.is_zero() || self.reporting_interval.is_zero() {
            return Err(PipelineError::fatal("circuit_breaker intervals must be positive"));
        }
        if self.state_cap == 0 {
            return Err(PipelineError::fatal("circuit_breaker.state_cap must be positive"));
        }
        Ok(())
    }
}

struct DatabaseBreaker {
    state: CircuitState,
    window_start: Instant,
    failures_in_window: u32,
    opened_at: Option<Instant>,
    half_open_admitted: u32,
    half_open_successes: u32,
    last_marker_emitted: Option<Instant>,
}

impl DatabaseBreaker {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            window_start: Instant::now(),
            failures_in_window: 0,
            opened_at: None,
            half_open_admitted: 0,
            half_open_successes: 0,
            last_marker_emitted: None,
        }
    }
}

fn is_failure_marker(attrs: &Attributes) -> bool {
    matches!(attrs.get("error"), Some(AttributeValue::Bool(true)))
        || matches!(attrs.get("resource_exhausted"), Some(AttributeValue::Bool(true)))
}

/// One FSM per database identity, guarding record flow downstream (spec
/// §4.6, §8 invariant 5).
pub struct CircuitBreakerProcessor {
    config: CircuitBreakerConfig,
    breakers: BoundedMap<Arc<Mutex<DatabaseBreaker>>>,
    metrics: Metrics,
}

impl CircuitBreakerProcessor {
    pub fn new(config: CircuitBreakerConfig, metrics: Metrics) -> Self {
        let breakers = BoundedMap::new(config.state_cap, EvictionPolicy::Lru, Some(config.state_ttl));
        Self {
            config,
            breakers,
            metrics,
        }
    }

    fn breaker_for(&self, database: &str) -> Arc<Mutex<DatabaseBreaker>> {
        if let Some(existing) = self.breakers.get(database) {
            return existing;
        }
        let fresh = Arc::new(Mutex::new(DatabaseBreaker::new()));
        self.breakers.put(database, fresh.clone());
        fresh
    }

    pub fn state_for(&self, database: &str) -> CircuitState {
        self.breaker_for(database).lock().state
    }

    /// Decides whether `point` is forwarded, and whether a throttled
    /// "circuit open" marker should accompany it this call.
    fn admit(&self, database: &str, point: &DataPoint) -> Admission {
        let handle = self.breaker_for(database);
        let mut breaker = handle.lock();
        let now = Instant::now();
        let failed = is_failure_marker(&point.attributes);

        match breaker.state {
            CircuitState::Closed => {
                if now.duration_since(breaker.window_start) > self.config.failure_window {
                    breaker.window_start = now;
                    breaker.failures_in_window = 0;
                }
                if failed {
                    breaker.failures_in_window += 1;
                    if breaker.failures_in_window > self.config.failure_threshold {
                        breaker.state = CircuitState::Open;
                        breaker.opened_at = Some(now);
                        self.metrics.incr_with_tag("circuit_breaker.tripped", "database", database);
                        return self.marker_or_drop(&mut breaker, database, now);
                    }
                }
                Admission::Forward
            }
            CircuitState::Open => {
                if let Some(opened_at) = breaker.opened_at {
                    if now.duration_since(opened_at) >= self.config.timeout_duration {
                        breaker.state = CircuitState::HalfOpen;
                        breaker.half_open_admitted = 0;
                        breaker.half_open_successes = 0;
                        return self.admit_half_open(&mut breaker, failed);
                    }
                }
                self.marker_or_drop(&mut breaker, database, now)
            }
            CircuitState::HalfOpen => self.admit_half_open(&mut breaker, failed),
        }
    }

    fn admit_half_open(&self, breaker: &mut DatabaseBreaker, failed: bool) -> Admission {
        if failed {
            breaker.state = CircuitState::Open;
            breaker.opened_at = Some(Instant::now());
            breaker.half_open_admitted = 0;
            return Admission::Drop;
        }
        if breaker.half_open_admitted >= self.config.half_open_successes {
            return Admission::Drop;
        }
        breaker.half_open_admitted += 1;
        breaker.half_open_successes += 1;
        if breaker.half_open_successes >= self.config.half_open_successes {
            breaker.state = CircuitState::Closed;
            breaker.failures_in_window = 0;
            breaker.window_start = Instant::now();
        }
        Admission::Forward
    }

    fn marker_or_drop(&self, breaker: &mut DatabaseBreaker, database: &str, now: Instant) -> Admission {
        let should_emit = breaker
            .last_marker_emitted
            .map_or(true, |t| now.duration_since(t) >= self.config.reporting_interval);
        if should_emit {
            breaker.last_marker_emitted = Some(now);
            Admission::Marker(database.to_owned())
        } else {
            Admission::Drop
        }
    }
}

enum Admission {
    Forward,
    Drop,
    Marker(String),
}

#[async_trait]
impl Processor for CircuitBreakerProcessor {
    fn name(&self) -> &str {
        "circuit_breaker"
    }

    async fn process(&self, mut batch: MetricBatch) -> Result<MetricBatch, PipelineError> {
        let mut markers: Vec<(String, usize)> = Vec::new();
        for scope in &mut batch.resource_scopes {
            for group in &mut scope.scope_groups {
                for metric in &mut group.metrics {
                    let mut kept = Vec::with_capacity(metric.data_points.len());
                    for point in metric.data_points.drain(..) {
                        let database = point
                            .attributes
                            .get("database_name")
                            .and_then(|v| v.as_str())
                            .unwrap_or("unknown")
                            .to_owned();
                        match self.admit(&database, &point) {
                            Admission::Forward => kept.push(point),
                            Admission::Drop => {
                                self.metrics.incr_with_tag("circuit_breaker.dropped", "database", &database);
                            }
                            Admission::Marker(db) => markers.push((db, kept.len())),
                        }
                    }
                    for (db, idx) in markers.drain(..) {
                        let mut attrs = Attributes::new();
                        attrs.insert("circuit.state", AttributeValue::string("open")).ok();
                        attrs.insert("database_name", AttributeValue::string(db)).ok();
                        kept.insert(
                            idx.min(kept.len()),
                            DataPoint {
                                timestamp: chrono::Utc::now(),
                                value: pipeline_types::DataPointValue::Int(1),
                                attributes: attrs,
                            },
                        );
                    }
                    metric.data_points = kept;
                }
            }
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_types::{DataPointValue, Metric, MetricKind, ResourceScope, ScopeGroup};

    fn point(database: &str, failed: bool) -> DataPoint {
        let mut attrs = Attributes::new();
        attrs.insert("database_name", AttributeValue::string(database)).unwrap();
        if failed {
            attrs.insert("error", AttributeValue::Bool(true)).unwrap();
        }
        DataPoint {
            timestamp: chrono::Utc::now(),
            value: DataPointValue::Int(1),
            attributes: attrs,
        }
    }

    fn single_point_batch(p: DataPoint) -> MetricBatch {
        MetricBatch {
            resource_scopes: vec![ResourceScope {
                resource_attributes: Attributes::new(),
                scope_groups: vec![ScopeGroup {
                    scope_name: "s".into(),
                    metrics: vec![Metric {
                        name: "db.query.total_time".into(),
                        description: String::new(),
                        unit: "ms".into(),
                        kind: MetricKind::Gauge,
                        data_points: vec![p],
                    }],
                }],
            }],
        }
    }

    #[tokio::test]
    async fn trips_after_exceeding_failure_threshold() {
        let cfg = CircuitBreakerConfig {
            failure_threshold: 3,
            ..CircuitBreakerConfig::default()
        };
        let breaker = CircuitBreakerProcessor::new(cfg, Metrics::noop());
        for _ in 0..3 {
            breaker.process(single_point_batch(point("prod", true))).await.unwrap();
        }
        assert_eq!(breaker.state_for("prod"), CircuitState::Closed);
        breaker.process(single_point_batch(point("prod", true))).await.unwrap();
        assert_eq!(breaker.state_for("prod"), CircuitState::Open);
    }

    #[tokio::test]
    async fn open_circuit_drops_records_for_that_database() {
        let cfg = CircuitBreakerConfig {
            failure_threshold: 1,
            ..CircuitBreakerConfig::default()
        };
        let breaker = CircuitBreakerProcessor::new(cfg, Metrics::noop());
        breaker.process(single_point_batch(point("prod", true))).await.unwrap();
        assert_eq!(breaker.state_for("prod"), CircuitState::Open);

        let after = breaker.process(single_point_batch(point("prod", false))).await.unwrap();
        // Dropped, not forwarded, while open and outside the marker path.
        assert_eq!(after.data_point_count(), 0);
    }

    #[tokio::test]
    async fn other_databases_are_unaffected() {
        let cfg = CircuitBreakerConfig {
            failure_threshold: 1,
            ..CircuitBreakerConfig::default()
        };
        let breaker = CircuitBreakerProcessor::new(cfg, Metrics::noop());
        breaker.process(single_point_batch(point("prod", true))).await.unwrap();
        let after = breaker.process(single_point_batch(point("staging", false))).await.unwrap();
        assert_eq!(after.data_point_count(), 1);
    }
}
