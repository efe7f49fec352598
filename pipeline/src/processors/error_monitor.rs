use std::time::Duration;

use async_trait::async_trait;
use bounded_map::{BoundedMap, EvictionPolicy};
use collector_common::Metrics;
use pipeline_types::MetricBatch;

use crate::error::PipelineError;
use crate::feedback::{FeedbackBus, FeedbackEvent, FeedbackLevel};
use crate::processors::Processor;

/// Downstream-rejection causes this processor knows how to recognize
/// (spec §4.9). Upstream receivers and sinks attach `rejection_cause` to
/// a record when they observe one of these; this processor never infers
/// a cause on its own.
const KNOWN_CAUSES: &[&str] = &["overlong_attribute", "invalid_metric_name", "cardinality_breach", "schema_mismatch"];

#[derive(Debug, Clone, Copy)]
pub struct ErrorMonitorConfig {
    pub suppression_window: Duration,
    pub alert_threshold: u32,
    pub cause_cap: usize,
}

impl Default for ErrorMonitorConfig {
    fn default() -> Self {
        Self {
            suppression_window: Duration::from_secs(5 * 60),
            alert_threshold: 20,
            cause_cap: 256,
        }
    }
}

impl ErrorMonitorConfig {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.alert_threshold == 0 {
            return Err(PipelineError::fatal("error_monitor.alert_threshold must be positive"));
        }
        if self.cause_cap == 0 {
            return Err(PipelineError::fatal("error_monitor.cause_cap must be positive"));
        }
        Ok(())
    }
}

/// Pattern-matches records against known downstream-rejection causes,
/// suppresses duplicate alerts within `suppression_window`, and raises a
/// structured alert on the feedback bus once a cause's count within the
/// window exceeds `alert_threshold` (spec §4.9).
pub struct ErrorMonitor {
    config: ErrorMonitorConfig,
    counts: BoundedMap<u32>,
    suppressed_until: BoundedMap<bool>,
    metrics: Metrics,
    feedback: Option<FeedbackBus>,
}

impl ErrorMonitor {
    pub fn new(config: ErrorMonitorConfig, metrics: Metrics, feedback: Option<FeedbackBus>) -> Self {
        let counts = BoundedMap::new(config.cause_cap, EvictionPolicy::Lru, Some(config.suppression_window));
        let suppressed_until = BoundedMap::new(config.cause_cap, EvictionPolicy::Lru, Some(config.suppression_window));
        Self {
            config,
            counts,
            suppressed_until,
            metrics,
            feedback,
        }
    }

    fn note_cause(&self, cause: &str) {
        if !KNOWN_CAUSES.contains(&cause) {
            return;
        }
        let count = self.counts.get(cause).unwrap_or(0) + 1;
        self.counts.put(cause, count);
        self.metrics.incr_with_tag("error_monitor.cause", "cause", cause);

        if count <= self.config.alert_threshold {
            return;
        }
        if self.suppressed_until.contains_key(cause) {
            return;
        }
        self.suppressed_until.put(cause, true);
        if let Some(bus) = &self.feedback {
            bus.publish(FeedbackEvent::new(
                FeedbackLevel::Error,
                "downstream_rejection_alert",
                format!("cause '{cause}' exceeded {} occurrences within the suppression window", self.config.alert_threshold),
                9,
            ));
        }
    }
}

#[async_trait]
impl Processor for ErrorMonitor {
    fn name(&self) -> &str {
        "error_monitor"
    }

    fn mutates_data(&self) -> bool {
        false
    }

    async fn process(&self, batch: MetricBatch) -> Result<MetricBatch, PipelineError> {
        batch.for_each_data_point(|_, point| {
            if let Some(cause) = point.attributes.get("rejection_cause").and_then(|v| v.as_str()) {
                self.note_cause(cause);
            }
        });
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_types::{AttributeValue, Attributes, DataPoint, DataPointValue, Metric, MetricKind, ResourceScope, ScopeGroup};

    fn batch_with_cause(cause: &str) -> MetricBatch {
        let mut attrs = Attributes::new();
        attrs.insert("rejection_cause", AttributeValue::string(cause)).unwrap();
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
                        data_points: vec![DataPoint {
                            timestamp: chrono::Utc::now(),
                            value: DataPointValue::Int(1),
                            attributes: attrs,
                        }],
                    }],
                }],
            }],
        }
    }

    #[tokio::test]
    async fn unknown_causes_are_ignored() {
        let monitor = ErrorMonitor::new(ErrorMonitorConfig::default(), Metrics::noop(), None);
        let batch = monitor.process(batch_with_cause("mystery")).await.unwrap();
        assert_eq!(batch.data_point_count(), 1);
    }

    #[tokio::test]
    async fn repeated_known_cause_past_threshold_alerts_once() {
        let cfg = ErrorMonitorConfig {
            alert_threshold: 2,
            ..ErrorMonitorConfig::default()
        };
        let monitor = ErrorMonitor::new(cfg, Metrics::noop(), None);
        for _ in 0..5 {
            monitor.process(batch_with_cause("overlong_attribute")).await.unwrap();
        }
        assert!(monitor.suppressed_until.contains_key("overlong_attribute"));
    }
}
