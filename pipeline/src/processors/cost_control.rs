use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use collector_common::Metrics;
use pipeline_types::{AttributeValue, MetricBatch};

use crate::error::PipelineError;
use crate::feedback::{FeedbackBus, FeedbackEvent, FeedbackLevel};
use crate::processors::Processor;

/// Approximate per-data-point wire cost used to convert volume into a
/// dollar estimate. Deliberately coarse — this is a budget guardrail, not
/// a billing reconciliation (spec §4.9).
const ASSUMED_BYTES_PER_DATA_POINT: u64 = 220;

#[derive(Debug, Clone, Copy)]
pub struct CostControlConfig {
    pub monthly_budget_usd: f64,
    pub price_per_gb_usd: f64,
    /// Once cumulative spend crosses this fraction of the budget, the
    /// processor enters aggressive mode (spec §4.9).
    pub aggressive_threshold_ratio: f64,
}

impl Default for CostControlConfig {
    fn default() -> Self {
        Self {
            monthly_budget_usd: 500.0,
            price_per_gb_usd: 0.05,
            aggressive_threshold_ratio: 1.0,
        }
    }
}

impl CostControlConfig {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.monthly_budget_usd <= 0.0 || self.price_per_gb_usd <= 0.0 {
            return Err(PipelineError::fatal("cost_control budget and price must be positive"));
        }
        if !(0.0..=1.0).contains(&self.aggressive_threshold_ratio) {
            return Err(PipelineError::fatal("cost_control.aggressive_threshold_ratio must be within [0, 1]"));
        }
        Ok(())
    }
}

/// Tracks cumulative export cost against a monthly budget. When spend
/// crosses `aggressive_threshold_ratio`, `aggressive_mode` flips on — the
/// flag is shared (`Arc<AtomicBool>`) so `AdaptiveSampler` and
/// `Verification` can consult it to raise their own default rate /
/// tighten cardinality without this processor reaching into their state
/// directly (spec §4.9).
pub struct CostControl {
    config: CostControlConfig,
    bytes_spent: AtomicU64,
    aggressive: Arc<AtomicBool>,
    metrics: Metrics,
    feedback: Option<FeedbackBus>,
}

impl CostControl {
    pub fn new(config: CostControlConfig, metrics: Metrics, feedback: Option<FeedbackBus>) -> Self {
        Self {
            config,
            bytes_spent: AtomicU64::new(0),
            aggressive: Arc::new(AtomicBool::new(false)),
            metrics,
            feedback,
        }
    }

    /// A shared handle other processors can poll to learn whether cost
    /// control currently wants the pipeline to shed load.
    pub fn aggressive_handle(&self) -> Arc<AtomicBool> {
        self.aggressive.clone()
    }

    pub fn is_aggressive(&self) -> bool {
        self.aggressive.load(Ordering::Relaxed)
    }

    fn usage_ratio(&self) -> f64 {
        let bytes = self.bytes_spent.load(Ordering::Relaxed) as f64;
        let gb = bytes / 1_000_000_000.0;
        let spent_usd = gb * self.config.price_per_gb_usd;
        spent_usd / self.config.monthly_budget_usd
    }

    fn record_usage(&self, data_points: u64) {
        self.bytes_spent.fetch_add(data_points * ASSUMED_BYTES_PER_DATA_POINT, Ordering::Relaxed);
        let ratio = self.usage_ratio();
        self.metrics.gauge("cost_control.budget_usage_ratio_permille", (ratio * 1000.0).max(0.0) as u64);

        let was_aggressive = self.aggressive.swap(ratio >= self.config.aggressive_threshold_ratio, Ordering::Relaxed);
        let now_aggressive = ratio >= self.config.aggressive_threshold_ratio;
        if now_aggressive && !was_aggressive {
            if let Some(bus) = &self.feedback {
                bus.publish(FeedbackEvent::new(
                    FeedbackLevel::Warning,
                    "cost_control_aggressive",
                    format!("export cost at {:.1}% of monthly budget, entering aggressive mode", ratio * 100.0),
                    7,
                ));
            }
        }
    }
}

#[async_trait]
impl Processor for CostControl {
    fn name(&self) -> &str {
        "cost_control"
    }

    async fn process(&self, mut batch: MetricBatch) -> Result<MetricBatch, PipelineError> {
        // Aggressive mode must take effect starting the *next* record once
        // budget is crossed, not the one that crosses it — so the shed
        // decision for this batch uses the state from before this batch's
        // usage is recorded.
        let shed_low_priority = self.is_aggressive();
        self.record_usage(batch.data_point_count() as u64);

        if shed_low_priority {
            batch.retain_data_points(|_, point| !matches!(point.attributes.get("priority"), Some(AttributeValue::String(p)) if p.as_ref() == "low"));
        }

        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_types::{Attributes, DataPoint, DataPointValue, Metric, MetricKind, ResourceScope, ScopeGroup};

    fn batch_with_priority(priority: &str) -> MetricBatch {
        let mut attrs = Attributes::new();
        attrs.insert("priority", AttributeValue::string(priority)).unwrap();
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
    async fn below_threshold_keeps_low_priority_records() {
        let cc = CostControl::new(CostControlConfig::default(), Metrics::noop(), None);
        let after = cc.process(batch_with_priority("low")).await.unwrap();
        assert_eq!(after.data_point_count(), 1);
        assert!(!cc.is_aggressive());
    }

    #[tokio::test]
    async fn aggressive_mode_sheds_low_priority_records() {
        let cfg = CostControlConfig {
            monthly_budget_usd: 0.000_001,
            price_per_gb_usd: 0.05,
            aggressive_threshold_ratio: 0.1,
        };
        let cc = CostControl::new(cfg, Metrics::noop(), None);
        cc.process(batch_with_priority("low")).await.unwrap();
        assert!(cc.is_aggressive());
        let after = cc.process(batch_with_priority("low")).await.unwrap();
        assert_eq!(after.data_point_count(), 0);
    }
}
