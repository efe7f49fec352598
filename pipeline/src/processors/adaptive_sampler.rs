use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bounded_map::{BoundedMap, EvictionPolicy};
use collector_common::Metrics;
use pipeline_types::{Attributes, MetricBatch};
use rand::Rng;

use crate::error::PipelineError;
use crate::feedback::{FeedbackBus, FeedbackEvent, FeedbackLevel};
use crate::processors::Processor;

/// A declarative retention rule (spec §4.5). The predicate may fail
/// (e.g. a malformed regex compiled from user config); a failure is
/// treated as "does not match" rather than aborting the batch.
pub struct Rule {
    pub name: String,
    pub priority: i32,
    pub predicate: Arc<dyn Fn(&Attributes) -> Result<bool, String> + Send + Sync>,
    pub sample_rate: f64,
}

#[derive(Clone)]
pub struct AdaptiveSamplerConfig {
    pub default_sample_rate: f64,
    /// Default rate used in place of `default_sample_rate` while cost
    /// control's shared aggressive flag is set (spec §4.9, Scenario 6).
    pub aggressive_default_sample_rate: f64,
    pub decision_cache_cap: usize,
    pub decision_cache_ttl: Duration,
}

impl Default for AdaptiveSamplerConfig {
    fn default() -> Self {
        Self {
            default_sample_rate: 1.0,
            aggressive_default_sample_rate: 1.0,
            decision_cache_cap: 50_000,
            decision_cache_ttl: Duration::from_secs(300),
        }
    }
}

impl AdaptiveSamplerConfig {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if !(0.0..=1.0).contains(&self.default_sample_rate) {
            return Err(PipelineError::fatal("adaptive_sampler.default_sample_rate must be in [0,1]"));
        }
        if self.decision_cache_cap == 0 {
            return Err(PipelineError::fatal("adaptive_sampler.decision_cache_cap must be positive"));
        }
        if self.decision_cache_ttl.is_zero() {
            return Err(PipelineError::fatal("adaptive_sampler.decision_cache_ttl must be positive"));
        }
        Ok(())
    }
}

/// Rule-based retention with a deduplicating decision cache keyed by
/// record fingerprint (spec §4.5). `default_sample_rate=1.0` with no
/// rules is the identity transform (spec §8 round-trip property).
pub struct AdaptiveSampler {
    rules: Vec<Rule>,
    config: AdaptiveSamplerConfig,
    decisions: BoundedMap<bool>,
    metrics: Metrics,
    feedback: Option<FeedbackBus>,
    aggressive: Option<Arc<AtomicBool>>,
}

impl AdaptiveSampler {
    pub fn new(mut rules: Vec<Rule>, config: AdaptiveSamplerConfig, metrics: Metrics, feedback: Option<FeedbackBus>) -> Self {
        rules.sort_by_key(|r| r.priority);
        let decisions = BoundedMap::new(config.decision_cache_cap, EvictionPolicy::Lru, Some(config.decision_cache_ttl));
        Self {
            rules,
            config,
            decisions,
            metrics,
            feedback,
            aggressive: None,
        }
    }

    /// Wires in cost control's shared aggressive-mode flag (spec §4.9).
    /// Optional: a sampler with no handle simply never raises its rate.
    pub fn with_aggressive_handle(mut self, aggressive: Arc<AtomicBool>) -> Self {
        self.aggressive = Some(aggressive);
        self
    }

    fn default_rate(&self) -> f64 {
        match &self.aggressive {
            Some(flag) if flag.load(Ordering::Relaxed) => self.config.aggressive_default_sample_rate,
            _ => self.config.default_sample_rate,
        }
    }

    fn fingerprint(attrs: &Attributes) -> String {
        let statement_type = attrs.get("statement_type").and_then(|v| v.as_str()).unwrap_or("");
        let database = attrs.get("database_name").and_then(|v| v.as_str()).unwrap_or("");
        let query = attrs.get("query.text").and_then(|v| v.as_str()).unwrap_or("");
        let normalized: String = query.split_whitespace().collect::<Vec<_>>().join(" ");
        format!("{statement_type}|{database}|{normalized}")
    }

    fn decide(&self, attrs: &Attributes) -> bool {
        let fingerprint = Self::fingerprint(attrs);
        if let Some(cached) = self.decisions.get(&fingerprint) {
            self.metrics.incr("adaptive_sampler.cache_hit");
            return cached;
        }

        let rate = self
            .rules
            .iter()
            .find_map(|rule| match (rule.predicate)(attrs) {
                Ok(true) => Some(rule.sample_rate),
                Ok(false) => None,
                Err(e) => {
                    self.metrics.incr_with_tag("adaptive_sampler.rule_error", "rule", &rule.name);
                    if let Some(bus) = &self.feedback {
                        bus.publish(FeedbackEvent::new(
                            FeedbackLevel::Warning,
                            "rule_evaluation_error",
                            format!("rule {} failed to evaluate: {e}", rule.name),
                            3,
                        ));
                    }
                    None
                }
            })
            .unwrap_or_else(|| self.default_rate());

        let keep = rate >= 1.0 || rand::thread_rng().gen_bool(rate.clamp(0.0, 1.0));
        self.decisions.put(fingerprint, keep);
        keep
    }
}

#[async_trait]
impl Processor for AdaptiveSampler {
    fn name(&self) -> &str {
        "adaptive_sampler"
    }

    async fn process(&self, mut batch: MetricBatch) -> Result<MetricBatch, PipelineError> {
        batch.retain_data_points(|_, point| self.decide(&point.attributes));
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_types::{AttributeValue, DataPoint, DataPointValue, Metric, MetricKind, ResourceScope, ScopeGroup};

    fn batch_with(statement_type: &str) -> MetricBatch {
        let mut attrs = Attributes::new();
        attrs.insert("statement_type", AttributeValue::string(statement_type)).unwrap();
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
    async fn default_rate_one_with_no_rules_is_identity() {
        let sampler = AdaptiveSampler::new(vec![], AdaptiveSamplerConfig::default(), Metrics::noop(), None);
        let batch = batch_with("SELECT");
        let before = batch.data_point_count();
        let after = sampler.process(batch).await.unwrap();
        assert_eq!(after.data_point_count(), before);
    }

    #[tokio::test]
    async fn matching_rule_with_zero_rate_drops_everything() {
        let rule = Rule {
            name: "drop-select".into(),
            priority: 0,
            predicate: Arc::new(|attrs| Ok(attrs.get("statement_type").and_then(|v| v.as_str()) == Some("SELECT"))),
            sample_rate: 0.0,
        };
        let sampler = AdaptiveSampler::new(vec![rule], AdaptiveSamplerConfig::default(), Metrics::noop(), None);
        let after = sampler.process(batch_with("SELECT")).await.unwrap();
        assert_eq!(after.data_point_count(), 0);
    }

    #[tokio::test]
    async fn repeated_fingerprint_reuses_cached_decision() {
        let rule = Rule {
            name: "half".into(),
            priority: 0,
            predicate: Arc::new(|_| Ok(true)),
            sample_rate: 0.0,
        };
        let sampler = AdaptiveSampler::new(vec![rule], AdaptiveSamplerConfig::default(), Metrics::noop(), None);
        sampler.process(batch_with("SELECT")).await.unwrap();
        // Second call for the same fingerprint must hit the cache rather
        // than re-rolling the dice, so the decision is stable.
        let after = sampler.process(batch_with("SELECT")).await.unwrap();
        assert_eq!(after.data_point_count(), 0);
    }
}
