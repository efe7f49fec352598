use std::time::Duration;

use async_trait::async_trait;
use bounded_map::{BoundedMap, EvictionPolicy};
use collector_common::Metrics;
use once_cell::sync::Lazy;
use pipeline_types::{AttributeValue, DataPoint, MetricBatch};
use regex::Regex;

use crate::error::PipelineError;
use crate::feedback::{FeedbackBus, FeedbackEvent, FeedbackLevel};
use crate::processors::Processor;

const NODE_TYPES: &[&str] = &[
    "Seq Scan",
    "Index Scan",
    "Index Only Scan",
    "Bitmap Heap Scan",
    "Nested Loop",
    "Hash Join",
    "Merge Join",
    "Sort",
    "Aggregate",
    "Limit",
];

static COST_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"cost=[\d.]+\.\.([\d.]+)").expect("cost pattern is valid"));
static ROWS_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"rows=(\d+)").expect("rows pattern is valid"));

fn fingerprint(text: &str) -> String {
    use md5::{Digest, Md5};
    hex::encode(&Md5::digest(text.as_bytes())[..8])
}

struct ParsedPlan {
    cost: Option<f64>,
    row_estimate: Option<u64>,
    node_types: Vec<String>,
    plan_hash: String,
}

/// Parses a query-plan payload an upstream receiver attached to a record
/// — this never issues `EXPLAIN` itself ("safe mode", spec §4.9).
fn parse_plan(plan_text: &str) -> ParsedPlan {
    ParsedPlan {
        cost: COST_PATTERN.captures(plan_text).and_then(|c| c[1].parse().ok()),
        row_estimate: ROWS_PATTERN.captures(plan_text).and_then(|c| c[1].parse().ok()),
        node_types: NODE_TYPES.iter().filter(|n| plan_text.contains(**n)).map(|s| s.to_string()).collect(),
        plan_hash: fingerprint(plan_text),
    }
}

#[derive(Debug, Clone)]
struct PlanHistoryEntry {
    plan_hash: String,
    mean_time_ms: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct PlanExtractorConfig {
    pub regression_ratio: f64,
    pub history_cap: usize,
    pub history_ttl: Duration,
}

impl Default for PlanExtractorConfig {
    fn default() -> Self {
        Self {
            regression_ratio: 1.5,
            history_cap: 50_000,
            history_ttl: Duration::from_secs(24 * 3600),
        }
    }
}

impl PlanExtractorConfig {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.regression_ratio <= 0.0 {
            return Err(PipelineError::fatal("plan_extractor.regression_ratio must be positive"));
        }
        if self.history_cap == 0 {
            return Err(PipelineError::fatal("plan_extractor.history_cap must be positive"));
        }
        Ok(())
    }
}

/// Holds a plan-per-query history for regression detection (spec §4.9): a
/// regression fires when the current `plan_hash` differs from the last
/// seen one for the same `query_id` and the observed mean time increased
/// by more than `regression_ratio`.
pub struct PlanExtractor {
    config: PlanExtractorConfig,
    history: BoundedMap<PlanHistoryEntry>,
    metrics: Metrics,
    feedback: Option<FeedbackBus>,
}

impl PlanExtractor {
    pub fn new(config: PlanExtractorConfig, metrics: Metrics, feedback: Option<FeedbackBus>) -> Self {
        let history = BoundedMap::new(config.history_cap, EvictionPolicy::Lru, Some(config.history_ttl));
        Self {
            config,
            history,
            metrics,
            feedback,
        }
    }

    fn handle_point(&self, point: &mut DataPoint) {
        let Some(plan_text) = point.attributes.get("query.plan").and_then(|v| v.as_str()).map(str::to_owned) else {
            return;
        };
        let parsed = parse_plan(&plan_text);

        let _ = point.attributes.insert("plan.hash", AttributeValue::string(parsed.plan_hash.clone()));
        if let Some(cost) = parsed.cost {
            let _ = point.attributes.insert("plan.cost", AttributeValue::Double(cost));
        }
        if let Some(rows) = parsed.row_estimate {
            let _ = point.attributes.insert("plan.row_estimate", AttributeValue::Int(rows as i64));
        }
        if !parsed.node_types.is_empty() {
            let _ = point.attributes.insert("plan.node_types", AttributeValue::string(parsed.node_types.join(",")));
        }

        let Some(query_id) = point.attributes.get("queryid").and_then(|v| v.as_str()).map(str::to_owned) else {
            self.history.put(parsed.plan_hash.clone(), PlanHistoryEntry { plan_hash: parsed.plan_hash, mean_time_ms: 0.0 });
            return;
        };
        let mean_time = point.attributes.get("duration_ms").and_then(|v| v.as_double()).unwrap_or(0.0);

        if let Some(previous) = self.history.get(&query_id) {
            if previous.plan_hash != parsed.plan_hash && mean_time > previous.mean_time_ms * self.config.regression_ratio {
                let _ = point.attributes.insert("plan.regression_detected", AttributeValue::Bool(true));
                self.metrics.incr_with_tag("plan_extractor.regression", "query_id", &query_id);
                if let Some(bus) = &self.feedback {
                    bus.publish(FeedbackEvent::new(
                        FeedbackLevel::Warning,
                        "plan_regression",
                        format!("query {query_id} plan changed and mean time rose past {}x", self.config.regression_ratio),
                        6,
                    ));
                }
            }
        }

        self.history.put(query_id, PlanHistoryEntry { plan_hash: parsed.plan_hash, mean_time_ms: mean_time });
    }
}

#[async_trait]
impl Processor for PlanExtractor {
    fn name(&self) -> &str {
        "plan_extractor"
    }

    async fn process(&self, mut batch: MetricBatch) -> Result<MetricBatch, PipelineError> {
        batch.for_each_data_point_mut(|_, point| self.handle_point(point));
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_types::{Attributes, DataPointValue, Metric, MetricKind, ResourceScope, ScopeGroup};

    fn plan_point(query_id: &str, plan: &str, duration_ms: f64) -> DataPoint {
        let mut attrs = Attributes::new();
        attrs.insert("queryid", AttributeValue::string(query_id)).unwrap();
        attrs.insert("query.plan", AttributeValue::string(plan)).unwrap();
        attrs.insert("duration_ms", AttributeValue::Double(duration_ms)).unwrap();
        DataPoint {
            timestamp: chrono::Utc::now(),
            value: DataPointValue::Double(duration_ms),
            attributes: attrs,
        }
    }

    fn single(p: DataPoint) -> MetricBatch {
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
    async fn extracts_cost_and_node_types() {
        let extractor = PlanExtractor::new(PlanExtractorConfig::default(), Metrics::noop(), None);
        let batch = single(plan_point("Q1", "Seq Scan on orders (cost=0.00..35.50 rows=2550 width=120)", 10.0));
        let after = extractor.process(batch).await.unwrap();
        let mut cost = None;
        after.for_each_data_point(|_, p| cost = p.attributes.get("plan.cost").and_then(|v| v.as_double()));
        assert_eq!(cost, Some(35.50));
    }

    #[tokio::test]
    async fn flags_regression_on_plan_change_and_slowdown() {
        let extractor = PlanExtractor::new(PlanExtractorConfig::default(), Metrics::noop(), None);
        extractor
            .process(single(plan_point("Q1", "Index Scan using orders_pkey on orders (cost=0.42..8.44 rows=1 width=120)", 5.0)))
            .await
            .unwrap();
        let after = extractor
            .process(single(plan_point("Q1", "Seq Scan on orders (cost=0.00..35000.50 rows=250000 width=120)", 50.0)))
            .await
            .unwrap();
        let mut flagged = false;
        after.for_each_data_point(|_, p| flagged |= p.attributes.get("plan.regression_detected").is_some());
        assert!(flagged);
    }
}
