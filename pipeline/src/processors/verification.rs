use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use bounded_map::{BoundedMap, EvictionPolicy};
use collector_common::Metrics;
use once_cell::sync::Lazy;
use pipeline_types::{AttributeValue, Attributes, DataPoint, MetricBatch};
use regex::RegexSet;
use worker_pool::WorkerPool;

use crate::error::PipelineError;
use crate::feedback::{FeedbackBus, FeedbackEvent, FeedbackLevel};
use crate::processors::Processor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sensitivity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PiiAction {
    DetectOnly,
    Redact,
    Drop,
}

/// Field-name substrings that mark a key as PII-bearing regardless of
/// value shape (spec §4.8).
const PII_FIELD_HINTS: &[&str] = &["ssn", "email", "phone", "credit"];

static PII_VALUE_PATTERNS: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"\d{3}-\d{2}-\d{4}",                           // SSN
        r"\d{4}[\s-]?\d{4}[\s-]?\d{4}[\s-]?\d{4}",      // credit card
        r"[\w.+-]+@[\w-]+\.[A-Za-z]{2,}",                // email
    ])
    .expect("PII value patterns are valid")
});

#[derive(Debug, Clone)]
pub struct PiiConfig {
    pub sensitivity: Sensitivity,
    pub action_by_sensitivity: [(Sensitivity, PiiAction); 3],
    pub exclude_fields: HashSet<String>,
}

impl Default for PiiConfig {
    fn default() -> Self {
        Self {
            sensitivity: Sensitivity::Medium,
            action_by_sensitivity: [
                (Sensitivity::Low, PiiAction::DetectOnly),
                (Sensitivity::Medium, PiiAction::Redact),
                (Sensitivity::High, PiiAction::Drop),
            ],
            exclude_fields: ["query_hash", "plan_hash", "database_name"].iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl PiiConfig {
    fn action(&self) -> PiiAction {
        self.action_by_sensitivity
            .iter()
            .find(|(s, _)| *s == self.sensitivity)
            .map(|(_, a)| *a)
            .unwrap_or(PiiAction::DetectOnly)
    }
}

/// The data types a schema can assert on an attribute (spec §4.8: "validate
/// data types against a schema (`string`/`int`/`double`)").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedType {
    String,
    Int,
    Double,
}

impl ExpectedType {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "string" => Some(ExpectedType::String),
            "int" => Some(ExpectedType::Int),
            "double" => Some(ExpectedType::Double),
            _ => None,
        }
    }

    fn matches(self, value: &AttributeValue) -> bool {
        matches!(
            (self, value),
            (ExpectedType::String, AttributeValue::String(_))
                | (ExpectedType::Int, AttributeValue::Int(_))
                | (ExpectedType::Double, AttributeValue::Double(_))
        )
    }

    fn as_str(self) -> &'static str {
        match self {
            ExpectedType::String => "string",
            ExpectedType::Int => "int",
            ExpectedType::Double => "double",
        }
    }
}

#[derive(Debug, Clone)]
pub struct QualityConfig {
    pub required_fields: Vec<String>,
    pub cardinality_limit: usize,
    pub cardinality_attribute: String,
    pub field_types: HashMap<String, ExpectedType>,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            required_fields: vec!["database_name".into(), "query_id".into(), "duration_ms".into()],
            cardinality_limit: 10_000,
            cardinality_attribute: "query_id".into(),
            field_types: [("database_name", ExpectedType::String), ("query_id", ExpectedType::String), ("duration_ms", ExpectedType::Double)]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VerificationConfig {
    pub pii: PiiConfig,
    pub quality: QualityConfig,
    pub export_feedback_as_logs: bool,
    pub pii_pool_queue_cap: usize,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            pii: PiiConfig::default(),
            quality: QualityConfig::default(),
            export_feedback_as_logs: false,
            pii_pool_queue_cap: 256,
        }
    }
}

impl VerificationConfig {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.quality.cardinality_limit == 0 {
            return Err(PipelineError::fatal("verification.quality.cardinality_limit must be positive"));
        }
        Ok(())
    }
}

enum PointOutcome {
    Keep,
    Drop,
}

fn scan_and_act(attrs: &mut Attributes, cfg: &PiiConfig) -> (PointOutcome, Vec<FeedbackEvent>) {
    let mut events = Vec::new();
    let mut hits: Vec<String> = Vec::new();

    let keys: Vec<String> = attrs.iter().map(|(k, _)| k.clone()).collect();
    for key in &keys {
        if cfg.exclude_fields.contains(key) {
            continue;
        }
        let name_hit = PII_FIELD_HINTS.iter().any(|hint| key.to_ascii_lowercase().contains(hint));
        let value_hit = attrs
            .get(key)
            .and_then(|v| v.as_str())
            .map(|s| PII_VALUE_PATTERNS.is_match(s))
            .unwrap_or(false);
        if name_hit || value_hit {
            hits.push(key.clone());
        }
    }

    if hits.is_empty() {
        return (PointOutcome::Keep, events);
    }

    match cfg.action() {
        PiiAction::DetectOnly => {}
        PiiAction::Redact => {
            for key in &hits {
                let _ = attrs.insert(key.clone(), AttributeValue::string("[REDACTED]"));
            }
        }
        PiiAction::Drop => {
            events.push(FeedbackEvent::new(FeedbackLevel::Warning, "pii_detected", format!("dropped record with PII in fields {hits:?}"), 8));
            return (PointOutcome::Drop, events);
        }
    }

    events.push(FeedbackEvent::new(
        FeedbackLevel::Warning,
        "pii_detected",
        format!("PII detected in fields {hits:?}"),
        8,
    ));
    (PointOutcome::Keep, events)
}

fn quality_check(attrs: &Attributes, cfg: &QualityConfig) -> Vec<FeedbackEvent> {
    let mut events = Vec::new();
    for field in &cfg.required_fields {
        if !attrs.contains_key(field) {
            events.push(FeedbackEvent::new(
                FeedbackLevel::Warning,
                "quality_missing_field",
                format!("required field {field} is missing"),
                4,
            ));
        }
    }
    for (field, expected) in &cfg.field_types {
        let Some(value) = attrs.get(field) else {
            continue;
        };
        if !expected.matches(value) {
            events.push(FeedbackEvent::new(
                FeedbackLevel::Warning,
                "quality_type_mismatch",
                format!("field {field} expected type {} but got a different type", expected.as_str()),
                4,
            ));
        }
    }
    events
}

/// PII detection, quality checks, and a feedback bus, composed into one
/// stage (spec §4.8). PII detection may fan out to a dedicated worker
/// pool; a full queue falls back to running inline rather than skipping
/// the check.
pub struct Verification {
    config: VerificationConfig,
    cardinality: BoundedMap<bool>,
    pii_pool: WorkerPool,
    metrics: Metrics,
    feedback: Option<FeedbackBus>,
}

impl Verification {
    pub fn new(config: VerificationConfig, metrics: Metrics, feedback: Option<FeedbackBus>) -> Self {
        let cardinality = BoundedMap::new(
            config.quality.cardinality_limit.max(1),
            EvictionPolicy::OldestInsert,
            Some(Duration::from_secs(300)),
        );
        let pii_pool = WorkerPool::new("pii-detect", 4, config.pii_pool_queue_cap);
        Self {
            config,
            cardinality,
            pii_pool,
            metrics,
            feedback,
        }
    }

    fn publish_all(&self, events: Vec<FeedbackEvent>) {
        if let Some(bus) = &self.feedback {
            for event in events {
                bus.publish(event);
            }
        }
    }

    fn check_cardinality(&self, attrs: &Attributes) {
        let Some(value) = attrs.get(&self.config.quality.cardinality_attribute).and_then(|v| v.as_str()) else {
            return;
        };
        if self.cardinality.contains_key(value) {
            return;
        }
        if self.cardinality.len() >= self.config.quality.cardinality_limit {
            self.publish_all(vec![FeedbackEvent::new(
                FeedbackLevel::Warning,
                "cardinality_exceeded",
                format!("{} distinct {} values exceeds limit {}", self.cardinality.len() + 1, self.config.quality.cardinality_attribute, self.config.quality.cardinality_limit),
                5,
            )]);
        }
        self.cardinality.put(value.to_owned(), true);
    }

    async fn verify_point(&self, mut point: DataPoint) -> Option<DataPoint> {
        let quality_events = quality_check(&point.attributes, &self.config.quality);
        self.publish_all(quality_events);
        self.check_cardinality(&point.attributes);

        let cfg = self.config.pii.clone();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let mut attrs_copy = point.attributes.clone();
        let submitted = self.pii_pool.submit(move || {
            let outcome = scan_and_act(&mut attrs_copy, &cfg);
            let _ = tx.send((attrs_copy, outcome.0, outcome.1));
        });

        let (attrs, outcome, events) = if submitted.is_ok() {
            match rx.await {
                Ok(result) => result,
                Err(_) => {
                    let mut attrs = point.attributes.clone();
                    let (outcome, events) = scan_and_act(&mut attrs, &self.config.pii);
                    (attrs, outcome, events)
                }
            }
        } else {
            self.metrics.incr("verification.pii_pool_fallback");
            let mut attrs = point.attributes.clone();
            let (outcome, events) = scan_and_act(&mut attrs, &self.config.pii);
            (attrs, outcome, events)
        };

        self.publish_all(events);
        point.attributes = attrs;

        match outcome {
            PointOutcome::Keep => Some(point),
            PointOutcome::Drop => None,
        }
    }
}

#[async_trait]
impl Processor for Verification {
    fn name(&self) -> &str {
        "verification"
    }

    async fn process(&self, mut batch: MetricBatch) -> Result<MetricBatch, PipelineError> {
        for scope in &mut batch.resource_scopes {
            for group in &mut scope.scope_groups {
                for metric in &mut group.metrics {
                    let points = std::mem::take(&mut metric.data_points);
                    let mut kept = Vec::with_capacity(points.len());
                    for point in points {
                        if let Some(point) = self.verify_point(point).await {
                            kept.push(point);
                        }
                    }
                    metric.data_points = kept;
                }
            }
        }
        Ok(batch)
    }
}
