//! The pipeline's wire-independent data model (spec §3): a metric batch is
//! an ordered tree of resource scopes, scope groups, metrics, and data
//! points. Attributes are a typed, copy-on-write container rather than a
//! loosely-typed dictionary (spec §9's re-architecture of "dynamic
//! attribute maps") — cloning a `MetricBatch` across a worker-pool fan-out
//! is cheap until a stage actually mutates an attribute map it touched.

use std::sync::Arc;

use collector_common::{MAX_ATTRIBUTE_VALUE_BYTES, MAX_METRIC_NAME_BYTES};
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

static METRIC_NAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_.]*$").expect("metric name pattern is valid"));

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("metric name {0:?} does not match [A-Za-z_][A-Za-z0-9_.]* or exceeds {MAX_METRIC_NAME_BYTES} bytes")]
    InvalidMetricName(String),
    #[error("attribute {key:?} value exceeds {MAX_ATTRIBUTE_VALUE_BYTES} bytes")]
    AttributeValueTooLong { key: String },
    #[error("histogram bucket boundaries must be strictly increasing")]
    NonMonotonicBuckets,
}

/// A single attribute value. `String` is `Arc<str>` so cloning an
/// attribute map never re-allocates string contents.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    String(Arc<str>),
    Int(i64),
    Double(f64),
    Bool(bool),
}

impl AttributeValue {
    pub fn string(s: impl Into<Arc<str>>) -> Self {
        AttributeValue::String(s.into())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            AttributeValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            AttributeValue::Double(v) => Some(*v),
            _ => None,
        }
    }

    fn byte_len(&self) -> usize {
        match self {
            AttributeValue::String(s) => s.len(),
            _ => 0,
        }
    }
}

/// A typed, copy-on-write map of attributes. `Arc::make_mut` clones the
/// backing `IndexMap` only the first time a shared `Attributes` is
/// mutated; every reader sharing the original `Arc` is unaffected.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Attributes(Arc<IndexMap<String, AttributeValue>>);

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&AttributeValue> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Inserts or replaces `key`. Rejects values over
    /// `MAX_ATTRIBUTE_VALUE_BYTES` rather than silently truncating them.
    pub fn insert(&mut self, key: impl Into<String>, value: AttributeValue) -> Result<(), ValidationError> {
        let key = key.into();
        if value.byte_len() > MAX_ATTRIBUTE_VALUE_BYTES {
            return Err(ValidationError::AttributeValueTooLong { key });
        }
        Arc::make_mut(&mut self.0).insert(key, value);
        Ok(())
    }

    pub fn remove(&mut self, key: &str) -> Option<AttributeValue> {
        Arc::make_mut(&mut self.0).shift_remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &AttributeValue)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, AttributeValue)> for Attributes {
    fn from_iter<I: IntoIterator<Item = (String, AttributeValue)>>(iter: I) -> Self {
        Attributes(Arc::new(iter.into_iter().collect()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Temporality {
    Cumulative,
    Delta,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MetricKind {
    Gauge,
    Sum { monotonic: bool, temporality: Temporality },
    Histogram { bucket_boundaries: Vec<f64> },
}

impl MetricKind {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let MetricKind::Histogram { bucket_boundaries } = self {
            if bucket_boundaries.windows(2).any(|w| w[0] >= w[1]) {
                return Err(ValidationError::NonMonotonicBuckets);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DataPointValue {
    Int(i64),
    Double(f64),
    /// Per-bucket counts, parallel to the metric's `bucket_boundaries`
    /// plus one overflow bucket.
    HistogramCounts(Vec<u64>),
}

#[derive(Debug, Clone)]
pub struct DataPoint {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub value: DataPointValue,
    pub attributes: Attributes,
}

#[derive(Debug, Clone)]
pub struct Metric {
    pub name: String,
    pub description: String,
    pub unit: String,
    pub kind: MetricKind,
    pub data_points: Vec<DataPoint>,
}

impl Metric {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.is_empty()
            || self.name.len() > MAX_METRIC_NAME_BYTES
            || !METRIC_NAME_PATTERN.is_match(&self.name)
        {
            return Err(ValidationError::InvalidMetricName(self.name.clone()));
        }
        self.kind.validate()
    }
}

#[derive(Debug, Clone)]
pub struct ScopeGroup {
    pub scope_name: String,
    pub metrics: Vec<Metric>,
}

#[derive(Debug, Clone, Default)]
pub struct ResourceScope {
    pub resource_attributes: Attributes,
    pub scope_groups: Vec<ScopeGroup>,
}

/// The pipeline's unit of flow between stages (spec §3): a list of
/// resource scopes, each with a list of scope groups, each with a list of
/// metrics and their data points.
#[derive(Debug, Clone, Default)]
pub struct MetricBatch {
    pub resource_scopes: Vec<ResourceScope>,
}

impl MetricBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        for scope in &self.resource_scopes {
            for group in &scope.scope_groups {
                for metric in &group.metrics {
                    metric.validate()?;
                }
            }
        }
        Ok(())
    }

    pub fn data_point_count(&self) -> usize {
        self.resource_scopes
            .iter()
            .flat_map(|s| &s.scope_groups)
            .flat_map(|g| &g.metrics)
            .map(|m| m.data_points.len())
            .sum()
    }

    /// Visits every `(metric name, data point)` pair in the batch,
    /// mutably. Used by processors that attach correlation/PII attributes
    /// without needing to rebuild the tree.
    pub fn for_each_data_point_mut(&mut self, mut f: impl FnMut(&str, &mut DataPoint)) {
        for scope in &mut self.resource_scopes {
            for group in &mut scope.scope_groups {
                for metric in &mut group.metrics {
                    for point in &mut metric.data_points {
                        f(&metric.name, point);
                    }
                }
            }
        }
    }

    pub fn for_each_data_point(&self, mut f: impl FnMut(&str, &DataPoint)) {
        for scope in &self.resource_scopes {
            for group in &scope.scope_groups {
                for metric in &group.metrics {
                    for point in &metric.data_points {
                        f(&metric.name, point);
                    }
                }
            }
        }
    }

    /// Drops data points for which `keep` returns `false`, preserving the
    /// invariant that output record count never exceeds input (spec §8
    /// invariant 2) — this only ever shrinks the batch.
    pub fn retain_data_points(&mut self, mut keep: impl FnMut(&str, &DataPoint) -> bool) {
        for scope in &mut self.resource_scopes {
            for group in &mut scope.scope_groups {
                for metric in &mut group.metrics {
                    let name = metric.name.clone();
                    metric.data_points.retain(|p| keep(&name, p));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_metric_names() {
        let m = Metric {
            name: "1bad-name".into(),
            description: String::new(),
            unit: String::new(),
            kind: MetricKind::Gauge,
            data_points: vec![],
        };
        assert_eq!(
            m.validate(),
            Err(ValidationError::InvalidMetricName("1bad-name".into()))
        );
    }

    #[test]
    fn accepts_conventional_metric_names() {
        let m = Metric {
            name: "db.query.total_time".into(),
            description: String::new(),
            unit: "ms".into(),
            kind: MetricKind::Gauge,
            data_points: vec![],
        };
        assert!(m.validate().is_ok());
    }

    #[test]
    fn rejects_non_monotonic_histogram_buckets() {
        let kind = MetricKind::Histogram {
            bucket_boundaries: vec![1.0, 5.0, 3.0],
        };
        assert_eq!(kind.validate(), Err(ValidationError::NonMonotonicBuckets));
    }

    #[test]
    fn attributes_are_copy_on_write() {
        let mut a = Attributes::new();
        a.insert("x", AttributeValue::Int(1)).unwrap();
        let b = a.clone();
        a.insert("x", AttributeValue::Int(2)).unwrap();
        assert_eq!(b.get("x").and_then(|v| v.as_int()), Some(1));
        assert_eq!(a.get("x").and_then(|v| v.as_int()), Some(2));
    }

    #[test]
    fn oversized_attribute_value_is_rejected() {
        let mut a = Attributes::new();
        let huge = "x".repeat(MAX_ATTRIBUTE_VALUE_BYTES + 1);
        assert!(matches!(
            a.insert("big", AttributeValue::string(huge)),
            Err(ValidationError::AttributeValueTooLong { .. })
        ));
    }

    #[test]
    fn retain_data_points_only_shrinks() {
        let mut batch = MetricBatch::new();
        batch.resource_scopes.push(ResourceScope {
            resource_attributes: Attributes::new(),
            scope_groups: vec![ScopeGroup {
                scope_name: "s".into(),
                metrics: vec![Metric {
                    name: "m".into(),
                    description: String::new(),
                    unit: String::new(),
                    kind: MetricKind::Gauge,
                    data_points: vec![
                        DataPoint {
                            timestamp: chrono::Utc::now(),
                            value: DataPointValue::Int(1),
                            attributes: Attributes::new(),
                        },
                        DataPoint {
                            timestamp: chrono::Utc::now(),
                            value: DataPointValue::Int(2),
                            attributes: Attributes::new(),
                        },
                    ],
                }],
            }],
        });
        assert_eq!(batch.data_point_count(), 2);
        batch.retain_data_points(|_, p| matches!(p.value, DataPointValue::Int(1)));
        assert_eq!(batch.data_point_count(), 1);
    }
}
