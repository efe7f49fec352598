//! The downstream consumer of processed batches (spec §6): `consume` for
//! metric batches, `consume_log_record` for feedback events exported as
//! logs (spec §4.8/§7). The sink owns retry, batching-for-transport, and
//! wire format; the core only sees an opaque error it feeds to the export
//! failure counter and, on persistence, the circuit breaker.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use pipeline_types::MetricBatch;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink transport error: {0}")]
    Transport(String),
    #[error("sink rejected batch: {0}")]
    Rejected(String),
}

/// A single feedback event re-emitted downstream as a log record (spec
/// §4.8/§7), rather than as a metric data point.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub level: &'static str,
    pub category: String,
    pub message: String,
    pub severity: u8,
}

#[async_trait]
pub trait MetricSink: Send + Sync {
    async fn consume(&self, batch: MetricBatch) -> Result<(), SinkError>;

    /// Emits one log record on the sink. Default logs it locally at info
    /// level; sinks with a real downstream transport should override this
    /// to actually ship the record rather than just logging it.
    async fn consume_log_record(&self, record: LogRecord) -> Result<(), SinkError> {
        log::info!(target: "feedback.sink", "[{}] {}: {}", record.category, record.severity, record.message);
        Ok(())
    }
}

/// Discards every batch. Used by `--dry-run` and unit tests that only
/// care about upstream processing.
#[derive(Debug, Default)]
pub struct NoopSink {
    consumed_batches: AtomicU64,
}

impl NoopSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn consumed_batches(&self) -> u64 {
        self.consumed_batches.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl MetricSink for NoopSink {
    async fn consume(&self, batch: MetricBatch) -> Result<(), SinkError> {
        self.consumed_batches.fetch_add(1, Ordering::Relaxed);
        log::trace!("noop sink discarding batch with {} data points", batch.data_point_count());
        Ok(())
    }

    async fn consume_log_record(&self, record: LogRecord) -> Result<(), SinkError> {
        log::trace!("noop sink discarding log record: {}", record.message);
        Ok(())
    }
}

/// Logs a one-line summary of each batch at info level rather than
/// discarding it silently; useful for local development and the
/// `--dry-run` "planned wiring" trace.
#[derive(Debug, Default)]
pub struct LoggingSink;

#[async_trait]
impl MetricSink for LoggingSink {
    async fn consume(&self, batch: MetricBatch) -> Result<(), SinkError> {
        log::info!(
            "batch: {} resource scopes, {} data points",
            batch.resource_scopes.len(),
            batch.data_point_count()
        );
        Ok(())
    }

    async fn consume_log_record(&self, record: LogRecord) -> Result<(), SinkError> {
        log::info!(
            "log record: ts={} level={} category={} severity={} message={}",
            record.timestamp.to_rfc3339(),
            record.level,
            record.category,
            record.severity,
            record.message
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_types::{Attributes, DataPoint, DataPointValue, Metric, MetricKind, ResourceScope, ScopeGroup};

    fn sample_batch() -> MetricBatch {
        MetricBatch {
            resource_scopes: vec![ResourceScope {
                resource_attributes: Attributes::new(),
                scope_groups: vec![ScopeGroup {
                    scope_name: "test".into(),
                    metrics: vec![Metric {
                        name: "db.query.total_time".into(),
                        description: String::new(),
                        unit: "ms".into(),
                        kind: MetricKind::Gauge,
                        data_points: vec![DataPoint {
                            timestamp: chrono::Utc::now(),
                            value: DataPointValue::Int(10),
                            attributes: Attributes::new(),
                        }],
                    }],
                }],
            }],
        }
    }

    #[tokio::test]
    async fn noop_sink_counts_consumed_batches() {
        let sink = NoopSink::new();
        sink.consume(sample_batch()).await.unwrap();
        sink.consume(sample_batch()).await.unwrap();
        assert_eq!(sink.consumed_batches(), 2);
    }

    #[tokio::test]
    async fn logging_sink_accepts_batches() {
        let sink = LoggingSink;
        assert!(sink.consume(sample_batch()).await.is_ok());
    }

    #[tokio::test]
    async fn logging_sink_accepts_log_records() {
        let sink = LoggingSink;
        let record = LogRecord {
            timestamp: chrono::Utc::now(),
            level: "WARNING",
            category: "pii_detected".into(),
            message: "found ssn".into(),
            severity: 8,
        };
        assert!(sink.consume_log_record(record).await.is_ok());
    }
}
