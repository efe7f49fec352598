use chrono::{DateTime, Utc};
use collector_common::Metrics;
use metric_sink::{LogRecord, MetricSink};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackLevel {
    Info,
    Warning,
    Error,
}

impl FeedbackLevel {
    fn as_str(self) -> &'static str {
        match self {
            FeedbackLevel::Info => "INFO",
            FeedbackLevel::Warning => "WARNING",
            FeedbackLevel::Error => "ERROR",
        }
    }
}

/// A structured record of an observability concern — a PII hit, a quality
/// failure, a circuit event — emitted onto the internal feedback bus
/// (spec §4.8, §7).
#[derive(Debug, Clone)]
pub struct FeedbackEvent {
    pub timestamp: DateTime<Utc>,
    pub level: FeedbackLevel,
    pub category: String,
    pub message: String,
    /// 1 (lowest) through 10 (highest).
    pub severity: u8,
}

impl FeedbackEvent {
    pub fn new(level: FeedbackLevel, category: impl Into<String>, message: impl Into<String>, severity: u8) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            category: category.into(),
            message: message.into(),
            severity: severity.clamp(1, 10),
        }
    }
}

/// A bounded channel of feedback events plus the producer-side handle
/// every processor holds. A background task drains it (spec §4.8): it
/// always logs locally, and optionally re-emits each event downstream as
/// a log record on the sink.
#[derive(Clone)]
pub struct FeedbackBus {
    sender: mpsc::Sender<FeedbackEvent>,
}

impl FeedbackBus {
    /// `capacity` bounds the channel so a feedback storm cannot grow
    /// memory unboundedly; a full channel drops the event and bumps a
    /// counter rather than blocking the processor that raised it.
    pub fn new(capacity: usize, export_as_logs: bool, sink: Option<Arc<dyn MetricSink>>, metrics: Metrics) -> (Self, JoinHandle<()>) {
        let (sender, mut receiver) = mpsc::channel(capacity);
        let handle = tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                match event.level {
                    FeedbackLevel::Error => log::error!(target: "feedback", "[{}] {}: {}", event.category, event.severity, event.message),
                    FeedbackLevel::Warning => log::warn!(target: "feedback", "[{}] {}: {}", event.category, event.severity, event.message),
                    FeedbackLevel::Info => log::info!(target: "feedback", "[{}] {}: {}", event.category, event.severity, event.message),
                }
                metrics.incr_with_tag("feedback.events", "level", event.level.as_str());
                if export_as_logs {
                    if let Some(sink) = &sink {
                        let record = LogRecord {
                            timestamp: event.timestamp,
                            level: event.level.as_str(),
                            category: event.category.clone(),
                            message: event.message.clone(),
                            severity: event.severity,
                        };
                        if let Err(e) = sink.consume_log_record(record).await {
                            log::warn!("failed to export feedback event as sink log record: {e}");
                        }
                    }
                }
            }
        });
        (Self { sender }, handle)
    }

    /// Publishes an event, dropping it with a logged warning if the
    /// channel is full rather than blocking the caller (spec §4.8's
    /// "records are not dropped by default" applies to batch records, not
    /// feedback events themselves, which are inherently best-effort).
    pub fn publish(&self, event: FeedbackEvent) {
        if let Err(e) = self.sender.try_send(event) {
            log::warn!("feedback channel full, dropping event: {e}");
        }
    }
}
