use collector_common::{ErrorKind, ReportableError};
use thiserror::Error;

/// A processor's error, classified into one of the five taxonomy families
/// (spec §7). Pipeline processors never panic or unwind across stages;
/// every fallible operation returns this instead.
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct PipelineError {
    kind: ErrorKind,
    message: String,
    metric_label: Option<String>,
}

impl PipelineError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            metric_label: None,
        }
    }

    pub fn with_metric_label(mut self, label: impl Into<String>) -> Self {
        self.metric_label = Some(label.into());
        self
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn data_quality(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::DataQuality, message)
    }

    pub fn resource(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Resource, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, message)
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Upstream, message)
    }
}

impl ReportableError for PipelineError {
    fn kind(&self) -> ErrorKind {
        self.kind
    }

    fn metric_label(&self) -> Option<String> {
        self.metric_label.clone()
    }
}
