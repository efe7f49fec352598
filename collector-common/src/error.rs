use std::fmt;

use backtrace::Backtrace;
use thiserror::Error;

/// The five error families from the error-handling design (spec §7). Every
/// processor and shared-infrastructure error ultimately classifies itself
/// as one of these so the pipeline can decide whether to skip a tick,
/// attribute a failure to a record, or exit the process.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Ping timeout, pool wait timeout, sink network error: retried at the
    /// appropriate scope, never fatal.
    #[error("transient remote error")]
    Transient,
    /// Missing required field, over-length attribute, PII match: recorded
    /// as a feedback event, never fatal.
    #[error("data quality error")]
    DataQuality,
    /// Bounded map full, worker pool queue full, global connection ceiling:
    /// evict/drop with a counter increment.
    #[error("resource exhaustion error")]
    Resource,
    /// Invalid configuration at start: fatal, exits the process.
    #[error("fatal configuration error")]
    Fatal,
    /// Receiver scrape error: logged, cycle skipped, drives the circuit
    /// breaker on repetition.
    #[error("upstream receiver error")]
    Upstream,
}

/// Types that implement this trait can represent internal (programmer or
/// resource-exhaustion) errors raised on behalf of a caller, e.g. when a
/// worker pool task is canceled.
pub trait InternalError {
    fn internal_error(message: String) -> Self;
}

/// Types that implement this trait can describe themselves for metrics and
/// alerting without the caller needing to match on their concrete kind.
pub trait ReportableError: fmt::Debug + fmt::Display {
    /// Which `ErrorKind` family this error belongs to.
    fn kind(&self) -> ErrorKind;

    /// A short label suitable for a metrics tag, e.g. `"pool.ping_timeout"`.
    fn metric_label(&self) -> Option<String> {
        None
    }

    /// Whether this error is severe enough to emit an ERROR-level feedback
    /// event rather than WARNING.
    fn is_alertable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Fatal | ErrorKind::Resource)
    }

    fn backtrace(&self) -> Option<&Backtrace> {
        None
    }
}
