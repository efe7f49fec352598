//! Infrastructure shared by every crate in the collector: the error
//! taxonomy, the metrics client, and process-wide logging setup.

#[macro_use]
extern crate slog_scope;

mod error;
mod logging;
mod metrics;

pub use error::{ErrorKind, InternalError, ReportableError};
pub use logging::{init_logging, reset_logging};
pub use metrics::{metrics_from_opts, MetricError, Metrics};

/// Max length, in bytes, of a data point attribute value (spec §3).
pub const MAX_ATTRIBUTE_VALUE_BYTES: usize = 4095;
/// Max length, in bytes, of a metric name (spec §3).
pub const MAX_METRIC_NAME_BYTES: usize = 255;

#[macro_export]
macro_rules! from_error {
    ($from:ty, $to:ty, $to_kind:expr) => {
        impl From<$from> for $to {
            fn from(inner: $from) -> $to {
                $to_kind(inner).into()
            }
        }
    };
}

#[macro_export]
macro_rules! impl_fmt_display {
    ($error:ty, $kind:ty) => {
        impl std::fmt::Display for $error {
            fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                std::fmt::Display::fmt(&self.kind, formatter)
            }
        }
    };
}
