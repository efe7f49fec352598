//! The stateful processor pipeline: circuit breaking, adaptive sampling,
//! plan-regression detection, query/table/database correlation, PII and
//! quality verification, cost control, and downstream-error monitoring,
//! composed by [`orchestrator::Pipeline`] (spec §4.5-§4.10).

pub mod error;
pub mod feedback;
pub mod orchestrator;
pub mod processors;

pub use error::PipelineError;
pub use feedback::{FeedbackBus, FeedbackEvent, FeedbackLevel};
pub use orchestrator::{ComponentHealth, HealthReport, Pipeline, PipelineBuilder};
pub use processors::Processor;
