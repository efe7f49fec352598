pub mod adaptive_sampler;
pub mod circuit_breaker;
pub mod cost_control;
pub mod error_monitor;
pub mod plan_extractor;
pub mod query_correlator;
pub mod verification;

use async_trait::async_trait;
use pipeline_types::MetricBatch;

use crate::error::PipelineError;

/// A single stage of the processor pipeline (spec §4.5-§4.9). Stages are
/// composed synchronously by the orchestrator: a batch moves from stage
/// to stage by method call, not by channel, and concurrency inside a
/// stage (if any) is explicit via its own worker pool.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Stable name used in logs, metrics tags, and `/health`.
    fn name(&self) -> &str;

    /// Whether this stage mutates attributes on data points it does not
    /// own exclusively — declared up front so the orchestrator knows
    /// which stages may safely run with shared, copy-on-write batches
    /// and which require an owned one (spec §9).
    fn mutates_data(&self) -> bool {
        true
    }

    async fn process(&self, batch: MetricBatch) -> Result<MetricBatch, PipelineError>;
}
