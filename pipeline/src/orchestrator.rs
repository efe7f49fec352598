use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metric_sink::MetricSink;
use pipeline_types::MetricBatch;
use pool_manager::ConnectionPoolManager;
use tokio::task::JoinHandle;

use crate::error::PipelineError;
use crate::feedback::FeedbackBus;
use crate::processors::Processor;

/// Health of a single named component, matching the `/health` shape from
/// spec §6: `{healthy: bool, metrics: map}`.
#[derive(Debug, Clone)]
pub struct ComponentHealth {
    pub healthy: bool,
    pub metrics: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct HealthReport {
    pub healthy: bool,
    pub components: HashMap<String, ComponentHealth>,
}

/// Composes the processor chain (in pipeline order: `CircuitBreaker →
/// AdaptiveSampler → PlanExtractor → QueryCorrelator → Verification →
/// CostControl → ErrorMonitor`) and the sink, plus the connection pool
/// manager it reports health for (spec §2, §4.10).
///
/// Receivers are an external collaborator (spec §6) — this type starts
/// after they would be started and stops before they would be stopped;
/// the binary crate owns the receiver lifecycle and calls
/// [`Pipeline::process_batch`] once per scraped/pushed batch.
pub struct Pipeline {
    processors: Vec<Arc<dyn Processor>>,
    sink: Arc<dyn MetricSink>,
    pool_manager: Option<Arc<ConnectionPoolManager>>,
    feedback_handle: Option<JoinHandle<()>>,
    shutdown_grace: Duration,
    started: AtomicBool,
    shut_down: AtomicBool,
    background: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

pub struct PipelineBuilder {
    processors: Vec<Arc<dyn Processor>>,
    sink: Option<Arc<dyn MetricSink>>,
    pool_manager: Option<Arc<ConnectionPoolManager>>,
    feedback_handle: Option<JoinHandle<()>>,
    shutdown_grace: Duration,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self {
            processors: Vec::new(),
            sink: None,
            pool_manager: None,
            feedback_handle: None,
            shutdown_grace: Duration::from_secs(10),
        }
    }

    pub fn processor(mut self, processor: Arc<dyn Processor>) -> Self {
        self.processors.push(processor);
        self
    }

    /// Appends a whole already-ordered chain at once, for callers (the
    /// binary crate) that build the stage list from configuration rather
    /// than naming each stage at the call site.
    pub fn processors(mut self, processors: impl IntoIterator<Item = Arc<dyn Processor>>) -> Self {
        self.processors.extend(processors);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn MetricSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn pool_manager(mut self, pool_manager: Arc<ConnectionPoolManager>) -> Self {
        self.pool_manager = Some(pool_manager);
        self
    }

    pub fn feedback_bus(mut self, bus_handle: JoinHandle<()>) -> Self {
        self.feedback_handle = Some(bus_handle);
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn build(self) -> Result<Pipeline, PipelineError> {
        let sink = self.sink.ok_or_else(|| PipelineError::fatal("pipeline requires a sink"))?;
        if self.processors.is_empty() {
            log::warn!("pipeline built with zero processors; batches pass through unmodified");
        }
        Ok(Pipeline {
            processors: self.processors,
            sink,
            pool_manager: self.pool_manager,
            feedback_handle: self.feedback_handle,
            shutdown_grace: self.shutdown_grace,
            started: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            background: parking_lot::Mutex::new(Vec::new()),
        })
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    /// Starts background loops owned at this layer: the pool manager's
    /// health and metrics tickers (spec §4.10's start order puts the pool
    /// manager first). Idempotent.
    pub fn start(&self) -> Result<(), PipelineError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(pool_manager) = &self.pool_manager {
            let mut background = self.background.lock();
            background.push(pool_manager.spawn_health_check_loop());
            background.push(pool_manager.spawn_metrics_loop());
        }
        Ok(())
    }

    /// Runs one batch through every processor in order, then the sink.
    /// A processor error never aborts the batch by default (spec §7); it
    /// is logged and the batch continues with whatever survived.
    pub async fn process_batch(&self, mut batch: MetricBatch) -> Result<(), PipelineError> {
        for processor in &self.processors {
            batch = match processor.process(batch).await {
                Ok(next) => next,
                Err(e) => {
                    log::warn!("processor {} failed: {e}", processor.name());
                    return Err(e);
                }
            };
        }
        self.sink
            .consume(batch)
            .await
            .map_err(|e| PipelineError::transient(format!("sink rejected batch: {e}")))
    }

    /// Reverse of start order: sink has nothing to stop explicitly (the
    /// `MetricSink` trait has no shutdown hook — it is expected to flush
    /// on drop), processors hold no background loops of their own besides
    /// worker pools (which stop when dropped), and the pool manager is
    /// shut down last among infrastructure this type owns. Waits up to
    /// `shutdown_grace` for in-flight work, then proceeds regardless.
    /// Idempotent.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = tokio::time::timeout(self.shutdown_grace, async {
            if let Some(pool_manager) = &self.pool_manager {
                pool_manager.shutdown();
            }
        })
        .await;
        for handle in self.background.lock().drain(..) {
            handle.abort();
        }
        if let Some(handle) = &self.feedback_handle {
            handle.abort();
        }
    }

    /// Per-component health (spec §6): one entry per processor (reported
    /// healthy — the `Processor` trait carries no deep health signal by
    /// design, since processors hold no I/O-facing state) plus one entry
    /// per connection pool, which does carry a meaningful healthy/error
    /// count.
    pub fn health(&self) -> HealthReport {
        let mut components = HashMap::new();
        let mut healthy = true;

        for processor in &self.processors {
            components.insert(
                processor.name().to_owned(),
                ComponentHealth {
                    healthy: true,
                    metrics: HashMap::new(),
                },
            );
        }

        if let Some(pool_manager) = &self.pool_manager {
            for name in pool_manager.pool_names() {
                if let Some(state) = pool_manager.pool_state(&name) {
                    healthy = healthy && state.healthy;
                    let mut metrics = HashMap::new();
                    metrics.insert("in_use".to_owned(), state.in_use.to_string());
                    metrics.insert("idle".to_owned(), state.idle.to_string());
                    metrics.insert("error_count".to_owned(), state.error_count.to_string());
                    components.insert(format!("pool.{name}"), ComponentHealth { healthy: state.healthy, metrics });
                }
            }
        }

        HealthReport { healthy, components }
    }

    /// Structural snapshot only: pipeline stage names and pool names.
    /// `cadence`'s `StatsdClient` is write-only (it pushes to a UDP sink),
    /// so actual counter/gauge values are not readable back here — they
    /// live in whatever scrapes the statsd stream this process emits.
    pub fn metrics_snapshot(&self) -> HashMap<String, String> {
        let mut snapshot = HashMap::new();
        snapshot.insert(
            "pipeline.stages".to_owned(),
            self.processors.iter().map(|p| p.name()).collect::<Vec<_>>().join(","),
        );
        if let Some(pool_manager) = &self.pool_manager {
            snapshot.insert("pipeline.pools".to_owned(), pool_manager.pool_names().join(","));
        }
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use metric_sink::NoopSink;

    struct Passthrough;

    #[async_trait]
    impl Processor for Passthrough {
        fn name(&self) -> &str {
            "passthrough"
        }

        async fn process(&self, batch: MetricBatch) -> Result<MetricBatch, PipelineError> {
            Ok(batch)
        }
    }

    #[tokio::test]
    async fn processes_a_batch_through_to_the_sink() {
        let sink = Arc::new(NoopSink::new());
        let pipeline = Pipeline::builder()
            .processor(Arc::new(Passthrough))
            .sink(sink.clone())
            .build()
            .unwrap();
        pipeline.start().unwrap();
        pipeline.process_batch(MetricBatch::new()).await.unwrap();
        assert_eq!(sink.consumed_batches(), 1);
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let pipeline = Pipeline::builder().sink(Arc::new(NoopSink::new())).build().unwrap();
        pipeline.start().unwrap();
        pipeline.shutdown().await;
        pipeline.shutdown().await;
    }

    #[test]
    fn health_reports_every_processor() {
        let pipeline = Pipeline::builder()
            .processor(Arc::new(Passthrough))
            .sink(Arc::new(NoopSink::new()))
            .build()
            .unwrap();
        let report = pipeline.health();
        assert!(report.components.contains_key("passthrough"));
        assert!(report.healthy);
    }
}
