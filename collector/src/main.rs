//! The database-intelligence collector: ties the ASH sampler, the
//! pool manager, and the processor pipeline together behind the
//! observability HTTP surface (spec §4.10, §6).
#[macro_use]
extern crate slog_scope;

use std::error::Error;
use std::process::ExitCode;
use std::sync::Arc;

use ash::{AshSampler, FeatureDetector};
use async_trait::async_trait;
use collector_common::{init_logging, metrics_from_opts, reset_logging, Metrics};
use collector_settings::Settings;
use docopt::Docopt;
use metric_sink::{LoggingSink, MetricSink, NoopSink};
use pipeline::processors::adaptive_sampler::AdaptiveSampler;
use pipeline::processors::circuit_breaker::CircuitBreakerProcessor;
use pipeline::processors::cost_control::CostControl;
use pipeline::processors::error_monitor::ErrorMonitor;
use pipeline::processors::plan_extractor::PlanExtractor;
use pipeline::processors::query_correlator::QueryCorrelator;
use pipeline::processors::verification::Verification;
use pipeline::{FeedbackBus, Pipeline, Processor};
use pool_manager::{AlwaysHealthyProbe, ConnectionPoolManager};

mod receiver;

const USAGE: &str = "
The database-intelligence collector.

Usage:
    collector [options]
    collector --validate [options]
    collector --version
    collector (-h | --help)

Options:
    -h, --help          Show this message.
    --version           Print the collector's version and exit.
    --config=FILE       Configuration file path.
    --validate          Load and validate configuration, then exit.
    --dry-run           Wire the pipeline with no-op receivers/sinks/pool
                        probes and log what would run, then exit.
";

#[derive(Debug, serde::Deserialize)]
struct Args {
    flag_config: Option<String>,
    flag_validate: bool,
    flag_version: bool,
    flag_dry_run: bool,
}

/// A `SessionSource`/`PoolProbe` pair with no real database behind it.
/// Concrete driver adapters for Postgres/MySQL/etc are an external
/// collaborator this crate does not implement (spec §1's Non-goals);
/// this stands in for one until a real receiver is wired in, and is what
/// `--dry-run` always uses regardless of the configured receivers.
struct NoReceiverConfigured;

#[async_trait]
impl ash::SessionSource for NoReceiverConfigured {
    async fn sample(&self) -> Result<Vec<ash::RawSession>, String> {
        Ok(Vec::new())
    }
}

#[async_trait]
impl ash::CapabilityProbe for NoReceiverConfigured {
    async fn probe(&self) -> Result<ash::Capabilities, String> {
        Ok(ash::Capabilities::default())
    }
}

fn build_processors(settings: &Settings, metrics: &Metrics, feedback: &FeedbackBus) -> Result<Vec<Arc<dyn Processor>>, Box<dyn Error>> {
    let circuit_breaker = Arc::new(CircuitBreakerProcessor::new(settings.pipeline.circuit_breaker.to_config(), metrics.clone()));

    let cost_control = Arc::new(CostControl::new(settings.pipeline.cost_control.to_config(), metrics.clone(), Some(feedback.clone())));
    let aggressive_handle = cost_control.aggressive_handle();

    let adaptive_sampler = Arc::new(
        AdaptiveSampler::new(Vec::new(), settings.pipeline.adaptive_sampler.to_config(), metrics.clone(), Some(feedback.clone()))
            .with_aggressive_handle(aggressive_handle.clone()),
    );
    let plan_extractor = Arc::new(PlanExtractor::new(settings.pipeline.plan_extractor.to_config(), metrics.clone(), Some(feedback.clone())));
    let query_correlator = Arc::new(QueryCorrelator::new(settings.pipeline.query_correlator.to_config(), metrics.clone()));
    let verification = Arc::new(Verification::new(settings.pipeline.verification.to_config(), metrics.clone(), Some(feedback.clone())));
    let error_monitor = Arc::new(ErrorMonitor::new(settings.pipeline.error_monitor.to_config(), metrics.clone(), Some(feedback.clone())));

    let by_name: std::collections::HashMap<&str, Arc<dyn Processor>> = [
        ("circuit_breaker", circuit_breaker as Arc<dyn Processor>),
        ("adaptive_sampler", adaptive_sampler as Arc<dyn Processor>),
        ("plan_extractor", plan_extractor as Arc<dyn Processor>),
        ("query_correlator", query_correlator as Arc<dyn Processor>),
        ("verification", verification as Arc<dyn Processor>),
        ("cost_control", cost_control as Arc<dyn Processor>),
        ("error_monitor", error_monitor as Arc<dyn Processor>),
    ]
    .into_iter()
    .collect();

    let mut processors = Vec::with_capacity(settings.pipeline.stages.len());
    for stage in &settings.pipeline.stages {
        let processor = by_name
            .get(stage.as_str())
            .ok_or_else(|| format!("unknown pipeline stage in configuration: {stage}"))?;
        processors.push(processor.clone());
    }
    Ok(processors)
}

#[actix_web::main]
async fn main() -> Result<ExitCode, Box<dyn Error>> {
    let args: Args = Docopt::new(USAGE).and_then(|d| d.deserialize()).unwrap_or_else(|e| e.exit());

    if args.flag_version {
        println!("collector {}", env!("CARGO_PKG_VERSION"));
        return Ok(ExitCode::SUCCESS);
    }

    let settings = match Settings::with_env_and_config_file(args.flag_config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return Ok(ExitCode::from(2));
        }
    };

    init_logging(!settings.human_logs).expect("logging failed to initialize");
    debug!("starting up: {}", settings.banner());

    if let Err(e) = settings.validate() {
        error!("configuration failed validation: {}", e);
        reset_logging();
        return Ok(ExitCode::from(2));
    }

    if args.flag_validate {
        info!("configuration is valid");
        reset_logging();
        return Ok(ExitCode::SUCCESS);
    }

    let statsd_client = metrics_from_opts("collector", settings.statsd_host.as_deref(), settings.statsd_port)?;
    let metrics = Metrics::from(&statsd_client);

    let sink: Arc<dyn MetricSink> = match (args.flag_dry_run, settings.sink.kind.as_str()) {
        (true, _) | (_, "noop") => Arc::new(NoopSink::new()),
        _ => Arc::new(LoggingSink),
    };

    let (feedback_bus, feedback_handle) = FeedbackBus::new(
        settings.pipeline.feedback_channel_capacity,
        settings.pipeline.feedback_export_as_logs,
        Some(sink.clone()),
        metrics.clone(),
    );

    let processors = build_processors(&settings, &metrics, &feedback_bus)?;

    let pool_manager = Arc::new(ConnectionPoolManager::new(
        settings.pool_manager.to_config(),
        metrics.clone(),
        Arc::new(AlwaysHealthyProbe),
    ));

    let pipeline = Arc::new(
        Pipeline::builder()
            .sink(sink)
            .pool_manager(pool_manager.clone())
            .feedback_bus(feedback_handle)
            .shutdown_grace(std::time::Duration::from_secs(settings.pipeline.shutdown_grace_secs))
            .processors(processors.clone())
            .build()?,
    );
    pipeline.start()?;

    let feature_detector = FeatureDetector::new(Arc::new(NoReceiverConfigured), std::time::Duration::from_secs(300));
    let ash_sampler = Arc::new(AshSampler::new(Arc::new(NoReceiverConfigured), settings.ash.to_config(), feature_detector, metrics.clone()));

    if args.flag_dry_run {
        info!("dry run: {} pipeline stage(s), {} configured receiver(s), sink={}", processors.len(), settings.receivers.len(), settings.sink.kind);
        pipeline.shutdown().await;
        reset_logging();
        return Ok(ExitCode::SUCCESS);
    }

    let receiver_handles = receiver::spawn_tickers(&settings, ash_sampler.clone(), pipeline.clone());

    let http = collector_server::Server::start(&settings.host, settings.port, pipeline.clone())?;
    let http_handle = http.handle();
    info!("collector running on {}", settings.banner());

    tokio::select! {
        result = http => { result?; }
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
            http_handle.stop(true).await;
        }
    }

    for handle in receiver_handles {
        handle.abort();
    }
    pipeline.shutdown().await;
    info!("collector closing");
    reset_logging();
    Ok(ExitCode::SUCCESS)
}
