//! Per-receiver tickers (spec §6's "optional `Scrape(ctx) → (batch, error)`
//! for pull-style receivers driven by the core ticker") and the ASH
//! sampler's own 1s-cadence ticker (spec §4.4). The actual database
//! scrape that would fill a batch with real session/query data is an
//! external collaborator this crate does not implement (spec §1's
//! Non-goals); each receiver ticker here calls through to the pipeline
//! with whatever its configured `Scrape` seam produces, which today is
//! an empty batch standing in for that adapter.

use std::sync::Arc;
use std::time::Duration;

use ash::AshSampler;
use collector_settings::Settings;
use pipeline::Pipeline;
use pipeline_types::MetricBatch;
use tokio::task::JoinHandle;

const ASH_TICK_INTERVAL: Duration = Duration::from_secs(1);

pub fn spawn_tickers(settings: &Settings, ash_sampler: Arc<AshSampler>, pipeline: Arc<Pipeline>) -> Vec<JoinHandle<()>> {
    let mut handles = vec![spawn_ash_ticker(ash_sampler)];
    for receiver in settings.receivers.clone() {
        handles.push(spawn_receiver_ticker(receiver, pipeline.clone()));
    }
    handles
}

fn spawn_ash_ticker(ash_sampler: Arc<AshSampler>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(ASH_TICK_INTERVAL);
        loop {
            interval.tick().await;
            let outcome = ash_sampler.tick().await;
            log::trace!("ash tick: sampled {}/{} at rate {:.3}", outcome.sampled, outcome.candidates, outcome.rate);
        }
    })
}

fn spawn_receiver_ticker(receiver: collector_settings::ReceiverSettings, pipeline: Arc<Pipeline>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(receiver.collection_interval_secs.max(1)));
        loop {
            interval.tick().await;
            // Scrape() is the external-collaborator seam (spec §6); no
            // driver is wired in here, so each cycle hands the pipeline
            // an empty batch rather than skipping it outright.
            if let Err(e) = pipeline.process_batch(MetricBatch::new()).await {
                log::warn!("receiver {} batch rejected: {e}", receiver.name);
            }
        }
    })
}
