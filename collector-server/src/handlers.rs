use actix_web::{web, HttpResponse};
use serde_json::{json, Value};

use crate::state::ServerState;

/// `GET /health` (spec §6): overall health plus per-component health and
/// counters. Thin by design — delegates entirely to
/// [`pipeline::Pipeline::health`].
pub async fn health(state: web::Data<ServerState>) -> HttpResponse {
    let report = state.pipeline.health();
    let components: serde_json::Map<String, Value> = report
        .components
        .iter()
        .map(|(name, component)| {
            (
                name.clone(),
                json!({
                    "healthy": component.healthy,
                    "metrics": component.metrics,
                }),
            )
        })
        .collect();

    let body = json!({
        "healthy": report.healthy,
        "components": components,
    });

    if report.healthy {
        HttpResponse::Ok().json(body)
    } else {
        HttpResponse::ServiceUnavailable().json(body)
    }
}

/// `GET /metrics` (spec §6): a structural snapshot (stage names, pool
/// names). Real counter/gauge values are not readable back from
/// `cadence::StatsdClient` (it only pushes), so this exposes what this
/// process *can* truthfully report about its own shape rather than
/// faking a scrape target; the numeric series live wherever the
/// process's statsd stream is collected.
pub async fn metrics(state: web::Data<ServerState>) -> HttpResponse {
    let snapshot = state.pipeline.metrics_snapshot();
    HttpResponse::Ok().json(snapshot)
}

pub async fn lbheartbeat() -> HttpResponse {
    HttpResponse::Ok().json(json!({"status": "Ok"}))
}

pub async fn version() -> HttpResponse {
    HttpResponse::Ok()
        .content_type("application/json")
        .body(format!(r#"{{"version":"{}"}}"#, env!("CARGO_PKG_VERSION")))
}
