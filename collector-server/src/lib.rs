//! The collector's self-observability HTTP surface: `/health` and
//! `/metrics`, plus the load-balancer heartbeat/version endpoints the
//! teacher's own servers expose (spec §6, §10.5).

pub mod handlers;
pub mod server;
pub mod state;

pub use server::Server;
pub use state::ServerState;

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use actix_web::{test, web, App};
    use metric_sink::NoopSink;
    use pipeline::Pipeline;

    use crate::{handlers, state::ServerState};

    fn pipeline() -> Arc<Pipeline> {
        Arc::new(Pipeline::builder().sink(Arc::new(NoopSink::new())).build().unwrap())
    }

    #[actix_web::test]
    async fn health_reports_ok_with_no_components() {
        let state = web::Data::new(ServerState { pipeline: pipeline() });
        let app = test::init_service(
            App::new().app_data(state.clone()).service(web::resource("/health").route(web::get().to(handlers::health))),
        )
        .await;
        let req = test::TestRequest::get().uri("/health").to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());
    }

    #[actix_web::test]
    async fn metrics_returns_stage_list() {
        let state = web::Data::new(ServerState { pipeline: pipeline() });
        let app = test::init_service(
            App::new().app_data(state.clone()).service(web::resource("/metrics").route(web::get().to(handlers::metrics))),
        )
        .await;
        let req = test::TestRequest::get().uri("/metrics").to_request();
        let body: std::collections::HashMap<String, String> = test::call_and_read_body_json(&app, req).await;
        assert!(body.contains_key("pipeline.stages"));
    }
}
