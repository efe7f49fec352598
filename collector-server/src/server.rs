use std::sync::Arc;

use actix_web::{dev::Server as ActixServer, web, App, HttpServer};
use pipeline::Pipeline;

use crate::handlers;
use crate::state::ServerState;

/// Builds and binds the observability HTTP server (spec §10.5): an
/// `actix-web` app exposing `/health` and `/metrics`, wired as an
/// `HttpServer::new(move || {...})` app factory the way
/// `syncserver::server::Server` composes its own app, translated to the
/// `actix-web` 4 API (`web::Data` instead of `App::data`, no
/// `ErrorHandlers`/CORS middleware — this surface has no browser client).
pub struct Server;

impl Server {
    /// Binds `host:port` and returns the running `actix_web::dev::Server`
    /// handle; the caller awaits it (or `.handle().stop(true)`s it) as
    /// part of the binary's shutdown sequence (spec §4.10).
    pub fn start(host: &str, port: u16, pipeline: Arc<Pipeline>) -> std::io::Result<ActixServer> {
        let state = web::Data::new(ServerState { pipeline });
        let server = HttpServer::new(move || {
            App::new()
                .app_data(state.clone())
                .service(web::resource("/health").route(web::get().to(handlers::health)))
                .service(web::resource("/metrics").route(web::get().to(handlers::metrics)))
                .service(web::resource("/__lbheartbeat__").route(web::get().to(handlers::lbheartbeat)))
                .service(web::resource("/__version__").route(web::get().to(handlers::version)))
        })
        .bind((host, port))?
        .run();
        Ok(server)
    }
}
