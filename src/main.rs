mod catalogue;
mod config;
mod engine;
mod filters;
mod hub;
mod normalize;
mod odds;
mod server;
mod sse;
mod subscription;
mod transform;
mod types;

use crate::catalogue::CatalogueClient;
use crate::config::Config;
use crate::engine::StateEngine;
use crate::hub::Hub;
use crate::server::{AppState, Stats};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let config = Config::from_env();
    let _trace_guard = init_tracing(&config);

    tracing::info!(port = config.port, "starting odds gateway");

    let hub = Arc::new(Hub::new(config.default_odds_format.clone(), config.default_ev_threshold, config.default_arb_threshold, config.ws_debug));
    let engine = Arc::new(StateEngine::new());
    let catalogue = Arc::new(CatalogueClient::new(config.opticodds_api_key.clone()));
    let stats = Arc::new(Stats::default());
    let config = Arc::new(config);

    let state = Arc::new(AppState { hub, engine, catalogue, config: Arc::clone(&config), stats });
    let app = server::build_router(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!(%addr, "listening");
    let listener = tokio::net::TcpListener::bind(addr).await.expect("bind listener");
    axum::serve(listener, app).await.expect("server error");
}

/// stdout formatter always on; an additional non-blocking file layer is
/// installed when `TRACE=1`, matching `opticOdds/config.py`'s file-logging
/// toggle. Returns the appender guard, which must stay alive for the
/// lifetime of the process.
fn init_tracing(config: &Config) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::prelude::*;

    let stdout_layer = tracing_subscriber::fmt::layer();

    if config.trace_enabled {
        let file_appender = tracing_appender::rolling::never(".", &config.trace_file);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        let file_layer = tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false);
        tracing_subscriber::registry()
            .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
            .with(stdout_layer)
            .with(file_layer)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
            .with(stdout_layer)
            .init();
        None
    }
}
