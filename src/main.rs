// =============================================================================
// aggflow-engine — Main Entry Point
// =============================================================================
//
// Wires the process-level config, the persistence repository, the Controller
// singleton, and the Axum REST + WebSocket surface together, then waits for
// Ctrl+C to stop any running session cleanly before exiting.
// =============================================================================

mod api;
mod app_state;
mod config;
mod controller;
mod error;
mod events;
mod exchange;
mod market;
mod persistence;
mod types;

use std::future::IntoFuture;
use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::config::RuntimeConfig;
use crate::controller::Controller;
use crate::persistence::JsonFileRepository;

const CONFIG_PATH: &str = "aggflow_config.json";
const PREFERENCES_PATH: &str = "aggflow_preferences.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("aggflow-engine starting up");

    let runtime_config = RuntimeConfig::load_or_default(CONFIG_PATH);
    info!(
        bind_addr = %runtime_config.bind_addr,
        default_symbol = %runtime_config.default_symbol,
        "runtime configuration loaded"
    );

    let preferences = Arc::new(
        JsonFileRepository::open(PREFERENCES_PATH).unwrap_or_else(|e| {
            warn!(error = %e, path = PREFERENCES_PATH, "failed to open preferences store, this is fatal");
            std::process::exit(1);
        }),
    );

    let events = crate::events::new_event_sink();
    let bind_addr = runtime_config.bind_addr.clone();
    let controller = Controller::new(runtime_config, events.clone());
    let state = Arc::new(AppState::new(controller.clone(), events, preferences));

    let app = api::rest::router(state);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "API server listening");

    tokio::select! {
        result = axum::serve(listener, app).into_future() => {
            if let Err(e) = result {
                warn!(error = %e, "API server exited with an error");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("shutdown signal received, stopping gracefully");
        }
    }

    if controller.stop().await {
        info!("active session stopped");
    }

    info!("aggflow-engine shut down complete");
    Ok(())
}
