mod routes;
mod state;
mod types;

use anyhow::Context;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use twin_core::TwinConfig;

use crate::state::{AppState, ServerSettings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg_path = std::env::var("TWIN_CONFIG").ok().map(PathBuf::from);
    let cfg = TwinConfig::load_or_default(cfg_path.as_deref()).context("failed to load TWIN_CONFIG")?;
    let settings = ServerSettings::from_env(&cfg);
    let port = settings.port;

    let state = AppState::new(settings);
    // A missing model is not fatal: requests get 503 until POST /reload succeeds.
    if state.reload().is_err() {
        tracing::warn!("starting without a model; POST /reload once one is trained");
    }

    let app = routes::router(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;
    Ok(())
}
