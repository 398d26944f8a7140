mod error;
mod middleware;
mod observability;
mod routes;
mod state;
mod validation;

use pantau_infra::{config::AppConfig, logging::init_tracing};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;

const DISPATCH_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load()?;
    init_tracing(&config)?;
    observability::init_metrics()?;
    error::expose_internal_details(config.is_development());

    let (state, dispatch_worker) = state::AppState::new(config.clone()).await?;
    let shutdown = state.shutdown.clone();
    let app = routes::router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!(%addr, webhook_url = %config.webhook_url(), "starting api");

    let listener = TcpListener::bind(addr).await?;
    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;

    shutdown.cancel();
    if tokio::time::timeout(DISPATCH_DRAIN_TIMEOUT, dispatch_worker)
        .await
        .is_err()
    {
        tracing::warn!("dispatch queue did not stop in time");
    }

    served.map_err(|err| {
        tracing::error!(error = %err, "server exited");
        err
    })?;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
