//! DonorBridge API Server
//!
//! Receives Stripe webhooks and hands them to the ingest worker pool.

use std::sync::Arc;

use donorbridge_api::{routes::create_router, AppState, Config};
use donorbridge_ingest::IngestService;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let config = Config::from_env()?;
    init_tracing(config.json_logs);

    tracing::info!("Starting DonorBridge API Server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        bind_address = %config.bind_address,
        lanes = config.pool.lanes,
        depth = config.pool.depth,
        job_timeout_secs = config.pool.job_timeout.as_secs(),
        "Configuration loaded"
    );

    let service = IngestService::from_env()?;
    tracing::info!(currency = %service.config.currency, "Ingest service ready");

    let state = AppState::new(config.clone(), service.dispatcher(config.pool));
    let dispatcher = state.dispatcher.clone();

    let app = create_router(state).layer(TraceLayer::new_for_http());

    tracing::info!("Starting server on {}", config.bind_address);
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // The router is gone, so this is the last handle; drain queued events
    match Arc::try_unwrap(dispatcher) {
        Ok(dispatcher) => {
            tracing::info!("Draining queued webhook events");
            dispatcher.shutdown().await;
        }
        Err(_) => tracing::warn!("Dispatcher still shared at shutdown, queued events may be lost"),
    }

    tracing::info!("Server stopped");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,donorbridge_api=debug,donorbridge_ingest=debug".into());

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
