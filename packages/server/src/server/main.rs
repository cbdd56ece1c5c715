// Main entry point for the record service

use anyhow::{Context, Result};
use server_core::{kernel::ServerDeps, server::build_app, Config};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,server_core=debug,courier=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting record service");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!(
        audit_topic = %config.audit_topic,
        max_attempts = config.dispatch_max_attempts,
        retry_interval_ms = config.dispatch_retry_interval_ms,
        "Configuration loaded"
    );

    // Connect the bus and build the dispatcher
    match &config.nats_url {
        Some(url) => tracing::info!("Connecting to NATS at {}", url),
        None => tracing::info!("NATS_URL not set, using in-process broker"),
    }
    let deps = ServerDeps::from_config(&config)
        .await
        .context("Failed to initialize server dependencies")?;
    if deps.processor.is_some() {
        tracing::info!("Embedded audit processor running");
    }
    if let Some(url) = &config.health_probe_url {
        tracing::info!("Liveness probe enabled: {}", url);
    }

    // Build application
    let app = build_app(deps.dispatcher.clone());

    // Start server
    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("Starting server on {}", addr);
    tracing::info!("Health check: http://localhost:{}/health", config.port);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
