//! convertkit - Self-hosted document and media conversion service

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use convertkit::{
    api::{self, AppState},
    config::Config,
    tools::{SystemRunner, ToolRegistry},
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "convertkit=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting convertkit {}...", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config_path = std::env::var("CONVERTKIT_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.yml"));
    let config = Config::load_with_env(&config_path)?;
    tracing::info!("Configuration loaded from {}", config_path.display());

    // Detect external tools (missing ones only disable their endpoints)
    let tools = ToolRegistry::detect(&config.tools);
    let available = tools.report().iter().filter(|t| t.available).count();
    tracing::info!("{} of {} external tools available", available, tools.report().len());

    let state = AppState::new(config, tools, Arc::new(SystemRunner))?;
    tracing::info!(
        "Files directory: {}, {} job worker(s)",
        state.store.root().display(),
        state.jobs.workers()
    );

    // Periodic cleanup of expired jobs and stored files
    {
        let jobs = state.jobs.clone();
        let store = state.store.clone();
        let storage = state.config.storage.clone();
        let job_retention = state.config.jobs.retention();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(storage.cleanup_interval());
            loop {
                interval.tick().await;
                jobs.cleanup(job_retention).await;
                store.cleanup_older_than(storage.retention()).await;
            }
        });
    }

    let jobs = state.jobs.clone();
    let addr = format!("{}:{}", state.config.server.host, state.config.server.port);

    // Build router
    let app = api::build_router(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    jobs.shutdown().await;
    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
