//! fanout-orchestrator - HTTP Server Entry Point
//!
//! Starts the HTTP server that accepts image tasks and serves their status.

use fanout_orchestrator::{api, config::Config};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fanout_orchestrator=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;
    info!(
        model = %config.provider.model,
        store = ?config.store.store_type,
        fan_out_width = config.orchestrator.default_fan_out_width,
        min_success = config.orchestrator.min_success,
        "Loaded configuration"
    );

    api::serve(config).await?;

    Ok(())
}
