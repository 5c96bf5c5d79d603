//! # Confer Server
//!
//! Signaling and coordination backend for multi-party video meetings.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! confer
//!
//! # Run with custom config
//! confer  # reads confer.toml from the working directory
//!
//! # Run with environment variables
//! CONFER_PORT=8080 CONFER_HOST=0.0.0.0 confer
//! ```

mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "confer=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!("Starting Confer server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
