//! Signing key rotation worker - Main Application Entry Point
//!
//! Keeps long-lived signing keys fresh by periodically rotating every active
//! key that is about to expire. Applications issue and verify keys through
//! the library; this process only owns the schema and the rotation sweep.
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment variables
//! 2. Create database connection pool
//! 3. Run database migrations
//! 4. Rotate expiring keys every `ROTATION_SWEEP_SECS` until interrupted

use std::sync::Arc;
use std::time::Duration;

use signing_keys::config::Config;
use signing_keys::db;
use signing_keys::{PgSignatureStore, SigningService};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging with tracing subscriber. Reads RUST_LOG environment variable (defaults to "info" level)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    // Load configuration
    let config = Config::from_env()?;
    let signing_config = config.signing_config()?;
    tracing::info!("Configuration loaded");

    // Create database pool
    let pool = db::create_pool(&config.database_url, config.max_connections).await?;
    tracing::info!("Database pool created");

    // Run migrations
    db::run_migrations(&pool).await?;
    tracing::info!("Database migrations complete");

    let store = Arc::new(PgSignatureStore::new(pool.clone()));
    let service = SigningService::new(store, signing_config)?;

    let mut sweep = tokio::time::interval(Duration::from_secs(config.rotation_sweep_secs.max(1)));
    tracing::info!(
        window_hours = config.rotation_window_hours,
        every_secs = config.rotation_sweep_secs,
        "Rotation worker started"
    );

    loop {
        tokio::select! {
            _ = sweep.tick() => {
                if let Err(error) = service
                    .rotate_expiring_keys(config.rotation_window_hours, None)
                    .await
                {
                    // Store outages are not fatal, the next sweep retries
                    tracing::error!(error = %error, "Rotation sweep failed");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown signal received");
                break;
            }
        }
    }

    pool.close().await;
    Ok(())
}
