//! certswap - a TCP/TLS listener with live certificate rotation.

use certswap_server::{Config, EchoHandler, SecureListener};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if CERTSWAP_CONFIG is set, then env overrides)
    let config = match Config::load() {
        Ok(c) => {
            if let Ok(path) = std::env::var("CERTSWAP_CONFIG") {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            // If a config file was explicitly specified, fail on error
            if std::env::var("CERTSWAP_CONFIG").is_ok() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::info!("Using default configuration");
            Config::default()
        }
    };

    tracing::info!("Starting certswap");
    tracing::info!(
        "  Bind address: {}:{}",
        config.network.hostname,
        config.network.port
    );
    if config.tls.enabled() {
        tracing::info!(
            "  TLS: enabled (rotation delay {}s)",
            config.tls.rotation_delay_secs
        );
    } else {
        tracing::info!("  TLS: disabled");
    }

    let mut listener = SecureListener::new(config, Arc::new(EchoHandler))?;
    listener.start().await?;

    // Run until interrupted
    tokio::signal::ctrl_c().await.ok();
    tracing::info!("Received shutdown signal, stopping listener...");
    listener.stop(false).await;

    Ok(())
}
