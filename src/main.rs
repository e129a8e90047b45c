//! herald alert webhook gateway.
//!
//! Main entry point for the herald server. Loads configuration, assembles
//! the gateway, and coordinates graceful startup and shutdown.

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use herald_api::{Config, Gateway};
use tracing::{error, info, warn};

const CONFIG_PATH_VAR: &str = "HERALD_CONFIG_FILE";
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting herald alert gateway");

    let config = load_config()?;
    let addr = config.parse_server_addr()?;
    info!(
        server_addr = %addr,
        destinations = config.destinations.len(),
        auth_enabled = config.auth.is_enabled(),
        dead_letter_persistence = config.dead_letter.persist_path.is_some(),
        "Configuration loaded"
    );

    let gateway = Arc::new(Gateway::from_config(config)?);

    match gateway.restore_dead_letters().await {
        Ok(0) => {},
        Ok(restored) => info!(restored, "Dead-letter records restored"),
        Err(e) => warn!(error = %e, "Dead-letter snapshot ignored"),
    }

    gateway.start_background_tasks();

    info!(addr = %addr, "herald is ready to receive alerts");

    if let Err(e) = herald_api::start_server(gateway.clone(), addr).await {
        error!(error = %e, "Server failed");
    }

    match tokio::time::timeout(SHUTDOWN_GRACE, gateway.shutdown()).await {
        Ok(()) => info!("herald shutdown complete"),
        Err(_) => warn!("Shutdown grace period expired"),
    }

    Ok(())
}

/// Reads `herald.toml`, or the file named by `HERALD_CONFIG_FILE`.
fn load_config() -> Result<Config> {
    match std::env::var_os(CONFIG_PATH_VAR) {
        Some(path) => {
            let path = PathBuf::from(path);
            Config::load_from(&path).with_context(|| format!("failed to load {}", path.display()))
        },
        None => Config::load(),
    }
}

/// Initializes tracing with environment-based configuration.
fn init_tracing() -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,herald=debug,tower_http=debug"))
        .context("Invalid RUST_LOG environment variable")?;

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
    Ok(())
}
