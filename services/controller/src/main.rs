//! Vagoth controller daemon.
//!
//! Opens the configured registry, builds the drivers, then runs the monitor
//! and the index cleanup worker until interrupted.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vagoth_controller::cleanup::{IndexCleanupConfig, IndexCleanupWorker};
use vagoth_controller::{Config, DriverTable, Manager, Monitor};
use vagoth_registry::open_registry;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("failed to load configuration")?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        registry = config.registry.backend_name(),
        scheduler = ?config.scheduler.kind,
        create_missing = config.monitor.create_missing,
        "Starting vagoth controller"
    );

    let registry = open_registry(&config.registry).context("failed to open registry")?;
    let manager = Manager::from_config(&config, Arc::clone(&registry), &DriverTable::default())
        .context("failed to build drivers")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let monitor_handle = tokio::spawn({
        let monitor = Monitor::new(Arc::clone(&manager));
        let shutdown_rx = shutdown_rx.clone();
        async move { monitor.run(shutdown_rx).await }
    });

    let cleanup_handle = tokio::spawn({
        let worker = IndexCleanupWorker::new(
            registry,
            IndexCleanupConfig {
                interval: config.cleanup.interval(),
            },
        );
        let shutdown_rx = shutdown_rx.clone();
        async move { worker.run(shutdown_rx).await }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        _ = monitor_handle => {
            warn!("Monitor exited");
        }
        _ = cleanup_handle => {
            warn!("Index cleanup worker exited");
        }
    }

    let _ = shutdown_tx.send(true);
    manager.shutdown().await;

    info!("Controller shutdown complete");
    Ok(())
}
