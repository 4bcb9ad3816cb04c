use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, instrument};
use vagoth_registry::{IndexRepair, Registry, RegistryError};

#[derive(Debug, Clone)]
pub struct IndexCleanupConfig {
    pub interval: Duration,
}

impl Default for IndexCleanupConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
        }
    }
}

/// Periodically repairs the registry's unique-key index.
///
/// A crash between claiming a key and writing the node (or between writing
/// the node and releasing an old key) leaves the index out of step with the
/// nodes. The first pass runs at startup.
pub struct IndexCleanupWorker {
    registry: Arc<dyn Registry>,
    config: IndexCleanupConfig,
}

impl IndexCleanupWorker {
    pub fn new(registry: Arc<dyn Registry>, config: IndexCleanupConfig) -> Self {
        Self { registry, config }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "Starting index cleanup worker"
        );

        let mut interval = tokio::time::interval(self.config.interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.run_cleanup().await {
                        error!(error = %e, "Index cleanup failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Index cleanup worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One repair pass, off the async executor.
    pub async fn run_cleanup(&self) -> Result<IndexRepair, RegistryError> {
        let registry = Arc::clone(&self.registry);
        let repair = tokio::task::spawn_blocking(move || registry.cleanup_index())
            .await
            .map_err(|e| RegistryError::Io(std::io::Error::other(e)))??;

        if !repair.is_clean() {
            info!(
                released = repair.released.len(),
                reclaimed = repair.reclaimed.len(),
                conflicts = repair.conflicts.len(),
                reservations_dropped = repair.reservations_dropped.len(),
                "Index cleanup pass complete"
            );
        }
        Ok(repair)
    }
}
