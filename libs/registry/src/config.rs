//! Backend selection.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::RegistryResult;
use crate::retry::{RetryPolicy, DEFAULT_BACKOFF, DEFAULT_MAX_ATTEMPTS};
use crate::sqlite::DEFAULT_RESERVATION_GRACE;
use crate::{FileRegistry, MemoryRegistry, Registry, SqliteRegistry};

/// Which backend to open, as written in the `[registry]` config section.
///
/// ```toml
/// [registry]
/// backend = "sqlite"
/// path = "/var/lib/vagoth/registry.db"
/// max_attempts = 5
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum RegistryConfig {
    /// Process-local, lost on exit.
    #[default]
    Memory,

    /// One JSON document guarded by a lock file.
    File {
        path: PathBuf,
        #[serde(default)]
        lock_path: Option<PathBuf>,
    },

    /// SQLite database with optimistic revisions.
    Sqlite {
        path: PathBuf,
        #[serde(default = "default_max_attempts")]
        max_attempts: u32,
        #[serde(default = "default_backoff_ms")]
        backoff_ms: u64,
        #[serde(default = "default_reservation_grace_secs")]
        reservation_grace_secs: u64,
    },
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_backoff_ms() -> u64 {
    DEFAULT_BACKOFF.as_millis() as u64
}

fn default_reservation_grace_secs() -> u64 {
    DEFAULT_RESERVATION_GRACE.as_secs()
}

impl RegistryConfig {
    /// Point the backend at `path`. A memory backend becomes a file backend.
    pub fn with_path(self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        match self {
            Self::Memory => Self::File {
                path,
                lock_path: None,
            },
            Self::File { lock_path, .. } => Self::File { path, lock_path },
            Self::Sqlite {
                max_attempts,
                backoff_ms,
                reservation_grace_secs,
                ..
            } => Self::Sqlite {
                path,
                max_attempts,
                backoff_ms,
                reservation_grace_secs,
            },
        }
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::File { .. } => "file",
            Self::Sqlite { .. } => "sqlite",
        }
    }
}

/// Open the configured backend.
pub fn open_registry(config: &RegistryConfig) -> RegistryResult<Arc<dyn Registry>> {
    let registry: Arc<dyn Registry> = match config {
        RegistryConfig::Memory => Arc::new(MemoryRegistry::new()),
        RegistryConfig::File { path, lock_path } => {
            Arc::new(FileRegistry::open(path.clone(), lock_path.clone())?)
        }
        RegistryConfig::Sqlite {
            path,
            max_attempts,
            backoff_ms,
            reservation_grace_secs,
        } => Arc::new(
            SqliteRegistry::open(path)?
                .with_retry(RetryPolicy::new(
                    *max_attempts,
                    Duration::from_millis(*backoff_ms),
                ))
                .with_reservation_grace(Duration::from_secs(*reservation_grace_secs)),
        ),
    };

    info!(backend = config.backend_name(), "Opened node registry");
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize)]
    struct Wrapper {
        registry: RegistryConfig,
    }

    fn parse(toml: &str) -> RegistryConfig {
        toml::from_str::<Wrapper>(toml).unwrap().registry
    }

    #[test]
    fn test_parse_sqlite_defaults() {
        let config = parse(
            r#"
            [registry]
            backend = "sqlite"
            path = "/tmp/registry.db"
            "#,
        );
        assert_eq!(
            config,
            RegistryConfig::Sqlite {
                path: PathBuf::from("/tmp/registry.db"),
                max_attempts: 5,
                backoff_ms: 10,
                reservation_grace_secs: 60,
            }
        );
    }

    #[test]
    fn test_parse_file() {
        let config = parse(
            r#"
            [registry]
            backend = "file"
            path = "/tmp/registry.json"
            lock_path = "/tmp/registry.lock"
            "#,
        );
        assert_eq!(config.backend_name(), "file");
    }

    #[test]
    fn test_with_path_upgrades_memory() {
        let config = RegistryConfig::Memory.with_path("/tmp/r.json");
        assert!(matches!(config, RegistryConfig::File { .. }));
    }

    #[test]
    fn test_open_file_backend() {
        let dir = tempfile::tempdir().unwrap();
        let config = RegistryConfig::File {
            path: dir.path().join("registry.json"),
            lock_path: None,
        };
        let registry = open_registry(&config).unwrap();
        assert!(registry.list_nodes().unwrap().is_empty());
    }
}
