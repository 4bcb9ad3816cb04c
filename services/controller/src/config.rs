//! Configuration for the controller.
//!
//! Settings come from a TOML file (path in `VAGOTH_CONFIG`, default
//! `/etc/vagoth/vagoth.toml`), with a few environment overrides on top. A
//! missing file means all defaults.
//!
//! ```toml
//! log_level = "info"
//!
//! [registry]
//! backend = "file"
//! path = "/var/lib/vagoth/registry.json"
//!
//! [scheduler]
//! kind = "background"
//!
//! [monitor]
//! create_missing = true
//! interval_secs = 30
//!
//! [allocator]
//! node = "hv1"
//!
//! [drivers.default]
//! kind = "mock"
//!
//! [node_types]
//! hv = "hypervisor"
//! vm = "virtual_machine"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use vagoth_reconcile::DEFAULT_POLL_INTERVAL;
use vagoth_registry::RegistryConfig;

use crate::driver::DriverSettings;
use crate::node::NodeKind;

/// Config file read when `VAGOTH_CONFIG` is unset.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/vagoth/vagoth.toml";

/// Errors from loading or applying configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file exists but could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// A `[drivers.<name>]` section names a kind nobody registered.
    #[error("driver {name} has unknown kind {kind}")]
    UnknownDriver { name: String, kind: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Controller configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error) when `RUST_LOG` is unset.
    pub log_level: String,

    pub registry: RegistryConfig,

    pub scheduler: SchedulerConfig,

    pub monitor: MonitorConfig,

    pub allocator: AllocatorConfig,

    pub cleanup: CleanupConfig,

    /// Driver instances by name. Hypervisors pick one with the `driver` key
    /// of their definition.
    pub drivers: BTreeMap<String, DriverSettings>,

    /// Which domain view wraps each node type.
    pub node_types: BTreeMap<String, NodeKind>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            registry: RegistryConfig::default(),
            scheduler: SchedulerConfig::default(),
            monitor: MonitorConfig::default(),
            allocator: AllocatorConfig::default(),
            cleanup: CleanupConfig::default(),
            drivers: BTreeMap::from([("default".to_string(), DriverSettings::new("dummy"))]),
            node_types: default_node_types(),
        }
    }
}

/// `hv` and `vm`, the node types every deployment uses.
pub fn default_node_types() -> BTreeMap<String, NodeKind> {
    BTreeMap::from([
        ("hv".to_string(), NodeKind::Hypervisor),
        ("vm".to_string(), NodeKind::VirtualMachine),
    ])
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    /// Run actions in the caller's task.
    #[default]
    Sync,
    /// Queue actions to a single background worker.
    Background,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub kind: SchedulerKind,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Register VMs that a hypervisor reports but the registry lacks.
    pub create_missing: bool,

    pub interval_secs: u64,

    /// Upper bound on each driver call.
    pub driver_timeout_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            create_missing: false,
            interval_secs: DEFAULT_POLL_INTERVAL.as_secs(),
            driver_timeout_secs: 30,
        }
    }
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn driver_timeout(&self) -> Duration {
        Duration::from_secs(self.driver_timeout_secs)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    /// Hypervisor to place VMs on when no hint is given.
    pub node: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    /// Interval between unique-key index repairs.
    pub interval_secs: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_secs: 3600,
        }
    }
}

impl CleanupConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Config {
    /// Load configuration from the file in `VAGOTH_CONFIG` and environment
    /// overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let path = std::env::var("VAGOTH_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

        let mut config = Self::load(&path)?;

        if let Ok(level) = std::env::var("VAGOTH_LOG_LEVEL") {
            config.log_level = level;
        }
        if let Ok(registry_path) = std::env::var("VAGOTH_REGISTRY_PATH") {
            config.registry = config.registry.with_path(registry_path);
        }

        config.validate()?;
        Ok(config)
    }

    /// Load a config file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::from_toml(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.monitor.interval_secs == 0 {
            return Err(ConfigError::Invalid("monitor.interval_secs must be positive".into()));
        }
        if self.monitor.driver_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "monitor.driver_timeout_secs must be positive".into(),
            ));
        }
        if self.cleanup.interval_secs == 0 {
            return Err(ConfigError::Invalid("cleanup.interval_secs must be positive".into()));
        }
        for kind in [NodeKind::Hypervisor, NodeKind::VirtualMachine] {
            if !self.node_types.values().any(|k| *k == kind) {
                return Err(ConfigError::Invalid(format!("no node type maps to {kind}")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.registry, RegistryConfig::Memory);
        assert_eq!(config.scheduler.kind, SchedulerKind::Sync);
        assert!(!config.monitor.create_missing);
        assert_eq!(config.drivers["default"].kind, "dummy");
        assert_eq!(config.node_types["hv"], NodeKind::Hypervisor);
        config.validate().unwrap();
    }

    #[test]
    fn test_full_file() {
        let config = Config::from_toml(
            r#"
            log_level = "debug"

            [registry]
            backend = "sqlite"
            path = "/var/lib/vagoth/registry.db"

            [scheduler]
            kind = "background"

            [monitor]
            create_missing = true
            interval_secs = 10

            [allocator]
            node = "hv1"

            [drivers.default]
            kind = "mock"
            latency_ms = 5

            [node_types]
            hypervisor = "hypervisor"
            guest = "virtual_machine"
            "#,
        )
        .unwrap();

        assert_eq!(config.registry.backend_name(), "sqlite");
        assert_eq!(config.scheduler.kind, SchedulerKind::Background);
        assert!(config.monitor.create_missing);
        assert_eq!(config.monitor.interval(), Duration::from_secs(10));
        assert_eq!(config.monitor.driver_timeout(), Duration::from_secs(30));
        assert_eq!(config.allocator.node.as_deref(), Some("hv1"));

        let driver = &config.drivers["default"];
        assert_eq!(driver.kind, "mock");
        assert_eq!(driver.get_u64("latency_ms"), Some(5));

        assert_eq!(config.node_types.len(), 2);
        assert_eq!(config.node_types["guest"], NodeKind::VirtualMachine);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.cleanup.interval(), Duration::from_secs(3600));
    }

    #[test]
    fn test_unknown_node_kind_is_a_parse_error() {
        let err = Config::from_toml("[node_types]\nhv = \"toaster\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let mut config = Config::default();
        config.monitor.interval_secs = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_requires_both_kinds() {
        let mut config = Config::default();
        config.node_types.remove("vm");
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
