//! Hypervisor driver contract and the table of driver factories.
//!
//! A driver speaks to one kind of hypervisor backend. Drivers are configured
//! by name under `[drivers.<name>]`; each section picks a `kind`, and the
//! [`DriverTable`] maps kinds to constructors. Hypervisors choose a driver
//! by name through the `driver` key of their definition.

mod dummy;
mod mock;

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;
use vagoth_reconcile::StatusRecord;
use vagoth_registry::{Document, NodeDoc};

pub use dummy::DummyDriver;
pub use mock::MockDriver;

use crate::config::ConfigError;
use crate::error::{DriverError, DriverResult};

/// Lifecycle operations a driver performs on one VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmOperation {
    /// Define and provision storage.
    Provision,
    Define,
    Undefine,
    /// Undefine and release storage.
    Deprovision,
    Start,
    /// Forceful stop.
    Stop,
    /// Graceful stop.
    Shutdown,
    Reboot,
}

impl VmOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provision => "provision",
            Self::Define => "define",
            Self::Undefine => "undefine",
            Self::Deprovision => "deprovision",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Shutdown => "shutdown",
            Self::Reboot => "reboot",
        }
    }
}

impl fmt::Display for VmOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hypervisor driver interface.
///
/// `hv` is the hypervisor node the call is addressed to and `vm` the guest
/// it concerns.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Driver kind, for logs.
    fn kind(&self) -> &'static str;

    async fn provision(&self, hv: &NodeDoc, vm: &NodeDoc) -> DriverResult<()>;

    async fn define(&self, hv: &NodeDoc, vm: &NodeDoc) -> DriverResult<()>;

    async fn undefine(&self, hv: &NodeDoc, vm: &NodeDoc) -> DriverResult<()>;

    async fn deprovision(&self, hv: &NodeDoc, vm: &NodeDoc) -> DriverResult<()>;

    async fn start(&self, hv: &NodeDoc, vm: &NodeDoc) -> DriverResult<()>;

    async fn stop(&self, hv: &NodeDoc, vm: &NodeDoc) -> DriverResult<()>;

    async fn shutdown(&self, hv: &NodeDoc, vm: &NodeDoc) -> DriverResult<()>;

    async fn reboot(&self, hv: &NodeDoc, vm: &NodeDoc) -> DriverResult<()>;

    /// What the hypervisor knows about one VM, with at least `definition`
    /// and `state`.
    async fn info(&self, hv: &NodeDoc, vm: &NodeDoc) -> DriverResult<Document>;

    /// Everything running on the hypervisor, possibly including a record for
    /// the hypervisor itself.
    async fn status(&self, hv: &NodeDoc) -> DriverResult<Vec<StatusRecord>>;

    async fn migrate(&self, _hv: &NodeDoc, _vm: &NodeDoc, _destination: &NodeDoc) -> DriverResult<()> {
        Err(DriverError::Unsupported {
            driver: self.kind(),
            operation: "migrate",
        })
    }
}

/// Route a [`VmOperation`] to the matching driver method.
pub async fn dispatch(
    driver: &dyn Driver,
    operation: VmOperation,
    hv: &NodeDoc,
    vm: &NodeDoc,
) -> DriverResult<()> {
    match operation {
        VmOperation::Provision => driver.provision(hv, vm).await,
        VmOperation::Define => driver.define(hv, vm).await,
        VmOperation::Undefine => driver.undefine(hv, vm).await,
        VmOperation::Deprovision => driver.deprovision(hv, vm).await,
        VmOperation::Start => driver.start(hv, vm).await,
        VmOperation::Stop => driver.stop(hv, vm).await,
        VmOperation::Shutdown => driver.shutdown(hv, vm).await,
        VmOperation::Reboot => driver.reboot(hv, vm).await,
    }
}

/// Bound a driver call; an elapsed deadline becomes [`DriverError::Timeout`].
pub async fn with_timeout<T>(
    timeout: Duration,
    hypervisor: &str,
    operation: &'static str,
    call: impl Future<Output = DriverResult<T>>,
) -> DriverResult<T> {
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(DriverError::Timeout {
            hypervisor: hypervisor.to_string(),
            operation,
            timeout,
        }),
    }
}

/// One `[drivers.<name>]` section.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DriverSettings {
    /// Which registered factory builds this driver.
    pub kind: String,

    /// Everything else in the section, for the factory to interpret.
    #[serde(flatten)]
    pub settings: toml::Table,
}

impl DriverSettings {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            settings: toml::Table::new(),
        }
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.settings.get(key).and_then(toml::Value::as_str)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.settings
            .get(key)
            .and_then(toml::Value::as_integer)
            .and_then(|n| u64::try_from(n).ok())
    }
}

/// Builds a driver from its config section.
pub type DriverFactory = fn(&DriverSettings) -> Result<Arc<dyn Driver>, ConfigError>;

/// Driver kinds known to this binary.
#[derive(Clone)]
pub struct DriverTable {
    factories: BTreeMap<String, DriverFactory>,
}

impl Default for DriverTable {
    fn default() -> Self {
        let mut table = Self {
            factories: BTreeMap::new(),
        };
        table.register("dummy", DummyDriver::from_settings);
        table.register("mock", MockDriver::from_settings);
        table
    }
}

impl DriverTable {
    /// Add or replace a driver kind.
    pub fn register(&mut self, kind: impl Into<String>, factory: DriverFactory) {
        self.factories.insert(kind.into(), factory);
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Build the driver configured under `name`.
    pub fn build(&self, name: &str, settings: &DriverSettings) -> Result<Arc<dyn Driver>, ConfigError> {
        let factory = self
            .factories
            .get(&settings.kind)
            .ok_or_else(|| ConfigError::UnknownDriver {
                name: name.to_string(),
                kind: settings.kind.clone(),
            })?;
        let driver = factory(settings)?;
        debug!(driver = %name, kind = %settings.kind, "Built driver");
        Ok(driver)
    }

    /// Build every configured driver.
    pub fn build_all(
        &self,
        sections: &BTreeMap<String, DriverSettings>,
    ) -> Result<Drivers, ConfigError> {
        let mut drivers = Drivers::default();
        for (name, settings) in sections {
            drivers.insert(name.clone(), self.build(name, settings)?);
        }
        Ok(drivers)
    }
}

/// Driver instances by configured name.
#[derive(Clone, Default)]
pub struct Drivers {
    by_name: BTreeMap<String, Arc<dyn Driver>>,
}

impl Drivers {
    pub fn insert(&mut self, name: impl Into<String>, driver: Arc<dyn Driver>) {
        self.by_name.insert(name.into(), driver);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Driver>> {
        self.by_name.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.by_name.keys().map(String::as_str)
    }
}

impl fmt::Debug for Drivers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}
