//! In-process simulated hypervisors.
//!
//! Used for local development and tests. Hosts are created on first use;
//! tests seed them with [`MockDriver::place_vm`] and can make one
//! unreachable or slow to exercise the monitor's failure handling.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info};
use vagoth_reconcile::StatusRecord;
use vagoth_registry::{Document, NodeDoc};

use super::{Driver, DriverSettings};
use crate::config::ConfigError;
use crate::error::{DriverError, DriverResult};

const STOPPED: &str = "stopped";
const RUNNING: &str = "running";

#[derive(Debug, Clone)]
struct MockVm {
    state: String,
    definition: Document,
}

#[derive(Debug, Default)]
struct MockHost {
    vms: BTreeMap<String, MockVm>,
    metrics: Document,
    unreachable: bool,
}

/// Simulated hypervisor backend.
#[derive(Debug, Default)]
pub struct MockDriver {
    hosts: Mutex<BTreeMap<String, MockHost>>,

    /// Delay added to every call, in milliseconds.
    latency_ms: AtomicU64,

    /// `"<operation> <vm>@<hv>"` for every lifecycle call, in order.
    calls: Mutex<Vec<String>>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// `latency_ms` in the driver section delays every call.
    pub fn from_settings(settings: &DriverSettings) -> Result<Arc<dyn Driver>, ConfigError> {
        let driver = Self::new();
        if let Some(ms) = settings.get_u64("latency_ms") {
            driver.set_latency(Duration::from_millis(ms));
        }
        Ok(Arc::new(driver))
    }

    /// Put a VM on a host, replacing any VM of the same name there.
    pub fn place_vm(&self, hv: &str, vm: &str, state: &str) {
        self.hosts().entry(hv.to_string()).or_default().vms.insert(
            vm.to_string(),
            MockVm {
                state: state.to_string(),
                definition: Document::new(),
            },
        );
    }

    /// Remove a VM behind the controller's back.
    pub fn remove_vm(&self, hv: &str, vm: &str) {
        if let Some(host) = self.hosts().get_mut(hv) {
            host.vms.remove(vm);
        }
    }

    pub fn set_unreachable(&self, hv: &str, unreachable: bool) {
        self.hosts().entry(hv.to_string()).or_default().unreachable = unreachable;
    }

    /// Metrics the host reports about itself in `status`.
    pub fn set_metrics(&self, hv: &str, metrics: Document) {
        self.hosts().entry(hv.to_string()).or_default().metrics = metrics;
    }

    pub fn set_latency(&self, latency: Duration) {
        let ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_ms.store(ms, Ordering::Relaxed);
    }

    pub fn vm_state(&self, hv: &str, vm: &str) -> Option<String> {
        self.hosts()
            .get(hv)
            .and_then(|host| host.vms.get(vm))
            .map(|vm| vm.state.clone())
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn hosts(&self) -> MutexGuard<'_, BTreeMap<String, MockHost>> {
        self.hosts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn delay(&self) {
        let ms = self.latency_ms.load(Ordering::Relaxed);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    /// Apply `f` to the VM's slot on a reachable host.
    async fn with_vm<T>(
        &self,
        operation: &'static str,
        hv: &NodeDoc,
        vm: &NodeDoc,
        f: impl FnOnce(&mut BTreeMap<String, MockVm>, &NodeDoc) -> Result<T, String>,
    ) -> DriverResult<T> {
        self.delay().await;

        info!(hv_id = %hv.id(), vm_id = %vm.id(), operation, "[MOCK] VM operation");
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(format!("{operation} {}@{}", vm.id(), hv.id()));

        let mut hosts = self.hosts();
        let host = hosts.entry(hv.id().to_string()).or_default();
        if host.unreachable {
            return Err(DriverError::Unreachable {
                hypervisor: hv.id().to_string(),
                reason: "mock host marked unreachable".to_string(),
            });
        }

        f(&mut host.vms, vm).map_err(|message| DriverError::Failed {
            hypervisor: hv.id().to_string(),
            operation,
            message,
        })
    }

    async fn set_running_state(
        &self,
        operation: &'static str,
        hv: &NodeDoc,
        vm: &NodeDoc,
        state: &'static str,
    ) -> DriverResult<()> {
        self.with_vm(operation, hv, vm, |vms, vm| match vms.get_mut(vm.id()) {
            Some(slot) => {
                slot.state = state.to_string();
                Ok(())
            }
            None => Err(format!("{} is not defined", vm.id())),
        })
        .await
    }

    async fn define_vm(&self, operation: &'static str, hv: &NodeDoc, vm: &NodeDoc) -> DriverResult<()> {
        self.with_vm(operation, hv, vm, |vms, vm| {
            let slot = vms.entry(vm.id().to_string()).or_insert_with(|| MockVm {
                state: STOPPED.to_string(),
                definition: Document::new(),
            });
            slot.definition = vm.definition().clone();
            Ok(())
        })
        .await
    }

    async fn remove(&self, operation: &'static str, hv: &NodeDoc, vm: &NodeDoc) -> DriverResult<()> {
        self.with_vm(operation, hv, vm, |vms, vm| {
            vms.remove(vm.id());
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl Driver for MockDriver {
    fn kind(&self) -> &'static str {
        "mock"
    }

    async fn provision(&self, hv: &NodeDoc, vm: &NodeDoc) -> DriverResult<()> {
        self.define_vm("provision", hv, vm).await
    }

    async fn define(&self, hv: &NodeDoc, vm: &NodeDoc) -> DriverResult<()> {
        self.define_vm("define", hv, vm).await
    }

    async fn undefine(&self, hv: &NodeDoc, vm: &NodeDoc) -> DriverResult<()> {
        self.remove("undefine", hv, vm).await
    }

    async fn deprovision(&self, hv: &NodeDoc, vm: &NodeDoc) -> DriverResult<()> {
        self.remove("deprovision", hv, vm).await
    }

    async fn start(&self, hv: &NodeDoc, vm: &NodeDoc) -> DriverResult<()> {
        self.set_running_state("start", hv, vm, RUNNING).await
    }

    async fn stop(&self, hv: &NodeDoc, vm: &NodeDoc) -> DriverResult<()> {
        self.set_running_state("stop", hv, vm, STOPPED).await
    }

    async fn shutdown(&self, hv: &NodeDoc, vm: &NodeDoc) -> DriverResult<()> {
        self.set_running_state("shutdown", hv, vm, STOPPED).await
    }

    async fn reboot(&self, hv: &NodeDoc, vm: &NodeDoc) -> DriverResult<()> {
        self.set_running_state("reboot", hv, vm, RUNNING).await
    }

    async fn info(&self, hv: &NodeDoc, vm: &NodeDoc) -> DriverResult<Document> {
        self.with_vm("info", hv, vm, |vms, vm| {
            let slot = vms
                .get(vm.id())
                .ok_or_else(|| format!("{} is not defined", vm.id()))?;
            let mut info = Document::new();
            info.insert("definition".into(), Value::Object(slot.definition.clone()));
            info.insert("state".into(), json!(slot.state));
            Ok(info)
        })
        .await
    }

    async fn status(&self, hv: &NodeDoc) -> DriverResult<Vec<StatusRecord>> {
        self.delay().await;

        let hosts = self.hosts();
        let Some(host) = hosts.get(hv.id()) else {
            debug!(hv_id = %hv.id(), "[MOCK] Unknown host, reporting no VMs");
            return Ok(Vec::new());
        };
        if host.unreachable {
            return Err(DriverError::Unreachable {
                hypervisor: hv.id().to_string(),
                reason: "mock host marked unreachable".to_string(),
            });
        }

        let mut report = Vec::with_capacity(host.vms.len() + 1);
        if !host.metrics.is_empty() {
            let mut own = StatusRecord::hypervisor(hv.id());
            for (key, value) in &host.metrics {
                own = own.with(key.clone(), value.clone());
            }
            report.push(own);
        }
        for (name, vm) in &host.vms {
            report.push(
                StatusRecord::vm(name.clone(), vm.state.clone())
                    .parent(hv.id())
                    .definition(vm.definition.clone()),
            );
        }

        debug!(hv_id = %hv.id(), records = report.len(), "[MOCK] Reporting status");
        Ok(report)
    }
}
