//! The monitor: reconciles the registry with what hypervisors report.
//!
//! Each pass asks every hypervisor's driver for its status, plans the
//! registry changes with [`vagoth_reconcile::plan`], and applies them. A
//! hypervisor that fails or times out is skipped; the rest of the pass goes
//! on.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};
use vagoth_reconcile::{
    plan, KnownNode, PlanInput, PollStats, SkipReason, StatusRecord, Step, UNASSIGNED_STATE,
    VM_RECORD_TYPE,
};
use vagoth_registry::{Document, NewNode, NodeQuery, RegistryError, STATE_KEY};

use crate::error::ControllerResult;
use crate::manager::Manager;
use crate::node::{Hypervisor, NodeKind, NodeView};

/// Metadata key stamped on a hypervisor when its own snapshot is merged.
pub const POLLED_AT_KEY: &str = "polled_at";

pub struct Monitor {
    manager: Arc<Manager>,
    create_missing: bool,
    interval: Duration,
}

impl Monitor {
    /// A monitor using the manager's `[monitor]` settings.
    pub fn new(manager: Arc<Manager>) -> Self {
        let config = manager.monitor_config();
        Self {
            create_missing: config.create_missing,
            interval: config.interval(),
            manager,
        }
    }

    /// Run polling passes until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            create_missing = self.create_missing,
            "Starting monitor"
        );

        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.poll_nodes().await {
                        error!(error = %e, "Poll cycle failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Monitor shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Poll every hypervisor once.
    ///
    /// Only a failure to list hypervisors fails the pass. Driver and
    /// reconciliation failures are logged and counted per hypervisor.
    #[instrument(skip(self))]
    pub async fn poll_nodes(&self) -> ControllerResult<PollStats> {
        let mut stats = PollStats::default();

        for hv in self.blocking(|manager| manager.hypervisors()).await? {
            stats.hypervisors_polled += 1;

            let report = match hv.status().await {
                Ok(report) => report,
                Err(e) => {
                    warn!(hv_id = %hv.id(), error = %e, "Failed to poll hypervisor, skipping");
                    stats.hypervisors_failed += 1;
                    continue;
                }
            };

            match self.update_node(&hv, report).await {
                Ok(node_stats) => stats.merge(&node_stats),
                Err(e) => {
                    warn!(hv_id = %hv.id(), error = %e, "Failed to reconcile hypervisor");
                    stats.hypervisors_failed += 1;
                }
            }
        }

        if stats.is_quiet() {
            debug!(?stats, "Poll cycle complete");
        } else {
            info!(?stats, "Poll cycle complete");
        }
        Ok(stats)
    }

    /// Reconcile one hypervisor against its status report.
    ///
    /// Once a step for a VM fails, its later steps in the same pass are
    /// skipped.
    pub async fn update_node(
        &self,
        hv: &Hypervisor,
        report: Vec<StatusRecord>,
    ) -> ControllerResult<PollStats> {
        let hv_id = hv.id().to_string();
        let names: Vec<String> = report
            .iter()
            .map(|record| record.name.clone())
            .filter(|name| *name != hv_id)
            .collect();

        let (known, placed) = self
            .blocking(move |manager| {
                let registry = manager.registry();

                let mut known = BTreeMap::new();
                for name in names {
                    if known.contains_key(&name) {
                        continue;
                    }
                    match registry.get_node(&name) {
                        Ok(doc) => {
                            let is_vm =
                                matches!(manager.kind_of(&doc), Ok(NodeKind::VirtualMachine));
                            known.insert(
                                name,
                                KnownNode {
                                    parent: doc.parent().map(str::to_string),
                                    state: doc.state().to_string(),
                                    is_vm,
                                },
                            );
                        }
                        Err(e) if e.is_not_found() => {}
                        Err(e) => return Err(e.into()),
                    }
                }

                let placed: Vec<String> = registry
                    .get_nodes(&NodeQuery::all().parent(hv_id))?
                    .into_iter()
                    .map(|doc| doc.id().to_string())
                    .collect();
                Ok((known, placed))
            })
            .await?;

        let steps = plan(PlanInput {
            hypervisor_id: hv.id(),
            report,
            known,
            placed,
            create_missing: self.create_missing,
        });

        let mut stats = PollStats::default();
        let mut failed: BTreeSet<String> = BTreeSet::new();
        for step in steps {
            if let Some(vm_id) = step.vm_id().filter(|id| failed.contains(*id)) {
                debug!(
                    hv_id = %hv.id(),
                    vm_id = %vm_id,
                    step = step.name(),
                    "Skipping step after earlier failure"
                );
                continue;
            }
            match self.apply(hv, &step).await {
                Ok(()) => stats.record(&step),
                Err(e) => {
                    warn!(
                        hv_id = %hv.id(),
                        step = step.name(),
                        error = %e,
                        "Reconciliation step failed"
                    );
                    stats.step_errors += 1;
                    if let Some(vm_id) = step.vm_id() {
                        failed.insert(vm_id.to_string());
                    }
                }
            }
        }
        Ok(stats)
    }

    async fn apply(&self, hv: &Hypervisor, step: &Step) -> ControllerResult<()> {
        let hv_id = hv.id().to_string();

        match step {
            Step::MergeSnapshot { metadata } => {
                let mut metadata = metadata.clone();
                metadata.insert(POLLED_AT_KEY.to_string(), Value::String(Utc::now().to_rfc3339()));
                self.blocking(move |manager| {
                    Ok(manager.registry().update_metadata(&hv_id, metadata, &[])?)
                })
                .await?;
            }
            Step::Create {
                vm_id,
                definition,
                state,
            } => {
                let node_type = self
                    .manager
                    .node_type_for(NodeKind::VirtualMachine)
                    .unwrap_or(VM_RECORD_TYPE);
                let metadata = state.as_deref().map(state_patch).unwrap_or_default();

                self.manager
                    .provisioner()
                    .provision(
                        NewNode::new(vm_id.as_str(), vm_id.as_str(), node_type)
                            .definition(definition.clone())
                            .metadata(metadata),
                    )
                    .await?;
                self.set_parent(vm_id, Some(hv_id)).await?;
                info!(hv_id = %hv.id(), vm_id = %vm_id, "Registered VM found on hypervisor");
            }
            Step::AutoAssign { vm_id } => {
                self.set_parent(vm_id, Some(hv_id)).await?;
                warn!(hv_id = %hv.id(), vm_id = %vm_id, "VM running on hypervisor but unassigned, assigning");
            }
            Step::SyncState { vm_id, state } => {
                self.set_state(vm_id, state).await?;
                info!(vm_id = %vm_id, state = %state, "Updated VM state");
            }
            Step::Conflict { vm_id, placed_on } => {
                warn!(
                    hv_id = %hv.id(),
                    vm_id = %vm_id,
                    placed_on = %placed_on,
                    "VM reported by a hypervisor other than the one it is placed on"
                );
            }
            Step::Skip { name, reason } => match reason {
                SkipReason::Duplicate => {
                    debug!(hv_id = %hv.id(), name = %name, "Duplicate status record ignored")
                }
                SkipReason::NotRegistered => {
                    info!(hv_id = %hv.id(), vm_id = %name, "VM not in registry, skipping")
                }
                SkipReason::NotAVm => {
                    warn!(hv_id = %hv.id(), node_id = %name, "Reported VM is registered as another kind")
                }
                SkipReason::UnexpectedType(kind) => {
                    warn!(hv_id = %hv.id(), name = %name, kind = %kind, "Ignoring status record of unexpected type")
                }
            },
            Step::Unassign { vm_id } => {
                self.set_parent(vm_id, None).await?;
                self.set_state(vm_id, UNASSIGNED_STATE).await?;
                warn!(hv_id = %hv.id(), vm_id = %vm_id, "Node no longer on hypervisor, unassigned");
            }
        }
        Ok(())
    }

    async fn set_parent(&self, node_id: &str, parent: Option<String>) -> ControllerResult<()> {
        let node_id = node_id.to_string();
        self.blocking(move |manager| {
            Ok(manager.registry().set_parent(&node_id, parent.as_deref())?)
        })
        .await
    }

    async fn set_state(&self, node_id: &str, state: &str) -> ControllerResult<()> {
        let node_id = node_id.to_string();
        let patch = state_patch(state);
        self.blocking(move |manager| {
            Ok(manager.registry().update_metadata(&node_id, patch, &[])?)
        })
        .await
    }

    /// Run registry work on the blocking pool. File backends wait on
    /// `flock`, which must not stall the executor.
    async fn blocking<T, F>(&self, f: F) -> ControllerResult<T>
    where
        F: FnOnce(&Arc<Manager>) -> ControllerResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let manager = Arc::clone(&self.manager);
        tokio::task::spawn_blocking(move || f(&manager))
            .await
            .map_err(|e| RegistryError::Io(std::io::Error::other(e)))?
    }
}

fn state_patch(state: &str) -> Document {
    let mut patch = Document::new();
    patch.insert(STATE_KEY.to_string(), Value::String(state.to_string()));
    patch
}
