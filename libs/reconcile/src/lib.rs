//! Reconciliation primitives.
//!
//! A hypervisor's driver reports what is actually running on it. This crate
//! turns one such report, plus the registry's view of the VMs it mentions,
//! into an ordered list of [`Step`]s that bring the registry in line with
//! reality. Key rules:
//!
//! - **Reality wins**: a VM reported on a hypervisor but unplaced in the
//!   registry is assigned to it; a VM placed on a hypervisor that stops
//!   reporting it is unassigned.
//! - **Minimal writes**: stored state is only overwritten when it differs.
//! - **No cross-hypervisor guessing**: a VM placed elsewhere is left alone
//!   and reported as a conflict.
//!
//! # Invariants
//!
//! - Planning is pure and deterministic given the same inputs
//! - Every reported name yields at most one placement step

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// `_type` of a VM status record.
pub const VM_RECORD_TYPE: &str = "vm";

/// `_type` of a hypervisor's own status record.
pub const HYPERVISOR_RECORD_TYPE: &str = "hv";

/// State recorded on VMs that lost their placement.
pub const UNASSIGNED_STATE: &str = "unassigned";

/// Default interval between poll cycles.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// One entry of a driver's status report.
///
/// On the wire the bookkeeping fields carry a leading underscore:
///
/// ```json
/// { "_name": "vm1", "_type": "vm", "_parent": "hv1",
///   "definition": { "ram": 512 }, "state": ["running", "running"] }
/// ```
///
/// `state` is a `(current, target)` pair. Anything else a driver sends is
/// kept in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    #[serde(rename = "_name")]
    pub name: String,

    #[serde(rename = "_type", default = "default_record_type")]
    pub kind: String,

    #[serde(rename = "_parent", default)]
    pub parent: Option<String>,

    #[serde(default)]
    pub definition: Map<String, Value>,

    #[serde(default)]
    pub state: Option<(String, Option<String>)>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_record_type() -> String {
    VM_RECORD_TYPE.to_string()
}

impl StatusRecord {
    /// A VM record with its current state.
    pub fn vm(name: impl Into<String>, current_state: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: VM_RECORD_TYPE.to_string(),
            parent: None,
            definition: Map::new(),
            state: Some((current_state.into(), None)),
            extra: Map::new(),
        }
    }

    /// A hypervisor's own snapshot record.
    pub fn hypervisor(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: HYPERVISOR_RECORD_TYPE.to_string(),
            parent: None,
            definition: Map::new(),
            state: None,
            extra: Map::new(),
        }
    }

    pub fn parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn definition(mut self, definition: Map<String, Value>) -> Self {
        self.definition = definition;
        self
    }

    pub fn target_state(mut self, target: impl Into<String>) -> Self {
        let current = self.state.take().map(|(current, _)| current).unwrap_or_default();
        self.state = Some((current, Some(target.into())));
        self
    }

    /// Attach an extra field, e.g. a host metric.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    pub fn current_state(&self) -> Option<&str> {
        self.state.as_ref().map(|(current, _)| current.as_str())
    }

    pub fn target(&self) -> Option<&str> {
        self.state.as_ref().and_then(|(_, target)| target.as_deref())
    }

    /// The metadata to merge into a hypervisor from its own record.
    ///
    /// Bookkeeping fields are dropped. The state pair is flattened to
    /// `state` and `target_state` so a hypervisor's state stays a string.
    pub fn into_snapshot(self) -> Map<String, Value> {
        let mut snapshot = self.extra;
        if !self.definition.is_empty() {
            snapshot.insert("definition".into(), Value::Object(self.definition));
        }
        if let Some((current, target)) = self.state {
            snapshot.insert("state".into(), Value::String(current));
            if let Some(target) = target {
                snapshot.insert("target_state".into(), Value::String(target));
            }
        }
        snapshot
    }
}

/// How the registry currently sees a reported node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownNode {
    pub parent: Option<String>,
    pub state: String,
    /// False when the id belongs to a hypervisor or other non-VM node.
    pub is_vm: bool,
}

/// Everything the planner needs about one hypervisor.
#[derive(Debug, Clone, Default)]
pub struct PlanInput<'a> {
    pub hypervisor_id: &'a str,
    pub report: Vec<StatusRecord>,
    /// Registry view of each reported name that exists.
    pub known: BTreeMap<String, KnownNode>,
    /// Ids of nodes whose parent is this hypervisor.
    pub placed: Vec<String>,
    pub create_missing: bool,
}

/// Why a status record produced no placement change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Unknown VM and creation is disabled.
    NotRegistered,
    /// The name is registered but not as a VM.
    NotAVm,
    /// Neither a VM record nor this hypervisor's own record.
    UnexpectedType(String),
    /// Already handled earlier in the same report.
    Duplicate,
}

/// One reconciliation step, in execution order.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Merge the hypervisor's own snapshot into its metadata.
    MergeSnapshot { metadata: Map<String, Value> },

    /// Register an unknown VM on this hypervisor.
    Create {
        vm_id: String,
        definition: Map<String, Value>,
        state: Option<String>,
    },

    /// Place an unplaced VM on this hypervisor.
    AutoAssign { vm_id: String },

    /// Persist a changed state.
    SyncState { vm_id: String, state: String },

    /// The VM is reported here but placed on another hypervisor.
    Conflict { vm_id: String, placed_on: String },

    /// Nothing to do for this record.
    Skip { name: String, reason: SkipReason },

    /// Placed here but no longer reported: clear the parent.
    Unassign { vm_id: String },
}

impl Step {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::MergeSnapshot { .. } => "merge_snapshot",
            Self::Create { .. } => "create",
            Self::AutoAssign { .. } => "auto_assign",
            Self::SyncState { .. } => "sync_state",
            Self::Conflict { .. } => "conflict",
            Self::Skip { .. } => "skip",
            Self::Unassign { .. } => "unassign",
        }
    }

    /// The VM this step changes or reports on, if any.
    pub fn vm_id(&self) -> Option<&str> {
        match self {
            Self::Create { vm_id, .. }
            | Self::AutoAssign { vm_id }
            | Self::SyncState { vm_id, .. }
            | Self::Conflict { vm_id, .. }
            | Self::Unassign { vm_id } => Some(vm_id),
            Self::MergeSnapshot { .. } | Self::Skip { .. } => None,
        }
    }
}

/// Plan the reconciliation of one hypervisor.
///
/// Records are handled in report order. Unassignments come last, for every
/// placed VM whose id appeared nowhere in the report.
pub fn plan(input: PlanInput<'_>) -> Vec<Step> {
    let PlanInput {
        hypervisor_id,
        report,
        known,
        placed,
        create_missing,
    } = input;

    let mut steps = Vec::new();
    let mut reported = BTreeSet::new();

    for record in report {
        if !reported.insert(record.name.clone()) {
            steps.push(Step::Skip {
                name: record.name,
                reason: SkipReason::Duplicate,
            });
            continue;
        }

        if record.name == hypervisor_id {
            steps.push(Step::MergeSnapshot {
                metadata: record.into_snapshot(),
            });
            continue;
        }

        if record.kind != VM_RECORD_TYPE {
            steps.push(Step::Skip {
                name: record.name,
                reason: SkipReason::UnexpectedType(record.kind),
            });
            continue;
        }

        let reported_state = record.current_state().map(str::to_string);
        let vm_id = record.name;

        let Some(node) = known.get(&vm_id) else {
            if create_missing {
                steps.push(Step::Create {
                    vm_id,
                    definition: record.definition,
                    state: reported_state,
                });
            } else {
                steps.push(Step::Skip {
                    name: vm_id,
                    reason: SkipReason::NotRegistered,
                });
            }
            continue;
        };

        if !node.is_vm {
            steps.push(Step::Skip {
                name: vm_id,
                reason: SkipReason::NotAVm,
            });
            continue;
        }

        match node.parent.as_deref() {
            None => steps.push(Step::AutoAssign {
                vm_id: vm_id.clone(),
            }),
            Some(parent) if parent == hypervisor_id => {}
            Some(parent) => {
                steps.push(Step::Conflict {
                    vm_id,
                    placed_on: parent.to_string(),
                });
                continue;
            }
        }

        if let Some(state) = reported_state.filter(|state| *state != node.state) {
            steps.push(Step::SyncState { vm_id, state });
        }
    }

    for vm_id in placed {
        if !reported.contains(&vm_id) {
            steps.push(Step::Unassign { vm_id });
        }
    }

    steps
}

/// Outcome counters for one poll cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollStats {
    pub hypervisors_polled: u32,
    pub hypervisors_failed: u32,
    pub vms_created: u32,
    pub vms_assigned: u32,
    pub vms_unassigned: u32,
    pub states_updated: u32,
    pub conflicts: u32,
    pub skipped: u32,
    /// Steps the registry rejected.
    pub step_errors: u32,
}

impl PollStats {
    /// Count one successfully applied step.
    pub fn record(&mut self, step: &Step) {
        match step {
            Step::MergeSnapshot { .. } => {}
            Step::Create { .. } => self.vms_created += 1,
            Step::AutoAssign { .. } => self.vms_assigned += 1,
            Step::SyncState { .. } => self.states_updated += 1,
            Step::Conflict { .. } => self.conflicts += 1,
            Step::Skip { .. } => self.skipped += 1,
            Step::Unassign { .. } => self.vms_unassigned += 1,
        }
    }

    pub fn merge(&mut self, other: &PollStats) {
        self.hypervisors_polled += other.hypervisors_polled;
        self.hypervisors_failed += other.hypervisors_failed;
        self.vms_created += other.vms_created;
        self.vms_assigned += other.vms_assigned;
        self.vms_unassigned += other.vms_unassigned;
        self.states_updated += other.states_updated;
        self.conflicts += other.conflicts;
        self.skipped += other.skipped;
        self.step_errors += other.step_errors;
    }

    /// Returns true if the cycle changed nothing in the registry.
    pub fn is_quiet(&self) -> bool {
        self.vms_created == 0
            && self.vms_assigned == 0
            && self.vms_unassigned == 0
            && self.states_updated == 0
    }
}
