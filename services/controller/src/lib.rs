//! # vagoth-controller
//!
//! The cluster controller. It tracks hypervisors and the virtual machines
//! placed on them in a [`vagoth_registry::Registry`], keeps that registry in
//! line with what hypervisors report, and carries out lifecycle actions
//! through pluggable drivers.
//!
//! ## Architecture
//!
//! - **Manager**: composition root holding the registry and collaborators
//! - **Node views**: [`Hypervisor`] and [`VirtualMachine`] over registry snapshots
//! - **Drivers**: one [`Driver`] per hypervisor backend, built from config
//! - **Actions and schedulers**: lifecycle requests, run inline or queued
//! - **Monitor**: polls drivers and reconciles placement and state
//! - **Index cleanup**: repairs the unique-key index after crashes

pub mod action;
pub mod allocator;
pub mod cleanup;
pub mod config;
pub mod driver;
pub mod error;
pub mod manager;
pub mod monitor;
pub mod node;
pub mod provisioner;
pub mod scheduler;
pub mod transaction;

pub use action::Action;
pub use config::{Config, ConfigError};
pub use driver::{Driver, DriverSettings, DriverTable, DummyDriver, MockDriver, VmOperation};
pub use error::{ControllerError, ControllerResult, DriverError, ProvisioningError};
pub use manager::Manager;
pub use monitor::Monitor;
pub use node::{Hypervisor, Node, NodeKind, NodeView, VirtualMachine};
pub use transaction::Transaction;
