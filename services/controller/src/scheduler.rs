//! Action execution policy.
//!
//! Node views never run actions themselves; they hand them to a
//! [`Scheduler`]. The synchronous scheduler runs them on the spot, the
//! background scheduler queues them to one worker task.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::action::Action;
use crate::config::SchedulerKind;
use crate::error::{ControllerError, ControllerResult};
use crate::manager::Manager;
use crate::transaction::{self, TxContext};

#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Run or queue `action`.
    async fn schedule(&self, manager: &Arc<Manager>, action: Action) -> ControllerResult<()>;

    /// Stop accepting actions and finish queued ones.
    async fn shutdown(&self) {}
}

/// Build the scheduler selected in config.
pub fn build(kind: SchedulerKind) -> Arc<dyn Scheduler> {
    match kind {
        SchedulerKind::Sync => Arc::new(SyncScheduler),
        SchedulerKind::Background => Arc::new(BackgroundScheduler::start()),
    }
}

/// Runs each action in the caller's task and returns its result.
#[derive(Debug, Default)]
pub struct SyncScheduler;

#[async_trait]
impl Scheduler for SyncScheduler {
    async fn schedule(&self, manager: &Arc<Manager>, action: Action) -> ControllerResult<()> {
        manager.action(action).await
    }
}

struct Job {
    manager: Arc<Manager>,
    action: Action,
    context: Option<TxContext>,
}

/// Queues actions to a single worker task, so they run in submission order.
///
/// `schedule` returns as soon as the action is queued; failures are logged
/// by the worker.
pub struct BackgroundScheduler {
    sender: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl BackgroundScheduler {
    /// Spawn the worker. Must be called inside a tokio runtime.
    pub fn start() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_worker(receiver));
        Self {
            sender: Mutex::new(Some(sender)),
            worker: tokio::sync::Mutex::new(Some(worker)),
        }
    }
}

async fn run_worker(mut receiver: mpsc::UnboundedReceiver<Job>) {
    debug!("Action worker started");
    while let Some(job) = receiver.recv().await {
        let Job {
            manager,
            action,
            context,
        } = job;
        let name = action.name();
        if transaction::resume(context, manager.action(action)).await.is_err() {
            debug!(action = name, "Queued action failed");
        }
    }
    debug!("Action worker stopped");
}

#[async_trait]
impl Scheduler for BackgroundScheduler {
    async fn schedule(&self, manager: &Arc<Manager>, action: Action) -> ControllerResult<()> {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(ControllerError::SchedulerClosed)?;

        debug!(action = action.name(), queue = %action.queue(), "Queueing action");
        sender
            .send(Job {
                manager: Arc::clone(manager),
                action,
                context: transaction::current(),
            })
            .map_err(|_| ControllerError::SchedulerClosed)
    }

    async fn shutdown(&self) {
        // Dropping the last sender lets the worker drain the queue and exit.
        drop(
            self.sender
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );

        if let Some(worker) = self.worker.lock().await.take() {
            info!("Waiting for queued actions");
            if let Err(e) = worker.await {
                warn!(error = %e, "Action worker panicked");
            }
        }
    }
}
