//! Coordinator: drives workflow instances through their graphs.
//!
//! Each attached instance owns a `tokio::sync::Mutex<Runtime>`; whoever holds
//! it is the instance's only driver. `advance`, `resume` and `retry` acquire
//! it with `try_lock` and fail fast with [`EngineError::AlreadyRunning`]
//! otherwise. The driver loop alternates between two frontier shapes:
//!
//! - `Frontier::Run(batch)`: every dispatch of the batch runs concurrently
//!   under the step executor. The batch is a join barrier; outputs merge in
//!   branch-index order and the result is checkpointed in one write.
//! - `Frontier::Route(done)`: outputs are merged but transitions are not
//!   resolved yet. This is where interrupt-after points hold the instance.
//!
//! New runtime state becomes visible (in memory, to `status` and to
//! subscribers) only after its checkpoint has been persisted.
//!
//! Coordinators in other processes may share the checkpoint store. Before a
//! driver runs anything it claims the instance's lease in the store, reloads
//! the latest checkpoint, and renews the lease while it works. Instances that
//! reach a final status are dropped from memory and answered from the store.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::Stream;
use quill_types::checkpoint::{Checkpoint, Dispatch, Frontier};
use quill_types::config::EngineConfig;
use quill_types::error::StorageError;
use quill_types::event::WorkflowEvent;
use quill_types::state::{ERROR_LOG_FIELD, ErrorEntry, StateDelta, StateDocument};
use quill_types::status::{InstanceStatus, InstanceSummary, InterruptInfo, StatusReport};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use super::checkpoint::CheckpointWriter;
use super::executor::{StepError, StepExecutor};
use super::graph::{GraphDefinition, RoutingError};
use super::merge;
use super::step::{StepOutput, StepStatus};
use super::validation::ValidationError;
use crate::event::EventBus;
use crate::repository::checkpoint::{CheckpointStore, LeaseClaim, load_history};

/// Checkpoints fetched per page by [`Coordinator::history`].
const HISTORY_PAGE_SIZE: usize = 50;

/// How often `cancel` checks whether a remote driver has let go.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(50);

// ---------------------------------------------------------------------------
// Errors and snapshots
// ---------------------------------------------------------------------------

/// Errors returned to callers of the coordinator.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("workflow instance not found: {0}")]
    NotFound(Uuid),

    #[error("invalid state for instance {instance_id}: {reason}")]
    InvalidState { instance_id: Uuid, reason: String },

    #[error("instance {0} is already being driven by another caller")]
    AlreadyRunning(Uuid),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Checkpoints exist but this coordinator has no graph for the instance.
    #[error("instance {0} is not attached to this coordinator; recover it with its graph first")]
    Detached(Uuid),
}

/// What `advance`, `resume` and subscribers see of an instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceSnapshot {
    pub report: StatusReport,
    pub state: StateDocument,
}

impl InstanceSnapshot {
    pub fn status(&self) -> InstanceStatus {
        self.report.status
    }
}

impl From<&Checkpoint> for InstanceSnapshot {
    fn from(checkpoint: &Checkpoint) -> Self {
        Self {
            report: checkpoint.report(),
            state: checkpoint.state.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Per-instance runtime
// ---------------------------------------------------------------------------

/// Mutable driver state of one instance. Mirrors its latest checkpoint.
#[derive(Debug, Clone)]
struct Runtime {
    status: InstanceStatus,
    state: StateDocument,
    frontier: Frontier,
    sequence: u64,
    interrupt: Option<InterruptInfo>,
    error: Option<String>,
}

impl Runtime {
    fn to_checkpoint(&self, graph: &str) -> Checkpoint {
        Checkpoint {
            instance_id: self.state.instance_id(),
            sequence: self.sequence,
            graph: graph.to_string(),
            status: self.status,
            current_step: self.state.current_step().map(str::to_string),
            state: self.state.clone(),
            frontier: self.frontier.clone(),
            interrupt: self.interrupt.clone(),
            error: self.error.clone(),
            created_at: chrono::Utc::now(),
        }
    }

    fn record_error(&mut self, entry: ErrorEntry, graph: &GraphDefinition) {
        let delta = StateDelta::new().set(ERROR_LOG_FIELD, entry.to_value());
        merge::apply(&mut self.state, &delta, graph.policies());
    }
}

impl From<Checkpoint> for Runtime {
    fn from(checkpoint: Checkpoint) -> Self {
        Self {
            status: checkpoint.status,
            state: checkpoint.state,
            frontier: checkpoint.frontier,
            sequence: checkpoint.sequence,
            interrupt: checkpoint.interrupt,
            error: checkpoint.error,
        }
    }
}

struct InstanceHandle {
    graph: Arc<GraphDefinition>,
    runtime: Mutex<Runtime>,
    cancel: CancellationToken,
    snapshots: watch::Sender<InstanceSnapshot>,
}

impl InstanceHandle {
    fn snapshot(&self) -> InstanceSnapshot {
        self.snapshots.borrow().clone()
    }
}

enum Lookup {
    Attached(Arc<InstanceHandle>),
    /// Not held in memory and final; its latest checkpoint is the answer.
    Finished(Checkpoint),
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

struct Shared<S: CheckpointStore> {
    store: Arc<S>,
    writer: CheckpointWriter<S>,
    executor: StepExecutor,
    config: EngineConfig,
    events: EventBus,
    instances: DashMap<Uuid, Arc<InstanceHandle>>,
    /// Lease owner id of this coordinator.
    owner: Uuid,
}

/// Drives workflow instances and answers queries about them.
///
/// Cheap to clone; clones share instances, store, and event bus.
pub struct Coordinator<S: CheckpointStore + 'static> {
    inner: Arc<Shared<S>>,
}

impl<S: CheckpointStore + 'static> Clone for Coordinator<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: CheckpointStore + 'static> Coordinator<S> {
    pub fn new(store: Arc<S>, config: EngineConfig) -> Self {
        let events = EventBus::new(config.event_bus_capacity);
        Self {
            inner: Arc::new(Shared {
                writer: CheckpointWriter::new(Arc::clone(&store), &config, events.clone()),
                executor: StepExecutor::new(&config, events.clone()),
                store,
                config,
                events,
                instances: DashMap::new(),
                owner: Uuid::now_v7(),
            }),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn store(&self) -> &S {
        &self.inner.store
    }

    /// Number of unfinished instances held in memory.
    pub fn attached_len(&self) -> usize {
        self.inner.instances.len()
    }

    // -----------------------------------------------------------------------
    // Lifecycle operations
    // -----------------------------------------------------------------------

    /// Create an instance of `graph` seeded with `initial` and persist its
    /// first checkpoint. Nothing runs until [`Coordinator::advance`].
    pub async fn start(
        &self,
        graph: Arc<GraphDefinition>,
        initial: StateDelta,
    ) -> Result<Uuid, EngineError> {
        let instance_id = Uuid::now_v7();
        let mut state = StateDocument::new(instance_id);
        merge::apply(&mut state, &initial, graph.policies());

        let runtime = Runtime {
            status: InstanceStatus::Running,
            state,
            frontier: Frontier::Run(vec![Dispatch::to(graph.entry())]),
            sequence: 1,
            interrupt: None,
            error: None,
        };
        let checkpoint = runtime.to_checkpoint(graph.name());
        self.inner.writer.write(&checkpoint).await?;

        tracing::info!(instance_id = %instance_id, graph = graph.name(), "workflow instance started");
        self.inner.events.publish(WorkflowEvent::InstanceStarted {
            instance_id,
            graph: graph.name().to_string(),
        });
        self.attach(instance_id, graph, runtime, &checkpoint);
        Ok(instance_id)
    }

    /// Drive the instance until it completes, interrupts, fails, or is
    /// cancelled. A no-op on instances that are not running.
    pub async fn advance(&self, instance_id: Uuid) -> Result<InstanceSnapshot, EngineError> {
        let handle = match self.lookup(instance_id).await? {
            Lookup::Attached(handle) => handle,
            Lookup::Finished(checkpoint) => return Ok(InstanceSnapshot::from(&checkpoint)),
        };
        let mut runtime = handle
            .runtime
            .try_lock()
            .map_err(|_| EngineError::AlreadyRunning(instance_id))?;
        if runtime.status.is_final() {
            return Ok(handle.snapshot());
        }

        self.claim(&handle, &mut runtime).await?;
        let result = self.advance_claimed(&handle, &mut runtime).await;
        self.release(instance_id).await;
        result.map(|()| handle.snapshot())
    }

    /// Supply feedback to an interrupted instance and keep driving it.
    ///
    /// `feedback` must populate the graph's feedback field. On any rejection
    /// the instance is left untouched.
    pub async fn resume(
        &self,
        instance_id: Uuid,
        feedback: StateDelta,
    ) -> Result<InstanceSnapshot, EngineError> {
        let handle = match self.lookup(instance_id).await? {
            Lookup::Attached(handle) => handle,
            Lookup::Finished(checkpoint) => {
                return Err(EngineError::InvalidState {
                    instance_id,
                    reason: format!("cannot resume a {} instance", checkpoint.status),
                });
            }
        };
        let mut runtime = handle
            .runtime
            .try_lock()
            .map_err(|_| EngineError::AlreadyRunning(instance_id))?;

        self.claim(&handle, &mut runtime).await?;
        let result = self.resume_claimed(&handle, &mut runtime, feedback).await;
        self.release(instance_id).await;
        result.map(|()| handle.snapshot())
    }

    /// Re-arm a failed instance from its last checkpoint and drive it again.
    ///
    /// The failed batch (or route) is attempted afresh; the error log keeps
    /// the earlier failures.
    pub async fn retry(&self, instance_id: Uuid) -> Result<InstanceSnapshot, EngineError> {
        let handle = match self.lookup(instance_id).await? {
            Lookup::Attached(handle) => handle,
            Lookup::Finished(checkpoint) => {
                return Err(EngineError::InvalidState {
                    instance_id,
                    reason: format!("only failed instances can be retried, this one is {}", checkpoint.status),
                });
            }
        };
        let mut runtime = handle
            .runtime
            .try_lock()
            .map_err(|_| EngineError::AlreadyRunning(instance_id))?;

        self.claim(&handle, &mut runtime).await?;
        let result = self.retry_claimed(&handle, &mut runtime).await;
        self.release(instance_id).await;
        result.map(|()| handle.snapshot())
    }

    /// Abort the instance.
    ///
    /// Cancels every in-flight branch, waits for the driver to stop, and
    /// writes one final `Cancelled` checkpoint. A driver in another process
    /// is asked to stop through the store and observes the request when it
    /// next renews its lease. Completed and cancelled instances are left as
    /// they are.
    pub async fn cancel(&self, instance_id: Uuid) -> Result<(), EngineError> {
        let handle = match self.lookup(instance_id).await? {
            Lookup::Attached(handle) => handle,
            Lookup::Finished(_) => return Ok(()),
        };
        handle.cancel.cancel();

        let mut runtime = handle.runtime.lock().await;
        if runtime.status.is_final() {
            return Ok(());
        }

        self.claim_for_cancel(instance_id).await?;
        let result = self.cancel_claimed(&handle, &mut runtime).await;
        self.release(instance_id).await;
        result
    }

    /// Drive the instance on a background task.
    pub fn spawn_advance(&self, instance_id: Uuid) -> JoinHandle<Result<InstanceSnapshot, EngineError>> {
        let coordinator = self.clone();
        tokio::spawn(async move { coordinator.advance(instance_id).await })
    }

    /// Reattach an instance from its latest checkpoint, e.g. after a restart.
    ///
    /// `graph` must be the definition the instance was started with. Already
    /// attached instances are returned as they are; finished instances are
    /// reported without being attached.
    pub async fn recover(
        &self,
        graph: Arc<GraphDefinition>,
        instance_id: Uuid,
    ) -> Result<InstanceSnapshot, EngineError> {
        if let Some(handle) = self.attached(&instance_id) {
            return Ok(handle.snapshot());
        }

        let checkpoint = self
            .inner
            .store
            .load_latest(&instance_id)
            .await?
            .ok_or(EngineError::NotFound(instance_id))?;

        if checkpoint.graph != graph.name() {
            return Err(EngineError::Configuration(format!(
                "instance {instance_id} runs graph '{}', not '{}'",
                checkpoint.graph,
                graph.name()
            )));
        }
        if let Some(unknown) = checkpoint
            .frontier
            .step_names()
            .into_iter()
            .find(|step| !graph.contains(step))
        {
            return Err(EngineError::Configuration(format!(
                "instance {instance_id} is pending on step '{unknown}' which graph '{}' does not define",
                graph.name()
            )));
        }

        if checkpoint.status.is_final() {
            return Ok(InstanceSnapshot::from(&checkpoint));
        }

        tracing::info!(
            instance_id = %instance_id,
            graph = graph.name(),
            sequence = checkpoint.sequence,
            status = %checkpoint.status,
            "workflow instance recovered"
        );
        let handle = self.attach(instance_id, graph, Runtime::from(checkpoint.clone()), &checkpoint);
        Ok(handle.snapshot())
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Status of the instance as of its latest checkpoint.
    pub async fn status(&self, instance_id: Uuid) -> Result<StatusReport, EngineError> {
        if let Some(handle) = self.attached(&instance_id) {
            return Ok(handle.snapshot().report);
        }
        self.inner
            .store
            .load_latest(&instance_id)
            .await?
            .map(|checkpoint| checkpoint.report())
            .ok_or(EngineError::NotFound(instance_id))
    }

    /// Lazy, restartable stream of the instance's checkpoints, oldest first.
    ///
    /// Fails with [`EngineError::NotFound`] for an instance without
    /// checkpoints.
    pub async fn history(
        &self,
        instance_id: Uuid,
    ) -> Result<impl Stream<Item = Result<Checkpoint, StorageError>> + Send + '_, EngineError> {
        if self.attached(&instance_id).is_none()
            && self.inner.store.load_latest(&instance_id).await?.is_none()
        {
            return Err(EngineError::NotFound(instance_id));
        }
        Ok(load_history(self.inner.store.as_ref(), instance_id, HISTORY_PAGE_SIZE))
    }

    /// Watch the instance's committed snapshots.
    ///
    /// A finished instance yields a receiver that holds its final snapshot
    /// and never changes.
    pub async fn subscribe(
        &self,
        instance_id: Uuid,
    ) -> Result<watch::Receiver<InstanceSnapshot>, EngineError> {
        match self.lookup(instance_id).await? {
            Lookup::Attached(handle) => Ok(handle.snapshots.subscribe()),
            Lookup::Finished(checkpoint) => {
                let (_, receiver) = watch::channel(InstanceSnapshot::from(&checkpoint));
                Ok(receiver)
            }
        }
    }

    /// Latest checkpoint header of every stored instance.
    pub async fn list_instances(
        &self,
        status: Option<InstanceStatus>,
    ) -> Result<Vec<InstanceSummary>, EngineError> {
        Ok(self.inner.store.list_instances(status).await?)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn attached(&self, instance_id: &Uuid) -> Option<Arc<InstanceHandle>> {
        self.inner
            .instances
            .get(instance_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    async fn lookup(&self, instance_id: Uuid) -> Result<Lookup, EngineError> {
        if let Some(handle) = self.attached(&instance_id) {
            return Ok(Lookup::Attached(handle));
        }
        match self.inner.store.load_latest(&instance_id).await? {
            Some(checkpoint) if checkpoint.status.is_final() => Ok(Lookup::Finished(checkpoint)),
            Some(_) => Err(EngineError::Detached(instance_id)),
            None => Err(EngineError::NotFound(instance_id)),
        }
    }

    fn detach(&self, instance_id: Uuid) {
        if self.inner.instances.remove(&instance_id).is_some() {
            tracing::debug!(instance_id = %instance_id, "finished instance released from memory");
        }
    }

    fn attach(
        &self,
        instance_id: Uuid,
        graph: Arc<GraphDefinition>,
        runtime: Runtime,
        checkpoint: &Checkpoint,
    ) -> Arc<InstanceHandle> {
        let (snapshots, _) = watch::channel(InstanceSnapshot::from(checkpoint));
        let handle = Arc::new(InstanceHandle {
            graph,
            runtime: Mutex::new(runtime),
            cancel: CancellationToken::new(),
            snapshots,
        });
        Arc::clone(
            self.inner
                .instances
                .entry(instance_id)
                .or_insert(handle)
                .value(),
        )
    }

    /// Persist `next` as the instance's new checkpoint, then make it current.
    ///
    /// A sequence conflict means another coordinator got there first: the
    /// runtime is reloaded from the store and the caller backs off.
    async fn commit(
        &self,
        handle: &InstanceHandle,
        runtime: &mut Runtime,
        mut next: Runtime,
    ) -> Result<(), EngineError> {
        next.sequence = runtime.sequence + 1;
        let checkpoint = next.to_checkpoint(handle.graph.name());
        match self.inner.writer.write(&checkpoint).await {
            Ok(()) => {}
            Err(StorageError::Conflict(reason)) => {
                tracing::warn!(
                    instance_id = %checkpoint.instance_id,
                    reason = reason.as_str(),
                    "instance was advanced by another coordinator"
                );
                self.refresh(handle, runtime).await?;
                return Err(EngineError::AlreadyRunning(checkpoint.instance_id));
            }
            Err(e) => return Err(e.into()),
        }

        let previous = std::mem::replace(runtime, next);
        handle.snapshots.send_replace(InstanceSnapshot::from(&checkpoint));
        self.announce(&previous, &checkpoint);
        if checkpoint.status.is_final() {
            self.detach(checkpoint.instance_id);
        }
        Ok(())
    }

    /// Catch the runtime up with checkpoints written by other coordinators.
    async fn refresh(&self, handle: &InstanceHandle, runtime: &mut Runtime) -> Result<(), EngineError> {
        let instance_id = runtime.state.instance_id();
        let Some(latest) = self.inner.store.load_latest(&instance_id).await? else {
            return Ok(());
        };
        if latest.sequence <= runtime.sequence {
            return Ok(());
        }

        tracing::debug!(
            instance_id = %instance_id,
            from = runtime.sequence,
            to = latest.sequence,
            "reloading instance advanced elsewhere"
        );
        handle.snapshots.send_replace(InstanceSnapshot::from(&latest));
        *runtime = Runtime::from(latest);
        if runtime.status.is_final() {
            self.detach(instance_id);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Driver lease
    // -----------------------------------------------------------------------

    /// Take the instance's lease and load anything written while we did not
    /// hold it. Fails with `AlreadyRunning` while another coordinator drives.
    async fn claim(&self, handle: &InstanceHandle, runtime: &mut Runtime) -> Result<(), EngineError> {
        let instance_id = runtime.state.instance_id();
        let claim = self
            .inner
            .store
            .claim(&instance_id, self.inner.owner, self.inner.config.driver_lease())
            .await?;
        if claim == LeaseClaim::Busy {
            tracing::debug!(instance_id = %instance_id, "instance is driven by another coordinator");
            return Err(EngineError::AlreadyRunning(instance_id));
        }

        if let Err(e) = self.refresh(handle, runtime).await {
            self.release(instance_id).await;
            return Err(e);
        }
        Ok(())
    }

    /// Renew the lease. Returns whether another coordinator asked for the
    /// instance to be cancelled, in which case the local token is tripped.
    async fn renew(&self, handle: &InstanceHandle, instance_id: Uuid) -> Result<bool, EngineError> {
        let claim = self
            .inner
            .store
            .claim(&instance_id, self.inner.owner, self.inner.config.driver_lease())
            .await?;
        match claim {
            LeaseClaim::Busy => {
                tracing::warn!(instance_id = %instance_id, "driver lease lost to another coordinator");
                Err(EngineError::AlreadyRunning(instance_id))
            }
            LeaseClaim::Held { cancel_requested } => {
                if cancel_requested && !handle.cancel.is_cancelled() {
                    tracing::info!(instance_id = %instance_id, "cancellation requested by another coordinator");
                    handle.cancel.cancel();
                }
                Ok(cancel_requested)
            }
        }
    }

    /// Renewal while branches run; failures only log, the next commit decides.
    async fn keep_lease(&self, handle: &InstanceHandle, instance_id: Uuid) {
        if let Err(e) = self.renew(handle, instance_id).await {
            tracing::warn!(instance_id = %instance_id, error = %e, "could not renew driver lease");
        }
    }

    async fn release(&self, instance_id: Uuid) {
        if let Err(e) = self.inner.store.release(&instance_id, self.inner.owner).await {
            tracing::warn!(instance_id = %instance_id, error = %e, "could not release driver lease, it will expire");
        }
    }

    /// Wait for the lease, asking its current holder to cancel meanwhile.
    async fn claim_for_cancel(&self, instance_id: Uuid) -> Result<(), EngineError> {
        let lease = self.inner.config.driver_lease();
        let deadline = tokio::time::Instant::now() + lease * 2;
        loop {
            let claim = self.inner.store.claim(&instance_id, self.inner.owner, lease).await?;
            if claim != LeaseClaim::Busy {
                return Ok(());
            }
            if self.inner.store.request_cancel(&instance_id).await? {
                tracing::debug!(instance_id = %instance_id, "waiting for remote driver to cancel");
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(EngineError::AlreadyRunning(instance_id));
            }
            tokio::time::sleep(CANCEL_POLL_INTERVAL).await;
        }
    }

    fn renew_interval(&self) -> Duration {
        (self.inner.config.driver_lease() / 3).max(Duration::from_millis(10))
    }

    // -----------------------------------------------------------------------
    // Claimed operations
    // -----------------------------------------------------------------------

    async fn advance_claimed(&self, handle: &InstanceHandle, runtime: &mut Runtime) -> Result<(), EngineError> {
        if runtime.status != InstanceStatus::Running {
            tracing::debug!(instance_id = %runtime.state.instance_id(), status = %runtime.status, "advance is a no-op");
            return Ok(());
        }
        self.drive(handle, runtime).await
    }

    async fn resume_claimed(
        &self,
        handle: &InstanceHandle,
        runtime: &mut Runtime,
        feedback: StateDelta,
    ) -> Result<(), EngineError> {
        let instance_id = runtime.state.instance_id();
        if runtime.status != InstanceStatus::Interrupted {
            return Err(EngineError::InvalidState {
                instance_id,
                reason: format!("cannot resume a {} instance", runtime.status),
            });
        }
        handle
            .graph
            .interrupts()
            .check_resume(&feedback)
            .map_err(|reason| EngineError::InvalidState {
                instance_id,
                reason,
            })?;

        let mut next = runtime.clone();
        merge::apply(&mut next.state, &feedback, handle.graph.policies());
        next.status = InstanceStatus::Running;
        next.interrupt = None;
        self.commit(handle, runtime, next).await?;

        self.drive(handle, runtime).await
    }

    async fn retry_claimed(&self, handle: &InstanceHandle, runtime: &mut Runtime) -> Result<(), EngineError> {
        if runtime.status != InstanceStatus::Failed {
            return Err(EngineError::InvalidState {
                instance_id: runtime.state.instance_id(),
                reason: format!("only failed instances can be retried, this one is {}", runtime.status),
            });
        }

        let mut next = runtime.clone();
        next.status = InstanceStatus::Running;
        next.error = None;
        self.commit(handle, runtime, next).await?;

        self.drive(handle, runtime).await
    }

    async fn cancel_claimed(&self, handle: &InstanceHandle, runtime: &mut Runtime) -> Result<(), EngineError> {
        self.refresh(handle, runtime).await?;
        self.finish_cancel(handle, runtime).await
    }

    /// Publish the lifecycle event for a status change.
    fn announce(&self, previous: &Runtime, checkpoint: &Checkpoint) {
        if previous.status == checkpoint.status {
            return;
        }
        let instance_id = checkpoint.instance_id;
        let event = match checkpoint.status {
            InstanceStatus::Running => {
                let step = previous.interrupt.as_ref().map(|i| i.step.clone());
                tracing::info!(instance_id = %instance_id, from = %previous.status, "workflow instance resumed");
                WorkflowEvent::InstanceResumed { instance_id, step }
            }
            InstanceStatus::Interrupted => {
                let Some(info) = checkpoint.interrupt.as_ref() else {
                    return;
                };
                tracing::info!(
                    instance_id = %instance_id,
                    step = info.step.as_str(),
                    position = %info.position,
                    "workflow instance interrupted, waiting for feedback"
                );
                WorkflowEvent::InstanceInterrupted {
                    instance_id,
                    step: info.step.clone(),
                    position: info.position,
                }
            }
            InstanceStatus::Completed => {
                tracing::info!(
                    instance_id = %instance_id,
                    step_count = checkpoint.state.step_count(),
                    "workflow instance completed"
                );
                WorkflowEvent::InstanceCompleted {
                    instance_id,
                    step_count: checkpoint.state.step_count(),
                }
            }
            InstanceStatus::Failed => {
                let error = checkpoint.error.clone().unwrap_or_default();
                tracing::warn!(instance_id = %instance_id, error = error.as_str(), "workflow instance failed");
                WorkflowEvent::InstanceFailed { instance_id, error }
            }
            InstanceStatus::Cancelled => {
                tracing::info!(instance_id = %instance_id, "workflow instance cancelled");
                WorkflowEvent::InstanceCancelled { instance_id }
            }
        };
        self.inner.events.publish(event);
    }

    async fn finish_cancel(
        &self,
        handle: &InstanceHandle,
        runtime: &mut Runtime,
    ) -> Result<(), EngineError> {
        if runtime.status.is_final() {
            return Ok(());
        }
        let mut next = runtime.clone();
        next.status = InstanceStatus::Cancelled;
        next.interrupt = None;
        self.commit(handle, runtime, next).await
    }

    /// The scheduler loop. Holds the instance lock for its whole duration.
    async fn drive(&self, handle: &InstanceHandle, runtime: &mut Runtime) -> Result<(), EngineError> {
        let instance_id = runtime.state.instance_id();
        let span = tracing::info_span!("advance", instance_id = %instance_id, graph = handle.graph.name());
        self.drive_loop(handle, runtime).instrument(span).await
    }

    async fn drive_loop(&self, handle: &InstanceHandle, runtime: &mut Runtime) -> Result<(), EngineError> {
        let graph = Arc::clone(&handle.graph);
        let instance_id = runtime.state.instance_id();
        let max_batches = self.inner.config.max_batches_per_advance;
        let mut batches: u32 = 0;

        while runtime.status == InstanceStatus::Running {
            self.renew(handle, instance_id).await?;
            if handle.cancel.is_cancelled() {
                return self.finish_cancel(handle, runtime).await;
            }

            match runtime.frontier.clone() {
                Frontier::Run(batch) if batch.is_empty() => {
                    let mut next = runtime.clone();
                    next.status = InstanceStatus::Completed;
                    self.commit(handle, runtime, next).await?;
                }
                Frontier::Run(batch) => {
                    if let Some(info) = graph.interrupts().pending_before(&batch, &runtime.state) {
                        let mut next = runtime.clone();
                        next.status = InstanceStatus::Interrupted;
                        next.interrupt = Some(info);
                        self.commit(handle, runtime, next).await?;
                        continue;
                    }

                    if batches >= max_batches {
                        let mut next = runtime.clone();
                        let names = join_names(batch.iter().map(|d| d.step.as_str()));
                        let cause = format!("step limit reached: {max_batches} batches in one advance");
                        next.record_error(
                            ErrorEntry {
                                step: names,
                                cause: cause.clone(),
                                retryable: false,
                                attempts: 0,
                                at: chrono::Utc::now(),
                            },
                            &graph,
                        );
                        next.status = InstanceStatus::Failed;
                        next.error = Some(cause);
                        self.commit(handle, runtime, next).await?;
                        continue;
                    }

                    batches += 1;
                    self.run_batch(handle, runtime, &batch).await?;
                }
                Frontier::Route(done) => {
                    let next = route(&graph, runtime.clone(), done);
                    self.commit(handle, runtime, next).await?;
                }
            }
        }
        Ok(())
    }

    /// Run one batch behind a join barrier and commit its outcome.
    async fn run_batch(
        &self,
        handle: &InstanceHandle,
        runtime: &mut Runtime,
        batch: &[Dispatch],
    ) -> Result<(), EngineError> {
        let graph = Arc::clone(&handle.graph);
        let instance_id = runtime.state.instance_id();

        tracing::debug!(
            instance_id = %instance_id,
            steps = %join_names(batch.iter().map(|d| d.step.as_str())),
            "running batch"
        );

        let mut results: Vec<Option<Result<StepOutput, StepError>>> =
            (0..batch.len()).map(|_| None).collect();
        let mut join_set = JoinSet::new();

        for (index, dispatch) in batch.iter().enumerate() {
            let Some(entry) = graph.step(&dispatch.step).cloned() else {
                results[index] = Some(Err(StepError {
                    step: dispatch.step.clone(),
                    cause: RoutingError::UnknownStep(dispatch.step.clone()).to_string(),
                    retryable: false,
                    attempts: 0,
                    cancelled: false,
                }));
                continue;
            };

            let reads = entry.reads();
            let view = runtime
                .state
                .view(&dispatch.step, reads.as_deref(), dispatch.payload.clone());
            let executor = self.inner.executor.clone();
            let cancel = handle.cancel.clone();

            join_set.spawn(async move {
                let result = executor.run(instance_id, &entry, view, &cancel).await;
                (index, result)
            });
        }

        // Join barrier: siblings keep running when one of them fails. The
        // lease is renewed while they run.
        let every = self.renew_interval();
        let mut lease_ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
        lease_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                joined = join_set.join_next() => match joined {
                    Some(Ok((index, result))) => results[index] = Some(result),
                    Some(Err(e)) => {
                        tracing::error!(instance_id = %instance_id, error = %e, "branch task did not finish");
                    }
                    None => break,
                },
                _ = lease_ticker.tick() => self.keep_lease(handle, instance_id).await,
            }
        }

        let results: Vec<Result<StepOutput, StepError>> = results
            .into_iter()
            .zip(batch)
            .map(|(result, dispatch)| {
                result.unwrap_or_else(|| {
                    Err(StepError {
                        step: dispatch.step.clone(),
                        cause: "branch task aborted".to_string(),
                        retryable: false,
                        attempts: 0,
                        cancelled: false,
                    })
                })
            })
            .collect();

        let cancelled = results
            .iter()
            .any(|r| matches!(r, Err(e) if e.cancelled));
        if cancelled || handle.cancel.is_cancelled() {
            return self.finish_cancel(handle, runtime).await;
        }

        let failures: Vec<&StepError> = results.iter().filter_map(|r| r.as_ref().err()).collect();
        if let Some(first) = failures.first() {
            // Completed siblings are not merged; the batch reruns as a whole.
            let mut next = runtime.clone();
            for failure in &failures {
                next.record_error(
                    ErrorEntry {
                        step: failure.step.clone(),
                        cause: failure.cause.clone(),
                        retryable: failure.retryable,
                        attempts: failure.attempts,
                        at: chrono::Utc::now(),
                    },
                    &graph,
                );
            }
            next.status = InstanceStatus::Failed;
            next.error = Some(first.to_string());
            return self.commit(handle, runtime, next).await;
        }

        let outputs: Vec<StepOutput> = results.into_iter().filter_map(Result::ok).collect();
        for (dispatch, output) in batch.iter().zip(&outputs) {
            if let StepStatus::Skipped { reason } = &output.status {
                tracing::debug!(instance_id = %instance_id, step = dispatch.step.as_str(), reason = reason.as_str(), "step skipped");
            }
            let routes_to_self = graph
                .successors(&dispatch.step)
                .iter()
                .any(|t| t.step_name() == Some(dispatch.step.as_str()));
            if routes_to_self && output.delta.is_empty() {
                tracing::warn!(
                    instance_id = %instance_id,
                    step = dispatch.step.as_str(),
                    "step may route to itself without changing state"
                );
            }
        }

        let names: Vec<String> = batch.iter().map(|d| d.step.clone()).collect();
        let mut next = runtime.clone();
        next.state = merge::merge_all(&runtime.state, outputs.iter().map(|o| &o.delta), graph.policies());
        next.state.record_steps(batch.len() as u64);
        next.state.set_current_step(join_names(names.iter().map(String::as_str)));

        // Resolve routing in the same checkpoint unless an interrupt-after
        // point holds the instance at the route stage.
        let next = route(&graph, next, names);
        self.commit(handle, runtime, next).await
    }
}

/// Resolve the transitions of a finished batch.
///
/// Pure: returns the candidate runtime, which is interrupted (after-point
/// without feedback), failed (routing error), completed (empty union), or
/// running with the next batch.
fn route(graph: &GraphDefinition, mut next: Runtime, done: Vec<String>) -> Runtime {
    let interrupts = graph.interrupts();

    if let Some(info) = interrupts.pending_after(&done, &next.state) {
        next.status = InstanceStatus::Interrupted;
        next.interrupt = Some(info);
        next.frontier = Frontier::Route(done);
        return next;
    }

    match graph.resolve_batch(&done, &next.state) {
        Err(e) => {
            next.record_error(
                ErrorEntry {
                    step: e.step().to_string(),
                    cause: e.to_string(),
                    retryable: false,
                    attempts: 0,
                    at: chrono::Utc::now(),
                },
                graph,
            );
            next.status = InstanceStatus::Failed;
            next.error = Some(format!("configuration error: {e}"));
            next.frontier = Frontier::Route(done);
        }
        Ok(batch) => {
            if let Some(consumed) = interrupts.consume(&done, &next.state) {
                merge::apply(&mut next.state, &consumed, graph.policies());
            }
            if batch.is_empty() {
                next.status = InstanceStatus::Completed;
            }
            next.frontier = Frontier::Run(batch);
        }
    }
    next
}

fn join_names<'a>(names: impl Iterator<Item = &'a str>) -> String {
    names.collect::<Vec<_>>().join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::{Duration, Instant};

    use futures_util::StreamExt;
    use quill_types::state::{DEFAULT_FEEDBACK_FIELD, FEEDBACK_LOG_FIELD, InputView, MergePolicy};
    use quill_types::status::InterruptPosition;
    use serde_json::{Value, json};

    use crate::event::bus::drain_for;
    use crate::repository::memory::InMemoryCheckpointStore;
    use crate::workflow::checkpoint::tests::FlakyStore;
    use crate::workflow::graph::{BranchKey, END, GraphBuilder};
    use crate::workflow::step::{FnStep, Step, StepFailure};

    fn fast_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.step_timeout_secs = 5;
        config.retry.base_delay_ms = 5;
        config.retry.max_delay_ms = 50;
        config.checkpoint_retry_delay_ms = 1;
        config
    }

    fn engine() -> (Coordinator<InMemoryCheckpointStore>, Arc<InMemoryCheckpointStore>) {
        let store = Arc::new(InMemoryCheckpointStore::new());
        (Coordinator::new(Arc::clone(&store), fast_config()), store)
    }

    /// Step that counts its invocations and writes `field = value`.
    fn counting(calls: &Arc<AtomicU32>, field: &'static str, value: Value) -> impl Step + 'static {
        let calls = Arc::clone(calls);
        FnStep::new(move |_v: InputView| {
            calls.fetch_add(1, Ordering::SeqCst);
            let value = value.clone();
            async move { Ok(StepOutput::new(StateDelta::new().set(field, value))) }
        })
    }

    fn noop() -> impl Step + 'static {
        FnStep::new(|_v: InputView| async { Ok::<_, StepFailure>(StepOutput::new(StateDelta::new())) })
    }

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    enum Gate {
        Ok,
        Retry,
    }

    impl BranchKey for Gate {
        fn all() -> Option<Vec<Self>> {
            Some(vec![Gate::Ok, Gate::Retry])
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    enum Review {
        Approve,
        Revise,
        Pending,
    }

    impl BranchKey for Review {
        fn all() -> Option<Vec<Self>> {
            Some(vec![Review::Approve, Review::Revise, Review::Pending])
        }
    }

    fn review_decision(state: &StateDocument) -> Review {
        match state.get_as::<String>(DEFAULT_FEEDBACK_FIELD).as_deref() {
            Some("approve") => Review::Approve,
            Some("revise") => Review::Revise,
            _ => Review::Pending,
        }
    }

    /// draft -> review (interrupt before) -> approve: publish | revise: draft.
    fn review_graph(drafts: &Arc<AtomicU32>, reviews: &Arc<AtomicU32>) -> Arc<GraphDefinition> {
        Arc::new(
            GraphBuilder::new("review")
                .add_step("draft", counting(drafts, "draft", json!("v")))
                .add_step("review", counting(reviews, "reviewed", json!(true)))
                .add_step("publish", counting(&Arc::new(AtomicU32::new(0)), "published", json!(true)))
                .add_edge("draft", "review")
                .add_conditional_edges(
                    "review",
                    review_decision,
                    [
                        (Review::Approve, "publish"),
                        (Review::Revise, "draft"),
                        (Review::Pending, END),
                    ],
                )
                .add_edge("publish", END)
                .interrupt_before("review")
                .set_entry("draft")
                .build()
                .unwrap(),
        )
    }

    async fn checkpoints(coordinator: &Coordinator<InMemoryCheckpointStore>, id: Uuid) -> Vec<Checkpoint> {
        coordinator
            .history(id)
            .await
            .unwrap()
            .map(|c| c.unwrap())
            .collect()
            .await
    }

    // -----------------------------------------------------------------------
    // Scenarios
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn conditional_self_loop_runs_until_ok() {
        let (coordinator, _store) = engine();
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);

        let graph = GraphBuilder::new("retry-loop")
            .add_step(
                "a",
                FnStep::new(move |view: InputView| {
                    c.fetch_add(1, Ordering::SeqCst);
                    let count = view.get_as::<u64>("retry_count").unwrap_or(0);
                    async move { Ok(StepOutput::new(StateDelta::new().set("retry_count", count + 1))) }
                })
                .with_reads(["retry_count"]),
            )
            .add_conditional_edges(
                "a",
                |s: &StateDocument| {
                    if s.get_as::<u64>("retry_count").unwrap_or(0) < 3 {
                        Gate::Retry
                    } else {
                        Gate::Ok
                    }
                },
                [(Gate::Ok, END), (Gate::Retry, "a")],
            )
            .set_entry("a")
            .build()
            .unwrap();

        let id = coordinator
            .start(Arc::new(graph), StateDelta::new().set("retry_count", 0))
            .await
            .unwrap();
        let snapshot = coordinator.advance(id).await.unwrap();

        assert_eq!(snapshot.status(), InstanceStatus::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(snapshot.state.get_as::<u64>("retry_count"), Some(3));
        assert_eq!(snapshot.report.step_count, 3);
    }

    #[tokio::test]
    async fn fan_out_appends_every_branch() {
        let (coordinator, _store) = engine();

        fn tagger(tag: &'static str, delay_ms: u64) -> impl Step + 'static {
            FnStep::new(move |_v: InputView| async move {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                Ok(StepOutput::new(StateDelta::new().set("tags", tag)))
            })
        }

        let graph = GraphBuilder::new("fan")
            .add_step("split", noop())
            .add_step("x", tagger("x", 30))
            .add_step("y", tagger("y", 5))
            .add_step("z", tagger("z", 15))
            .add_edge("split", "x")
            .add_edge("split", "y")
            .add_edge("split", "z")
            .field_policy("tags", MergePolicy::Append)
            .set_entry("split")
            .build()
            .unwrap();

        let id = coordinator.start(Arc::new(graph), StateDelta::new()).await.unwrap();
        let snapshot = coordinator.advance(id).await.unwrap();
        assert_eq!(snapshot.status(), InstanceStatus::Completed);

        let tags: Vec<String> = snapshot.state.get_as("tags").unwrap();
        let set: BTreeSet<&str> = tags.iter().map(String::as_str).collect();
        assert_eq!(set, BTreeSet::from(["x", "y", "z"]));
        // Merged in branch-index order, not completion order.
        assert_eq!(tags, vec!["x", "y", "z"]);
        assert_eq!(snapshot.report.step_count, 4);
    }

    #[tokio::test]
    async fn interrupt_before_holds_until_resume() {
        let (coordinator, _store) = engine();
        let drafts = Arc::new(AtomicU32::new(0));
        let reviews = Arc::new(AtomicU32::new(0));
        let graph = review_graph(&drafts, &reviews);

        let id = coordinator.start(graph, StateDelta::new()).await.unwrap();
        let first = coordinator.advance(id).await.unwrap();
        assert_eq!(first.status(), InstanceStatus::Interrupted);
        let interrupt = first.report.interrupt.clone().unwrap();
        assert_eq!(interrupt.step, "review");
        assert_eq!(interrupt.position, InterruptPosition::Before);

        for _ in 0..2 {
            let again = coordinator.advance(id).await.unwrap();
            assert_eq!(again, first);
        }
        assert_eq!(reviews.load(Ordering::SeqCst), 0);

        let done = coordinator
            .resume(id, StateDelta::new().set(DEFAULT_FEEDBACK_FIELD, "approve"))
            .await
            .unwrap();
        assert_eq!(done.status(), InstanceStatus::Completed);
        assert_eq!(reviews.load(Ordering::SeqCst), 1);
        assert_eq!(done.state.get_as::<bool>("published"), Some(true));

        // Feedback is consumed once the review step has been routed.
        assert!(!done.state.has(DEFAULT_FEEDBACK_FIELD));
        let log: Vec<Value> = done.state.get_as(FEEDBACK_LOG_FIELD).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0]["feedback"], "approve");

        let status = coordinator.status(id).await.unwrap();
        assert_eq!(status, done.report);
    }

    #[tokio::test]
    async fn revision_loop_interrupts_again() {
        let (coordinator, _store) = engine();
        let drafts = Arc::new(AtomicU32::new(0));
        let reviews = Arc::new(AtomicU32::new(0));
        let id = coordinator
            .start(review_graph(&drafts, &reviews), StateDelta::new())
            .await
            .unwrap();

        coordinator.advance(id).await.unwrap();
        let revised = coordinator
            .resume(id, StateDelta::new().set(DEFAULT_FEEDBACK_FIELD, "revise"))
            .await
            .unwrap();
        assert_eq!(revised.status(), InstanceStatus::Interrupted);
        assert_eq!(drafts.load(Ordering::SeqCst), 2);
        assert_eq!(reviews.load(Ordering::SeqCst), 1);

        let done = coordinator
            .resume(id, StateDelta::new().set(DEFAULT_FEEDBACK_FIELD, "approve"))
            .await
            .unwrap();
        assert_eq!(done.status(), InstanceStatus::Completed);
        let log: Vec<Value> = done.state.get_as(FEEDBACK_LOG_FIELD).unwrap();
        assert_eq!(log.len(), 2);
    }

    #[tokio::test]
    async fn interrupt_after_holds_before_routing() {
        let (coordinator, _store) = engine();
        let checks = Arc::new(AtomicU32::new(0));

        let graph = GraphBuilder::new("after")
            .add_step("check", counting(&checks, "score", json!(0.4)))
            .add_step("fix", noop())
            .add_conditional_edges(
                "check",
                review_decision,
                [(Review::Approve, END), (Review::Revise, "fix"), (Review::Pending, END)],
            )
            .interrupt_after("check")
            .set_entry("check")
            .build()
            .unwrap();

        let id = coordinator.start(Arc::new(graph), StateDelta::new()).await.unwrap();
        let held = coordinator.advance(id).await.unwrap();
        assert_eq!(held.status(), InstanceStatus::Interrupted);
        assert_eq!(held.report.interrupt.as_ref().unwrap().position, InterruptPosition::After);
        // Output is merged before the halt.
        assert_eq!(held.state.get_as::<f64>("score"), Some(0.4));

        let done = coordinator
            .resume(id, StateDelta::new().set(DEFAULT_FEEDBACK_FIELD, "revise"))
            .await
            .unwrap();
        assert_eq!(done.status(), InstanceStatus::Completed);
        assert_eq!(checks.load(Ordering::SeqCst), 1);
        assert_eq!(done.state.current_step(), Some("fix"));
    }

    #[tokio::test]
    async fn flaky_step_succeeds_on_third_attempt() {
        let (coordinator, _store) = engine();
        let calls = Arc::new(AtomicU32::new(0));
        let stamps = Arc::new(std::sync::Mutex::new(Vec::<Instant>::new()));
        let (c, s) = (Arc::clone(&calls), Arc::clone(&stamps));

        let graph = GraphBuilder::new("flaky")
            .add_step(
                "fetch",
                FnStep::new(move |_v: InputView| {
                    s.lock().unwrap().push(Instant::now());
                    let attempt = c.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if attempt < 2 {
                            Err(StepFailure::retryable("upstream unavailable"))
                        } else {
                            Ok(StepOutput::new(StateDelta::new().set("fetched", true)))
                        }
                    }
                }),
            )
            .set_entry("fetch")
            .build()
            .unwrap();

        let id = coordinator.start(Arc::new(graph), StateDelta::new()).await.unwrap();
        let snapshot = coordinator.advance(id).await.unwrap();

        assert_eq!(snapshot.status(), InstanceStatus::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(snapshot.state.get_as::<bool>("fetched"), Some(true));

        let stamps = stamps.lock().unwrap();
        let gaps: Vec<Duration> = stamps.windows(2).map(|w| w[1] - w[0]).collect();
        assert!(gaps[0] >= Duration::from_millis(5));
        assert!(gaps[1] >= Duration::from_millis(10));
    }

    #[tokio::test]
    async fn concurrent_advance_is_rejected() {
        let (coordinator, store) = engine();
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);

        let graph = GraphBuilder::new("slow")
            .add_step(
                "work",
                FnStep::new(move |_v: InputView| {
                    c.fetch_add(1, Ordering::SeqCst);
                    async {
                        tokio::time::sleep(Duration::from_millis(150)).await;
                        Ok(StepOutput::new(StateDelta::new().set("done", true)))
                    }
                }),
            )
            .set_entry("work")
            .build()
            .unwrap();

        let id = coordinator.start(Arc::new(graph), StateDelta::new()).await.unwrap();
        let driver = coordinator.spawn_advance(id);
        tokio::time::sleep(Duration::from_millis(30)).await;

        let before = store.len_for(&id);
        let err = coordinator.advance(id).await.unwrap_err();
        assert!(matches!(err, EngineError::AlreadyRunning(got) if got == id));
        let err = coordinator
            .resume(id, StateDelta::new().set(DEFAULT_FEEDBACK_FIELD, "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::AlreadyRunning(_)));
        assert_eq!(store.len_for(&id), before);

        let snapshot = driver.await.unwrap().unwrap();
        assert_eq!(snapshot.status(), InstanceStatus::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    // -----------------------------------------------------------------------
    // Failures
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn failing_branch_fails_batch_without_merging_siblings() {
        let (coordinator, _store) = engine();
        let broken = Arc::new(AtomicBool::new(true));
        let b = Arc::clone(&broken);

        let graph = GraphBuilder::new("partial")
            .add_step("split", noop())
            .add_step(
                "bad",
                FnStep::new(move |_v: InputView| {
                    let fail = b.load(Ordering::SeqCst);
                    async move {
                        if fail {
                            Err(StepFailure::fatal("malformed input"))
                        } else {
                            Ok(StepOutput::new(StateDelta::new().set("bad", "fixed")))
                        }
                    }
                }),
            )
            .add_step("good", counting(&Arc::new(AtomicU32::new(0)), "good", json!(1)))
            .add_edge("split", "bad")
            .add_edge("split", "good")
            .set_entry("split")
            .build()
            .unwrap();

        let id = coordinator.start(Arc::new(graph), StateDelta::new()).await.unwrap();
        let failed = coordinator.advance(id).await.unwrap();

        assert_eq!(failed.status(), InstanceStatus::Failed);
        assert!(failed.report.error.as_deref().unwrap().contains("malformed input"));
        assert!(!failed.state.has("good"));
        assert_eq!(failed.report.step_count, 1);
        let log: Vec<ErrorEntry> = failed.state.get_as(ERROR_LOG_FIELD).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].step, "bad");
        assert!(!log[0].retryable);

        // Failed is not final: retry reruns the batch from the last checkpoint.
        broken.store(false, Ordering::SeqCst);
        let done = coordinator.retry(id).await.unwrap();
        assert_eq!(done.status(), InstanceStatus::Completed);
        assert_eq!(done.state.get_as::<i64>("good"), Some(1));
        assert_eq!(done.state.get_as::<Vec<ErrorEntry>>(ERROR_LOG_FIELD).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unregistered_branch_fails_instance() {
        let (coordinator, _store) = engine();
        let graph = GraphBuilder::new("open")
            .add_step("a", noop())
            .add_step("b", noop())
            .add_conditional_edges("a", |_s: &StateDocument| "nowhere".to_string(), [("b".to_string(), "b")])
            .set_entry("a")
            .build()
            .unwrap();

        let id = coordinator.start(Arc::new(graph), StateDelta::new()).await.unwrap();
        let failed = coordinator.advance(id).await.unwrap();

        assert_eq!(failed.status(), InstanceStatus::Failed);
        assert!(failed.report.error.as_deref().unwrap().starts_with("configuration error"));
        let log: Vec<ErrorEntry> = failed.state.get_as(ERROR_LOG_FIELD).unwrap();
        assert_eq!(log[0].step, "a");
        assert_eq!(log[0].attempts, 0);
    }

    #[tokio::test]
    async fn step_limit_fails_instead_of_stalling() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let mut config = fast_config();
        config.max_batches_per_advance = 4;
        let coordinator = Coordinator::new(store, config);
        let calls = Arc::new(AtomicU32::new(0));

        let graph = GraphBuilder::new("forever")
            .add_step("spin", counting(&calls, "spun", json!(true)))
            .add_conditional_edges("spin", |_s: &StateDocument| true, [(true, "spin"), (false, END)])
            .set_entry("spin")
            .build()
            .unwrap();

        let id = coordinator.start(Arc::new(graph), StateDelta::new()).await.unwrap();
        let failed = coordinator.advance(id).await.unwrap();

        assert_eq!(failed.status(), InstanceStatus::Failed);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(failed.report.error.unwrap().contains("step limit"));
    }

    #[tokio::test]
    async fn storage_failure_keeps_last_checkpoint() {
        let store = Arc::new(FlakyStore::default());
        let mut config = fast_config();
        config.checkpoint_write_attempts = 2;
        let coordinator = Coordinator::new(Arc::clone(&store), config);
        let calls = Arc::new(AtomicU32::new(0));

        let graph = GraphBuilder::new("durable")
            .add_step("only", counting(&calls, "out", json!("x")))
            .set_entry("only")
            .build()
            .unwrap();

        let id = coordinator.start(Arc::new(graph), StateDelta::new()).await.unwrap();
        store.fail_next(2);

        let err = coordinator.advance(id).await.unwrap_err();
        assert!(matches!(err, EngineError::Storage(StorageError::Connection(_))));

        let status = coordinator.status(id).await.unwrap();
        assert_eq!(status.status, InstanceStatus::Running);
        assert_eq!(status.last_checkpoint_seq, 1);
        assert_eq!(status.step_count, 0);

        let done = coordinator.advance(id).await.unwrap();
        assert_eq!(done.status(), InstanceStatus::Completed);
        assert_eq!(done.report.last_checkpoint_seq, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    // -----------------------------------------------------------------------
    // Resume, cancel, recover
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn resume_rejects_misuse_without_mutation() {
        let (coordinator, store) = engine();
        let drafts = Arc::new(AtomicU32::new(0));
        let reviews = Arc::new(AtomicU32::new(0));
        let id = coordinator
            .start(review_graph(&drafts, &reviews), StateDelta::new())
            .await
            .unwrap();

        // Running, not interrupted.
        let err = coordinator
            .resume(id, StateDelta::new().set(DEFAULT_FEEDBACK_FIELD, "approve"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidState { .. }));

        coordinator.advance(id).await.unwrap();
        let held = store.len_for(&id);

        // Interrupted, but the delta does not carry feedback.
        let err = coordinator
            .resume(id, StateDelta::new().set("notes", "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidState { .. }));
        assert_eq!(store.len_for(&id), held);
        assert_eq!(coordinator.status(id).await.unwrap().status, InstanceStatus::Interrupted);

        let err = coordinator.resume(Uuid::now_v7(), StateDelta::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn cancel_stops_in_flight_branches() {
        let (coordinator, store) = engine();
        let graph = GraphBuilder::new("hang")
            .add_step("split", noop())
            .add_step(
                "long",
                FnStep::new(|_v: InputView| async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(StepOutput::new(StateDelta::new().set("long", true)))
                }),
            )
            .add_step(
                "longer",
                FnStep::new(|_v: InputView| async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(StepOutput::new(StateDelta::new().set("longer", true)))
                }),
            )
            .add_edge("split", "long")
            .add_edge("split", "longer")
            .set_entry("split")
            .build()
            .unwrap();

        let id = coordinator.start(Arc::new(graph), StateDelta::new()).await.unwrap();
        let driver = coordinator.spawn_advance(id);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = Instant::now();
        coordinator.cancel(id).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));

        let snapshot = driver.await.unwrap().unwrap();
        assert_eq!(snapshot.status(), InstanceStatus::Cancelled);
        assert!(!snapshot.state.has("long"));

        let written = store.len_for(&id);
        let history = checkpoints(&coordinator, id).await;
        assert_eq!(
            history.iter().filter(|c| c.status == InstanceStatus::Cancelled).count(),
            1
        );

        // Nothing is written after the cancellation is acknowledged.
        coordinator.cancel(id).await.unwrap();
        coordinator.advance(id).await.unwrap();
        assert_eq!(store.len_for(&id), written);
    }

    #[tokio::test]
    async fn cancel_interrupted_and_completed_instances() {
        let (coordinator, _store) = engine();
        let drafts = Arc::new(AtomicU32::new(0));
        let reviews = Arc::new(AtomicU32::new(0));
        let graph = review_graph(&drafts, &reviews);

        let held = coordinator.start(Arc::clone(&graph), StateDelta::new()).await.unwrap();
        coordinator.advance(held).await.unwrap();
        coordinator.cancel(held).await.unwrap();
        assert_eq!(coordinator.status(held).await.unwrap().status, InstanceStatus::Cancelled);
        let err = coordinator
            .resume(held, StateDelta::new().set(DEFAULT_FEEDBACK_FIELD, "approve"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidState { .. }));

        let linear = Arc::new(
            GraphBuilder::new("one")
                .add_step("a", noop())
                .set_entry("a")
                .build()
                .unwrap(),
        );
        let done = coordinator.start(linear, StateDelta::new()).await.unwrap();
        coordinator.advance(done).await.unwrap();
        coordinator.cancel(done).await.unwrap();
        assert_eq!(coordinator.status(done).await.unwrap().status, InstanceStatus::Completed);
    }

    #[tokio::test]
    async fn recover_reattaches_after_restart() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let drafts = Arc::new(AtomicU32::new(0));
        let reviews = Arc::new(AtomicU32::new(0));
        let graph = review_graph(&drafts, &reviews);

        let id = {
            let first = Coordinator::new(Arc::clone(&store), fast_config());
            let id = first.start(Arc::clone(&graph), StateDelta::new()).await.unwrap();
            first.advance(id).await.unwrap();
            id
        };

        let second = Coordinator::new(Arc::clone(&store), fast_config());
        assert_eq!(second.status(id).await.unwrap().status, InstanceStatus::Interrupted);
        assert!(matches!(second.advance(id).await, Err(EngineError::Detached(_))));

        let wrong = Arc::new(
            GraphBuilder::new("other")
                .add_step("draft", noop())
                .set_entry("draft")
                .build()
                .unwrap(),
        );
        assert!(matches!(
            second.recover(wrong, id).await,
            Err(EngineError::Configuration(_))
        ));

        let recovered = second.recover(Arc::clone(&graph), id).await.unwrap();
        assert_eq!(recovered.status(), InstanceStatus::Interrupted);

        let done = second
            .resume(id, StateDelta::new().set(DEFAULT_FEEDBACK_FIELD, "approve"))
            .await
            .unwrap();
        assert_eq!(done.status(), InstanceStatus::Completed);
        assert_eq!(drafts.load(Ordering::SeqCst), 1);

        let sequences: Vec<u64> = checkpoints(&second, id).await.iter().map(|c| c.sequence).collect();
        assert_eq!(sequences, (1..=sequences.len() as u64).collect::<Vec<_>>());
    }

    // -----------------------------------------------------------------------
    // Queries and observability
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn status_and_history_are_idempotent() {
        let (coordinator, _store) = engine();
        let drafts = Arc::new(AtomicU32::new(0));
        let reviews = Arc::new(AtomicU32::new(0));
        let id = coordinator
            .start(review_graph(&drafts, &reviews), StateDelta::new())
            .await
            .unwrap();
        coordinator.advance(id).await.unwrap();

        assert_eq!(coordinator.status(id).await.unwrap(), coordinator.status(id).await.unwrap());
        let first = checkpoints(&coordinator, id).await;
        let second = checkpoints(&coordinator, id).await;
        assert_eq!(first, second);
        assert_eq!(first.first().unwrap().sequence, 1);
        assert_eq!(first.last().unwrap().status, InstanceStatus::Interrupted);

        assert!(matches!(
            coordinator.status(Uuid::now_v7()).await,
            Err(EngineError::NotFound(_))
        ));
        assert!(matches!(
            coordinator.history(Uuid::now_v7()).await,
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn fan_out_payloads_and_narrow_views() {
        let (coordinator, _store) = engine();
        let graph = GraphBuilder::new("drafts")
            .add_step("plan", counting(&Arc::new(AtomicU32::new(0)), "secret", json!("hidden")))
            .add_step(
                "draft",
                FnStep::new(|view: InputView| async move {
                    let format = view.payload_as::<Value>().unwrap()["format"].clone();
                    let key = format.as_str().unwrap_or("unknown").to_string();
                    let saw_secret = view.get("secret").is_some();
                    Ok(StepOutput::new(
                        StateDelta::new().set("content", json!({ key: { "saw_secret": saw_secret } })),
                    ))
                })
                .with_reads(["topic"]),
            )
            .add_fan_out("plan", ["draft"], |_s: &StateDocument| {
                ["text", "image"]
                    .into_iter()
                    .map(|f| Dispatch::with_payload("draft", json!({ "format": f })))
                    .collect()
            })
            .field_policy("content", MergePolicy::ShallowMerge)
            .set_entry("plan")
            .build()
            .unwrap();

        let id = coordinator
            .start(Arc::new(graph), StateDelta::new().set("topic", "rust"))
            .await
            .unwrap();
        let done = coordinator.advance(id).await.unwrap();

        assert_eq!(done.status(), InstanceStatus::Completed);
        let content = done.state.get("content").unwrap();
        assert_eq!(content["text"]["saw_secret"], false);
        assert_eq!(content["image"]["saw_secret"], false);
    }

    #[tokio::test]
    async fn lifecycle_events_and_snapshots_are_published() {
        let (coordinator, _store) = engine();
        let mut events = coordinator.events().subscribe();
        let graph = Arc::new(
            GraphBuilder::new("linear")
                .add_step("a", noop())
                .add_step("b", noop())
                .add_edge("a", "b")
                .set_entry("a")
                .build()
                .unwrap(),
        );

        let id = coordinator.start(graph, StateDelta::new()).await.unwrap();
        let watcher = coordinator.subscribe(id).await.unwrap();
        coordinator.advance(id).await.unwrap();

        assert_eq!(watcher.borrow().status(), InstanceStatus::Completed);

        let seen = drain_for(&mut events, id);
        assert!(seen.iter().any(|e| matches!(e, WorkflowEvent::InstanceStarted { .. })));
        assert!(matches!(seen.last(), Some(WorkflowEvent::InstanceCompleted { step_count: 2, .. })));
        let steps = seen
            .iter()
            .filter(|e| matches!(e, WorkflowEvent::StepCompleted { .. }))
            .count();
        assert_eq!(steps, 2);
    }

    // -----------------------------------------------------------------------
    // Shared store, several coordinators
    // -----------------------------------------------------------------------

    fn slow_step(calls: &Arc<AtomicU32>, millis: u64) -> impl Step + 'static {
        let calls = Arc::clone(calls);
        FnStep::new(move |_v: InputView| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                tokio::time::sleep(Duration::from_millis(millis)).await;
                Ok(StepOutput::new(StateDelta::new().set("done", true)))
            }
        })
    }

    fn single_step_graph(step: impl Step + 'static) -> Arc<GraphDefinition> {
        Arc::new(GraphBuilder::new("shared").add_step("work", step).set_entry("work").build().unwrap())
    }

    /// Store that never arbitrates the driver lease.
    #[derive(Default)]
    struct UnguardedStore {
        inner: InMemoryCheckpointStore,
    }

    impl CheckpointStore for UnguardedStore {
        async fn save(&self, checkpoint: &Checkpoint) -> Result<(), StorageError> {
            self.inner.save(checkpoint).await
        }

        async fn load_latest(&self, instance_id: &Uuid) -> Result<Option<Checkpoint>, StorageError> {
            self.inner.load_latest(instance_id).await
        }

        async fn load_range(&self, instance_id: &Uuid, after: u64, limit: usize) -> Result<Vec<Checkpoint>, StorageError> {
            self.inner.load_range(instance_id, after, limit).await
        }

        async fn list_instances(&self, status: Option<InstanceStatus>) -> Result<Vec<InstanceSummary>, StorageError> {
            self.inner.list_instances(status).await
        }

        async fn claim(&self, _instance_id: &Uuid, _owner: Uuid, _ttl: Duration) -> Result<LeaseClaim, StorageError> {
            Ok(LeaseClaim::Held { cancel_requested: false })
        }

        async fn release(&self, _instance_id: &Uuid, _owner: Uuid) -> Result<(), StorageError> {
            Ok(())
        }

        async fn request_cancel(&self, _instance_id: &Uuid) -> Result<bool, StorageError> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn second_coordinator_is_rejected_before_running_steps() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let calls = Arc::new(AtomicU32::new(0));
        let graph = single_step_graph(slow_step(&calls, 150));

        let a = Coordinator::new(Arc::clone(&store), fast_config());
        let b = Coordinator::new(Arc::clone(&store), fast_config());
        let id = a.start(Arc::clone(&graph), StateDelta::new()).await.unwrap();
        b.recover(Arc::clone(&graph), id).await.unwrap();

        let (first, second) = tokio::join!(a.advance(id), async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            b.advance(id).await
        });

        assert_eq!(first.unwrap().status(), InstanceStatus::Completed);
        assert!(matches!(second, Err(EngineError::AlreadyRunning(got)) if got == id));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // The rejected coordinator catches up from the store.
        let caught_up = b.advance(id).await.unwrap();
        assert_eq!(caught_up.status(), InstanceStatus::Completed);
        assert_eq!(caught_up.report, a.status(id).await.unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(b.attached_len(), 0);
    }

    #[tokio::test]
    async fn sequence_conflict_reloads_and_reports_already_running() {
        let store = Arc::new(UnguardedStore::default());
        let calls = Arc::new(AtomicU32::new(0));
        let graph = single_step_graph(slow_step(&calls, 50));

        let a = Coordinator::new(Arc::clone(&store), fast_config());
        let b = Coordinator::new(Arc::clone(&store), fast_config());
        let id = a.start(Arc::clone(&graph), StateDelta::new()).await.unwrap();
        b.recover(Arc::clone(&graph), id).await.unwrap();

        let (first, second) = tokio::join!(a.advance(id), b.advance(id));
        let outcomes = [first, second];
        let winners = outcomes.iter().filter(|r| r.is_ok()).count();
        let losers = outcomes
            .iter()
            .filter(|r| matches!(r, Err(EngineError::AlreadyRunning(_))))
            .count();
        assert_eq!((winners, losers), (1, 1));

        // Neither side is left behind the store.
        for coordinator in [&a, &b] {
            let snapshot = coordinator.advance(id).await.unwrap();
            assert_eq!(snapshot.status(), InstanceStatus::Completed);
        }
        assert_eq!(store.inner.len_for(&id), 2);
    }

    #[tokio::test]
    async fn cancel_reaches_driver_of_another_coordinator() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let mut config = fast_config();
        config.driver_lease_ms = 300;
        let calls = Arc::new(AtomicU32::new(0));
        let graph = single_step_graph(slow_step(&calls, 30_000));

        let a = Coordinator::new(Arc::clone(&store), config.clone());
        let b = Coordinator::new(Arc::clone(&store), config);
        let id = a.start(Arc::clone(&graph), StateDelta::new()).await.unwrap();
        b.recover(Arc::clone(&graph), id).await.unwrap();

        let driver = a.spawn_advance(id);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = Instant::now();
        b.cancel(id).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));

        let snapshot = driver.await.unwrap().unwrap();
        assert_eq!(snapshot.status(), InstanceStatus::Cancelled);
        assert!(!snapshot.state.has("done"));
        assert_eq!(b.status(id).await.unwrap().status, InstanceStatus::Cancelled);

        let history = checkpoints(&a, id).await;
        assert_eq!(
            history.iter().filter(|c| c.status == InstanceStatus::Cancelled).count(),
            1
        );
    }

    #[tokio::test]
    async fn finished_instances_are_released_from_memory() {
        let (coordinator, _store) = engine();
        let graph = Arc::new(GraphBuilder::new("one").add_step("a", noop()).set_entry("a").build().unwrap());

        let mut ids = Vec::new();
        for _ in 0..5 {
            let id = coordinator.start(Arc::clone(&graph), StateDelta::new()).await.unwrap();
            assert_eq!(coordinator.advance(id).await.unwrap().status(), InstanceStatus::Completed);
            ids.push(id);
        }
        assert_eq!(coordinator.attached_len(), 0);

        for id in ids {
            assert_eq!(coordinator.status(id).await.unwrap().status, InstanceStatus::Completed);
            assert_eq!(coordinator.advance(id).await.unwrap().status(), InstanceStatus::Completed);
            coordinator.cancel(id).await.unwrap();
            let watcher = coordinator.subscribe(id).await.unwrap();
            assert_eq!(watcher.borrow().status(), InstanceStatus::Completed);
            let recovered = coordinator.recover(Arc::clone(&graph), id).await.unwrap();
            assert_eq!(recovered.status(), InstanceStatus::Completed);
            assert!(matches!(coordinator.retry(id).await, Err(EngineError::InvalidState { .. })));
        }
        assert_eq!(coordinator.attached_len(), 0);

        let drafts = Arc::new(AtomicU32::new(0));
        let reviews = Arc::new(AtomicU32::new(0));
        let held = coordinator
            .start(review_graph(&drafts, &reviews), StateDelta::new())
            .await
            .unwrap();
        coordinator.advance(held).await.unwrap();
        assert_eq!(coordinator.attached_len(), 1);
    }
}
