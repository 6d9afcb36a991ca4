//! Durable checkpoint writer for workflow instances.
//!
//! Wraps a `CheckpointStore` with the engine's write policy: transient
//! storage failures are retried a bounded number of times before the error
//! reaches the coordinator, conflicts are surfaced immediately, and every
//! persisted checkpoint is announced on the event bus.

use std::sync::Arc;
use std::time::Duration;

use quill_types::checkpoint::Checkpoint;
use quill_types::config::EngineConfig;
use quill_types::error::StorageError;
use quill_types::event::WorkflowEvent;

use crate::event::EventBus;
use crate::repository::checkpoint::CheckpointStore;

// ---------------------------------------------------------------------------
// CheckpointWriter
// ---------------------------------------------------------------------------

/// Persists checkpoints on behalf of the coordinator.
///
/// Generic over `S: CheckpointStore` so the same policy applies to the
/// in-memory and SQLite stores.
pub struct CheckpointWriter<S: CheckpointStore> {
    store: Arc<S>,
    attempts: u32,
    retry_delay: Duration,
    events: EventBus,
}

impl<S: CheckpointStore> CheckpointWriter<S> {
    pub fn new(store: Arc<S>, config: &EngineConfig, events: EventBus) -> Self {
        Self {
            store,
            attempts: config.checkpoint_write_attempts.max(1),
            retry_delay: config.checkpoint_retry_delay(),
            events,
        }
    }

    /// Access the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Persist `checkpoint`, retrying transient failures.
    ///
    /// On `Err` nothing was persisted and the caller must not treat the
    /// checkpoint's state as committed.
    pub async fn write(&self, checkpoint: &Checkpoint) -> Result<(), StorageError> {
        let mut attempt = 1;
        loop {
            match self.store.save(checkpoint).await {
                Ok(()) => {
                    tracing::debug!(
                        instance_id = %checkpoint.instance_id,
                        sequence = checkpoint.sequence,
                        status = %checkpoint.status,
                        "checkpoint saved"
                    );
                    self.events.publish(WorkflowEvent::CheckpointSaved {
                        instance_id: checkpoint.instance_id,
                        sequence: checkpoint.sequence,
                        status: checkpoint.status,
                    });
                    return Ok(());
                }
                Err(e) if e.is_transient() && attempt < self.attempts => {
                    tracing::warn!(
                        instance_id = %checkpoint.instance_id,
                        sequence = checkpoint.sequence,
                        attempt,
                        error = %e,
                        "checkpoint write failed, retrying"
                    );
                    attempt += 1;
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => {
                    tracing::error!(
                        instance_id = %checkpoint.instance_id,
                        sequence = checkpoint.sequence,
                        attempts = attempt,
                        error = %e,
                        "checkpoint write failed"
                    );
                    return Err(e);
                }
            }
        }
    }
}
