//! Checkpoint store trait definition.
//!
//! Checkpoints are append-only. Implementations must make `save` atomic with
//! respect to `load_latest` (readers never observe a partial checkpoint),
//! serialize writes for one instance, and keep different instances
//! independent of each other.
//!
//! The store also arbitrates which coordinator drives an instance. Several
//! processes may share one store; a driver claims a time-limited lease before
//! it runs any step and renews it while it works.

use std::time::Duration;

use futures_util::Stream;
use quill_types::checkpoint::Checkpoint;
use quill_types::error::StorageError;
use quill_types::status::{InstanceStatus, InstanceSummary};
use uuid::Uuid;

/// Outcome of [`CheckpointStore::claim`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseClaim {
    /// The caller holds the lease until it expires or is released.
    Held {
        /// Another coordinator asked for the instance to be cancelled.
        cancel_requested: bool,
    },
    /// A different owner holds an unexpired lease.
    Busy,
}

/// Persistence contract for instance checkpoints.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait CheckpointStore: Send + Sync {
    /// Append a checkpoint. A checkpoint whose `(instance_id, sequence)`
    /// already exists is rejected with [`StorageError::Conflict`].
    fn save(
        &self,
        checkpoint: &Checkpoint,
    ) -> impl std::future::Future<Output = Result<(), StorageError>> + Send;

    /// Highest-sequence checkpoint of an instance, if any.
    fn load_latest(
        &self,
        instance_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Checkpoint>, StorageError>> + Send;

    /// Up to `limit` checkpoints with `sequence > after`, ascending.
    fn load_range(
        &self,
        instance_id: &Uuid,
        after: u64,
        limit: usize,
    ) -> impl std::future::Future<Output = Result<Vec<Checkpoint>, StorageError>> + Send;

    /// Latest checkpoint header of every instance, optionally filtered by status.
    fn list_instances(
        &self,
        status: Option<InstanceStatus>,
    ) -> impl std::future::Future<Output = Result<Vec<InstanceSummary>, StorageError>> + Send;

    /// Take or renew the driver lease of an instance for `ttl`.
    ///
    /// Succeeds when no lease exists, when the current one has expired, or
    /// when `owner` already holds it. Renewal keeps a pending cancellation
    /// request; a takeover clears it.
    fn claim(
        &self,
        instance_id: &Uuid,
        owner: Uuid,
        ttl: Duration,
    ) -> impl std::future::Future<Output = Result<LeaseClaim, StorageError>> + Send;

    /// Drop the lease if `owner` holds it.
    fn release(
        &self,
        instance_id: &Uuid,
        owner: Uuid,
    ) -> impl std::future::Future<Output = Result<(), StorageError>> + Send;

    /// Flag the current lease so its holder cancels the instance. Returns
    /// `false` when nobody holds a lease.
    fn request_cancel(
        &self,
        instance_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, StorageError>> + Send;
}

/// Lazy, ascending stream over an instance's checkpoint history.
///
/// Pages through [`CheckpointStore::load_range`] `page_size` rows at a time.
/// Nothing is read until the stream is polled, and calling this again
/// restarts from the first checkpoint.
pub fn load_history<S: CheckpointStore>(
    store: &S,
    instance_id: Uuid,
    page_size: usize,
) -> impl Stream<Item = Result<Checkpoint, StorageError>> + Send + '_ {
    let page_size = page_size.max(1);
    async_stream::try_stream! {
        let mut after = 0u64;
        loop {
            let page = store.load_range(&instance_id, after, page_size).await?;
            let exhausted = page.len() < page_size;
            for checkpoint in page {
                after = checkpoint.sequence;
                yield checkpoint;
            }
            if exhausted {
                break;
            }
        }
    }
}
