//! In-memory checkpoint store.
//!
//! Backed by a `DashMap` keyed by instance id. Each save holds the instance's
//! shard lock only for the duration of the append, which serializes writers
//! of one instance while leaving other instances untouched. Driver leases
//! live in a second map with the same locking.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use quill_types::checkpoint::Checkpoint;
use quill_types::error::StorageError;
use quill_types::status::{InstanceStatus, InstanceSummary};
use uuid::Uuid;

use super::checkpoint::{CheckpointStore, LeaseClaim};

#[derive(Debug, Clone, Copy)]
struct Lease {
    owner: Uuid,
    expires_at: Instant,
    cancel_requested: bool,
}

#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    instances: DashMap<Uuid, Vec<Checkpoint>>,
    leases: DashMap<Uuid, Lease>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of checkpoints stored for an instance.
    pub fn len_for(&self, instance_id: &Uuid) -> usize {
        self.instances.get(instance_id).map(|v| v.len()).unwrap_or(0)
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), StorageError> {
        let mut history = self.instances.entry(checkpoint.instance_id).or_default();

        if let Some(last) = history.last() {
            if checkpoint.sequence <= last.sequence {
                return Err(StorageError::Conflict(format!(
                    "checkpoint {} of instance {} already exists (latest is {})",
                    checkpoint.sequence, checkpoint.instance_id, last.sequence
                )));
            }
        }

        history.push(checkpoint.clone());
        Ok(())
    }

    async fn load_latest(&self, instance_id: &Uuid) -> Result<Option<Checkpoint>, StorageError> {
        Ok(self
            .instances
            .get(instance_id)
            .and_then(|history| history.last().cloned()))
    }

    async fn load_range(
        &self,
        instance_id: &Uuid,
        after: u64,
        limit: usize,
    ) -> Result<Vec<Checkpoint>, StorageError> {
        Ok(self
            .instances
            .get(instance_id)
            .map(|history| {
                history
                    .iter()
                    .filter(|c| c.sequence > after)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list_instances(
        &self,
        status: Option<InstanceStatus>,
    ) -> Result<Vec<InstanceSummary>, StorageError> {
        let mut out: Vec<InstanceSummary> = self
            .instances
            .iter()
            .filter_map(|entry| entry.value().last().cloned())
            .filter(|latest| status.is_none_or(|s| latest.status == s))
            .map(|latest| InstanceSummary {
                instance_id: latest.instance_id,
                graph: latest.graph,
                status: latest.status,
                last_checkpoint_seq: latest.sequence,
                updated_at: latest.created_at,
            })
            .collect();
        out.sort_by_key(|s| s.instance_id);
        Ok(out)
    }

    async fn claim(&self, instance_id: &Uuid, owner: Uuid, ttl: Duration) -> Result<LeaseClaim, StorageError> {
        let now = Instant::now();
        let mut entry = self.leases.entry(*instance_id).or_insert(Lease {
            owner,
            expires_at: now,
            cancel_requested: false,
        });
        let lease = entry.value_mut();

        if lease.owner != owner {
            if lease.expires_at > now {
                return Ok(LeaseClaim::Busy);
            }
            lease.owner = owner;
            lease.cancel_requested = false;
        }
        lease.expires_at = now + ttl;
        Ok(LeaseClaim::Held {
            cancel_requested: lease.cancel_requested,
        })
    }

    async fn release(&self, instance_id: &Uuid, owner: Uuid) -> Result<(), StorageError> {
        self.leases.remove_if(instance_id, |_, lease| lease.owner == owner);
        Ok(())
    }

    async fn request_cancel(&self, instance_id: &Uuid) -> Result<bool, StorageError> {
        match self.leases.get_mut(instance_id) {
            Some(mut lease) => {
                lease.cancel_requested = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
