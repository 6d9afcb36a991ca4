//! Event types for the Quill engine event bus.
//!
//! `WorkflowEvent` is broadcast by the coordinator, the step executor, and
//! the checkpoint writer. Every variant carries the instance id it concerns.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::status::{InstanceStatus, InterruptPosition};

/// Lifecycle events of workflow instances and their step invocations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    InstanceStarted {
        instance_id: Uuid,
        graph: String,
    },

    /// Execution continues after feedback or an explicit retry.
    InstanceResumed {
        instance_id: Uuid,
        step: Option<String>,
    },

    InstanceInterrupted {
        instance_id: Uuid,
        step: String,
        position: InterruptPosition,
    },

    InstanceCompleted {
        instance_id: Uuid,
        step_count: u64,
    },

    InstanceFailed {
        instance_id: Uuid,
        error: String,
    },

    InstanceCancelled {
        instance_id: Uuid,
    },

    StepStarted {
        instance_id: Uuid,
        step: String,
        attempt: u32,
    },

    StepCompleted {
        instance_id: Uuid,
        step: String,
        attempt: u32,
        duration_ms: u64,
    },

    StepFailed {
        instance_id: Uuid,
        step: String,
        attempt: u32,
        error: String,
        /// Whether the executor will try the step again.
        will_retry: bool,
    },

    CheckpointSaved {
        instance_id: Uuid,
        sequence: u64,
        status: InstanceStatus,
    },
}

impl WorkflowEvent {
    /// The instance this event belongs to.
    pub fn instance_id(&self) -> Uuid {
        match self {
            WorkflowEvent::InstanceStarted { instance_id, .. }
            | WorkflowEvent::InstanceResumed { instance_id, .. }
            | WorkflowEvent::InstanceInterrupted { instance_id, .. }
            | WorkflowEvent::InstanceCompleted { instance_id, .. }
            | WorkflowEvent::InstanceFailed { instance_id, .. }
            | WorkflowEvent::InstanceCancelled { instance_id }
            | WorkflowEvent::StepStarted { instance_id, .. }
            | WorkflowEvent::StepCompleted { instance_id, .. }
            | WorkflowEvent::StepFailed { instance_id, .. }
            | WorkflowEvent::CheckpointSaved { instance_id, .. } => *instance_id,
        }
    }
}
