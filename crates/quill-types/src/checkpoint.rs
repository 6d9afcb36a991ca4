//! Immutable checkpoint snapshots and the pending-step set they carry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::state::StateDocument;
use crate::status::{InstanceStatus, InterruptInfo, StatusReport};

/// One step invocation to run, with an optional branch-specific payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dispatch {
    pub step: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Dispatch {
    /// Dispatch `step` with no payload.
    pub fn to(step: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            payload: None,
        }
    }

    pub fn with_payload(step: impl Into<String>, payload: Value) -> Self {
        Self {
            step: step.into(),
            payload: Some(payload),
        }
    }
}

/// The pending-step set of an instance.
///
/// `Run` is a batch waiting to execute. `Route` lists the steps of a batch
/// whose outputs are merged but whose transitions have not been resolved yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "steps", rename_all = "snake_case")]
pub enum Frontier {
    Run(Vec<Dispatch>),
    Route(Vec<String>),
}

impl Frontier {
    /// Names of the steps in the frontier, in batch order.
    pub fn step_names(&self) -> Vec<&str> {
        match self {
            Frontier::Run(batch) => batch.iter().map(|d| d.step.as_str()).collect(),
            Frontier::Route(done) => done.iter().map(String::as_str).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Frontier::Run(batch) => batch.is_empty(),
            Frontier::Route(done) => done.is_empty(),
        }
    }
}

/// Immutable snapshot of an instance after a state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub instance_id: Uuid,
    /// Strictly increasing per instance, starting at 1.
    pub sequence: u64,
    /// Name of the graph definition the instance runs.
    pub graph: String,
    pub status: InstanceStatus,
    pub current_step: Option<String>,
    pub state: StateDocument,
    pub frontier: Frontier,
    pub interrupt: Option<InterruptInfo>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Status report derived from this checkpoint.
    pub fn report(&self) -> StatusReport {
        StatusReport {
            instance_id: self.instance_id,
            status: self.status,
            current_step: self.current_step.clone(),
            step_count: self.state.step_count(),
            last_checkpoint_seq: self.sequence,
            interrupt: self.interrupt.clone(),
            error: self.error.clone(),
        }
    }
}
