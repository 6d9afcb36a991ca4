//! Workflow instance lifecycle status and status reports.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Execution status of a workflow instance.
///
/// `Interrupted` is a normal suspension waiting for external feedback and is
/// reported distinctly from `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Running,
    Interrupted,
    Completed,
    Failed,
    Cancelled,
}

impl InstanceStatus {
    /// Completed and cancelled instances never run again.
    pub fn is_final(&self) -> bool {
        matches!(self, InstanceStatus::Completed | InstanceStatus::Cancelled)
    }

    /// Statuses at which a driver loop stops.
    pub fn is_settled(&self) -> bool {
        !matches!(self, InstanceStatus::Running)
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceStatus::Running => write!(f, "running"),
            InstanceStatus::Interrupted => write!(f, "interrupted"),
            InstanceStatus::Completed => write!(f, "completed"),
            InstanceStatus::Failed => write!(f, "failed"),
            InstanceStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "running" => Ok(InstanceStatus::Running),
            "interrupted" => Ok(InstanceStatus::Interrupted),
            "completed" => Ok(InstanceStatus::Completed),
            "failed" => Ok(InstanceStatus::Failed),
            "cancelled" | "canceled" => Ok(InstanceStatus::Cancelled),
            other => Err(format!("invalid instance status: '{other}'")),
        }
    }
}

/// Which side of a step an interrupt was raised on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptPosition {
    Before,
    After,
}

impl fmt::Display for InterruptPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterruptPosition::Before => write!(f, "before"),
            InterruptPosition::After => write!(f, "after"),
        }
    }
}

/// The pending decision of an interrupted instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterruptInfo {
    pub step: String,
    pub position: InterruptPosition,
    /// State field that `resume` must populate.
    pub feedback_field: String,
}

/// Answer to `status(instance_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub instance_id: Uuid,
    pub status: InstanceStatus,
    pub current_step: Option<String>,
    pub step_count: u64,
    pub last_checkpoint_seq: u64,
    pub interrupt: Option<InterruptInfo>,
    pub error: Option<String>,
}

/// One row of `list_instances`: the latest checkpoint header of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSummary {
    pub instance_id: Uuid,
    pub graph: String,
    pub status: InstanceStatus,
    pub last_checkpoint_seq: u64,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_display_matches_serde() {
        for status in [
            InstanceStatus::Running,
            InstanceStatus::Interrupted,
            InstanceStatus::Completed,
            InstanceStatus::Failed,
            InstanceStatus::Cancelled,
        ] {
            let json = serde_json::to_value(status).unwrap();
            assert_eq!(json.as_str().unwrap(), status.to_string());
            assert_eq!(status.to_string().parse::<InstanceStatus>().unwrap(), status);
        }
    }

    #[test]
    fn status_from_str_rejects_unknown() {
        assert!("paused".parse::<InstanceStatus>().is_err());
        assert_eq!(
            "CANCELED".parse::<InstanceStatus>().unwrap(),
            InstanceStatus::Cancelled
        );
    }

    #[test]
    fn final_and_settled() {
        assert!(InstanceStatus::Completed.is_final());
        assert!(InstanceStatus::Cancelled.is_final());
        assert!(!InstanceStatus::Failed.is_final());
        assert!(InstanceStatus::Interrupted.is_settled());
        assert!(!InstanceStatus::Running.is_settled());
    }
}
