//! The state document threaded through a workflow instance.
//!
//! A [`StateDocument`] is a JSON object whose fields are merged according to
//! per-field [`MergePolicy`] values fixed when the graph is built. Steps never
//! see the whole document: they receive an [`InputView`] holding only the
//! fields they declared, and return a [`StateDelta`].

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use uuid::Uuid;

/// Engine-owned field receiving one entry per recorded failure.
pub const ERROR_LOG_FIELD: &str = "error_log";

/// Engine-owned field receiving every piece of consumed human feedback.
pub const FEEDBACK_LOG_FIELD: &str = "feedback_log";

/// Field that carries external feedback unless the graph overrides it.
pub const DEFAULT_FEEDBACK_FIELD: &str = "human_feedback";

// ---------------------------------------------------------------------------
// MergePolicy
// ---------------------------------------------------------------------------

/// How a delta value is combined with the existing value of a field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// The incoming value overwrites the existing one.
    #[default]
    Replace,
    /// Incoming values are concatenated onto an ordered array.
    Append,
    /// An incoming object is merged key-by-key into the existing object.
    ShallowMerge,
}

impl fmt::Display for MergePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergePolicy::Replace => write!(f, "replace"),
            MergePolicy::Append => write!(f, "append"),
            MergePolicy::ShallowMerge => write!(f, "shallow_merge"),
        }
    }
}

impl FromStr for MergePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "replace" => Ok(MergePolicy::Replace),
            "append" => Ok(MergePolicy::Append),
            "shallow_merge" | "merge" => Ok(MergePolicy::ShallowMerge),
            other => Err(format!("invalid merge policy: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// FieldPolicies
// ---------------------------------------------------------------------------

/// Field name to merge policy table.
///
/// Unregistered fields merge with [`MergePolicy::Replace`]. The engine-owned
/// log fields ([`ERROR_LOG_FIELD`], [`FEEDBACK_LOG_FIELD`]) are always
/// [`MergePolicy::Append`] and cannot be overridden.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldPolicies {
    policies: BTreeMap<String, MergePolicy>,
}

impl FieldPolicies {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style registration.
    pub fn with(mut self, field: impl Into<String>, policy: MergePolicy) -> Self {
        self.set(field, policy);
        self
    }

    /// Register (or change) the policy for `field`.
    pub fn set(&mut self, field: impl Into<String>, policy: MergePolicy) {
        self.policies.insert(field.into(), policy);
    }

    /// The effective policy for `field`.
    pub fn policy_for(&self, field: &str) -> MergePolicy {
        if is_reserved_log_field(field) {
            return MergePolicy::Append;
        }
        self.policies.get(field).copied().unwrap_or_default()
    }

    /// Explicitly registered policies, in field-name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, MergePolicy)> {
        self.policies.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

fn is_reserved_log_field(field: &str) -> bool {
    field == ERROR_LOG_FIELD || field == FEEDBACK_LOG_FIELD
}

// ---------------------------------------------------------------------------
// StateDocument
// ---------------------------------------------------------------------------

/// The shared, policy-merged record of one workflow instance.
///
/// The instance id is fixed at construction and `step_count` only moves
/// forward through [`StateDocument::record_steps`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDocument {
    instance_id: Uuid,
    step_count: u64,
    current_step: Option<String>,
    fields: Map<String, Value>,
}

impl StateDocument {
    /// Create an empty document for a new instance.
    pub fn new(instance_id: Uuid) -> Self {
        Self {
            instance_id,
            step_count: 0,
            current_step: None,
            fields: Map::new(),
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Number of step executions merged into this document so far.
    pub fn step_count(&self) -> u64 {
        self.step_count
    }

    /// The step (or comma-joined batch) whose output was merged last.
    pub fn current_step(&self) -> Option<&str> {
        self.current_step.as_deref()
    }

    pub fn set_current_step(&mut self, step: impl Into<String>) {
        self.current_step = Some(step.into());
    }

    /// Count `n` more step executions.
    pub fn record_steps(&mut self, n: u64) {
        self.step_count = self.step_count.saturating_add(n);
    }

    /// Raw value of a field, if present.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Deserialize a field into `T`. Returns `None` when the field is absent,
    /// null, or of the wrong shape.
    pub fn get_as<T: DeserializeOwned>(&self, field: &str) -> Option<T> {
        match self.fields.get(field) {
            None | Some(Value::Null) => None,
            Some(value) => serde_json::from_value(value.clone()).ok(),
        }
    }

    /// `true` when the field exists and is not null.
    pub fn has(&self, field: &str) -> bool {
        !matches!(self.fields.get(field), None | Some(Value::Null))
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Mutable access for the merge engine.
    pub fn fields_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.fields
    }

    /// Build the read view handed to `step`.
    ///
    /// With `reads = None` the step sees every field; otherwise only the
    /// listed fields that are present.
    pub fn view(&self, step: &str, reads: Option<&[String]>, payload: Option<Value>) -> InputView {
        let fields = match reads {
            None => self.fields.clone(),
            Some(names) => names
                .iter()
                .filter_map(|name| self.fields.get(name).map(|v| (name.clone(), v.clone())))
                .collect(),
        };

        InputView {
            instance_id: self.instance_id,
            step: step.to_string(),
            step_count: self.step_count,
            fields,
            payload,
        }
    }
}

// ---------------------------------------------------------------------------
// StateDelta
// ---------------------------------------------------------------------------

/// A step's output: field name to value, merged by policy into the document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateDelta {
    fields: Map<String, Value>,
}

impl StateDelta {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(field.into(), value.into());
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }

    pub fn into_inner(self) -> Map<String, Value> {
        self.fields
    }
}

impl From<Map<String, Value>> for StateDelta {
    fn from(fields: Map<String, Value>) -> Self {
        Self { fields }
    }
}

impl TryFrom<Value> for StateDelta {
    type Error = String;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(fields) => Ok(Self { fields }),
            other => Err(format!("state delta must be a JSON object, got {other}")),
        }
    }
}

impl FromIterator<(String, Value)> for StateDelta {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// InputView
// ---------------------------------------------------------------------------

/// Narrow, owned view of the state document handed to one step invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputView {
    pub instance_id: Uuid,
    pub step: String,
    pub step_count: u64,
    pub fields: Map<String, Value>,
    /// Branch-specific payload from a dynamic fan-out, if any.
    pub payload: Option<Value>,
}

impl InputView {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Deserialize a field into `T`; absent, null, or mismatched yields `None`.
    pub fn get_as<T: DeserializeOwned>(&self, field: &str) -> Option<T> {
        match self.fields.get(field) {
            None | Some(Value::Null) => None,
            Some(value) => serde_json::from_value(value.clone()).ok(),
        }
    }

    /// Deserialize the branch payload into `T`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Option<T> {
        self.payload
            .as_ref()
            .and_then(|p| serde_json::from_value(p.clone()).ok())
    }
}

// ---------------------------------------------------------------------------
// Engine log entries
// ---------------------------------------------------------------------------

/// One entry of the [`ERROR_LOG_FIELD`] array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub step: String,
    pub cause: String,
    pub retryable: bool,
    pub attempts: u32,
    pub at: DateTime<Utc>,
}

impl ErrorEntry {
    pub fn to_value(&self) -> Value {
        json!({
            "step": self.step,
            "cause": self.cause,
            "retryable": self.retryable,
            "attempts": self.attempts,
            "at": self.at.to_rfc3339(),
        })
    }
}

/// One entry of the [`FEEDBACK_LOG_FIELD`] array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackEntry {
    pub step: String,
    pub feedback: Value,
    pub at: DateTime<Utc>,
}

impl FeedbackEntry {
    pub fn to_value(&self) -> Value {
        json!({
            "step": self.step,
            "feedback": self.feedback,
            "at": self.at.to_rfc3339(),
        })
    }
}
