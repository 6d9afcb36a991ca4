//! Interrupt points and the feedback handshake around them.
//!
//! An interrupt-before step halts the coordinator ahead of the batch that
//! contains it; an interrupt-after step halts it once the step's output is
//! merged but before its transition is resolved. Either halt only happens
//! while the feedback field is absent or null. After the interrupt step's
//! transition has been resolved the feedback is consumed: cleared from the
//! feedback field and appended to the feedback log, so a later visit to the
//! same step interrupts again.

use std::collections::BTreeSet;

use chrono::Utc;
use quill_types::checkpoint::Dispatch;
use quill_types::state::{
    DEFAULT_FEEDBACK_FIELD, FEEDBACK_LOG_FIELD, FeedbackEntry, StateDelta, StateDocument,
};
use quill_types::status::{InterruptInfo, InterruptPosition};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterruptPoints {
    before: BTreeSet<String>,
    after: BTreeSet<String>,
    feedback_field: String,
}

impl Default for InterruptPoints {
    fn default() -> Self {
        Self::new(DEFAULT_FEEDBACK_FIELD)
    }
}

impl InterruptPoints {
    pub fn new(feedback_field: impl Into<String>) -> Self {
        Self {
            before: BTreeSet::new(),
            after: BTreeSet::new(),
            feedback_field: feedback_field.into(),
        }
    }

    pub(crate) fn add_before(&mut self, step: impl Into<String>) {
        self.before.insert(step.into());
    }

    pub(crate) fn add_after(&mut self, step: impl Into<String>) {
        self.after.insert(step.into());
    }

    pub(crate) fn set_feedback_field(&mut self, field: impl Into<String>) {
        self.feedback_field = field.into();
    }

    pub fn is_before(&self, step: &str) -> bool {
        self.before.contains(step)
    }

    pub fn is_after(&self, step: &str) -> bool {
        self.after.contains(step)
    }

    /// Every step named by an interrupt point.
    pub fn steps(&self) -> impl Iterator<Item = &str> {
        self.before.union(&self.after).map(String::as_str)
    }

    pub fn feedback_field(&self) -> &str {
        &self.feedback_field
    }

    pub fn has_feedback(&self, state: &StateDocument) -> bool {
        state.has(&self.feedback_field)
    }

    /// The first step of `batch` that must wait for feedback before running.
    pub fn pending_before(&self, batch: &[Dispatch], state: &StateDocument) -> Option<InterruptInfo> {
        if self.has_feedback(state) {
            return None;
        }
        batch
            .iter()
            .find(|d| self.is_before(&d.step))
            .map(|d| self.info(&d.step, InterruptPosition::Before))
    }

    /// The first step of a finished batch that must wait for feedback before
    /// its transition is resolved.
    pub fn pending_after(&self, done: &[String], state: &StateDocument) -> Option<InterruptInfo> {
        if self.has_feedback(state) {
            return None;
        }
        done.iter()
            .find(|s| self.is_after(s))
            .map(|s| self.info(s, InterruptPosition::After))
    }

    /// Delta that consumes the current feedback once `routed` steps have had
    /// their transitions resolved. `None` when no interrupt step was routed
    /// or no feedback is present.
    pub fn consume(&self, routed: &[String], state: &StateDocument) -> Option<StateDelta> {
        let step = routed
            .iter()
            .find(|s| self.is_before(s) || self.is_after(s))?;
        let feedback = state
            .get(&self.feedback_field)
            .filter(|v| !v.is_null())?
            .clone();

        let entry = FeedbackEntry {
            step: step.clone(),
            feedback,
            at: Utc::now(),
        };

        Some(
            StateDelta::new()
                .set(self.feedback_field.clone(), Value::Null)
                .set(FEEDBACK_LOG_FIELD, entry.to_value()),
        )
    }

    /// A resume delta must carry a non-null feedback value.
    pub fn check_resume(&self, feedback: &StateDelta) -> Result<(), String> {
        match feedback.get(&self.feedback_field) {
            Some(value) if !value.is_null() => Ok(()),
            _ => Err(format!(
                "resume requires a non-null '{}' value",
                self.feedback_field
            )),
        }
    }

    fn info(&self, step: &str, position: InterruptPosition) -> InterruptInfo {
        InterruptInfo {
            step: step.to_string(),
            position,
            feedback_field: self.feedback_field.clone(),
        }
    }
}
