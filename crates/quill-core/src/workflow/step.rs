//! The pluggable step contract.
//!
//! A step maps an [`InputView`] to a [`StepOutput`] or a [`StepFailure`]. The
//! engine never looks inside. [`Step`] uses RPITIT and is therefore not
//! object-safe; [`StepDyn`] is its boxed-future twin with a blanket impl, and
//! [`BoxStep`] is the shareable handle the graph stores.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use quill_types::state::{InputView, StateDelta};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::retry::RetryPolicy;

// ---------------------------------------------------------------------------
// Outputs and failures
// ---------------------------------------------------------------------------

/// How a step invocation ended when it did not fail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    /// The step decided there was nothing to do. Its delta is still merged.
    Skipped { reason: String },
}

/// Result of a successful step invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutput {
    pub delta: StateDelta,
    pub status: StepStatus,
}

impl StepOutput {
    pub fn new(delta: StateDelta) -> Self {
        Self {
            delta,
            status: StepStatus::Succeeded,
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            delta: StateDelta::new(),
            status: StepStatus::Skipped {
                reason: reason.into(),
            },
        }
    }
}

impl From<StateDelta> for StepOutput {
    fn from(delta: StateDelta) -> Self {
        Self::new(delta)
    }
}

/// Error returned by a step implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct StepFailure {
    pub message: String,
    pub retryable: bool,
}

impl StepFailure {
    /// A transient failure the executor may retry.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// A permanent failure; retrying cannot help.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Step trait + dynamic dispatch
// ---------------------------------------------------------------------------

/// A named unit of work in a workflow graph.
pub trait Step: Send + Sync {
    fn run(&self, input: InputView) -> impl Future<Output = Result<StepOutput, StepFailure>> + Send;

    /// Fields this step reads. `None` means the whole document.
    fn reads(&self) -> Option<Vec<String>> {
        None
    }
}

/// Object-safe version of [`Step`] with a boxed future.
pub trait StepDyn: Send + Sync {
    fn run_boxed(
        &self,
        input: InputView,
    ) -> Pin<Box<dyn Future<Output = Result<StepOutput, StepFailure>> + Send + '_>>;

    fn reads(&self) -> Option<Vec<String>>;
}

impl<T: Step> StepDyn for T {
    fn run_boxed(
        &self,
        input: InputView,
    ) -> Pin<Box<dyn Future<Output = Result<StepOutput, StepFailure>> + Send + '_>> {
        Box::pin(self.run(input))
    }

    fn reads(&self) -> Option<Vec<String>> {
        Step::reads(self)
    }
}

/// Type-erased, cheaply cloneable step handle.
#[derive(Clone)]
pub struct BoxStep {
    inner: Arc<dyn StepDyn>,
}

impl BoxStep {
    pub fn new<T: Step + 'static>(step: T) -> Self {
        Self {
            inner: Arc::new(step),
        }
    }

    pub async fn run(&self, input: InputView) -> Result<StepOutput, StepFailure> {
        self.inner.run_boxed(input).await
    }

    pub fn reads(&self) -> Option<Vec<String>> {
        self.inner.reads()
    }
}

impl std::fmt::Debug for BoxStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxStep")
            .field("reads", &self.inner.reads())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// FnStep
// ---------------------------------------------------------------------------

/// Adapts an async closure into a [`Step`].
pub struct FnStep<F> {
    f: F,
    reads: Option<Vec<String>>,
}

impl<F> FnStep<F> {
    pub fn new<Fut>(f: F) -> Self
    where
        F: Fn(InputView) -> Fut + Send + Sync,
        Fut: Future<Output = Result<StepOutput, StepFailure>> + Send,
    {
        Self { f, reads: None }
    }

    /// Restrict the step's input view to `fields`.
    pub fn with_reads<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.reads = Some(fields.into_iter().map(Into::into).collect());
        self
    }
}

impl<F, Fut> Step for FnStep<F>
where
    F: Fn(InputView) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StepOutput, StepFailure>> + Send,
{
    fn run(&self, input: InputView) -> impl Future<Output = Result<StepOutput, StepFailure>> + Send {
        (self.f)(input)
    }

    fn reads(&self) -> Option<Vec<String>> {
        self.reads.clone()
    }
}

// ---------------------------------------------------------------------------
// StepOptions
// ---------------------------------------------------------------------------

/// Per-step overrides of the engine-wide timeout and retry policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepOptions {
    pub timeout: Option<Duration>,
    pub retry: Option<RetryPolicy>,
}

impl StepOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }
}
