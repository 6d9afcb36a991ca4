//! Step executor: timeout, retry, cancellation, and observability around a
//! single step invocation.
//!
//! Each attempt runs as its own tokio task so a panicking step surfaces as a
//! `StepError` instead of tearing down the coordinator. Attempts are bounded
//! by the step timeout; retryable failures (including timeouts) back off
//! exponentially until the retry policy is exhausted.

use std::time::{Duration, Instant};

use quill_types::config::EngineConfig;
use quill_types::event::WorkflowEvent;
use quill_types::state::InputView;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use super::graph::StepEntry;
use super::retry::RetryPolicy;
use super::step::StepOutput;
use crate::event::EventBus;

// ---------------------------------------------------------------------------
// StepError
// ---------------------------------------------------------------------------

/// Terminal outcome of a step whose attempts did not produce an output.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("step '{step}' failed after {attempts} attempt(s): {cause}")]
pub struct StepError {
    pub step: String,
    pub cause: String,
    pub retryable: bool,
    pub attempts: u32,
    /// Set when the instance was cancelled while the step was in flight.
    pub cancelled: bool,
}

impl StepError {
    fn cancelled(step: &str, attempts: u32) -> Self {
        Self {
            step: step.to_string(),
            cause: "cancelled".to_string(),
            retryable: false,
            attempts,
            cancelled: true,
        }
    }
}

/// Why a single attempt did not produce an output.
enum AttemptFailure {
    Cancelled,
    Failed { cause: String, retryable: bool },
}

// ---------------------------------------------------------------------------
// StepExecutor
// ---------------------------------------------------------------------------

/// Runs one step invocation to completion under the engine's policies.
#[derive(Debug, Clone)]
pub struct StepExecutor {
    default_timeout: Duration,
    default_retry: RetryPolicy,
    events: EventBus,
}

impl StepExecutor {
    pub fn new(config: &EngineConfig, events: EventBus) -> Self {
        Self {
            default_timeout: config.step_timeout(),
            default_retry: RetryPolicy::from(&config.retry),
            events,
        }
    }

    /// Run `entry` against `view`, retrying retryable failures.
    pub async fn run(
        &self,
        instance_id: Uuid,
        entry: &StepEntry,
        view: InputView,
        cancel: &CancellationToken,
    ) -> Result<StepOutput, StepError> {
        let name = entry.name();
        let timeout = entry.options().timeout.unwrap_or(self.default_timeout);
        let policy = entry.options().retry.unwrap_or(self.default_retry);
        let mut attempt: u32 = 1;

        loop {
            if cancel.is_cancelled() {
                return Err(StepError::cancelled(name, attempt - 1));
            }

            self.events.publish(WorkflowEvent::StepStarted {
                instance_id,
                step: name.to_string(),
                attempt,
            });

            let span = tracing::info_span!("step", instance_id = %instance_id, step = name, attempt);
            let started = Instant::now();
            let outcome = self
                .attempt(entry, view.clone(), timeout, cancel)
                .instrument(span)
                .await;
            let duration_ms = started.elapsed().as_millis() as u64;

            let (cause, retryable) = match outcome {
                Ok(output) => {
                    tracing::debug!(instance_id = %instance_id, step = name, attempt, duration_ms, "step completed");
                    self.events.publish(WorkflowEvent::StepCompleted {
                        instance_id,
                        step: name.to_string(),
                        attempt,
                        duration_ms,
                    });
                    return Ok(output);
                }
                Err(AttemptFailure::Cancelled) => {
                    tracing::info!(instance_id = %instance_id, step = name, attempt, "step cancelled");
                    return Err(StepError::cancelled(name, attempt));
                }
                Err(AttemptFailure::Failed { cause, retryable }) => (cause, retryable),
            };

            let will_retry = retryable && policy.should_retry(attempt);
            tracing::warn!(
                instance_id = %instance_id,
                step = name,
                attempt,
                retryable,
                will_retry,
                error = cause.as_str(),
                "step attempt failed"
            );
            self.events.publish(WorkflowEvent::StepFailed {
                instance_id,
                step: name.to_string(),
                attempt,
                error: cause.clone(),
                will_retry,
            });

            if !will_retry {
                return Err(StepError {
                    step: name.to_string(),
                    cause,
                    retryable,
                    attempts: attempt,
                    cancelled: false,
                });
            }

            let delay = policy.delay_for(attempt);
            tokio::select! {
                _ = cancel.cancelled() => return Err(StepError::cancelled(name, attempt)),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    async fn attempt(
        &self,
        entry: &StepEntry,
        view: InputView,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<StepOutput, AttemptFailure> {
        let step = entry.step().clone();
        let mut handle = tokio::spawn(async move { step.run(view).await });

        tokio::select! {
            _ = cancel.cancelled() => {
                handle.abort();
                Err(AttemptFailure::Cancelled)
            }
            joined = tokio::time::timeout(timeout, &mut handle) => match joined {
                Err(_elapsed) => {
                    handle.abort();
                    Err(AttemptFailure::Failed {
                        cause: format!("timed out after {}ms", timeout.as_millis()),
                        retryable: true,
                    })
                }
                Ok(Err(join_err)) if join_err.is_panic() => Err(AttemptFailure::Failed {
                    cause: format!("step panicked: {}", panic_message(join_err)),
                    retryable: false,
                }),
                Ok(Err(join_err)) => Err(AttemptFailure::Failed {
                    cause: format!("step task aborted: {join_err}"),
                    retryable: false,
                }),
                Ok(Ok(Err(failure))) => Err(AttemptFailure::Failed {
                    cause: failure.message,
                    retryable: failure.retryable,
                }),
                Ok(Ok(Ok(output))) => Ok(output),
            },
        }
    }
}

fn panic_message(err: tokio::task::JoinError) -> String {
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
