//! Workflow engine.
//!
//! Graph definition and validation, the pure merge engine, the step contract
//! and executor, interrupt points, the checkpoint writer, and the coordinator
//! that ties them together.

pub mod checkpoint;
pub mod coordinator;
pub mod executor;
pub mod graph;
pub mod interrupt;
pub mod merge;
pub mod retry;
pub mod step;
pub mod validation;

pub use coordinator::{Coordinator, EngineError, InstanceSnapshot};
pub use executor::{StepError, StepExecutor};
pub use graph::{BranchKey, END, GraphBuilder, GraphDefinition, Route, RoutingError, Target};
pub use step::{BoxStep, FnStep, Step, StepFailure, StepOptions, StepOutput, StepStatus};
pub use validation::{ValidationError, ValidationErrorKind};
