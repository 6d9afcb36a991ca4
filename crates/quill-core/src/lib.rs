//! Core engine for Quill.
//!
//! Holds the workflow graph model, the state merge engine, the step executor,
//! the coordinator that drives instances, and the checkpoint store port.
//! Concrete durable storage lives in `quill-infra`.

pub mod event;
pub mod repository;
pub mod workflow;
