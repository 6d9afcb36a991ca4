//! Shared domain types for Quill.
//!
//! Pure data: the state document and its merge policies, checkpoints,
//! instance statuses, engine events, configuration, and storage errors.
//! Nothing in this crate performs I/O.

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod event;
pub mod state;
pub mod status;
