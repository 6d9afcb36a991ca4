//! Storage ports.
//!
//! The core crate defines what persistence must provide; `quill-infra`
//! supplies the durable implementation. An in-memory store lives here for
//! tests and embedded use.

pub mod checkpoint;
pub mod memory;

pub use checkpoint::{CheckpointStore, LeaseClaim, load_history};
pub use memory::InMemoryCheckpointStore;
