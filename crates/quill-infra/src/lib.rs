//! Infrastructure layer for Quill.
//!
//! Implements the storage port defined in `quill-core` on top of SQLite and
//! loads engine configuration from the data directory.

pub mod config;
pub mod sqlite;
