//! CLI command definitions for the `quill` binary.
//!
//! Uses clap derive macros for argument parsing. Every command except `run`
//! addresses an existing workflow instance by id.

pub mod instance;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use quill_types::status::InstanceStatus;
use uuid::Uuid;

/// Run and inspect durable content pipeline workflows.
#[derive(Parser)]
#[command(name = "quill", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Detailed output (-v for engine events, -vv for trace logging).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Data directory holding quill.db and config.toml.
    #[arg(long, global = true, env = "QUILL_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Export spans to stdout through OpenTelemetry.
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a content pipeline for a topic and drive it to its first halt.
    Run {
        /// Topic to produce content about.
        #[arg(long)]
        topic: String,
    },

    /// Keep driving a running instance, e.g. after a crash.
    Advance {
        /// Instance UUID.
        instance_id: Uuid,
    },

    /// Answer the review of an interrupted instance.
    Resume {
        /// Instance UUID.
        instance_id: Uuid,

        /// Approve the drafts for publishing.
        #[arg(long, conflicts_with = "revise", required_unless_present = "revise")]
        approve: bool,

        /// Send the drafts back to planning.
        #[arg(long)]
        revise: bool,

        /// Notes for the next revision.
        #[arg(long)]
        notes: Option<String>,
    },

    /// Show the status of an instance.
    Status {
        /// Instance UUID.
        instance_id: Uuid,
    },

    /// List the checkpoints of an instance, oldest first.
    History {
        /// Instance UUID.
        instance_id: Uuid,

        /// Include the state document of every checkpoint.
        #[arg(long)]
        full: bool,
    },

    /// Cancel an instance.
    Cancel {
        /// Instance UUID.
        instance_id: Uuid,
    },

    /// Rerun the failed batch of a failed instance.
    Retry {
        /// Instance UUID.
        instance_id: Uuid,
    },

    /// List stored instances.
    #[command(alias = "ls")]
    Instances {
        /// Only show instances with this status.
        #[arg(long)]
        status: Option<InstanceStatus>,
    },
}
