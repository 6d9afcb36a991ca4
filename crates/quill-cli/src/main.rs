//! Quill CLI entry point.
//!
//! Binary name: `quill`
//!
//! Parses CLI arguments, initializes tracing, the database, and the engine,
//! then dispatches to the command handler.

mod cli;
mod pipeline;
mod state;

use clap::Parser;

use cli::Cli;
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Engine events at -v, everything at -vv
    let filter = match cli.verbose {
        0 => "warn",
        1 => "info,quill_core=debug",
        _ => "trace",
    };
    quill_observe::tracing_setup::init_tracing(filter, cli.otel)
        .map_err(|e| anyhow::anyhow!("failed to initialise tracing: {e}"))?;

    let state = AppState::init(cli.data_dir.clone()).await?;
    let result = cli::instance::handle_command(cli.command, &state, cli.json, cli.verbose > 0).await;

    quill_observe::tracing_setup::shutdown_tracing();
    result
}
