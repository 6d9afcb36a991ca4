//! Workflow instance subcommands.
//!
//! run, advance, resume, retry, cancel, status, history, and instances.
//! Every handler prints styled text by default and JSON with `--json`.

use anyhow::{Context, Result};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use futures_util::TryStreamExt;
use quill_core::event::bus::drain_for;
use quill_core::workflow::InstanceSnapshot;
use quill_types::checkpoint::Checkpoint;
use quill_types::event::WorkflowEvent;
use quill_types::state::StateDelta;
use quill_types::status::{InstanceStatus, StatusReport};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::Commands;
use crate::pipeline::{ReviewDecision, ReviewFeedback};
use crate::state::AppState;

/// Dispatch a parsed command.
pub async fn handle_command(cmd: Commands, state: &AppState, json: bool, verbose: bool) -> Result<()> {
    match cmd {
        Commands::Run { topic } => handle_run(&topic, state, json, verbose).await,
        Commands::Advance { instance_id } => handle_advance(instance_id, state, json, verbose).await,
        Commands::Resume {
            instance_id,
            approve,
            revise: _,
            notes,
        } => {
            let decision = if approve {
                ReviewDecision::Approve
            } else {
                ReviewDecision::Revise
            };
            handle_resume(instance_id, ReviewFeedback::new(decision, notes), state, json, verbose).await
        }
        Commands::Retry { instance_id } => handle_retry(instance_id, state, json, verbose).await,
        Commands::Cancel { instance_id } => handle_cancel(instance_id, state, json).await,
        Commands::Status { instance_id } => handle_status(instance_id, state, json).await,
        Commands::History { instance_id, full } => handle_history(instance_id, full, state, json).await,
        Commands::Instances { status } => handle_instances(status, state, json).await,
    }
}

// ---------------------------------------------------------------------------
// Driving commands
// ---------------------------------------------------------------------------

async fn handle_run(topic: &str, state: &AppState, json: bool, verbose: bool) -> Result<()> {
    let mut events = verbose.then(|| state.coordinator.events().subscribe());

    let instance_id = state
        .coordinator
        .start(state.graph.clone(), StateDelta::new().set("topic", topic))
        .await
        .context("Failed to start workflow instance")?;
    let snapshot = state.coordinator.advance(instance_id).await?;

    print_events(events.as_mut(), instance_id, json);
    display_snapshot(&snapshot, json)
}

async fn handle_advance(instance_id: Uuid, state: &AppState, json: bool, verbose: bool) -> Result<()> {
    state.attach(instance_id).await?;
    let mut events = verbose.then(|| state.coordinator.events().subscribe());

    let snapshot = state.coordinator.advance(instance_id).await?;

    print_events(events.as_mut(), instance_id, json);
    display_snapshot(&snapshot, json)
}

async fn handle_resume(
    instance_id: Uuid,
    feedback: ReviewFeedback,
    state: &AppState,
    json: bool,
    verbose: bool,
) -> Result<()> {
    state.attach(instance_id).await?;
    let mut events = verbose.then(|| state.coordinator.events().subscribe());

    let snapshot = state
        .coordinator
        .resume(instance_id, feedback.into_delta())
        .await?;

    print_events(events.as_mut(), instance_id, json);
    display_snapshot(&snapshot, json)
}

async fn handle_retry(instance_id: Uuid, state: &AppState, json: bool, verbose: bool) -> Result<()> {
    state.attach(instance_id).await?;
    let mut events = verbose.then(|| state.coordinator.events().subscribe());

    let snapshot = state.coordinator.retry(instance_id).await?;

    print_events(events.as_mut(), instance_id, json);
    display_snapshot(&snapshot, json)
}

async fn handle_cancel(instance_id: Uuid, state: &AppState, json: bool) -> Result<()> {
    state.attach(instance_id).await?;
    state.coordinator.cancel(instance_id).await?;
    let report = state.coordinator.status(instance_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!();
        println!(
            "  {} Instance {} is {}",
            style("*").green().bold(),
            style(short_id(&instance_id)).cyan(),
            report.status
        );
        println!();
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

async fn handle_status(instance_id: Uuid, state: &AppState, json: bool) -> Result<()> {
    let report = state.coordinator.status(instance_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    display_report(&report);
    Ok(())
}

async fn handle_history(instance_id: Uuid, full: bool, state: &AppState, json: bool) -> Result<()> {
    let checkpoints: Vec<Checkpoint> = state
        .coordinator
        .history(instance_id)
        .await?
        .try_collect()
        .await
        .context("Failed to load checkpoint history")?;

    if json {
        if full {
            println!("{}", serde_json::to_string_pretty(&checkpoints)?);
        } else {
            let reports: Vec<StatusReport> = checkpoints.iter().map(Checkpoint::report).collect();
            println!("{}", serde_json::to_string_pretty(&reports)?);
        }
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Seq").fg(Color::Cyan),
            Cell::new("Status"),
            Cell::new("Step"),
            Cell::new("Steps run"),
            Cell::new("Saved"),
            Cell::new("Error"),
        ]);

    for c in &checkpoints {
        let error = c
            .error
            .as_ref()
            .map(|e| e.chars().take(40).collect::<String>())
            .unwrap_or_else(|| "-".to_string());

        table.add_row(vec![
            Cell::new(c.sequence),
            format_status(c.status),
            Cell::new(c.current_step.as_deref().unwrap_or("-")),
            Cell::new(c.state.step_count()),
            Cell::new(c.created_at.format("%Y-%m-%d %H:%M:%S").to_string()),
            Cell::new(error),
        ]);
    }

    println!();
    println!(
        "  History of instance '{}'",
        style(short_id(&instance_id)).cyan()
    );
    println!();
    println!("{table}");
    println!();

    if full {
        for c in &checkpoints {
            println!("  {} {}", style("checkpoint").bold(), c.sequence);
            println!("{}", serde_json::to_string_pretty(c.state.fields())?);
            println!();
        }
    }

    Ok(())
}

async fn handle_instances(status: Option<InstanceStatus>, state: &AppState, json: bool) -> Result<()> {
    let instances = state.coordinator.list_instances(status).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&instances)?);
        return Ok(());
    }

    if instances.is_empty() {
        println!();
        println!("  No workflow instances.");
        println!(
            "  Start one with: {}",
            style("quill run --topic <topic>").dim()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Instance").fg(Color::Cyan),
            Cell::new("Graph"),
            Cell::new("Status"),
            Cell::new("Checkpoint"),
            Cell::new("Updated"),
        ]);

    for i in &instances {
        table.add_row(vec![
            Cell::new(i.instance_id),
            Cell::new(&i.graph),
            format_status(i.status),
            Cell::new(i.last_checkpoint_seq),
            Cell::new(i.updated_at.format("%Y-%m-%d %H:%M").to_string()),
        ]);
    }

    println!();
    println!("{table}");
    println!();

    Ok(())
}

// ---------------------------------------------------------------------------
// Display helpers
// ---------------------------------------------------------------------------

fn display_snapshot(snapshot: &InstanceSnapshot, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(snapshot)?);
        return Ok(());
    }

    display_report(&snapshot.report);

    if let Some(messages) = snapshot.state.get_as::<Vec<String>>("messages") {
        println!("  {}", style("Log:").bold());
        for message in messages {
            println!("    {} {message}", style("-").dim());
        }
        println!();
    }
    Ok(())
}

fn display_report(report: &StatusReport) {
    println!();
    println!(
        "  {} {}",
        style("Instance:").bold(),
        style(report.instance_id).cyan()
    );
    println!("  Status: {}", styled_status(report.status));
    if let Some(step) = &report.current_step {
        println!("  Step: {step}");
    }
    println!("  Steps run: {}", report.step_count);
    println!("  Checkpoint: {}", report.last_checkpoint_seq);
    if let Some(interrupt) = &report.interrupt {
        println!(
            "  Waiting {} '{}' for '{}'",
            interrupt.position, interrupt.step, interrupt.feedback_field
        );
        println!(
            "  Continue with: {}",
            style(format!(
                "quill resume {} --approve | --revise --notes <notes>",
                report.instance_id
            ))
            .dim()
        );
    }
    if let Some(err) = &report.error {
        println!("  Error: {}", style(err).red());
        if report.status == InstanceStatus::Failed {
            println!(
                "  Rerun with: {}",
                style(format!("quill retry {}", report.instance_id)).dim()
            );
        }
    }
    println!();
}

fn print_events(
    rx: Option<&mut broadcast::Receiver<WorkflowEvent>>,
    instance_id: Uuid,
    json: bool,
) {
    let Some(rx) = rx else {
        return;
    };
    for event in drain_for(rx, instance_id) {
        if json {
            if let Ok(line) = serde_json::to_string(&event) {
                eprintln!("{line}");
            }
        } else {
            eprintln!("  {} {}", style(">").dim(), describe_event(&event));
        }
    }
}

fn describe_event(event: &WorkflowEvent) -> String {
    match event {
        WorkflowEvent::InstanceStarted { graph, .. } => format!("started graph '{graph}'"),
        WorkflowEvent::InstanceResumed { step, .. } => match step {
            Some(step) => format!("resumed at '{step}'"),
            None => "resumed".to_string(),
        },
        WorkflowEvent::InstanceInterrupted { step, position, .. } => {
            format!("interrupted {position} '{step}'")
        }
        WorkflowEvent::InstanceCompleted { step_count, .. } => {
            format!("completed after {step_count} steps")
        }
        WorkflowEvent::InstanceFailed { error, .. } => format!("failed: {error}"),
        WorkflowEvent::InstanceCancelled { .. } => "cancelled".to_string(),
        WorkflowEvent::StepStarted { step, attempt, .. } => {
            format!("step '{step}' attempt {attempt} started")
        }
        WorkflowEvent::StepCompleted {
            step, duration_ms, ..
        } => format!("step '{step}' completed in {duration_ms}ms"),
        WorkflowEvent::StepFailed {
            step,
            attempt,
            error,
            will_retry,
            ..
        } => {
            let next = if *will_retry { "retrying" } else { "giving up" };
            format!("step '{step}' attempt {attempt} failed ({error}), {next}")
        }
        WorkflowEvent::CheckpointSaved {
            sequence, status, ..
        } => format!("checkpoint {sequence} saved ({status})"),
    }
}

fn styled_status(status: InstanceStatus) -> console::StyledObject<String> {
    let text = status.to_string();
    match status {
        InstanceStatus::Running => style(text).yellow(),
        InstanceStatus::Interrupted => style(text).magenta(),
        InstanceStatus::Completed => style(text).green(),
        InstanceStatus::Failed => style(text).red(),
        InstanceStatus::Cancelled => style(text).dim(),
    }
}

fn format_status(status: InstanceStatus) -> Cell {
    let cell = Cell::new(status.to_string());
    match status {
        InstanceStatus::Running => cell.fg(Color::Yellow),
        InstanceStatus::Interrupted => cell.fg(Color::Magenta),
        InstanceStatus::Completed => cell.fg(Color::Green),
        InstanceStatus::Failed => cell.fg(Color::Red),
        InstanceStatus::Cancelled => cell.fg(Color::DarkGrey),
    }
}

fn short_id(id: &Uuid) -> String {
    id.to_string().chars().take(8).collect()
}
