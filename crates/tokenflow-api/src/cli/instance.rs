//! `tflow start`, `tflow instances` and `tflow show`.

use anyhow::{anyhow, Result};
use comfy_table::{presets, Cell, Color, ContentArrangement, Table};
use console::style;
use serde_json::{Map, Value};
use uuid::Uuid;

use tokenflow_core::repository::RuntimeRepository;
use tokenflow_core::StartProcessInstance;
use tokenflow_types::runtime::{Execution, InstanceSnapshot, ProcessInstanceStatus};

use crate::state::AppState;

// ---------------------------------------------------------------------------
// Start
// ---------------------------------------------------------------------------

pub async fn start(
    state: &AppState,
    key: &str,
    business_key: Option<String>,
    initiator: Option<String>,
    variables: Map<String, Value>,
    json: bool,
) -> Result<()> {
    let mut request = StartProcessInstance::new(key).with_variables(variables);
    if let Some(business_key) = business_key {
        request = request.with_business_key(business_key);
    }
    if let Some(initiator) = initiator {
        request = request.with_initiator(initiator);
    }
    let instance = state.engine.start_process_instance(request).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&instance)?);
    } else {
        println!();
        println!(
            "  {} Started '{}'",
            style("*").green().bold(),
            style(&instance.process_definition_key).cyan()
        );
        println!("  Instance: {}", instance.id);
        println!("  Status: {}", status_label(instance.status));
        println!();
        println!(
            "  Inspect it: {}",
            style(format!("tflow show {}", instance.id)).dim()
        );
        println!();
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

pub async fn list(
    state: &AppState,
    status: Option<ProcessInstanceStatus>,
    limit: u32,
    json: bool,
) -> Result<()> {
    let instances = state
        .engine
        .repository()
        .list_instances(status, limit)
        .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&instances)?);
        return Ok(());
    }

    if instances.is_empty() {
        println!();
        println!("  No process instances.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("ID").fg(Color::Cyan),
            Cell::new("Process"),
            Cell::new("Business key"),
            Cell::new("Status"),
            Cell::new("Started"),
            Cell::new("Ended"),
        ]);
    for i in &instances {
        table.add_row(vec![
            Cell::new(i.id),
            Cell::new(&i.process_definition_key),
            Cell::new(i.business_key.as_deref().unwrap_or("-")),
            status_cell(i.status),
            Cell::new(i.started_at.format("%Y-%m-%d %H:%M:%S")),
            Cell::new(
                i.ended_at
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "-".to_string()),
            ),
        ]);
    }
    println!("{table}");
    Ok(())
}

// ---------------------------------------------------------------------------
// Show
// ---------------------------------------------------------------------------

pub async fn show(state: &AppState, instance_id: Uuid, json: bool) -> Result<()> {
    let snapshot = state
        .engine
        .instance(instance_id)
        .await?
        .ok_or_else(|| anyhow!("process instance {instance_id} not found"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }

    let instance = &snapshot.instance;
    println!();
    println!(
        "  {} {} ({})",
        style(&instance.process_definition_key).cyan().bold(),
        instance.id,
        status_label(instance.status)
    );
    if let Some(business_key) = &instance.business_key {
        println!("  Business key: {business_key}");
    }
    println!("  Revision: {}", instance.revision);
    println!();

    println!("  {}", style("── Executions ──").dim());
    let lines = execution_tree_lines(&snapshot);
    if lines.is_empty() {
        println!("  (none)");
    }
    for line in lines {
        println!("  {line}");
    }

    if !snapshot.variables.is_empty() {
        println!();
        println!("  {}", style("── Variables ──").dim());
        for var in &snapshot.variables {
            println!(
                "  {} = {}  {}",
                style(&var.name).bold(),
                var.value,
                style(short_id(var.execution_id)).dim()
            );
        }
    }

    if !snapshot.tasks.is_empty() {
        println!();
        println!("  {}", style("── Tasks ──").dim());
        for task in &snapshot.tasks {
            println!(
                "  {} {}  {}",
                task.id,
                task.name.as_deref().unwrap_or(&task.task_definition_key),
                style(task.assignee.as_deref().unwrap_or("unassigned")).dim()
            );
        }
    }

    if !snapshot.event_subscriptions.is_empty() {
        println!();
        println!("  {}", style("── Waiting for ──").dim());
        for sub in &snapshot.event_subscriptions {
            println!(
                "  {} '{}' at {}",
                sub.event_type,
                sub.event_name,
                style(&sub.activity_id).cyan()
            );
        }
    }

    if !snapshot.jobs.is_empty() {
        println!();
        println!("  {}", style("── Jobs ──").dim());
        for job in &snapshot.jobs {
            println!(
                "  {} {} due {} (retries {})",
                job.job_type,
                job.activity_id.as_deref().unwrap_or("-"),
                job.due_at.format("%Y-%m-%d %H:%M:%S"),
                job.retries
            );
        }
    }
    println!();
    Ok(())
}

/// Render the execution tree depth-first, children in creation order.
pub fn execution_tree_lines(snapshot: &InstanceSnapshot) -> Vec<String> {
    let mut lines = Vec::new();
    let roots = snapshot.executions.iter().filter(|e| e.parent_id.is_none());
    for root in roots {
        push_execution(snapshot, root, 0, &mut lines);
    }
    lines
}

fn push_execution(
    snapshot: &InstanceSnapshot,
    execution: &Execution,
    depth: usize,
    lines: &mut Vec<String>,
) {
    let mut flags = Vec::new();
    if execution.is_scope {
        flags.push("scope");
    }
    if execution.is_concurrent {
        flags.push("concurrent");
    }
    if execution.is_multi_instance_root {
        flags.push("mi-root");
    }
    if !execution.is_active {
        flags.push("inactive");
    }
    if execution.is_ended {
        flags.push("ended");
    }
    let position = execution.current_flow_element_id.as_deref().unwrap_or("-");
    let flags = if flags.is_empty() {
        String::new()
    } else {
        format!(" [{}]", flags.join(", "))
    };
    lines.push(format!(
        "{}{} @ {}{}",
        "  ".repeat(depth),
        short_id(execution.id),
        position,
        flags
    ));

    let mut children: Vec<&Execution> = snapshot
        .executions
        .iter()
        .filter(|e| e.parent_id == Some(execution.id))
        .collect();
    children.sort_by_key(|e| (e.created_at, e.id));
    for child in children {
        push_execution(snapshot, child, depth + 1, lines);
    }
}

fn short_id(id: Uuid) -> String {
    let full = id.simple().to_string();
    full[full.len() - 8..].to_string()
}

fn status_label(status: ProcessInstanceStatus) -> String {
    match status {
        ProcessInstanceStatus::Running => style("running").green().to_string(),
        ProcessInstanceStatus::Completed => style("completed").dim().to_string(),
    }
}

fn status_cell(status: ProcessInstanceStatus) -> Cell {
    match status {
        ProcessInstanceStatus::Running => Cell::new("running").fg(Color::Green),
        ProcessInstanceStatus::Completed => Cell::new("completed").fg(Color::DarkGrey),
    }
}
