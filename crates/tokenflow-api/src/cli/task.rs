//! `tflow tasks` and `tflow complete`.

use anyhow::Result;
use comfy_table::{presets, Cell, Color, ContentArrangement, Table};
use console::style;
use serde_json::{Map, Value};
use uuid::Uuid;

use tokenflow_core::repository::RuntimeRepository;

use crate::state::AppState;

pub async fn list(state: &AppState, instance: Option<Uuid>, json: bool) -> Result<()> {
    let tasks = state
        .engine
        .repository()
        .list_tasks(instance.as_ref())
        .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&tasks)?);
        return Ok(());
    }

    if tasks.is_empty() {
        println!();
        println!("  No open tasks.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Task").fg(Color::Cyan),
            Cell::new("Name"),
            Cell::new("Assignee"),
            Cell::new("Instance"),
            Cell::new("Created"),
        ]);
    for t in &tasks {
        table.add_row(vec![
            Cell::new(t.id),
            Cell::new(t.name.as_deref().unwrap_or(&t.task_definition_key)),
            Cell::new(t.assignee.as_deref().unwrap_or("-")),
            Cell::new(t.process_instance_id),
            Cell::new(t.created_at.format("%Y-%m-%d %H:%M:%S")),
        ]);
    }
    println!("{table}");
    Ok(())
}

pub async fn complete(
    state: &AppState,
    task_id: Uuid,
    variables: Map<String, Value>,
    json: bool,
) -> Result<()> {
    let instance = state.engine.complete_task(task_id, variables).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&instance)?);
    } else {
        println!();
        println!("  {} Completed task {}", style("*").green().bold(), task_id);
        println!("  Instance {} is {}", instance.id, instance.status);
        println!();
    }
    Ok(())
}
