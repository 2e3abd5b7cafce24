//! `tflow deploy` and `tflow definitions`.

use std::path::Path;

use anyhow::{Context, Result};
use comfy_table::{presets, Cell, Color, ContentArrangement, Table};
use console::style;

use tokenflow_core::process::definition::load_process_file;
use tokenflow_core::repository::RuntimeRepository;

use crate::state::AppState;

pub async fn deploy(state: &AppState, file: &Path, json: bool) -> Result<()> {
    let definition = load_process_file(file)
        .with_context(|| format!("cannot load process definition {}", file.display()))?;
    let graph = state.engine.deploy(definition).await?;
    let def = graph.definition();

    if json {
        let out = serde_json::json!({
            "id": def.id.to_string(),
            "key": def.key,
            "version": def.version,
            "nodes": def.nodes.len(),
            "flows": def.flows.len(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!();
        println!(
            "  {} Deployed '{}' version {}",
            style("*").green().bold(),
            style(&def.key).cyan(),
            def.version
        );
        println!("  ID: {}", def.id);
        if let Some(name) = &def.name {
            println!("  Name: {name}");
        }
        println!(
            "  Start it with: {}",
            style(format!("tflow start {}", def.key)).dim()
        );
        println!();
    }
    Ok(())
}

pub async fn list(state: &AppState, json: bool) -> Result<()> {
    let defs = state.engine.repository().list_definitions().await?;

    if json {
        let out: Vec<_> = defs
            .iter()
            .map(|d| {
                serde_json::json!({
                    "id": d.id.to_string(),
                    "key": d.key,
                    "name": d.name,
                    "version": d.version,
                    "tenant_id": d.tenant_id,
                    "nodes": d.nodes.len(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if defs.is_empty() {
        println!();
        println!("  No process definitions deployed.");
        println!(
            "  Deploy one with: {}",
            style("tflow deploy <file.yaml>").dim()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Key").fg(Color::Cyan),
            Cell::new("Version"),
            Cell::new("Name"),
            Cell::new("Tenant"),
            Cell::new("ID"),
        ]);
    for d in &defs {
        table.add_row(vec![
            Cell::new(&d.key),
            Cell::new(d.version),
            Cell::new(d.name.as_deref().unwrap_or("-")),
            Cell::new(d.tenant_id.as_deref().unwrap_or("-")),
            Cell::new(d.id),
        ]);
    }
    println!("{table}");
    Ok(())
}
