//! `tflow jobs`, `tflow run-jobs` and `tflow worker`.

use anyhow::Result;
use comfy_table::{presets, Cell, Color, ContentArrangement, Table};
use console::style;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use tokenflow_core::job::JobExecutor;
use tokenflow_core::repository::RuntimeRepository;

use crate::state::AppState;

pub async fn list(state: &AppState, instance: Option<Uuid>, json: bool) -> Result<()> {
    let jobs = state
        .engine
        .repository()
        .list_jobs(instance.as_ref())
        .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&jobs)?);
        return Ok(());
    }

    if jobs.is_empty() {
        println!();
        println!("  No jobs.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Job").fg(Color::Cyan),
            Cell::new("Type"),
            Cell::new("Activity"),
            Cell::new("Due"),
            Cell::new("Retries"),
            Cell::new("Locked by"),
            Cell::new("Last error"),
        ]);
    for j in &jobs {
        let retries = if j.retries == 0 {
            Cell::new("dead").fg(Color::Red)
        } else {
            Cell::new(j.retries)
        };
        table.add_row(vec![
            Cell::new(j.id),
            Cell::new(j.job_type),
            Cell::new(j.activity_id.as_deref().unwrap_or("-")),
            Cell::new(j.due_at.format("%Y-%m-%d %H:%M:%S")),
            retries,
            Cell::new(j.lock_owner.as_deref().unwrap_or("-")),
            Cell::new(j.exception_message.as_deref().unwrap_or("-")),
        ]);
    }
    println!("{table}");
    Ok(())
}

pub async fn run_once(state: &AppState, json: bool) -> Result<()> {
    let executor = JobExecutor::new(state.engine.clone());
    let summary = executor.run_once().await?;

    if json {
        let out = serde_json::json!({
            "acquired": summary.acquired,
            "succeeded": summary.succeeded,
            "failed": summary.failed,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else if summary.acquired == 0 {
        println!();
        println!("  No jobs due.");
        println!();
    } else {
        println!();
        println!(
            "  {} Ran {} job(s): {} succeeded, {} failed",
            style("*").green().bold(),
            summary.acquired,
            style(summary.succeeded).green(),
            if summary.failed > 0 {
                style(summary.failed).red()
            } else {
                style(summary.failed).dim()
            }
        );
        println!();
    }
    Ok(())
}

pub async fn worker(state: &AppState, owner: Option<String>, quiet: bool) -> Result<()> {
    let mut executor = JobExecutor::new(state.engine.clone());
    if let Some(owner) = owner {
        executor = executor.with_owner(owner);
    }

    if !quiet {
        println!(
            "  {} Job worker '{}' polling {}",
            style("⚡").bold(),
            style(executor.owner()).cyan(),
            style(state.data_dir.display()).dim()
        );
        println!("  {}", style("Press Ctrl+C to stop").dim());
    }

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        crate::shutdown_signal().await;
        shutdown.cancel();
    });
    executor.run(cancel).await;

    if !quiet {
        println!("\n  Worker stopped.");
    }
    Ok(())
}
