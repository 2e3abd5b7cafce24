//! `tflow trigger`, `tflow message` and `tflow signal`.

use anyhow::Result;
use console::style;
use serde_json::Value;
use uuid::Uuid;

use tokenflow_types::runtime::ProcessInstance;

use crate::state::AppState;

pub async fn trigger(
    state: &AppState,
    execution_id: Uuid,
    payload: Option<Value>,
    json: bool,
) -> Result<()> {
    let instance = state.engine.trigger(execution_id, payload).await?;
    report(&instance, &format!("Triggered execution {execution_id}"), json)
}

pub async fn message(
    state: &AppState,
    instance_id: Uuid,
    name: &str,
    payload: Option<Value>,
    json: bool,
) -> Result<()> {
    let instance = state
        .engine
        .message_event_received(instance_id, name, payload)
        .await?;
    report(&instance, &format!("Delivered message '{name}'"), json)
}

pub async fn signal(
    state: &AppState,
    name: &str,
    payload: Option<Value>,
    json: bool,
) -> Result<()> {
    let delivery = state.engine.signal_event_received(name, payload).await?;

    if json {
        let failed: Vec<_> = delivery
            .failed
            .iter()
            .map(|(id, e)| serde_json::json!({ "instance": id, "error": e.to_string() }))
            .collect();
        let out = serde_json::json!({
            "signal": name,
            "delivered": delivery.delivered,
            "failed": failed,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else if delivery.delivered.is_empty() && delivery.failed.is_empty() {
        println!();
        println!("  No instance is waiting for signal '{}'.", style(name).cyan());
        println!();
    } else {
        println!();
        println!(
            "  {} Signal '{}' delivered to {} instance(s)",
            style("*").green().bold(),
            style(name).cyan(),
            delivery.delivered.len()
        );
        for (id, e) in &delivery.failed {
            println!("  {} Instance {id}: {e}", style("!").red().bold());
        }
        println!();
    }

    if delivery.is_complete() {
        Ok(())
    } else {
        anyhow::bail!(
            "signal '{name}' failed on {} instance(s)",
            delivery.failed.len()
        )
    }
}

fn report(instance: &ProcessInstance, headline: &str, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(instance)?);
    } else {
        println!();
        println!("  {} {headline}", style("*").green().bold());
        println!("  Instance {} is {}", instance.id, instance.status);
        println!();
    }
    Ok(())
}
