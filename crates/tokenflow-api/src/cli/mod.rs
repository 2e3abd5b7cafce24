//! CLI command definitions and dispatch for the `tflow` binary.
//!
//! Uses clap derive macros for argument parsing. Each command maps onto one
//! engine operation or repository query.

pub mod definition;
pub mod event;
pub mod instance;
pub mod job;
pub mod task;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use serde_json::{Map, Value};
use tokenflow_types::runtime::ProcessInstanceStatus;
use uuid::Uuid;

/// Run BPMN-style processes from the command line.
#[derive(Parser)]
#[command(name = "tflow", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed logs (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Also export spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Deploy a process definition from a YAML file as its next version.
    Deploy {
        /// Path to the process YAML file.
        file: PathBuf,
    },

    /// List deployed process definitions.
    Definitions,

    /// Start an instance of the latest version of a process.
    Start {
        /// Process definition key.
        key: String,

        #[arg(long)]
        business_key: Option<String>,

        /// User recorded as the instance starter.
        #[arg(long)]
        initiator: Option<String>,

        /// Initial variable as `name=value`; the value is parsed as JSON
        /// when possible (repeatable).
        #[arg(long = "var", value_parser = parse_var)]
        vars: Vec<(String, Value)>,
    },

    /// List process instances, newest first.
    Instances {
        /// Only instances with this status (running, completed).
        #[arg(long)]
        status: Option<ProcessInstanceStatus>,

        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Show the execution tree, variables and wait states of an instance.
    Show {
        /// Process instance UUID.
        instance: Uuid,
    },

    /// List open user tasks.
    Tasks {
        /// Only tasks of this process instance.
        #[arg(long)]
        instance: Option<Uuid>,
    },

    /// Complete a user task.
    Complete {
        /// Task UUID.
        task: Uuid,

        /// Variable as `name=value` (repeatable).
        #[arg(long = "var", value_parser = parse_var)]
        vars: Vec<(String, Value)>,
    },

    /// Trigger a waiting execution directly.
    Trigger {
        /// Execution UUID.
        execution: Uuid,

        /// JSON payload; object entries become process variables.
        #[arg(long)]
        payload: Option<String>,
    },

    /// Deliver a message to a process instance.
    Message {
        /// Process instance UUID.
        instance: Uuid,

        /// Message name.
        name: String,

        #[arg(long)]
        payload: Option<String>,
    },

    /// Broadcast a signal to every waiting instance.
    Signal {
        /// Signal name.
        name: String,

        #[arg(long)]
        payload: Option<String>,
    },

    /// List jobs, including dead letters.
    Jobs {
        /// Only jobs of this process instance.
        #[arg(long)]
        instance: Option<Uuid>,
    },

    /// Acquire and execute one batch of due jobs.
    #[command(name = "run-jobs")]
    RunJobs,

    /// Run the job executor until Ctrl+C.
    Worker {
        /// Lock owner name recorded on acquired jobs.
        #[arg(long)]
        owner: Option<String>,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

// ---------------------------------------------------------------------------
// Argument helpers
// ---------------------------------------------------------------------------

/// Parse `name=value`. The value is read as JSON, falling back to a plain
/// string (`amount=5` is a number, `who=alice` a string).
pub fn parse_var(raw: &str) -> Result<(String, Value), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got '{raw}'"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("missing variable name in '{raw}'"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((name.to_string(), value))
}

pub fn vars_to_map(vars: Vec<(String, Value)>) -> Map<String, Value> {
    vars.into_iter().collect()
}

/// Parse an optional `--payload` argument as JSON.
pub fn parse_payload(raw: Option<&str>) -> anyhow::Result<Option<Value>> {
    use anyhow::Context;
    raw.map(|s| serde_json::from_str(s).context("invalid JSON payload"))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use serde_json::json;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn vars_are_json_or_strings() {
        assert_eq!(parse_var("amount=5").unwrap(), ("amount".into(), json!(5)));
        assert_eq!(parse_var("ok=true").unwrap(), ("ok".into(), json!(true)));
        assert_eq!(parse_var("who=alice").unwrap(), ("who".into(), json!("alice")));
        assert_eq!(parse_var("expr=a=b").unwrap(), ("expr".into(), json!("a=b")));
        assert!(parse_var("novalue").is_err());
        assert!(parse_var("=1").is_err());
    }

    #[test]
    fn start_collects_repeated_vars() {
        let cli = Cli::try_parse_from([
            "tflow", "start", "review", "--var", "x=1", "--var", "name=bob", "--json",
        ])
        .unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Start { key, vars, .. } => {
                assert_eq!(key, "review");
                let map = vars_to_map(vars);
                assert_eq!(map["x"], json!(1));
                assert_eq!(map["name"], json!("bob"));
            }
            _ => panic!("expected start"),
        }
    }

    #[test]
    fn payload_must_be_json() {
        assert_eq!(parse_payload(None).unwrap(), None);
        assert_eq!(parse_payload(Some(r#"{"a":1}"#)).unwrap(), Some(json!({"a": 1})));
        assert!(parse_payload(Some("{oops")).is_err());
    }
}
