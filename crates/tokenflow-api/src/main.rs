//! tokenflow CLI entry point.
//!
//! Binary name: `tflow`
//!
//! Parses CLI arguments, initializes tracing, opens the database in the data
//! directory, then dispatches to the command handler.

mod cli;
mod state;

use clap::Parser;
use clap_complete::generate;
use tokenflow_observe::{init_tracing, shutdown_tracing, LogFormat, TracingOptions};

use cli::{parse_payload, vars_to_map, Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let options = TracingOptions {
        verbosity: cli.verbose,
        quiet: cli.quiet,
        format: if cli.json { LogFormat::Json } else { LogFormat::Pretty },
        otel: cli.otel,
    };
    init_tracing(&options).map_err(|e| anyhow::anyhow!("cannot initialize logging: {e}"))?;

    // Shell completions don't need app state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "tflow", &mut std::io::stdout());
        return Ok(());
    }

    let state = AppState::init().await?;
    let result = dispatch(&state, cli).await;
    shutdown_tracing();
    result
}

async fn dispatch(state: &AppState, cli: Cli) -> anyhow::Result<()> {
    let json = cli.json;
    match cli.command {
        Commands::Deploy { file } => cli::definition::deploy(state, &file, json).await,
        Commands::Definitions => cli::definition::list(state, json).await,
        Commands::Start {
            key,
            business_key,
            initiator,
            vars,
        } => {
            cli::instance::start(state, &key, business_key, initiator, vars_to_map(vars), json)
                .await
        }
        Commands::Instances { status, limit } => {
            cli::instance::list(state, status, limit, json).await
        }
        Commands::Show { instance } => cli::instance::show(state, instance, json).await,
        Commands::Tasks { instance } => cli::task::list(state, instance, json).await,
        Commands::Complete { task, vars } => {
            cli::task::complete(state, task, vars_to_map(vars), json).await
        }
        Commands::Trigger { execution, payload } => {
            let payload = parse_payload(payload.as_deref())?;
            cli::event::trigger(state, execution, payload, json).await
        }
        Commands::Message {
            instance,
            name,
            payload,
        } => {
            let payload = parse_payload(payload.as_deref())?;
            cli::event::message(state, instance, &name, payload, json).await
        }
        Commands::Signal { name, payload } => {
            let payload = parse_payload(payload.as_deref())?;
            cli::event::signal(state, &name, payload, json).await
        }
        Commands::Jobs { instance } => cli::job::list(state, instance, json).await,
        Commands::RunJobs => cli::job::run_once(state, json).await,
        Commands::Worker { owner } => cli::job::worker(state, owner, cli.quiet).await,
        Commands::Completions { .. } => Ok(()),
    }
}

/// Wait for Ctrl+C or SIGTERM for graceful shutdown.
pub(crate) async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
