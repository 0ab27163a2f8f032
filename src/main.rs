//! Telos kernel host - main entry point.
//!
//! Boots an isolated core, starts the self-optimization loop and logs a
//! state summary until interrupted. `telos-kernel schema` prints the JSON
//! schema of the config file instead.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use telos_core::{Config, Kernel};

#[derive(Debug, Parser)]
#[command(name = "telos-kernel", version, about = "Telos event and module core")]
struct Cli {
    /// JSON config file. Defaults are used when omitted.
    #[arg(long, short, env = "TELOS_CONFIG")]
    config: Option<PathBuf>,

    /// Interval between state summaries, e.g. "30s" or "2m".
    #[arg(long, default_value = "60s", value_parser = humantime_duration)]
    summary_interval: Duration,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the core until Ctrl-C (default).
    Run,
    /// Print the config JSON schema and exit.
    Schema,
}

fn humantime_duration(raw: &str) -> Result<Duration, String> {
    #[derive(serde::Deserialize)]
    struct Wrapper(#[serde(with = "humantime_serde")] Duration);

    serde_json::from_value::<Wrapper>(serde_json::Value::String(raw.to_string()))
        .map(|w| w.0)
        .map_err(|e| format!("invalid duration '{raw}': {e}"))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if matches!(cli.command, Some(Command::Schema)) {
        println!("{}", serde_json::to_string_pretty(&Config::json_schema())?);
        return Ok(());
    }

    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    telos_core::observability::init_tracing_with(&config.observability);

    let kernel = Kernel::new(config)?;
    let optimizer = kernel.start_optimizer();

    tracing::info!(
        config = ?cli.config,
        summary_interval = ?cli.summary_interval,
        "telos_kernel_started"
    );

    let mut summary = tokio::time::interval(cli.summary_interval);
    summary.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // First tick completes immediately.
    summary.tick().await;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = summary.tick() => {
                let state = kernel.os_state();
                tracing::info!(
                    active_modules = state.active_modules,
                    active_footprint_mb = state.active_footprint_mb,
                    budget_mb = state.budget_mb,
                    history_len = state.bus.history_len,
                    events_published = state.bus.events_published,
                    throttled = state.throttle.engaged,
                    optimizer_passes = state.optimizer.passes_run,
                    "state_summary"
                );
            }
            signal = &mut shutdown => {
                if let Err(err) = signal {
                    tracing::error!(error = %err, "signal_listener_failed");
                }
                break;
            }
        }
    }

    let destroyed = kernel.shutdown();
    if let Err(err) = optimizer.await {
        tracing::warn!(error = %err, "optimizer_task_join_failed");
    }
    tracing::info!(destroyed, "telos_kernel_stopped");
    Ok(())
}
