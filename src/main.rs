// SPDX-License-Identifier: MIT

use anyhow::Result;
use clap::{Parser, Subcommand};
use sentineld::config::OversightConfig;
use sentineld::engine::EvaluationOutcome;
use sentineld::kill_switch::KillError;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(
    name = "sentineld",
    about = "Agent oversight engine — heartbeat health, escalation, auto-restart, kill switch",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Data directory for config.toml and the SQLite database
    #[arg(long, env = "SENTINELD_DATA_DIR")]
    data_dir: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "SENTINELD_LOG")]
    log: Option<String>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "SENTINELD_LOG_FILE")]
    log_file: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the oversight loop in the foreground (default when no subcommand
    /// given). Evaluates the whole fleet every cycle.
    Serve,
    /// Run one evaluation cycle and print the outcome. With an agent id,
    /// evaluates only that agent.
    Evaluate {
        /// Agent id (omit to evaluate the whole fleet)
        agent: Option<String>,
    },
    /// Kill an agent: stop its service and mark it killed until an approved
    /// resume. Protected agents require a human actor.
    Kill {
        agent: String,
        /// Why the agent is being killed (recorded on the incident)
        #[arg(long)]
        reason: String,
        /// Human actor issuing the kill
        #[arg(long = "by", default_value = "cli")]
        triggered_by: String,
    },
    /// Resume a killed agent: start its service and resolve the kill incident.
    Resume {
        agent: String,
        /// Human approver recorded on the resolved incident
        #[arg(long = "by", default_value = "cli")]
        approved_by: String,
    },
    /// Scan heartbeat history for conditions that justify recommending a
    /// kill. Advisory only — never acts.
    Triggers,
    /// Show stored status and latest kill incident for every agent.
    Status {
        /// Emit machine-readable JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = OversightConfig::new(args.data_dir, args.log);
    let _file_guard = setup_logging(&config.log, args.log_file.as_deref(), &config.log_format);

    let engine = sentineld::bootstrap(&config).await?;

    match args.command {
        None | Some(Command::Serve) => {
            serve(engine, config.evaluation_interval_secs).await?;
        }
        Some(Command::Evaluate { agent }) => match agent {
            Some(agent_id) => {
                let outcome = engine.evaluate(&agent_id).await?;
                print_outcome(&agent_id, &outcome);
            }
            None => {
                for (agent_id, result) in engine.evaluate_all().await {
                    match result {
                        Ok(outcome) => print_outcome(&agent_id, &outcome),
                        Err(e) => eprintln!("{agent_id}: evaluation failed: {e}"),
                    }
                }
            }
        },
        Some(Command::Kill {
            agent,
            reason,
            triggered_by,
        }) => match engine.kill(&agent, &reason, &triggered_by).await {
            Ok(report) if report.command_succeeded => {
                println!("{agent}: killed (incident {})", report.incident.id);
            }
            Ok(report) => {
                println!(
                    "{agent}: marked killed but the stop command FAILED — verify manually (incident {})",
                    report.incident.id
                );
                std::process::exit(1);
            }
            Err(e @ KillError::Internal(_)) => return Err(e.into()),
            Err(e) => {
                eprintln!("kill rejected: {e}");
                std::process::exit(1);
            }
        },
        Some(Command::Resume { agent, approved_by }) => {
            match engine.resume(&agent, &approved_by).await {
                Ok(report) if report.started => println!("{agent}: resumed"),
                Ok(report) => {
                    eprintln!("{agent}: start command failed — agent remains killed: {}", report.output);
                    std::process::exit(1);
                }
                Err(e @ KillError::Internal(_)) => return Err(e.into()),
                Err(e) => {
                    eprintln!("resume rejected: {e}");
                    std::process::exit(1);
                }
            }
        }
        Some(Command::Triggers) => {
            let recommendations = engine.check_auto_triggers().await?;
            if recommendations.is_empty() {
                println!("no kill triggers met");
            }
            for (agent_id, reason) in recommendations {
                println!("{agent_id}: {reason}");
            }
        }
        Some(Command::Status { json }) => {
            let statuses = engine.agent_statuses().await?;
            if json {
                let mut entries = Vec::new();
                for row in &statuses {
                    let ks = engine.kill_status(&row.agent_id).await?;
                    entries.push(serde_json::json!({
                        "agent_id": row.agent_id,
                        "status": row.status,
                        "updated_at": row.updated_at,
                        "latest_kill": ks.latest_kill,
                    }));
                }
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                for row in &statuses {
                    println!("{:<20} {:<10} {}", row.agent_id, row.status, row.updated_at);
                }
            }
        }
    }

    Ok(())
}

fn print_outcome(agent_id: &str, outcome: &EvaluationOutcome) {
    match outcome {
        EvaluationOutcome::Busy => println!("{agent_id}: busy (pipeline in flight)"),
        EvaluationOutcome::Unknown => println!("{agent_id}: not in the registry"),
        EvaluationOutcome::Evaluated(report) => println!(
            "{agent_id}: status={} missed={} ladder={:?} restart={:?}",
            report.status, report.missed_beats, report.ladder, report.restart
        ),
    }
}

/// Foreground oversight loop: evaluate the fleet every `interval_secs`,
/// stopping cleanly on Ctrl-C.
async fn serve(engine: Arc<sentineld::engine::OversightEngine>, interval_secs: u64) -> Result<()> {
    info!(
        agents = engine.registry().len(),
        interval_secs, "oversight loop started"
    );
    if engine.registry().is_empty() {
        warn!("no agents configured — add [agents.<id>] sections to config.toml");
    }

    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let results = engine.run_cycle().await;
                let failures = results.iter().filter(|(_, r)| r.is_err()).count();
                info!(agents = results.len(), failures, "evaluation cycle complete");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
        }
    }
    Ok(())
}

/// Initialize the tracing subscriber.
/// If `log_file` is set, logs go to both stdout and a daily-rolling file.
/// Returns a `WorkerGuard` that must stay alive for the process lifetime.
///
/// `log_format` may be `"pretty"` (default, human-readable compact format) or
/// `"json"` (structured JSON for log aggregators).
///
/// If the log directory cannot be created, falls back to stdout-only logging
/// with a warning — never panics.
fn setup_logging(
    log_level: &str,
    log_file: Option<&std::path::Path>,
    log_format: &str,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let use_json = log_format == "json";

    if let Some(path) = log_file {
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let filename = path
            .file_name()
            .unwrap_or_else(|| std::ffi::OsStr::new("sentineld.log"));

        // Ensure the directory exists before tracing-appender tries to open it.
        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!(
                "warn: could not create log directory '{}': {e} — falling back to stdout",
                dir.display()
            );
            if use_json {
                tracing_subscriber::fmt().json().with_env_filter(log_level).init();
            } else {
                tracing_subscriber::fmt().with_env_filter(log_level).compact().init();
            }
            return None;
        }

        let appender = tracing_appender::rolling::daily(dir, filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        if use_json {
            tracing_subscriber::registry()
                .with(EnvFilter::new(log_level))
                .with(fmt::layer().json())
                .with(fmt::layer().json().with_writer(non_blocking))
                .init();
        } else {
            tracing_subscriber::registry()
                .with(EnvFilter::new(log_level))
                .with(fmt::layer().compact())
                .with(fmt::layer().with_writer(non_blocking))
                .init();
        }

        Some(guard)
    } else if use_json {
        tracing_subscriber::fmt().json().with_env_filter(log_level).init();
        None
    } else {
        tracing_subscriber::fmt().with_env_filter(log_level).compact().init();
        None
    }
}
