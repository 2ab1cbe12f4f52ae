//! mission-kernel - command line entry point.
//!
//! Runs a mission to completion (or to an approval pause), and inspects the
//! ledger and stored manifests.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use mission_kernel::config::Config;
use mission_kernel::ledger::Ledger;
use mission_kernel::mission::{Orchestrator, Phase};
use mission_kernel::{ExecutionMode, Runtime};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "mission-kernel", version, about = "Drive a delivery mission through the kernel")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a mission and run it until it finishes or needs sign-off
    Run {
        description: String,
        #[arg(long, value_enum, default_value_t = ExecutionMode::Offline)]
        mode: ExecutionMode,
        /// Directory the mission works in (defaults to the current directory)
        #[arg(long)]
        project_root: Option<PathBuf>,
        /// Approve gates that ask for sign-off
        #[arg(long)]
        auto_approve: bool,
    },
    /// Print ledger entries after a sequence number
    Ledger {
        #[arg(long, default_value_t = 0)]
        since: u64,
    },
    /// Print a stored mission manifest
    Status { mission_id: String },
    /// Sign off a mission waiting for approval and continue it
    Approve {
        mission_id: String,
        #[arg(long, default_value = "approved from the command line")]
        note: String,
        #[arg(long, value_enum, default_value_t = ExecutionMode::Offline)]
        mode: ExecutionMode,
    },
    /// Refuse a mission waiting for approval
    Reject {
        mission_id: String,
        #[arg(long)]
        reason: String,
    },
}

fn main() -> ExitCode {
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("error: cannot start async runtime: {}", e);
            return ExitCode::from(1);
        }
    };
    match runtime.block_on(async_main()) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::from(1)
        }
    }
}

async fn async_main() -> anyhow::Result<ExitCode> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mission_kernel=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env()?;
    info!(
        data_dir = %config.data_dir.display(),
        ledger = ?config.ledger_backend,
        "Loaded configuration"
    );

    match cli.command {
        Command::Run {
            description,
            mode,
            project_root,
            auto_approve,
        } => {
            config.auto_approve |= auto_approve;
            let project_root = match project_root {
                Some(path) => path,
                None => std::env::current_dir()?,
            };
            let runtime = Runtime::boot(config, mode).await?;
            let mut orchestrator = runtime.start_mission(&description, project_root).await?;
            println!("mission {}", orchestrator.manifest().mission_id);
            drive(&runtime, &mut orchestrator).await
        }
        Command::Ledger { since } => {
            let runtime = Runtime::boot(config, ExecutionMode::Offline).await?;
            for entry in runtime.kernel().ledger().read_since(since).await? {
                println!(
                    "{:>6}  {}  {:<9}  {}  {:<22}  {}",
                    entry.sequence,
                    entry.timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
                    entry.kind.as_str(),
                    entry.task_id,
                    entry.actor,
                    entry.summary
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Status { mission_id } => {
            let runtime = Runtime::boot(config, ExecutionMode::Offline).await?;
            let orchestrator = runtime.resume_mission(&mission_id).await?;
            println!("{}", serde_json::to_string_pretty(orchestrator.manifest())?);
            Ok(exit_code(orchestrator.phase()))
        }
        Command::Approve {
            mission_id,
            note,
            mode,
        } => {
            let runtime = Runtime::boot(config, mode).await?;
            let mut orchestrator = runtime.resume_mission(&mission_id).await?;
            orchestrator.approve(&note).await?;
            drive(&runtime, &mut orchestrator).await
        }
        Command::Reject { mission_id, reason } => {
            let runtime = Runtime::boot(config, ExecutionMode::Offline).await?;
            let mut orchestrator = runtime.resume_mission(&mission_id).await?;
            let phase = orchestrator.reject(&reason).await?;
            print_history(&orchestrator);
            Ok(exit_code(phase))
        }
    }
}

/// Run the mission with the worker pool up, then report the transitions.
async fn drive(runtime: &Runtime, orchestrator: &mut Orchestrator) -> anyhow::Result<ExitCode> {
    let shutdown = CancellationToken::new();
    let workers = if runtime.config().workers > 1 {
        runtime.spawn_workers(shutdown.clone())
    } else {
        Vec::new()
    };

    let result = orchestrator.run_to_end().await;
    shutdown.cancel();
    for worker in workers {
        let _ = worker.await;
    }

    print_history(orchestrator);
    let phase = result?;
    for event in runtime.chain().recent_fallbacks(10).await {
        println!(
            "fallback: {} -> {} ({:?}: {})",
            event.from_provider,
            event.to_provider.as_deref().unwrap_or("-"),
            event.reason,
            event.detail
        );
    }
    println!("final phase: {}", phase);
    Ok(exit_code(phase))
}

fn print_history(orchestrator: &Orchestrator) {
    for record in &orchestrator.manifest().history {
        println!("{} -> {}: {}", record.from, record.to, record.reason);
    }
}

/// 0 when the mission is done, 2 while it waits for sign-off, 1 otherwise.
fn exit_code(phase: Phase) -> ExitCode {
    match phase {
        Phase::Maintenance => ExitCode::SUCCESS,
        Phase::AwaitingApproval => ExitCode::from(2),
        Phase::Failed => ExitCode::from(1),
        _ => ExitCode::SUCCESS,
    }
}
