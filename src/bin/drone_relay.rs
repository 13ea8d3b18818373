use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use drone_relay::RelayConfig;
use drone_relay::endpoint::EndpointRegistry;
use drone_relay::lifecycle::error::EXIT_FAILURE;
use drone_relay::lifecycle::pidfile::{self, MarkerState, PidRecord};
use drone_relay::lifecycle::status::read_status;
use drone_relay::lifecycle::{RelaySupervisor, StartOutcome};
use drone_relay::logging;
use drone_relay::sys::{is_alive, send_signal};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};

const EXIT_NOT_RUNNING: u8 = 3;
const EXIT_STALE_CLEARED: u8 = 4;

#[derive(Parser)]
#[command(name = "drone-relay", version, about = "Command, telemetry and video relay between a base station and a drone")]
struct Cli {
    /// Relay configuration file; built-in defaults are used when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the relay in the foreground until SIGINT or SIGTERM.
    Start,
    /// Stop the running relay.
    Stop {
        /// Seconds to wait for the relay to exit.
        #[arg(long, default_value_t = 10)]
        timeout: u64,
    },
    /// Ask the running relay to restart and re-read its configuration.
    Restart,
    /// Show the status of the running relay.
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Validate the configuration and exit.
    CheckConfig,
}

fn load_config(path: Option<&Path>) -> Result<RelayConfig> {
    match path {
        Some(path) => RelayConfig::from_file(path)
            .with_context(|| format!("failed to load configuration from {}", path.display())),
        None => Ok(RelayConfig::default()),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Start => start(cli.config).await,
        Command::Stop { timeout } => stop(cli.config.as_deref(), Duration::from_secs(timeout)).await,
        Command::Restart => restart(cli.config.as_deref()),
        Command::Status { json } => status(cli.config.as_deref(), json),
        Command::CheckConfig => check_config(cli.config.as_deref()),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("drone-relay: {e:#}");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

async fn start(config_path: Option<PathBuf>) -> Result<ExitCode> {
    let config = load_config(config_path.as_deref())?;
    logging::init(&config.logging).context("failed to initialize logging")?;

    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut hangup = signal(SignalKind::hangup())?;
    let mut user1 = signal(SignalKind::user_defined1())?;

    let mut supervisor = RelaySupervisor::new();
    match supervisor.start(config).await {
        Ok(outcome) => report_start(&outcome),
        Err(e) => return Ok(ExitCode::from(e.exit_code())),
    }

    loop {
        tokio::select! {
            _ = terminate.recv() => {
                info!("Received SIGTERM");
                break;
            }
            _ = interrupt.recv() => {
                info!("Received SIGINT");
                break;
            }
            _ = hangup.recv() => {
                info!("Received SIGHUP, restarting");
                let loader = || match config_path.as_deref() {
                    Some(path) => RelayConfig::from_file(path),
                    None => Ok(RelayConfig::default()),
                };
                match supervisor.restart(loader).await {
                    Ok(outcome) => report_start(&outcome),
                    Err(e) => {
                        error!(error = %e, "Relay could not be restarted");
                        return Ok(ExitCode::from(e.exit_code()));
                    }
                }
            }
            _ = user1.recv() => {
                if let Some(registry) = supervisor.registry() {
                    info!("Received SIGUSR1, forgetting learned endpoints");
                    registry.invalidate_all();
                }
            }
        }
    }

    supervisor.stop().await;
    Ok(ExitCode::SUCCESS)
}

fn report_start(outcome: &StartOutcome) {
    match outcome {
        StartOutcome::Started {
            stale_marker,
            conflicts,
        } => {
            if let Some(stale) = stale_marker {
                warn!(pid = stale.pid, instance_id = %stale.instance_id, "Cleared marker of a relay that is no longer running");
            }
            for conflict in conflicts {
                warn!(port = conflict.port, pids = ?conflict.pids, escalated = conflict.escalated, "Freed port held by another process");
            }
        }
        StartOutcome::AlreadyRunning => {}
    }
}

/// The live relay named by the marker, or the exit code to report when there is none.
fn running_relay(config: &RelayConfig) -> Result<Result<PidRecord, ExitCode>> {
    let path = &config.runtime.pid_file;
    match pidfile::inspect(path)? {
        MarkerState::Running(record) => Ok(Ok(record)),
        MarkerState::Absent => {
            println!("drone-relay is not running");
            Ok(Err(ExitCode::from(EXIT_NOT_RUNNING)))
        }
        MarkerState::Stale(record) => {
            pidfile::clear_stale(path)?;
            match record {
                Some(record) => println!(
                    "drone-relay is not running; cleared stale marker of pid {}",
                    record.pid
                ),
                None => println!("drone-relay is not running; cleared unreadable marker"),
            }
            Ok(Err(ExitCode::from(EXIT_STALE_CLEARED)))
        }
    }
}

async fn stop(config_path: Option<&Path>, timeout: Duration) -> Result<ExitCode> {
    let config = load_config(config_path)?;
    let record = match running_relay(&config)? {
        Ok(record) => record,
        Err(code) => return Ok(code),
    };

    send_signal(record.pid, libc::SIGTERM)
        .with_context(|| format!("failed to signal pid {}", record.pid))?;

    let deadline = tokio::time::Instant::now() + timeout;
    while is_alive(record.pid) {
        if tokio::time::Instant::now() >= deadline {
            println!("drone-relay (pid {}) did not exit within {}s", record.pid, timeout.as_secs());
            return Ok(ExitCode::from(EXIT_FAILURE));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    println!("drone-relay (pid {}) stopped", record.pid);
    Ok(ExitCode::SUCCESS)
}

fn restart(config_path: Option<&Path>) -> Result<ExitCode> {
    let config = load_config(config_path)?;
    let record = match running_relay(&config)? {
        Ok(record) => record,
        Err(code) => return Ok(code),
    };

    send_signal(record.pid, libc::SIGHUP)
        .with_context(|| format!("failed to signal pid {}", record.pid))?;
    println!("drone-relay (pid {}) restarting", record.pid);
    Ok(ExitCode::SUCCESS)
}

fn status(config_path: Option<&Path>, json: bool) -> Result<ExitCode> {
    let config = load_config(config_path)?;
    let record = match running_relay(&config)? {
        Ok(record) => record,
        Err(code) => return Ok(code),
    };

    let status = read_status(&config.runtime.status_file).with_context(|| {
        format!(
            "drone-relay (pid {}) is running but its status file {} is unreadable",
            record.pid,
            config.runtime.status_file.display()
        )
    })?;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(ExitCode::SUCCESS);
    }

    let relay = status
        .relay_id
        .as_ref()
        .map_or(record.relay_id.to_string(), ToString::to_string);
    println!("relay:    {relay}");
    println!("state:    {}", status.state);
    println!("pid:      {}", status.pid);
    println!("instance: {}", status.instance_id);
    println!("updated:  {}", status.updated_at.to_rfc3339());
    if let Some(snapshot) = &status.snapshot {
        println!("stats:    {snapshot}");
    }
    if let Some(video) = &status.video {
        let pid = video.pid.map_or("-".to_string(), |pid| pid.to_string());
        println!(
            "video:    pid={pid} restarts={} failed={}",
            video.restart_count, video.failed
        );
    }

    Ok(ExitCode::SUCCESS)
}

fn check_config(config_path: Option<&Path>) -> Result<ExitCode> {
    let config = load_config(config_path)?;

    match EndpointRegistry::resolve(&config) {
        Ok(registry) => {
            println!("configuration ok");
            for claim in registry.claims() {
                println!("  {} -> {}", claim.bind, claim.owner);
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            eprintln!("drone-relay: {:#}", anyhow::Error::from(e));
            Ok(ExitCode::from(EXIT_FAILURE))
        }
    }
}
