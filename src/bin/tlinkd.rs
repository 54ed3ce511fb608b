//! threadlink daemon - durable session registry and IPC router
//!
//! Runs the registry that maps chat threads to live assistant sessions,
//! delivers routed input to session wrappers, and keeps conversation ids
//! current across compaction.
//!
//! # Usage
//!
//! ```bash
//! # Start the daemon (foreground)
//! tlinkd start
//!
//! # Start the daemon (background/daemonized)
//! tlinkd start -d
//!
//! # Stop the daemon
//! tlinkd stop
//!
//! # Check daemon status
//! tlinkd status
//! ```

use std::fs::{self, File};
use std::process;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tlinkd::config::Config;
use tlinkd::continuity::ContinuityService;
use tlinkd::lifecycle::{self, StartupError};
use tlinkd::registry::spawn_registry;
use tlinkd::server::DaemonServer;
use tlinkd::store::SessionStore;

/// threadlink daemon - session registry for chat-bridged assistant sessions
#[derive(Parser, Debug)]
#[command(name = "tlinkd", version, about)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the daemon
    Start {
        /// Run as a background daemon (fork to background)
        #[arg(short = 'd', long)]
        daemon: bool,
    },
    /// Stop the running daemon
    Stop,
    /// Show daemon status
    Status,
}

/// PID of a running daemon, clearing a stale PID file on the way.
fn running_daemon(config: &Config) -> Option<u32> {
    let pid_file = config.pid_file();
    let pid = lifecycle::read_pid(&pid_file)?;
    if lifecycle::is_process_running(pid) {
        return Some(pid);
    }
    lifecycle::remove_pid_file(&pid_file);
    None
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::load().context("Failed to load configuration")?;

    let command = args.command.unwrap_or(Command::Start { daemon: false });

    match command {
        Command::Start { daemon } => {
            if lifecycle::socket_is_live(&config.socket_path) {
                eprintln!(
                    "Daemon is already running on {}",
                    config.socket_path.display()
                );
                eprintln!("Use 'tlinkd stop' to stop it first.");
                process::exit(1);
            }

            if daemon {
                daemonize(&config)?;
            }

            run_daemon(config)
        }
        Command::Stop => {
            if let Some(pid) = running_daemon(&config) {
                println!("Stopping daemon (PID {pid})...");
                lifecycle::terminate(pid)
                    .with_context(|| format!("Failed to send SIGTERM to process {pid}"))?;

                for _ in 0..50 {
                    if !lifecycle::is_process_running(pid) {
                        println!("Daemon stopped.");
                        return Ok(());
                    }
                    std::thread::sleep(Duration::from_millis(100));
                }

                eprintln!("Daemon did not stop within 5 seconds.");
                process::exit(1);
            } else {
                println!("Daemon is not running.");
                Ok(())
            }
        }
        Command::Status => {
            let live = lifecycle::socket_is_live(&config.socket_path);
            match (running_daemon(&config), live) {
                (Some(pid), true) => {
                    println!("Daemon is running (PID {pid})");
                    println!("Socket: {}", config.socket_path.display());
                    println!("Database: {}", config.db_path.display());
                    Ok(())
                }
                (None, true) => {
                    println!("Daemon is answering on {}", config.socket_path.display());
                    Ok(())
                }
                (Some(pid), false) => {
                    println!("Daemon process {pid} exists but the socket is not answering.");
                    process::exit(1);
                }
                (None, false) => {
                    println!("Daemon is not running.");
                    process::exit(1);
                }
            }
        }
    }
}

fn daemonize(config: &Config) -> Result<()> {
    use daemonize::Daemonize;

    let log_path = config.log_file();

    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent).context("Failed to create log directory")?;
    }

    let stdout = File::create(&log_path).context("Failed to create log file for stdout")?;
    let stderr = stdout
        .try_clone()
        .context("Failed to create log file for stderr")?;

    let daemonize = Daemonize::new()
        .working_directory("/")
        .stdout(stdout)
        .stderr(stderr);

    daemonize.start().context("Failed to daemonize")?;

    Ok(())
}

#[tokio::main]
async fn run_daemon(config: Config) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("tlinkd=info".parse()?)
                .add_directive("tlink_core=info".parse()?)
                .add_directive("tlink_protocol=info".parse()?)
                .add_directive("tlink_capture=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        state_dir = %config.state_dir.display(),
        "threadlink daemon starting"
    );

    let prepared = match lifecycle::prepare(&config) {
        Ok(prepared) => prepared,
        Err(e @ StartupError::AlreadyRunning { .. }) => {
            error!(error = %e, "Refusing to start a second daemon");
            return Err(e.into());
        }
        Err(e) => {
            error!(error = %e, "Daemon startup failed");
            return Err(e.into());
        }
    };

    let pid_file = config.pid_file();
    lifecycle::write_pid(&pid_file)?;
    let result = serve(config, prepared.store).await;
    lifecycle::remove_pid_file(&pid_file);
    result
}

/// Runs the registry, continuity service and socket server until a
/// shutdown signal arrives.
async fn serve(config: Config, store: SessionStore) -> Result<()> {
    let cancel_token = CancellationToken::new();

    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let registry = spawn_registry(store, config.registry.clone());
    info!(db = %config.db_path.display(), "Session registry started");

    let continuity = ContinuityService::new(registry.clone(), config.continuity.clone());
    tokio::spawn(continuity.run(cancel_token.clone()));
    info!("Continuity service started");

    let server = DaemonServer::new(&config.socket_path, registry, cancel_token)
        .with_send_timeout(config.send_timeout);

    info!(socket = %config.socket_path.display(), "Starting server");

    if let Err(e) = server.run().await {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("threadlink daemon stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT");
        }
    }

    Ok(())
}
