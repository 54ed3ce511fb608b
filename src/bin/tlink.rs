//! threadlink command line client
//!
//! Inspects and drives the registry daemon over its socket.
//!
//! # Usage
//!
//! ```text
//! tlink list [--status active] [--json]
//! tlink lookup C0123 --thread 1712345678.000100
//! tlink show <session-id>
//! tlink send <session-id> "run the tests"
//! tlink heartbeat <session-id>
//! tlink end <session-id>
//! tlink watch
//! tlink ping
//! tlink hook --session <session-id> < event.json
//! ```

use std::io::Read;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use tlink_core::{RoutingKey, SessionId, SessionRecord, SessionStatus};
use tlink_protocol::RawHookEvent;
use tlink_router::{registry_effect, ClientConfig, RegistryClient, RegistryEvent};
use tlinkd::config::Config;

// ============================================================================
// CLI Arguments
// ============================================================================

/// threadlink - chat thread to assistant session registry client
#[derive(Parser, Debug)]
#[command(name = "tlink", version, about)]
struct Args {
    /// Daemon socket (defaults to the configured socket)
    #[arg(long, global = true, env = "TLINK_SOCKET")]
    socket: Option<PathBuf>,

    /// Print JSON instead of a table
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List sessions (live ones unless --status is given)
    List {
        #[arg(long, value_parser = parse_status)]
        status: Option<SessionStatus>,
    },
    /// Find the live session for a channel or thread
    Lookup {
        channel: String,
        #[arg(long)]
        thread: Option<String>,
    },
    /// Show one session by id
    Show { session_id: String },
    /// Type text into a session
    Send { session_id: String, text: String },
    /// Record a liveness heartbeat
    Heartbeat { session_id: String },
    /// Mark a session ended
    End { session_id: String },
    /// Print registry events as they happen
    Watch {
        /// Only events for this session
        #[arg(long)]
        session: Option<String>,
    },
    /// Check that the daemon answers
    Ping,
    /// Apply a hook event read from stdin to the session's record
    ///
    /// Never fails the calling hook: problems are logged to stderr.
    Hook {
        /// Registry session of the wrapper that runs the assistant
        #[arg(long, env = "TLINK_SESSION_ID")]
        session: Option<String>,
    },
}

fn parse_status(s: &str) -> Result<SessionStatus, String> {
    SessionStatus::parse(s).map_err(|e| e.to_string())
}

// ============================================================================
// Output
// ============================================================================

fn print_sessions(sessions: &[SessionRecord], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(sessions)?);
        return Ok(());
    }
    if sessions.is_empty() {
        println!("No sessions.");
        return Ok(());
    }
    println!(
        "{:<38} {:<9} {:<24} {:<20} LAST ACTIVITY",
        "SESSION", "STATUS", "ROUTING", "PROJECT"
    );
    for s in sessions {
        println!(
            "{:<38} {:<9} {:<24} {:<20} {}",
            s.session_id,
            s.status,
            s.routing,
            s.project,
            s.last_activity.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

fn print_session(session: &SessionRecord, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(session)?);
        return Ok(());
    }
    println!("Session:      {}", session.session_id);
    println!("Status:       {}", session.status);
    println!("Mode:         {}", session.mode);
    println!("Routing:      {}", session.routing);
    println!("Project:      {} ({})", session.project, session.project_dir.display());
    if let Some(ref id) = session.conversation_id {
        println!("Conversation: {id}");
    }
    println!("Endpoint:     {}", session.endpoint);
    println!("Created:      {}", session.created_at.to_rfc3339());
    println!("Last active:  {}", session.last_activity.to_rfc3339());
    if let Some(ended) = session.ended_at {
        println!("Ended:        {}", ended.to_rfc3339());
    }
    Ok(())
}

// ============================================================================
// Hook
// ============================================================================

async fn run_hook(socket: Option<PathBuf>, session: Option<String>) -> Result<()> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .context("Failed to read hook event")?;
    let event: RawHookEvent =
        serde_json::from_str(&input).context("Hook event is not valid JSON")?;

    let Some(session_id) = session.map(SessionId::new) else {
        debug!(event = %event.hook_event_name, "No registry session for this hook");
        return Ok(());
    };
    let Some(effect) = registry_effect(&event) else {
        debug!(event = %event.hook_event_name, "Hook event has no registry effect");
        return Ok(());
    };

    let client = connect(socket).await?;
    client.apply_hook_effect(&session_id, &effect).await?;
    Ok(())
}

async fn connect(socket: Option<PathBuf>) -> Result<RegistryClient> {
    let socket_path = match socket {
        Some(path) => path,
        None => Config::load().context("Failed to load configuration")?.socket_path,
    };
    RegistryClient::connect(ClientConfig::new(&socket_path))
        .await
        .with_context(|| format!("Is tlinkd running? Socket: {}", socket_path.display()))
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("tlink_router=warn".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    if let Command::Hook { session } = args.command {
        if let Err(e) = run_hook(args.socket, session).await {
            warn!(error = %e, "Hook event not applied");
        }
        return Ok(());
    }

    let client = connect(args.socket).await?;

    match args.command {
        Command::List { status } => {
            let sessions = client.list(status).await?;
            print_sessions(&sessions, args.json)?;
        }
        Command::Lookup { channel, thread } => {
            let routing = match thread {
                Some(thread) => RoutingKey::thread(channel, thread),
                None => RoutingKey::channel(channel),
            };
            let session = client.lookup_by_thread(&routing).await?;
            print_session(&session, args.json)?;
        }
        Command::Show { session_id } => {
            let session = client.lookup_by_id(&SessionId::new(session_id)).await?;
            print_session(&session, args.json)?;
        }
        Command::Send { session_id, text } => {
            client.send(&SessionId::new(&session_id), &text).await?;
            println!("Delivered to {session_id}.");
        }
        Command::Heartbeat { session_id } => {
            let session = client.heartbeat(&SessionId::new(session_id)).await?;
            print_session(&session, args.json)?;
        }
        Command::End { session_id } => {
            client.mark_ended(&SessionId::new(&session_id)).await?;
            println!("Session {session_id} ended.");
        }
        Command::Watch { session } => {
            let mut events = client.subscribe(session.map(SessionId::new)).await?;
            print_sessions(events.initial_sessions(), args.json)?;
            while let Some(event) = events.next().await? {
                match event {
                    RegistryEvent::Updated(session) if args.json => {
                        println!("{}", serde_json::to_string(&session)?)
                    }
                    RegistryEvent::Updated(session) => println!(
                        "updated  {} {} {}",
                        session.session_id, session.status, session.routing
                    ),
                    RegistryEvent::Ended(id) => println!("ended    {id}"),
                }
            }
        }
        Command::Ping => {
            client.ping(1).await?;
            println!("pong");
        }
        Command::Hook { .. } => {}
    }

    Ok(())
}
