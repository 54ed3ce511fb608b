//! threadlink daemon - durable session registry and IPC routing
//!
//! This crate provides the daemon side of threadlink:
//! - `store` - SQLite session store (WAL, separate reader)
//! - `registry` - Actor that owns the store and publishes session events
//! - `server` - Unix socket server speaking newline-delimited JSON
//! - `delivery` - One-shot payload delivery to wrapper sockets
//! - `continuity` - Rebinds sessions when the tool switches conversations
//! - `lifecycle` - Startup checks, PID file, singleton discipline
//! - `config` - Defaults, TOML file, environment overrides
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        tlinkd daemon                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐     ┌─────────────────────────────┐    │
//! │  │  DaemonServer   │────▶│     RegistryActor           │    │
//! │  │ (Unix Socket)   │     │  (owns SessionStore)        │    │
//! │  └────────┬────────┘     └──────────────┬──────────────┘    │
//! │           │ connections                 │ events             │
//! │           ▼                             ▼                    │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐    │
//! │  │ConnectionHandler│     │   broadcast::Sender         │    │
//! │  │  (per client)   │     │   (subscribers, continuity) │    │
//! │  └─────────────────┘     └─────────────────────────────┘    │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │ ContinuityService (polls transcripts, UPDATEs)      │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod config;
pub mod continuity;
pub mod delivery;
pub mod lifecycle;
pub mod registry;
pub mod server;
pub mod store;
