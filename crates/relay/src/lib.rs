//! # ShellMux Relay Library
//!
//! This crate provides the relay daemon for ShellMux: a headless service
//! that keeps shell sessions alive independently of client connections
//! and multiplexes any number of sessions over a single framed transport
//! connection.
//!
//! ## Overview
//!
//! - **Session Registry**: Create, attach, detach, and close shell
//!   sessions; closed ids are never reused
//! - **Reconnection Grace**: Detached sessions keep running for a
//!   configurable grace period, buffering output for replay on reattach
//! - **Transport Multiplexer**: One connection carries interleaved
//!   traffic for many sessions, each message tagged with its session id
//! - **Pseudo-Commands**: `clear`, `help`, and `history` are answered by
//!   the relay and never reach process stdin
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                      TCP Server                        │
//! │   framed MessagePack envelopes, one task per client    │
//! ├────────────────────────────────────────────────────────┤
//! │                 Connection Multiplexer                 │
//! │      dispatch + pseudo-command interception            │
//! ├────────────────────────────────────────────────────────┤
//! │                   Session Registry                     │
//! │   per-session state, grace timers, output buffering    │
//! ├────────────────────────────────────────────────────────┤
//! │                   Process Handles                      │
//! │        shell processes over tokio::process pipes       │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and validation
//! - [`process`]: Process spawning and handle abstraction
//! - [`session`]: Per-session state and lifecycle
//! - [`registry`]: The process-wide session registry
//! - [`grace`]: Reconnection grace-period timers
//! - [`commands`]: Pseudo-command classification
//! - [`mux`]: Per-connection message dispatch
//! - [`server`]: TCP accept loop and framing

pub mod commands;
pub mod config;
pub mod grace;
pub mod mux;
pub mod process;
pub mod registry;
pub mod server;
pub mod session;

// Re-export protocol for convenience
pub use protocol;

pub use config::Config;
pub use mux::Connection;
pub use process::{ProcessEvent, ProcessHandle, ProcessSpawner, ShellSpawner};
pub use registry::{RegistryLimits, SessionRegistry};
pub use session::{ClientSink, Session, SessionError, SessionId, SessionState};
