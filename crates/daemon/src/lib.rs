//! # shellbridge
//!
//! This crate relays an interactive shell through a chat room. Messages from
//! allowed senders are typed into a shell running on a pseudo-terminal, and
//! whatever the shell prints is batched, cleaned up and posted back.
//!
//! ## Overview
//!
//! - **Shell**: one shell process on a PTY for the lifetime of the bridge
//! - **Output**: quiet-window batching, escape stripping, message splitting
//! - **Input**: sender allow-list plus a small command grammar (optional
//!   prefix, `!ctrlc`, `!ctrld`)
//! - **Transports**: Matrix over HTTPS, or the local console
//! - **Lifecycle**: reconnect with fixed backoff, clean shutdown on signals
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      BridgeController                           │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  chat events ──► InputRouter ──► PtyProcess (shell on a PTY)    │
//! │                                       │                         │
//! │  ChatTransport ◄── filter ◄── OutputAggregator ◄──┘             │
//! │                                                                 │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use shellbridge::network::ConsoleTransport;
//! use shellbridge::{AuthorizationPolicy, BridgeController, BridgeSettings, CommandGrammar, Config, PtyProcess};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!
//!     let shell = PtyProcess::spawn(&config.shell)?;
//!     let transport = Arc::new(ConsoleTransport::stdio("local"));
//!     let controller = BridgeController::new(
//!         BridgeSettings::from_config(&config),
//!         transport,
//!         shell,
//!         AuthorizationPolicy::new(["local"]),
//!         CommandGrammar::from(&config.input),
//!     );
//!
//!     let reason = controller.run().await?;
//!     std::process::exit(reason.exit_code());
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`session`]: Shell process and output batching
//! - [`filter`]: Escape stripping and message rendering
//! - [`auth`]: Sender allow-list and broadcast rooms
//! - [`router`]: Chat message to shell input
//! - [`network`]: Chat transports
//! - [`controller`]: Bridge lifecycle

pub mod auth;
pub mod config;
pub mod controller;
pub mod filter;
pub mod network;
pub mod router;
pub mod session;

// Re-export the transport contract for convenience
pub use chat_protocol;

pub use auth::{AuthorizationPolicy, BroadcastSet};
pub use config::Config;
pub use controller::{BridgeController, BridgeError, BridgeEvent, BridgeSettings, BridgeState, StopReason};
pub use router::{CommandGrammar, ControlKind, InboundCommand, InputRouter, RouterError};
pub use session::{OutputAggregator, OutputChunk, PtyError, PtyOutput, PtyProcess, ShellInput};
