//! # shellbridge chat protocol
//!
//! This crate defines the contract between the shellbridge daemon and the
//! chat backend it relays a shell through.
//!
//! ## Overview
//!
//! - **Events**: inbound messages and invitations
//! - **Transport**: the [`ChatTransport`] trait (connect, long-poll, send, join)
//! - **Handlers**: the [`EventHandler`] callbacks and the [`listen`] driver
//! - **Errors**: [`TransportError`], split into transient and fatal kinds
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────┐
//! │        EventHandler          │  on_message / on_invite
//! ├──────────────────────────────┤
//! │          listen()            │  batch loop + cancellation
//! ├──────────────────────────────┤
//! │        ChatTransport         │  Matrix, console, mocks
//! └──────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`events`]: Inbound event types
//! - [`transport`]: Transport and handler traits
//! - [`error`]: Error types

pub mod error;
pub mod events;
pub mod transport;

pub use error::{HandlerError, Result, TransportError};
pub use events::{InboundEvent, InviteEvent, MessageEvent, TransportSession};
pub use transport::{listen, ChatTransport, EventHandler};

/// Boxed `Send` future returned by the transport and handler traits.
pub use futures_util::future::BoxFuture;
