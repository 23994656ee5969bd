//! Chat transport and event handler traits.
//!
//! A [`ChatTransport`] is the remote side of the bridge: it authenticates,
//! long-polls for inbound events and delivers outbound text. The
//! [`listen`] driver pulls batches from a transport and dispatches each
//! event to an [`EventHandler`] until the transport fails or shutdown is
//! requested.

use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::error::{HandlerError, Result};
use crate::events::{InboundEvent, InviteEvent, MessageEvent, TransportSession};

/// Trait for chat transport operations.
///
/// This trait abstracts the chat backend, allowing for different
/// implementations (e.g., Matrix, a local console, a mock for testing).
/// Methods take `&self` so one transport can be shared between the event
/// loop and the output relay.
pub trait ChatTransport: Send + Sync {
    /// Authenticates and positions the event stream after the backlog.
    ///
    /// The first call discards historical events so they are not replayed
    /// into the shell. Later calls resume where the previous connection
    /// stopped.
    fn connect(&self) -> BoxFuture<'_, Result<TransportSession>>;

    /// Blocks until the next batch of events is available.
    ///
    /// An empty batch is valid (e.g. a long-poll that timed out server-side).
    fn next_events(&self) -> BoxFuture<'_, Result<Vec<InboundEvent>>>;

    /// Sends a message to a room, with an optional HTML rendering.
    fn send<'a>(
        &'a self,
        room_id: &'a str,
        body: &'a str,
        html: Option<&'a str>,
    ) -> BoxFuture<'a, Result<()>>;

    /// Joins a room the account was invited to.
    fn join<'a>(&'a self, room_id: &'a str) -> BoxFuture<'a, Result<()>>;
}

/// Callbacks invoked by [`listen`] for each inbound event.
pub trait EventHandler: Send + Sync {
    /// Called for every text message.
    fn on_message<'a>(
        &'a self,
        event: &'a MessageEvent,
    ) -> BoxFuture<'a, std::result::Result<(), HandlerError>>;

    /// Called for every room invitation.
    fn on_invite<'a>(
        &'a self,
        event: &'a InviteEvent,
    ) -> BoxFuture<'a, std::result::Result<(), HandlerError>>;
}

/// Drives `transport`'s event loop, dispatching events to `handler`.
///
/// Returns `Ok(())` once `shutdown` is cancelled. Any transport failure or
/// handler error is returned to the caller, which decides whether to
/// reconnect.
pub async fn listen<T>(
    transport: &T,
    handler: &dyn EventHandler,
    shutdown: &CancellationToken,
) -> Result<()>
where
    T: ChatTransport + ?Sized,
{
    loop {
        let Some(batch) = shutdown.run_until_cancelled(transport.next_events()).await else {
            tracing::debug!("listen loop stopping: shutdown requested");
            return Ok(());
        };

        for event in batch? {
            if shutdown.is_cancelled() {
                return Ok(());
            }

            let handled = match &event {
                InboundEvent::Message(message) => handler.on_message(message).await,
                InboundEvent::Invite(invite) => handler.on_invite(invite).await,
            };
            if let Err(e) = handled {
                tracing::warn!(
                    sender = event.sender(),
                    room_id = event.room_id(),
                    error = %e,
                    "Event handler failed"
                );
                return Err(e.into());
            }
        }
    }
}
