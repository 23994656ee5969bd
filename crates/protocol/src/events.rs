//! Inbound event types delivered by a chat transport.

/// A text message posted to a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEvent {
    /// Identity of the sender (e.g. `@alice:example.org`).
    pub sender: String,
    /// Room the message was posted to.
    pub room_id: String,
    /// Plain-text body.
    pub body: String,
}

/// An invitation for the bridge account to join a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InviteEvent {
    /// Identity of the inviter.
    pub sender: String,
    /// Room the bridge was invited to.
    pub room_id: String,
}

/// Events surfaced by [`ChatTransport::next_events`](crate::ChatTransport::next_events).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// A text message.
    Message(MessageEvent),
    /// A room invitation.
    Invite(InviteEvent),
}

impl InboundEvent {
    /// Convenience constructor for a message event.
    pub fn message(
        sender: impl Into<String>,
        room_id: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        InboundEvent::Message(MessageEvent {
            sender: sender.into(),
            room_id: room_id.into(),
            body: body.into(),
        })
    }

    /// Convenience constructor for an invite event.
    pub fn invite(sender: impl Into<String>, room_id: impl Into<String>) -> Self {
        InboundEvent::Invite(InviteEvent {
            sender: sender.into(),
            room_id: room_id.into(),
        })
    }

    /// Returns the sender of the event.
    pub fn sender(&self) -> &str {
        match self {
            InboundEvent::Message(m) => &m.sender,
            InboundEvent::Invite(i) => &i.sender,
        }
    }

    /// Returns the room the event refers to.
    pub fn room_id(&self) -> &str {
        match self {
            InboundEvent::Message(m) => &m.room_id,
            InboundEvent::Invite(i) => &i.room_id,
        }
    }
}

/// Result of a successful [`ChatTransport::connect`](crate::ChatTransport::connect).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportSession {
    /// Identity the bridge is logged in as.
    pub user_id: String,
    /// Rooms the account is already a member of.
    pub joined_rooms: Vec<String>,
}
