//! Typed events for the presentation layer

use chat_protocol::{ChatMessage, ClientId, SessionId};
use tokio::sync::broadcast;

/// Why a connection attempt did not produce a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailReason {
    /// The counterparty declined
    Rejected,
    /// The counterparty is not connected to the relay
    Unreachable,
    /// The wrapped session secret could not be recovered
    KeyExchange,
}

/// Events a presentation layer subscribes to
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The relay assigned this client an identity, shareable with peers
    Ready { client_id: ClientId },
    /// Somebody wants to chat; answer with accept_offer or decline_offer
    OfferReceived { caller_id: ClientId },
    /// A handshake completed and the session is ready for messages
    SessionEstablished {
        session_id: SessionId,
        counterparty_id: ClientId,
    },
    /// A connection attempt ended without a session
    RequestFailed {
        counterparty_id: ClientId,
        reason: FailReason,
    },
    /// A decrypted message was appended to a session
    MessageReceived(ChatMessage),
    /// A session member went away; the conversation stays readable
    PeerDisconnected {
        session_id: SessionId,
        client_id: ClientId,
    },
}

/// Broadcast fan-out for client events. Emitting never blocks; events sent
/// while nobody subscribes are dropped.
pub(crate) struct EventSender {
    tx: broadcast::Sender<ClientEvent>,
}

impl EventSender {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.tx.subscribe()
    }

    pub(crate) fn emit(&self, event: ClientEvent) {
        let _ = self.tx.send(event);
    }
}
