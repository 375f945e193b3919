//! Wire messages between client and relay

use serde::{Deserialize, Serialize};

use crate::{ClientId, MessageId, SessionId};

/// Outcome of a connection handshake, as reported by the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakeStatus {
    /// Request forwarded, the target has not decided yet
    Waiting,
    /// Target accepted and a session was created
    Accepted,
    /// Target declined the request
    Rejected,
    /// Target is not connected to the relay
    Unreachable,
}

/// A relayed chat message. The relay stamps `id` and `timestamp_ms` so every
/// session member observes the same ordering; `body` is an opaque encrypted
/// frame the relay never inspects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub session_id: SessionId,
    pub sender_id: ClientId,
    /// Server receive time, milliseconds since the Unix epoch
    pub timestamp_ms: u64,
    pub body: String,
}

/// Requests a client sends to the relay
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientRequest {
    /// Ask the relay to forward a connection request to another client.
    /// `public_key` is the caller's RSA public key in PEM form, used by the
    /// target to wrap the session secret.
    RequestConnection {
        target_id: ClientId,
        public_key: String,
    },
    /// Accept a previously received connection request. `wrapped_secret` is
    /// the session secret encrypted under the requester's public key.
    AcceptConnection {
        target_id: ClientId,
        wrapped_secret: String,
    },
    /// Decline a previously received connection request
    RejectConnection { target_id: ClientId },
    /// Fan an encrypted message out to every member of a session
    Send { session_id: SessionId, body: String },
}

/// Events the relay pushes to a client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerEvent {
    /// First event after the socket opens, carrying the assigned identity
    Connected { client_id: ClientId },
    /// Another client wants to start a chat
    IncomingRequest {
        caller_id: ClientId,
        public_key: String,
    },
    /// Progress or outcome of a handshake this client participates in.
    /// `session_id` is present once `status` is `Accepted`; `wrapped_secret`
    /// is present only for the side that did not generate the secret.
    HandshakeResult {
        session_id: Option<SessionId>,
        counterparty_id: ClientId,
        status: HandshakeStatus,
        wrapped_secret: Option<String>,
    },
    /// A stamped message relayed to every session member, sender included
    Message(ChatMessage),
    /// A member of one of this client's sessions went away
    PeerDisconnected {
        session_id: SessionId,
        client_id: ClientId,
    },
}
