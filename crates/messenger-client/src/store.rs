//! Session store: established chats and their conversation state

use std::collections::HashMap;

use parking_lot::RwLock;

use chat_protocol::{ChatMessage, ClientId, SessionId};

/// One chat participant as seen locally
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub id: ClientId,
    /// Local display label; defaults to the id and never leaves the process
    pub label: String,
    pub connected: bool,
}

impl Peer {
    fn new(id: ClientId) -> Self {
        Self {
            id,
            label: id.to_display_string(),
            connected: true,
        }
    }
}

/// Conversation state of one session
#[derive(Debug, Clone, Default)]
pub struct ChatSessionState {
    /// Decrypted messages in the order the relay stamped them
    pub messages: Vec<ChatMessage>,
    /// Composing text, preserved when the user switches chats
    pub draft: String,
    /// True after sending until the counterparty answers
    pub awaiting_reply: bool,
    /// Messages received since the session was last marked read
    pub unread: u32,
}

/// An established chat: the shared secret plus local conversation state
struct ChatSession {
    id: SessionId,
    secret: String,
    peers: Vec<Peer>,
    state: ChatSessionState,
}

impl std::fmt::Debug for ChatSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatSession")
            .field("id", &self.id)
            .field("peers", &self.peers)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Read-only snapshot of one session for presentation
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub id: SessionId,
    pub peers: Vec<Peer>,
    pub unread: u32,
    pub awaiting_reply: bool,
}

/// All established sessions of one client.
///
/// Mutations besides drafts, labels and read marks are driven exclusively by
/// relay events through the owning client; the presentation layer reads
/// snapshots.
pub struct SessionStore {
    sessions: RwLock<HashMap<SessionId, ChatSession>>,
}

impl SessionStore {
    pub(crate) fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn insert(&self, id: SessionId, counterparty_id: ClientId, secret: String) {
        self.sessions.write().entry(id).or_insert_with(|| ChatSession {
            id,
            secret,
            peers: vec![Peer::new(counterparty_id)],
            state: ChatSessionState::default(),
        });
    }

    pub(crate) fn secret(&self, id: &SessionId) -> Option<String> {
        self.sessions.read().get(id).map(|session| session.secret.clone())
    }

    /// Append a decrypted message to its session. Messages from the
    /// counterparty count as unread and clear the awaiting flag; the echo of
    /// an own message changes neither.
    pub(crate) fn append_message(&self, message: ChatMessage, from_self: bool) -> bool {
        let mut sessions = self.sessions.write();
        let Some(session) = sessions.get_mut(&message.session_id) else {
            return false;
        };
        if !from_self {
            session.state.unread += 1;
            session.state.awaiting_reply = false;
        }
        session.state.messages.push(message);
        true
    }

    pub(crate) fn set_awaiting_reply(&self, id: &SessionId) {
        if let Some(session) = self.sessions.write().get_mut(id) {
            session.state.awaiting_reply = true;
        }
    }

    /// Flag a session member as gone. Returns true only on the transition,
    /// so duplicate notices stay silent.
    pub(crate) fn mark_peer_disconnected(&self, id: &SessionId, client_id: ClientId) -> bool {
        let mut sessions = self.sessions.write();
        let Some(session) = sessions.get_mut(id) else {
            return false;
        };
        match session.peers.iter_mut().find(|peer| peer.id == client_id) {
            Some(peer) if peer.connected => {
                peer.connected = false;
                true
            }
            _ => false,
        }
    }

    /// Whether a session with this id is established
    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.read().contains_key(id)
    }

    /// Snapshot of every session for a chat list
    pub fn summaries(&self) -> Vec<SessionSummary> {
        self.sessions
            .read()
            .values()
            .map(|session| SessionSummary {
                id: session.id,
                peers: session.peers.clone(),
                unread: session.state.unread,
                awaiting_reply: session.state.awaiting_reply,
            })
            .collect()
    }

    /// Decrypted history of one session
    pub fn messages(&self, id: &SessionId) -> Option<Vec<ChatMessage>> {
        self.sessions
            .read()
            .get(id)
            .map(|session| session.state.messages.clone())
    }

    /// Composing text of one session
    pub fn draft(&self, id: &SessionId) -> Option<String> {
        self.sessions.read().get(id).map(|session| session.state.draft.clone())
    }

    /// Replace the composing text of one session
    pub fn set_draft(&self, id: &SessionId, text: impl Into<String>) -> bool {
        match self.sessions.write().get_mut(id) {
            Some(session) => {
                session.state.draft = text.into();
                true
            }
            None => false,
        }
    }

    /// Reset the unread counter, typically when the session gains focus
    pub fn mark_read(&self, id: &SessionId) -> bool {
        match self.sessions.write().get_mut(id) {
            Some(session) => {
                session.state.unread = 0;
                true
            }
            None => false,
        }
    }

    /// Rename a session member locally
    pub fn set_peer_label(&self, id: &SessionId, client_id: ClientId, label: impl Into<String>) -> bool {
        let mut sessions = self.sessions.write();
        let Some(session) = sessions.get_mut(id) else {
            return false;
        };
        match session.peers.iter_mut().find(|peer| peer.id == client_id) {
            Some(peer) => {
                peer.label = label.into();
                true
            }
            None => false,
        }
    }
}
