//! Connection and session brokering
//!
//! The broker tracks two registries: live clients (id to outbound event
//! queue) and established sessions (id to member list). Handshakes move a
//! pair of clients from unrelated to sharing a session; messages are stamped
//! here and fanned out to every member, sender included, so all members see
//! one ordering.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use chat_protocol::{
    ChatMessage, ClientId, HandshakeStatus, MessageId, ServerEvent, SessionId,
};
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Outbound events queued per client before the socket writer drains them
const EVENT_QUEUE: usize = 100;

/// Members of one established chat session
struct SessionGroup {
    members: Vec<ClientId>,
}

impl SessionGroup {
    fn new(requester_id: ClientId, acceptor_id: ClientId) -> Self {
        // A self-chat session holds one member, not the same id twice, so
        // fan-out stays one delivery per stamped copy
        let members = if requester_id == acceptor_id {
            vec![requester_id]
        } else {
            vec![requester_id, acceptor_id]
        };
        Self { members }
    }

    fn contains(&self, id: ClientId) -> bool {
        self.members.contains(&id)
    }

    fn contains_pair(&self, a: ClientId, b: ClientId) -> bool {
        self.contains(a) && self.contains(b)
    }

    fn remove_member(&mut self, id: ClientId) -> bool {
        let before = self.members.len();
        self.members.retain(|member| *member != id);
        self.members.len() != before
    }
}

/// Central relay state: who is connected and which sessions exist
pub struct Broker {
    /// Live clients, id to outbound event queue
    clients: DashMap<ClientId, mpsc::Sender<ServerEvent>>,
    /// Established sessions. Guarded by one lock so session creation and
    /// message stamping are serialized
    sessions: RwLock<HashMap<SessionId, SessionGroup>>,
}

impl Broker {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Admit a new client: assign an identity, register its event queue and
    /// greet it with [`ServerEvent::Connected`]
    pub fn connect(&self) -> (ClientId, mpsc::Receiver<ServerEvent>) {
        let client_id = ClientId::new();
        let (tx, rx) = mpsc::channel(EVENT_QUEUE);
        self.clients.insert(client_id, tx);
        self.deliver(client_id, ServerEvent::Connected { client_id });
        (client_id, rx)
    }

    /// Remove a departed client and sweep its sessions. Every remaining
    /// member of an affected session gets exactly one
    /// [`ServerEvent::PeerDisconnected`]; sessions left without members are
    /// destroyed.
    pub fn disconnect(&self, client_id: ClientId) {
        // Drop from the live registry first so a concurrent accept cannot
        // admit this client into a new session mid-teardown
        self.clients.remove(&client_id);

        let notifications = {
            let mut sessions = self.sessions.write();
            let mut notify = Vec::new();
            sessions.retain(|session_id, group| {
                if !group.remove_member(client_id) {
                    return true;
                }
                for member in &group.members {
                    notify.push((*member, *session_id));
                }
                if group.members.is_empty() {
                    debug!("Destroying empty session {}", session_id);
                    false
                } else {
                    true
                }
            });
            notify
        };

        for (member, session_id) in notifications {
            self.deliver(
                member,
                ServerEvent::PeerDisconnected {
                    session_id,
                    client_id,
                },
            );
        }
    }

    /// Forward a connection request to its target and tell the caller
    /// whether the target is reachable
    pub fn request_connection(
        &self,
        caller_id: ClientId,
        target_id: ClientId,
        public_key: String,
    ) {
        info!("Connection request: {} -> {}", caller_id, target_id);

        let forwarded = self.deliver(
            target_id,
            ServerEvent::IncomingRequest {
                caller_id,
                public_key,
            },
        );

        let status = if forwarded {
            HandshakeStatus::Waiting
        } else {
            HandshakeStatus::Unreachable
        };
        self.deliver(
            caller_id,
            ServerEvent::HandshakeResult {
                session_id: None,
                counterparty_id: target_id,
                status,
                wrapped_secret: None,
            },
        );
    }

    /// Establish a session between acceptor and original requester. The
    /// wrapped secret travels only to the requester; the acceptor already
    /// holds the plain secret it generated.
    pub fn accept_connection(
        &self,
        acceptor_id: ClientId,
        requester_id: ClientId,
        wrapped_secret: String,
    ) {
        enum Outcome {
            Created(SessionId),
            AlreadyPaired,
            Gone,
        }

        // Liveness is checked under the sessions lock so a session is never
        // created around a client the disconnect sweep has already passed
        let outcome = {
            let mut sessions = self.sessions.write();
            if !self.clients.contains_key(&requester_id)
                || !self.clients.contains_key(&acceptor_id)
            {
                Outcome::Gone
            } else if sessions
                .values()
                .any(|group| group.contains_pair(acceptor_id, requester_id))
            {
                Outcome::AlreadyPaired
            } else {
                let session_id = SessionId::new();
                sessions.insert(session_id, SessionGroup::new(requester_id, acceptor_id));
                Outcome::Created(session_id)
            }
        };

        match outcome {
            Outcome::Created(session_id) => {
                info!(
                    "Session {} established: {} accepted {}",
                    session_id, acceptor_id, requester_id
                );
                self.deliver(
                    requester_id,
                    ServerEvent::HandshakeResult {
                        session_id: Some(session_id),
                        counterparty_id: acceptor_id,
                        status: HandshakeStatus::Accepted,
                        wrapped_secret: Some(wrapped_secret),
                    },
                );
                self.deliver(
                    acceptor_id,
                    ServerEvent::HandshakeResult {
                        session_id: Some(session_id),
                        counterparty_id: requester_id,
                        status: HandshakeStatus::Accepted,
                        wrapped_secret: None,
                    },
                );
            }
            Outcome::AlreadyPaired => {
                // Both sides already share a session, from a mutual-accept
                // race or a repeated handshake. Each gets a terminal answer
                // so no request is left dangling on the dropped accept; in
                // the race case the winner's results are queued ahead of
                // these and the clients discard them as stale.
                info!(
                    "Duplicate accept between {} and {}",
                    acceptor_id, requester_id
                );
                for (member_id, counterparty_id) in
                    [(requester_id, acceptor_id), (acceptor_id, requester_id)]
                {
                    self.deliver(
                        member_id,
                        ServerEvent::HandshakeResult {
                            session_id: None,
                            counterparty_id,
                            status: HandshakeStatus::Rejected,
                            wrapped_secret: None,
                        },
                    );
                }
            }
            Outcome::Gone => {
                self.deliver(
                    acceptor_id,
                    ServerEvent::HandshakeResult {
                        session_id: None,
                        counterparty_id: requester_id,
                        status: HandshakeStatus::Unreachable,
                        wrapped_secret: None,
                    },
                );
            }
        }
    }

    /// Forward a rejection to the original requester
    pub fn reject_connection(&self, rejector_id: ClientId, requester_id: ClientId) {
        info!("Connection rejected: {} rejected {}", rejector_id, requester_id);
        self.deliver(
            requester_id,
            ServerEvent::HandshakeResult {
                session_id: None,
                counterparty_id: rejector_id,
                status: HandshakeStatus::Rejected,
                wrapped_secret: None,
            },
        );
    }

    /// Stamp a message and fan it out to every session member, sender
    /// included. Sends from non-members and to unknown sessions are dropped.
    pub fn send(&self, sender_id: ClientId, session_id: SessionId, body: String) {
        // Exclusive lock: concurrent sends to one session must stamp and
        // enqueue in a single order for every member
        let sessions = self.sessions.write();
        let Some(group) = sessions.get(&session_id) else {
            warn!("Send to unknown session {} from {}", session_id, sender_id);
            return;
        };
        if !group.contains(sender_id) {
            warn!(
                "Dropping send from non-member {} to session {}",
                sender_id, session_id
            );
            return;
        }

        let message = ChatMessage {
            id: MessageId::new(),
            session_id,
            sender_id,
            timestamp_ms: unix_millis(),
            body,
        };
        for member in &group.members {
            self.deliver(*member, ServerEvent::Message(message.clone()));
        }
    }

    /// Number of live client connections
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Number of established sessions
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Queue an event for one client without blocking. Departed clients and
    /// full queues lose the event; the caller decides whether that matters.
    fn deliver(&self, client_id: ClientId, event: ServerEvent) -> bool {
        let Some(tx) = self.clients.get(&client_id).map(|entry| entry.value().clone()) else {
            debug!("No live connection for {}", client_id);
            return false;
        };
        match tx.try_send(event) {
            Ok(()) => true,
            Err(err) => {
                warn!("Dropping event for {}: {}", client_id, err);
                false
            }
        }
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}
