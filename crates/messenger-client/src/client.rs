//! The messenger client core
//!
//! Owns the connection-handshake state machine and the session store. Relay
//! events are fed in through [`MessengerClient::handle_event`] (or the
//! [`MessengerClient::run`] loop); the presentation layer calls the async
//! operations and subscribes to [`ClientEvent`]s.

use std::collections::HashMap;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use chat_protocol::{
    ChatMessage, ClientId, ClientRequest, HandshakeStatus, ServerEvent, SessionId,
};
use message_crypto::{self as crypto, IdentityKeys};

use crate::error::{ClientError, ClientResult};
use crate::events::{ClientEvent, EventSender, FailReason};
use crate::store::SessionStore;

/// Events buffered per subscriber before older ones are dropped
const EVENT_CAPACITY: usize = 100;

/// An unresolved handshake with one counterparty
struct PendingRequest {
    counterparty_id: ClientId,
    /// Present when this side generated the secret, which is the acceptor
    /// side of the handshake
    secret: Option<String>,
}

/// Client-side state machine for one relay connection
pub struct MessengerClient {
    identity: IdentityKeys,
    local_id: RwLock<Option<ClientId>>,
    /// Handshakes started or accepted here, not yet resolved by the relay
    pending: Mutex<HashMap<ClientId, PendingRequest>>,
    /// Offers received and not yet answered, caller id to their public key
    offers: Mutex<HashMap<ClientId, String>>,
    store: SessionStore,
    outbound: mpsc::Sender<ClientRequest>,
    events: EventSender,
}

impl MessengerClient {
    /// Create a client with a fresh default-size identity. Key generation
    /// can take a moment; do it before connecting the transport.
    pub fn new(outbound: mpsc::Sender<ClientRequest>) -> ClientResult<Self> {
        Ok(Self::assemble(IdentityKeys::generate()?, outbound))
    }

    /// Create a client with an explicit RSA modulus size
    pub fn with_key_bits(outbound: mpsc::Sender<ClientRequest>, bits: usize) -> ClientResult<Self> {
        Ok(Self::assemble(IdentityKeys::with_bits(bits)?, outbound))
    }

    fn assemble(identity: IdentityKeys, outbound: mpsc::Sender<ClientRequest>) -> Self {
        Self {
            identity,
            local_id: RwLock::new(None),
            pending: Mutex::new(HashMap::new()),
            offers: Mutex::new(HashMap::new()),
            store: SessionStore::new(),
            outbound,
            events: EventSender::new(EVENT_CAPACITY),
        }
    }

    /// Identity assigned by the relay, once [`ServerEvent::Connected`] arrives
    pub fn local_id(&self) -> Option<ClientId> {
        *self.local_id.read()
    }

    /// Established sessions and their conversation state
    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Subscribe to client events
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Offers currently awaiting an answer
    pub fn pending_offers(&self) -> Vec<ClientId> {
        self.offers.lock().keys().copied().collect()
    }

    /// Drive the client from a stream of relay events until the stream ends
    pub async fn run(&self, mut inbound: mpsc::Receiver<ServerEvent>) {
        while let Some(event) = inbound.recv().await {
            self.handle_event(event);
        }
        info!("Relay event stream ended");
    }

    /// Ask `target_id` for a chat. The outcome arrives later as
    /// [`ClientEvent::SessionEstablished`] or [`ClientEvent::RequestFailed`].
    pub async fn request_connection(&self, target_id: ClientId) -> ClientResult<()> {
        self.pending.lock().insert(
            target_id,
            PendingRequest {
                counterparty_id: target_id,
                secret: None,
            },
        );
        info!("Requesting connection to {}", target_id);
        self.send_request(ClientRequest::RequestConnection {
            target_id,
            public_key: self.identity.public_key_pem().to_string(),
        })
        .await
    }

    /// Accept a received offer: generate the session secret, wrap it under
    /// the caller's public key and hand it to the relay. A wrap failure
    /// turns into a rejection so the caller is never left waiting.
    pub async fn accept_offer(&self, caller_id: ClientId) -> ClientResult<()> {
        let public_key = self
            .offers
            .lock()
            .remove(&caller_id)
            .ok_or(ClientError::NoSuchOffer(caller_id))?;

        let secret = crypto::generate_secret();
        self.pending.lock().insert(
            caller_id,
            PendingRequest {
                counterparty_id: caller_id,
                secret: Some(secret.clone()),
            },
        );

        match crypto::wrap_secret(&secret, &public_key) {
            Ok(wrapped_secret) => {
                info!("Accepting connection from {}", caller_id);
                self.send_request(ClientRequest::AcceptConnection {
                    target_id: caller_id,
                    wrapped_secret,
                })
                .await
            }
            Err(err) => {
                warn!("Could not wrap secret for {}: {}", caller_id, err);
                self.pending.lock().remove(&caller_id);
                let _ = self
                    .send_request(ClientRequest::RejectConnection {
                        target_id: caller_id,
                    })
                    .await;
                Err(err.into())
            }
        }
    }

    /// Decline a received offer
    pub async fn decline_offer(&self, caller_id: ClientId) -> ClientResult<()> {
        if self.offers.lock().remove(&caller_id).is_none() {
            return Err(ClientError::NoSuchOffer(caller_id));
        }
        info!("Declining connection from {}", caller_id);
        self.send_request(ClientRequest::RejectConnection {
            target_id: caller_id,
        })
        .await
    }

    /// Encrypt and send a message into an established session. The message
    /// joins the local history when the relay echoes the stamped copy back.
    pub async fn send_text(&self, session_id: SessionId, plaintext: &str) -> ClientResult<()> {
        let secret = self
            .store
            .secret(&session_id)
            .ok_or(ClientError::SessionNotFound(session_id))?;
        let body = crypto::encrypt(&secret, plaintext);
        self.send_request(ClientRequest::Send { session_id, body })
            .await?;
        self.store.set_awaiting_reply(&session_id);
        Ok(())
    }

    /// Apply one relay event to the local state machine
    pub fn handle_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::Connected { client_id } => {
                info!("Connected to relay as {}", client_id);
                *self.local_id.write() = Some(client_id);
                self.events.emit(ClientEvent::Ready { client_id });
            }

            ServerEvent::IncomingRequest {
                caller_id,
                public_key,
            } => {
                info!("Incoming connection request from {}", caller_id);
                self.offers.lock().insert(caller_id, public_key);
                self.events.emit(ClientEvent::OfferReceived { caller_id });
            }

            ServerEvent::HandshakeResult {
                session_id,
                counterparty_id,
                status,
                wrapped_secret,
            } => self.on_handshake_result(session_id, counterparty_id, status, wrapped_secret),

            ServerEvent::Message(message) => self.on_message(message),

            ServerEvent::PeerDisconnected {
                session_id,
                client_id,
            } => {
                self.pending.lock().remove(&client_id);
                self.offers.lock().remove(&client_id);
                if self.store.mark_peer_disconnected(&session_id, client_id) {
                    info!("Peer {} left session {}", client_id, session_id);
                    self.events.emit(ClientEvent::PeerDisconnected {
                        session_id,
                        client_id,
                    });
                } else {
                    debug!("Disconnect notice for unknown session {}", session_id);
                }
            }
        }
    }

    fn on_handshake_result(
        &self,
        session_id: Option<SessionId>,
        counterparty_id: ClientId,
        status: HandshakeStatus,
        wrapped_secret: Option<String>,
    ) {
        // A result only means something against an outstanding request.
        // Results with none on file are stale duplicates, like the second
        // copy of a self-chat accept or the relay's answer to the losing
        // half of a mutual-accept race, and resolve nothing.
        let Some(request) = self.pending.lock().remove(&counterparty_id) else {
            debug!(
                "No outstanding handshake with {}, dropping {:?} result",
                counterparty_id, status
            );
            return;
        };

        match status {
            HandshakeStatus::Accepted => {
                let Some(session_id) = session_id else {
                    warn!(
                        "Accepted handshake with {} carried no session id",
                        counterparty_id
                    );
                    return;
                };

                // A delivered wrapped secret wins over a locally generated
                // one: when both sides accepted concurrently, both converge
                // on the secret of whichever accept the relay admitted first
                let secret = match wrapped_secret {
                    Some(wrapped) => self
                        .identity
                        .unwrap_secret(&wrapped)
                        .map_err(|err| {
                            warn!(
                                "Could not unwrap secret from {}: {}",
                                counterparty_id, err
                            );
                        })
                        .ok(),
                    None => request.secret,
                };

                match secret {
                    Some(secret) => {
                        self.store.insert(session_id, counterparty_id, secret);
                        info!("Session {} established with {}", session_id, counterparty_id);
                        self.events.emit(ClientEvent::SessionEstablished {
                            session_id,
                            counterparty_id,
                        });
                    }
                    None => {
                        warn!(
                            "No usable secret for session {} with {}",
                            session_id, counterparty_id
                        );
                        self.events.emit(ClientEvent::RequestFailed {
                            counterparty_id,
                            reason: FailReason::KeyExchange,
                        });
                    }
                }
            }

            HandshakeStatus::Waiting => {
                // Put the entry back, complete with any secret a racing
                // accept of this same counterparty already generated
                debug!("Waiting for {} to answer", request.counterparty_id);
                self.pending.lock().insert(counterparty_id, request);
            }

            HandshakeStatus::Rejected => {
                info!("Connection request rejected by {}", counterparty_id);
                self.events.emit(ClientEvent::RequestFailed {
                    counterparty_id,
                    reason: FailReason::Rejected,
                });
            }

            HandshakeStatus::Unreachable => {
                info!("{} is not reachable", counterparty_id);
                self.events.emit(ClientEvent::RequestFailed {
                    counterparty_id,
                    reason: FailReason::Unreachable,
                });
            }
        }
    }

    fn on_message(&self, mut message: ChatMessage) {
        let Some(secret) = self.store.secret(&message.session_id) else {
            warn!("Dropping message for unknown session {}", message.session_id);
            return;
        };
        match crypto::decrypt(&secret, &message.body) {
            Ok(plaintext) => {
                message.body = plaintext;
                let from_self = *self.local_id.read() == Some(message.sender_id);
                self.store.append_message(message.clone(), from_self);
                self.events.emit(ClientEvent::MessageReceived(message));
            }
            Err(err) => {
                warn!(
                    "Dropping undecryptable message {} in session {}: {}",
                    message.id, message.session_id, err
                );
            }
        }
    }

    async fn send_request(&self, request: ClientRequest) -> ClientResult<()> {
        self.outbound
            .send(request)
            .await
            .map_err(|_| ClientError::ChannelClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chat_protocol::MessageId;
    use message_crypto::{decrypt, encrypt, generate_secret, wrap_secret};

    const TEST_BITS: usize = 1024;

    fn test_client() -> (MessengerClient, mpsc::Receiver<ClientRequest>) {
        let (tx, rx) = mpsc::channel(16);
        let client = MessengerClient::with_key_bits(tx, TEST_BITS).unwrap();
        (client, rx)
    }

    fn next_request(rx: &mut mpsc::Receiver<ClientRequest>) -> ClientRequest {
        rx.try_recv().expect("expected an outbound request")
    }

    fn next_event(events: &mut broadcast::Receiver<ClientEvent>) -> ClientEvent {
        events.try_recv().expect("expected a client event")
    }

    fn stamped(session_id: SessionId, sender_id: ClientId, body: String) -> ChatMessage {
        ChatMessage {
            id: MessageId::new(),
            session_id,
            sender_id,
            timestamp_ms: 1,
            body,
        }
    }

    #[tokio::test]
    async fn ready_event_records_identity() {
        let (client, _out_rx) = test_client();
        let mut events = client.subscribe();
        assert_eq!(client.local_id(), None);

        let id = ClientId::new();
        client.handle_event(ServerEvent::Connected { client_id: id });

        assert_eq!(client.local_id(), Some(id));
        assert!(matches!(
            next_event(&mut events),
            ClientEvent::Ready { client_id } if client_id == id
        ));
    }

    #[tokio::test]
    async fn requester_establishes_session_from_wrapped_secret() {
        let (client, mut out_rx) = test_client();
        let mut events = client.subscribe();
        let peer = ClientId::new();
        client.handle_event(ServerEvent::Connected {
            client_id: ClientId::new(),
        });
        let _ = next_event(&mut events);

        client.request_connection(peer).await.unwrap();
        let public_key = match next_request(&mut out_rx) {
            ClientRequest::RequestConnection {
                target_id,
                public_key,
            } => {
                assert_eq!(target_id, peer);
                public_key
            }
            other => panic!("expected RequestConnection, got {other:?}"),
        };

        // What the acceptor side would do with our public key
        let secret = generate_secret();
        let wrapped = wrap_secret(&secret, &public_key).unwrap();

        let session_id = SessionId::new();
        client.handle_event(ServerEvent::HandshakeResult {
            session_id: Some(session_id),
            counterparty_id: peer,
            status: HandshakeStatus::Accepted,
            wrapped_secret: Some(wrapped),
        });

        assert!(matches!(
            next_event(&mut events),
            ClientEvent::SessionEstablished { session_id: sid, counterparty_id }
                if sid == session_id && counterparty_id == peer
        ));
        assert!(client.store().contains(&session_id));

        // Both ends now hold the same secret
        client.send_text(session_id, "hi there").await.unwrap();
        match next_request(&mut out_rx) {
            ClientRequest::Send {
                session_id: sid,
                body,
            } => {
                assert_eq!(sid, session_id);
                assert_ne!(body, "hi there");
                assert_eq!(decrypt(&secret, &body).unwrap(), "hi there");
            }
            other => panic!("expected Send, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn acceptor_generates_and_keeps_the_secret() {
        let (client, mut out_rx) = test_client();
        let mut events = client.subscribe();
        let requester_keys = IdentityKeys::with_bits(TEST_BITS).unwrap();
        let caller = ClientId::new();

        client.handle_event(ServerEvent::IncomingRequest {
            caller_id: caller,
            public_key: requester_keys.public_key_pem().to_string(),
        });
        assert!(matches!(
            next_event(&mut events),
            ClientEvent::OfferReceived { caller_id } if caller_id == caller
        ));
        assert_eq!(client.pending_offers(), vec![caller]);

        client.accept_offer(caller).await.unwrap();
        assert!(client.pending_offers().is_empty());
        let secret = match next_request(&mut out_rx) {
            ClientRequest::AcceptConnection {
                target_id,
                wrapped_secret,
            } => {
                assert_eq!(target_id, caller);
                requester_keys.unwrap_secret(&wrapped_secret).unwrap()
            }
            other => panic!("expected AcceptConnection, got {other:?}"),
        };

        // The relay confirms without echoing any secret to the acceptor
        let session_id = SessionId::new();
        client.handle_event(ServerEvent::HandshakeResult {
            session_id: Some(session_id),
            counterparty_id: caller,
            status: HandshakeStatus::Accepted,
            wrapped_secret: None,
        });
        assert!(matches!(
            next_event(&mut events),
            ClientEvent::SessionEstablished { .. }
        ));

        client.send_text(session_id, "welcome").await.unwrap();
        match next_request(&mut out_rx) {
            ClientRequest::Send { body, .. } => {
                assert_eq!(decrypt(&secret, &body).unwrap(), "welcome");
            }
            other => panic!("expected Send, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn accept_without_offer_is_refused() {
        let (client, mut out_rx) = test_client();
        let stranger = ClientId::new();
        assert!(matches!(
            client.accept_offer(stranger).await,
            Err(ClientError::NoSuchOffer(id)) if id == stranger
        ));
        assert!(out_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn wrap_failure_turns_into_rejection() {
        let (client, mut out_rx) = test_client();
        let caller = ClientId::new();
        client.handle_event(ServerEvent::IncomingRequest {
            caller_id: caller,
            public_key: "not a usable key".into(),
        });

        let result = client.accept_offer(caller).await;
        assert!(matches!(result, Err(ClientError::Crypto(_))));
        assert!(matches!(
            next_request(&mut out_rx),
            ClientRequest::RejectConnection { target_id } if target_id == caller
        ));
    }

    #[tokio::test]
    async fn decline_offer_sends_rejection() {
        let (client, mut out_rx) = test_client();
        let caller = ClientId::new();
        client.handle_event(ServerEvent::IncomingRequest {
            caller_id: caller,
            public_key: "irrelevant".into(),
        });

        client.decline_offer(caller).await.unwrap();
        assert!(matches!(
            next_request(&mut out_rx),
            ClientRequest::RejectConnection { target_id } if target_id == caller
        ));
        assert!(matches!(
            client.decline_offer(caller).await,
            Err(ClientError::NoSuchOffer(_))
        ));
    }

    #[tokio::test]
    async fn waiting_preserves_a_racing_accept_secret() {
        let (client, mut out_rx) = test_client();
        let requester_keys = IdentityKeys::with_bits(TEST_BITS).unwrap();
        let peer = ClientId::new();

        // We requested the peer, the peer requested us, and we accepted
        // before our own Waiting reply came back
        client.request_connection(peer).await.unwrap();
        let _ = next_request(&mut out_rx);
        client.handle_event(ServerEvent::IncomingRequest {
            caller_id: peer,
            public_key: requester_keys.public_key_pem().to_string(),
        });
        client.accept_offer(peer).await.unwrap();
        let secret = match next_request(&mut out_rx) {
            ClientRequest::AcceptConnection { wrapped_secret, .. } => {
                requester_keys.unwrap_secret(&wrapped_secret).unwrap()
            }
            other => panic!("expected AcceptConnection, got {other:?}"),
        };

        // The stale Waiting reply to our original request arrives late
        client.handle_event(ServerEvent::HandshakeResult {
            session_id: None,
            counterparty_id: peer,
            status: HandshakeStatus::Waiting,
            wrapped_secret: None,
        });

        // Our accept won the race; the relay confirms without a secret and
        // the one we generated must still be on file
        let session_id = SessionId::new();
        client.handle_event(ServerEvent::HandshakeResult {
            session_id: Some(session_id),
            counterparty_id: peer,
            status: HandshakeStatus::Accepted,
            wrapped_secret: None,
        });

        client.send_text(session_id, "survived the race").await.unwrap();
        match next_request(&mut out_rx) {
            ClientRequest::Send { body, .. } => {
                assert_eq!(decrypt(&secret, &body).unwrap(), "survived the race");
            }
            other => panic!("expected Send, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn self_chat_establishes_one_session_and_echoes_once() {
        let (client, mut out_rx) = test_client();
        let me = ClientId::new();
        client.handle_event(ServerEvent::Connected { client_id: me });
        let mut events = client.subscribe();

        client.request_connection(me).await.unwrap();
        let public_key = match next_request(&mut out_rx) {
            ClientRequest::RequestConnection { public_key, .. } => public_key,
            other => panic!("expected RequestConnection, got {other:?}"),
        };
        client.handle_event(ServerEvent::HandshakeResult {
            session_id: None,
            counterparty_id: me,
            status: HandshakeStatus::Waiting,
            wrapped_secret: None,
        });
        client.handle_event(ServerEvent::IncomingRequest {
            caller_id: me,
            public_key,
        });
        client.accept_offer(me).await.unwrap();
        let wrapped = match next_request(&mut out_rx) {
            ClientRequest::AcceptConnection { wrapped_secret, .. } => wrapped_secret,
            other => panic!("expected AcceptConnection, got {other:?}"),
        };

        // The relay answers a self-accept twice, requester copy first
        let session_id = SessionId::new();
        client.handle_event(ServerEvent::HandshakeResult {
            session_id: Some(session_id),
            counterparty_id: me,
            status: HandshakeStatus::Accepted,
            wrapped_secret: Some(wrapped),
        });
        client.handle_event(ServerEvent::HandshakeResult {
            session_id: Some(session_id),
            counterparty_id: me,
            status: HandshakeStatus::Accepted,
            wrapped_secret: None,
        });

        assert!(matches!(
            next_event(&mut events),
            ClientEvent::OfferReceived { caller_id } if caller_id == me
        ));
        assert!(matches!(
            next_event(&mut events),
            ClientEvent::SessionEstablished { session_id: sid, counterparty_id }
                if sid == session_id && counterparty_id == me
        ));
        // The duplicate copy resolves nothing and raises nothing
        assert!(events.try_recv().is_err());

        client.send_text(session_id, "note to self").await.unwrap();
        let body = match next_request(&mut out_rx) {
            ClientRequest::Send { body, .. } => body,
            other => panic!("expected Send, got {other:?}"),
        };
        client.handle_event(ServerEvent::Message(stamped(session_id, me, body)));

        let history = client.store().messages(&session_id).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].body, "note to self");
        assert_eq!(client.store().summaries()[0].unread, 0);
    }

    #[tokio::test]
    async fn unmatched_handshake_results_are_dropped() {
        let (client, _out_rx) = test_client();
        let mut events = client.subscribe();
        let stranger = ClientId::new();

        for (status, session_id) in [
            (HandshakeStatus::Waiting, None),
            (HandshakeStatus::Rejected, None),
            (HandshakeStatus::Unreachable, None),
            (HandshakeStatus::Accepted, Some(SessionId::new())),
        ] {
            client.handle_event(ServerEvent::HandshakeResult {
                session_id,
                counterparty_id: stranger,
                status,
                wrapped_secret: None,
            });
        }

        assert!(events.try_recv().is_err());
        assert!(client.store().summaries().is_empty());
        assert!(client.pending.lock().is_empty());
    }

    #[tokio::test]
    async fn rejection_and_unreachable_surface_as_failures() {
        let (client, _out_rx) = test_client();
        let mut events = client.subscribe();
        let peer = ClientId::new();

        client.request_connection(peer).await.unwrap();
        client.handle_event(ServerEvent::HandshakeResult {
            session_id: None,
            counterparty_id: peer,
            status: HandshakeStatus::Rejected,
            wrapped_secret: None,
        });
        assert!(matches!(
            next_event(&mut events),
            ClientEvent::RequestFailed { reason: FailReason::Rejected, .. }
        ));

        client.request_connection(peer).await.unwrap();
        client.handle_event(ServerEvent::HandshakeResult {
            session_id: None,
            counterparty_id: peer,
            status: HandshakeStatus::Unreachable,
            wrapped_secret: None,
        });
        assert!(matches!(
            next_event(&mut events),
            ClientEvent::RequestFailed { reason: FailReason::Unreachable, .. }
        ));
    }

    #[tokio::test]
    async fn garbled_wrapped_secret_fails_the_handshake() {
        let (client, _out_rx) = test_client();
        let mut events = client.subscribe();
        let peer = ClientId::new();

        client.request_connection(peer).await.unwrap();
        client.handle_event(ServerEvent::HandshakeResult {
            session_id: Some(SessionId::new()),
            counterparty_id: peer,
            status: HandshakeStatus::Accepted,
            wrapped_secret: Some("junk".into()),
        });

        assert!(matches!(
            next_event(&mut events),
            ClientEvent::RequestFailed { reason: FailReason::KeyExchange, .. }
        ));
        assert!(client.store().summaries().is_empty());
    }

    /// Put one established session into the client by replaying the
    /// acceptor-side handshake, returning its id, secret and counterparty
    async fn established_session(
        client: &MessengerClient,
        out_rx: &mut mpsc::Receiver<ClientRequest>,
    ) -> (SessionId, String, ClientId) {
        let requester_keys = IdentityKeys::with_bits(TEST_BITS).unwrap();
        let peer = ClientId::new();
        client.handle_event(ServerEvent::IncomingRequest {
            caller_id: peer,
            public_key: requester_keys.public_key_pem().to_string(),
        });
        client.accept_offer(peer).await.unwrap();
        let secret = match next_request(out_rx) {
            ClientRequest::AcceptConnection { wrapped_secret, .. } => {
                requester_keys.unwrap_secret(&wrapped_secret).unwrap()
            }
            other => panic!("expected AcceptConnection, got {other:?}"),
        };
        let session_id = SessionId::new();
        client.handle_event(ServerEvent::HandshakeResult {
            session_id: Some(session_id),
            counterparty_id: peer,
            status: HandshakeStatus::Accepted,
            wrapped_secret: None,
        });
        (session_id, secret, peer)
    }

    #[tokio::test]
    async fn incoming_message_is_decrypted_and_appended() {
        let (client, mut out_rx) = test_client();
        client.handle_event(ServerEvent::Connected {
            client_id: ClientId::new(),
        });
        let (session_id, secret, peer) = established_session(&client, &mut out_rx).await;
        let mut events = client.subscribe();

        client.handle_event(ServerEvent::Message(stamped(
            session_id,
            peer,
            encrypt(&secret, "ciao"),
        )));

        match next_event(&mut events) {
            ClientEvent::MessageReceived(message) => {
                assert_eq!(message.session_id, session_id);
                assert_eq!(message.body, "ciao");
            }
            other => panic!("expected MessageReceived, got {other:?}"),
        }
        let history = client.store().messages(&session_id).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].body, "ciao");
        assert_eq!(client.store().summaries()[0].unread, 1);
    }

    #[tokio::test]
    async fn own_echo_completes_the_send_without_counting_unread() {
        let (client, mut out_rx) = test_client();
        let local = ClientId::new();
        client.handle_event(ServerEvent::Connected { client_id: local });
        let (session_id, secret, _peer) = established_session(&client, &mut out_rx).await;

        client.send_text(session_id, "anyone there?").await.unwrap();
        let body = match next_request(&mut out_rx) {
            ClientRequest::Send { body, .. } => body,
            other => panic!("expected Send, got {other:?}"),
        };
        // Nothing lands in history until the relay echoes the stamped copy
        assert!(client.store().messages(&session_id).unwrap().is_empty());
        assert!(client.store().summaries()[0].awaiting_reply);

        client.handle_event(ServerEvent::Message(stamped(session_id, local, body)));

        let history = client.store().messages(&session_id).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].body, "anyone there?");
        assert_eq!(client.store().summaries()[0].unread, 0);
        assert!(client.store().summaries()[0].awaiting_reply);

        // Decryption leaves the relay stamp untouched
        assert_eq!(history[0].sender_id, local);

        // A reply from anyone else clears the flag
        client.handle_event(ServerEvent::Message(stamped(
            session_id,
            ClientId::new(),
            encrypt(&secret, "here!"),
        )));
        assert!(!client.store().summaries()[0].awaiting_reply);
    }

    #[tokio::test]
    async fn undecryptable_and_unknown_messages_are_dropped() {
        let (client, mut out_rx) = test_client();
        let (session_id, _secret, peer) = established_session(&client, &mut out_rx).await;
        let mut events = client.subscribe();

        client.handle_event(ServerEvent::Message(stamped(
            session_id,
            peer,
            "00ff00ff".into(),
        )));
        client.handle_event(ServerEvent::Message(stamped(
            SessionId::new(),
            peer,
            "00ff00ff".into(),
        )));

        assert!(events.try_recv().is_err());
        assert!(client.store().messages(&session_id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn send_into_unknown_session_is_refused() {
        let (client, mut out_rx) = test_client();
        let nowhere = SessionId::new();
        assert!(matches!(
            client.send_text(nowhere, "hello?").await,
            Err(ClientError::SessionNotFound(id)) if id == nowhere
        ));
        assert!(out_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn peer_disconnect_marks_store_and_emits_once() {
        let (client, mut out_rx) = test_client();
        let (session_id, _secret, peer) = established_session(&client, &mut out_rx).await;
        let mut events = client.subscribe();

        client.handle_event(ServerEvent::PeerDisconnected {
            session_id,
            client_id: peer,
        });
        client.handle_event(ServerEvent::PeerDisconnected {
            session_id,
            client_id: peer,
        });

        assert!(matches!(
            next_event(&mut events),
            ClientEvent::PeerDisconnected { session_id: sid, client_id }
                if sid == session_id && client_id == peer
        ));
        assert!(events.try_recv().is_err());
        assert!(!client.store().summaries()[0].peers[0].connected);
        // History survives the departure
        assert!(client.store().messages(&session_id).is_some());
    }
}
