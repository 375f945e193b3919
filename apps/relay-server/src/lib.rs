//! Sotto Relay Server
//!
//! WebSocket relay that brokers end-to-end encrypted 1:1 chat sessions. The
//! relay assigns client identities, mediates connection handshakes, and fans
//! stamped messages out to session members without ever holding key material.

pub mod broker;
pub mod server;
