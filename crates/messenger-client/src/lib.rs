//! Messenger Client for Sotto
//!
//! The embeddable client core: relay transport, connection handshakes,
//! per-session secrets and conversation state. A presentation layer calls
//! the operations on [`MessengerClient`] and subscribes to [`ClientEvent`]s;
//! the relay never sees more than wrapped secrets and ciphertext frames.

mod client;
mod error;
mod events;
mod store;
pub mod transport;

pub use client::*;
pub use error::*;
pub use events::*;
pub use store::*;
