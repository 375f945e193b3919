//! Client error types

use chat_protocol::{ClientId, SessionId};
use message_crypto::CryptoError;
use thiserror::Error;

/// Messenger client error
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("No pending offer from {0}")]
    NoSuchOffer(ClientId),

    #[error("Relay connection closed")]
    ChannelClosed,

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

pub type ClientResult<T> = Result<T, ClientError>;
