//! Crypto error types

use thiserror::Error;

/// Cryptographic operation error
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Malformed ciphertext frame: {0}")]
    MalformedFrame(&'static str),

    #[error("Decryption failed: bad key or corrupted frame")]
    DecryptionFailed,

    #[error("Secret wrapping failed: {0}")]
    WrapFailure(String),

    #[error("Secret unwrapping failed: {0}")]
    UnwrapFailure(String),
}

pub type CryptoResult<T> = Result<T, CryptoError>;
