//! Message Crypto - End-to-End Encryption for Sotto
//!
//! Provides RSA-wrapped session secrets with PBKDF2-derived AES-256-CBC
//! per-message encryption. The relay only ever sees the hex frames produced
//! here and the wrapped secrets it forwards.

mod cipher;
mod error;
mod keywrap;

pub use cipher::*;
pub use error::*;
pub use keywrap::*;

/// PBKDF2-HMAC-SHA256 iteration count for per-message key derivation
pub const PBKDF2_ROUNDS: u32 = 1000;

/// Derived AES key size (256 bits / 32 bytes)
pub const KEY_SIZE: usize = 32;

/// Per-message salt size (128 bits / 16 bytes)
pub const SALT_SIZE: usize = 16;

/// AES-CBC initialization vector size (128 bits / 16 bytes)
pub const IV_SIZE: usize = 16;

/// AES block size, used to validate ciphertext length
pub const BLOCK_SIZE: usize = 16;

/// Random bytes in a session secret before hex encoding
pub const SECRET_SIZE: usize = 16;

/// Default RSA modulus size for identity keys
pub const DEFAULT_RSA_BITS: usize = 2048;
