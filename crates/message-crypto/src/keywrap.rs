//! RSA identity keys and session-secret wrapping

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};

use crate::{CryptoError, CryptoResult, DEFAULT_RSA_BITS};

/// RSA key pair identifying one client for the lifetime of a run.
///
/// The public half travels to peers as PEM inside connection requests; the
/// private half never leaves the process.
pub struct IdentityKeys {
    private: RsaPrivateKey,
    public_pem: String,
}

impl IdentityKeys {
    /// Generate a fresh identity with the default modulus size
    pub fn generate() -> CryptoResult<Self> {
        Self::with_bits(DEFAULT_RSA_BITS)
    }

    /// Generate a fresh identity with an explicit modulus size
    pub fn with_bits(bits: usize) -> CryptoResult<Self> {
        let mut rng = OsRng;
        let private = RsaPrivateKey::new(&mut rng, bits)
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
        let public_pem = RsaPublicKey::from(&private)
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
        Ok(Self {
            private,
            public_pem,
        })
    }

    /// The public key in PEM form, as sent inside connection requests
    pub fn public_key_pem(&self) -> &str {
        &self.public_pem
    }

    /// Recover a session secret wrapped for this identity by [`wrap_secret`]
    pub fn unwrap_secret(&self, wrapped: &str) -> CryptoResult<String> {
        let ciphertext = BASE64
            .decode(wrapped)
            .map_err(|e| CryptoError::UnwrapFailure(e.to_string()))?;
        let encoded = self
            .private
            .decrypt(Pkcs1v15Encrypt, &ciphertext)
            .map_err(|e| CryptoError::UnwrapFailure(e.to_string()))?;
        let secret = BASE64
            .decode(&encoded)
            .map_err(|e| CryptoError::UnwrapFailure(e.to_string()))?;
        String::from_utf8(secret).map_err(|e| CryptoError::UnwrapFailure(e.to_string()))
    }
}

impl std::fmt::Debug for IdentityKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeys").finish_non_exhaustive()
    }
}

/// Wrap a session secret under a recipient's PEM public key.
///
/// The secret text is base64-wrapped before RSA so the recipient recovers
/// exactly the string it will feed to key derivation.
pub fn wrap_secret(secret: &str, recipient_pem: &str) -> CryptoResult<String> {
    let public = RsaPublicKey::from_public_key_pem(recipient_pem)
        .map_err(|e| CryptoError::WrapFailure(e.to_string()))?;
    let mut rng = OsRng;
    let ciphertext = public
        .encrypt(&mut rng, Pkcs1v15Encrypt, BASE64.encode(secret).as_bytes())
        .map_err(|e| CryptoError::WrapFailure(e.to_string()))?;
    Ok(BASE64.encode(ciphertext))
}
