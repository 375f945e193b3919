//! Per-message symmetric encryption with PBKDF2-derived AES-256-CBC keys

use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use pbkdf2::pbkdf2_hmac;
use rand::{RngCore, rngs::OsRng};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::{
    BLOCK_SIZE, CryptoError, CryptoResult, IV_SIZE, KEY_SIZE, PBKDF2_ROUNDS, SALT_SIZE,
    SECRET_SIZE,
};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Generate a fresh session secret: 16 random bytes, hex encoded
pub fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_SIZE];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Derive the AES key for one message from the session secret and its salt
fn derive_key(secret: &str, salt: &[u8]) -> Zeroizing<[u8; KEY_SIZE]> {
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    pbkdf2_hmac::<Sha256>(secret.as_bytes(), salt, PBKDF2_ROUNDS, &mut key[..]);
    key
}

/// Encrypt a plaintext into a self-contained hex frame.
///
/// Frame layout: `hex(salt) || hex(iv) || hex(ciphertext)`, with a fresh
/// 16-byte salt and IV drawn per message so encrypting the same text twice
/// never yields the same frame.
pub fn encrypt(secret: &str, plaintext: &str) -> String {
    let mut salt = [0u8; SALT_SIZE];
    let mut iv = [0u8; IV_SIZE];
    OsRng.fill_bytes(&mut salt);
    OsRng.fill_bytes(&mut iv);

    let key = derive_key(secret, &salt);
    let ciphertext = Aes256CbcEnc::new(&(*key).into(), &iv.into())
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

    let mut frame = String::with_capacity(2 * (SALT_SIZE + IV_SIZE + ciphertext.len()));
    frame.push_str(&hex::encode(salt));
    frame.push_str(&hex::encode(iv));
    frame.push_str(&hex::encode(ciphertext));
    frame
}

/// Decrypt a frame produced by [`encrypt`] under the same session secret
pub fn decrypt(secret: &str, frame: &str) -> CryptoResult<String> {
    const SALT_HEX: usize = 2 * SALT_SIZE;
    const IV_HEX: usize = 2 * IV_SIZE;

    // ASCII check first so the fixed-offset slicing below cannot split a
    // multi-byte character
    if !frame.is_ascii() || frame.len() < SALT_HEX + IV_HEX + 2 * BLOCK_SIZE {
        return Err(CryptoError::MalformedFrame("frame too short"));
    }

    let mut salt = [0u8; SALT_SIZE];
    let mut iv = [0u8; IV_SIZE];
    hex::decode_to_slice(&frame[..SALT_HEX], &mut salt)
        .map_err(|_| CryptoError::MalformedFrame("salt is not hex"))?;
    hex::decode_to_slice(&frame[SALT_HEX..SALT_HEX + IV_HEX], &mut iv)
        .map_err(|_| CryptoError::MalformedFrame("iv is not hex"))?;
    let ciphertext = hex::decode(&frame[SALT_HEX + IV_HEX..])
        .map_err(|_| CryptoError::MalformedFrame("ciphertext is not hex"))?;
    if ciphertext.is_empty() || ciphertext.len() % BLOCK_SIZE != 0 {
        return Err(CryptoError::MalformedFrame("ciphertext is not block aligned"));
    }

    let key = derive_key(secret, &salt);
    let plaintext = Aes256CbcDec::new(&(*key).into(), &iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)?;

    String::from_utf8(plaintext).map_err(|_| CryptoError::DecryptionFailed)
}
