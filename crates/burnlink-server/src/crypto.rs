//! Per-link AEAD sealing and access-token generation.
//!
//! Every link gets its own AES-256-GCM key and nonce. The key travels with
//! the ciphertext inside the stored payload:
//!
//! ```text
//! [0, 32)   raw AES-256 key
//! [32, 44)  96-bit nonce
//! [44, ..)  ciphertext || 16-byte GCM tag
//! ```

use aes_gcm::{
    aead::{consts::U12, Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use thiserror::Error;
use uuid::Uuid;
use zeroize::{ZeroizeOnDrop, Zeroizing};

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
/// Offset of the ciphertext within a payload.
pub const HEADER_LEN: usize = KEY_LEN + NONCE_LEN;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("payload too short: {len} bytes, need at least {}", HEADER_LEN + TAG_LEN)]
    Truncated { len: usize },
    #[error("encryption failed")]
    Encrypt,
    #[error("payload failed authentication")]
    Authentication,
    #[error("decrypted content is not valid UTF-8")]
    NotUtf8,
}

/// 32-byte content key, generated fresh for every link.
#[derive(ZeroizeOnDrop)]
pub struct ContentKey([u8; KEY_LEN]);

impl ContentKey {
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    fn from_slice(bytes: &[u8]) -> Self {
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&bytes[..KEY_LEN]);
        Self(key)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

/// Encrypt `plaintext` under a fresh key and nonce and pack the result.
pub fn seal(plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let key = ContentKey::generate();
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    seal_with(&key, &nonce, plaintext)
}

fn seal_with(
    key: &ContentKey,
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|_| CryptoError::Encrypt)?;
    let ciphertext = cipher
        .encrypt(Nonce::<U12>::from_slice(nonce), plaintext)
        .map_err(|_| CryptoError::Encrypt)?;

    let mut payload = Vec::with_capacity(HEADER_LEN + ciphertext.len());
    payload.extend_from_slice(key.as_bytes());
    payload.extend_from_slice(nonce);
    payload.extend_from_slice(&ciphertext);
    Ok(payload)
}

/// Unpack a payload and return the authenticated plaintext.
pub fn open(payload: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if payload.len() < HEADER_LEN + TAG_LEN {
        return Err(CryptoError::Truncated { len: payload.len() });
    }
    let key = ContentKey::from_slice(&payload[..KEY_LEN]);
    let nonce = Nonce::<U12>::from_slice(&payload[KEY_LEN..HEADER_LEN]);

    let cipher =
        Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|_| CryptoError::Authentication)?;
    let plaintext = cipher
        .decrypt(nonce, &payload[HEADER_LEN..])
        .map_err(|_| CryptoError::Authentication)?;
    Ok(Zeroizing::new(plaintext))
}

/// Open a payload and decode it as UTF-8 text.
pub fn open_text(payload: &[u8]) -> Result<Zeroizing<String>, CryptoError> {
    let plaintext = open(payload)?;
    let text = std::str::from_utf8(&plaintext).map_err(|_| CryptoError::NotUtf8)?;
    Ok(Zeroizing::new(text.to_owned()))
}

/// A fresh bearer token (UUIDv4, 122 random bits). Drawn independently of
/// the content key.
pub fn generate_access_token() -> String {
    Uuid::new_v4().to_string()
}
