//! AES-256-GCM authenticated encryption.
//!
//! Frame layout: `nonce (12) || ciphertext || tag (16)`. The associated
//! data is authenticated but not transmitted; callers bind the public
//! header of whatever message the frame belongs to.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};

use crate::{error::CryptoError, Result, KEY_LEN, NONCE_LEN, TAG_LEN};

/// Encrypt `plaintext` under `key` with the caller-supplied nonce,
/// returning the full frame with the nonce prepended.
pub fn seal(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
    ad: &[u8],
) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| CryptoError::InvalidArg("aead key length"))?;

    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad: ad,
            },
        )
        .map_err(|_| CryptoError::InvalidArg("plaintext too large"))?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Verify and decrypt a `nonce || ciphertext || tag` frame.
pub fn open(key: &[u8; KEY_LEN], frame: &[u8], ad: &[u8]) -> Result<Vec<u8>> {
    if frame.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::AuthFailed);
    }
    let (nonce, ct) = frame.split_at(NONCE_LEN);

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| CryptoError::InvalidArg("aead key length"))?;

    cipher
        .decrypt(Nonce::from_slice(nonce), Payload { msg: ct, aad: ad })
        .map_err(|_| CryptoError::AuthFailed)
}
