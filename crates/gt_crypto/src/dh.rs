//! X25519 key pairs and shared-secret derivation.
//!
//! Keys cross the module boundary as raw 32-byte arrays; the dalek types
//! are rebuilt per operation so the stored secret stays a plain buffer
//! that can be wiped.

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::{error::CryptoError, Result, DH_PUB_LEN, KEY_LEN};

/// An X25519 ratchet key pair. The secret half is wiped on drop.
#[derive(Clone)]
pub struct DhKeyPair {
    pub public: [u8; DH_PUB_LEN],
    secret: [u8; KEY_LEN],
}

impl DhKeyPair {
    /// Generate a fresh pair from the OS RNG.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self {
            public: public.to_bytes(),
            secret: secret.to_bytes(),
        }
    }

    /// Rebuild a pair from a stored secret, e.g. a pre-key the session
    /// manager handed out earlier.
    pub fn from_secret(secret: [u8; KEY_LEN]) -> Self {
        let s = StaticSecret::from(secret);
        let public = PublicKey::from(&s);
        Self {
            public: public.to_bytes(),
            secret,
        }
    }

    pub fn secret_bytes(&self) -> &[u8; KEY_LEN] {
        &self.secret
    }
}

impl Drop for DhKeyPair {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

/// X25519 between our secret and a peer public key.
///
/// All-zero outputs (low-order peer points) are rejected so a malicious
/// header key cannot collapse the key schedule.
pub fn dh(secret: &[u8; KEY_LEN], public: &[u8; DH_PUB_LEN]) -> Result<[u8; KEY_LEN]> {
    let s = StaticSecret::from(*secret);
    let shared = s.diffie_hellman(&PublicKey::from(*public));
    if !shared.was_contributory() {
        return Err(CryptoError::DhFailure);
    }
    Ok(shared.to_bytes())
}
