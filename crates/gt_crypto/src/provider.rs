//! Capability set the engines are parameterized over.
//!
//! The ratchet and stream cipher never call a crypto crate directly;
//! they go through this trait. Production code uses [`StdProvider`],
//! tests substitute providers with fixed clocks or canned randomness.

use std::time::Instant;

use rand::rngs::OsRng;
use rand::RngCore;

use crate::dh::{self, DhKeyPair};
use crate::{aead, kdf, Result, DH_PUB_LEN, KEY_LEN, NONCE_LEN};

pub trait CryptoProvider: Send {
    /// Generate a fresh DH ratchet key pair.
    fn generate_keypair(&self) -> Result<DhKeyPair>;

    /// Derive the shared secret between our secret and a peer public key.
    fn dh(&self, secret: &[u8; KEY_LEN], public: &[u8; DH_PUB_LEN]) -> Result<[u8; KEY_LEN]>;

    /// HKDF-SHA256 into `out`.
    fn hkdf(&self, salt: &[u8], ikm: &[u8], info: &[u8], out: &mut [u8]) -> Result<()>;

    /// AEAD-encrypt with a fresh nonce; returns `nonce || ct || tag`.
    fn aead_seal(&self, key: &[u8; KEY_LEN], plaintext: &[u8], ad: &[u8]) -> Result<Vec<u8>>;

    /// Verify and decrypt a `nonce || ct || tag` frame.
    fn aead_open(&self, key: &[u8; KEY_LEN], frame: &[u8], ad: &[u8]) -> Result<Vec<u8>>;

    /// Fill `out` with cryptographically strong random bytes.
    fn random_bytes(&self, out: &mut [u8]) -> Result<()>;

    /// Monotonic instant source for rotation timing.
    fn now(&self) -> Instant;
}

/// Default provider: x25519-dalek, HKDF-SHA256, AES-256-GCM, the OS RNG
/// and the OS monotonic clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdProvider;

impl CryptoProvider for StdProvider {
    fn generate_keypair(&self) -> Result<DhKeyPair> {
        Ok(DhKeyPair::generate())
    }

    fn dh(&self, secret: &[u8; KEY_LEN], public: &[u8; DH_PUB_LEN]) -> Result<[u8; KEY_LEN]> {
        dh::dh(secret, public)
    }

    fn hkdf(&self, salt: &[u8], ikm: &[u8], info: &[u8], out: &mut [u8]) -> Result<()> {
        kdf::hkdf_sha256(salt, ikm, info, out)
    }

    fn aead_seal(&self, key: &[u8; KEY_LEN], plaintext: &[u8], ad: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        self.random_bytes(&mut nonce)?;
        aead::seal(key, &nonce, plaintext, ad)
    }

    fn aead_open(&self, key: &[u8; KEY_LEN], frame: &[u8], ad: &[u8]) -> Result<Vec<u8>> {
        aead::open(key, frame, ad)
    }

    fn random_bytes(&self, out: &mut [u8]) -> Result<()> {
        OsRng.fill_bytes(out);
        Ok(())
    }

    fn now(&self) -> Instant {
        Instant::now()
    }
}
