//! HKDF-SHA256 key derivation.
//!
//! Every derived key role gets its own info string; the four constants
//! below are wire-level protocol constants and must not change, or the
//! two ends of a channel stop agreeing on the key schedule.

use hkdf::Hkdf;
use sha2::Sha256;

use crate::{error::CryptoError, Result};

/// Root-key derivation (DH output mixed into the root).
pub const RK_INFO: &[u8] = b"FutonRatchetRK";
/// Chain-key derivation (per-message symmetric ratchet).
pub const CK_INFO: &[u8] = b"FutonRatchetCK";
/// Session-master-key derivation (exported to the data channel).
pub const SMK_INFO: &[u8] = b"FutonSessionMK";
/// Stream-key derivation (per-generation bulk data key).
pub const STREAM_KEY_INFO: &[u8] = b"FutonStreamKey";

/// Fill `out` with HKDF-SHA256 output for the given salt/ikm/info.
pub fn hkdf_sha256(salt: &[u8], ikm: &[u8], info: &[u8], out: &mut [u8]) -> Result<()> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    hk.expand(info, out)
        .map_err(|_| CryptoError::InvalidArg("hkdf output length"))
}
