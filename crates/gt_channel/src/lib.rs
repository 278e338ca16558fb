//! gt_channel - Gantry Secure IPC dual-channel coordinator
//!
//! Binds the two halves of `gt_crypto` into the object the daemon and
//! client actually hold: a Double Ratchet control channel and a chunked
//! stream cipher for bulk data, re-keyed in lock-step. One mutex
//! serializes every operation, so a single [`DualChannel`] can be shared
//! across threads.
//!
//! The initial 32-byte shared secret, and the transport that moves wire
//! bytes (and session-key snapshots for the peer's data channel), are
//! the session manager's business; this crate only turns plaintext into
//! frames and back.

pub mod channel;

pub use channel::{ChannelStats, DualChannel};
pub use gt_crypto::CryptoError;
