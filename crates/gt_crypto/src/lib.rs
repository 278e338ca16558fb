//! gt_crypto - Gantry Secure IPC cryptographic core
//!
//! Secures traffic between a local client and the automation daemon over
//! an untrusted IPC transport. Two channels share one key schedule:
//!
//! - *control*: a full Double Ratchet (DH ratchet + chain-key ratchet)
//!   carrying small ordered messages with replay protection
//! - *data*: a chunked AES-256-GCM stream cipher whose per-generation
//!   keys are derived from the ratchet's session master key
//!
//! # Design principles
//! - No custom crypto; all primitives come from audited crates.
//! - Secret material is zeroized the moment it leaves its role.
//! - All failures are typed values; nothing panics on adversarial input.
//!
//! # Module layout
//! - `dh`       - X25519 key pairs and shared-secret derivation
//! - `kdf`      - HKDF-SHA256 with domain-separated info strings
//! - `aead`     - AES-256-GCM seal/open helpers
//! - `provider` - capability set over the primitives, swappable in tests
//! - `ratchet`  - Double Ratchet engine, header codec, wire envelope
//! - `stream`   - generation-keyed chunked stream cipher
//! - `error`    - unified error type

pub mod aead;
pub mod dh;
pub mod error;
pub mod kdf;
pub mod provider;
pub mod ratchet;
pub mod stream;

pub use error::CryptoError;

/// Symmetric and private key length in bytes.
pub const KEY_LEN: usize = 32;
/// AES-GCM nonce length in bytes.
pub const NONCE_LEN: usize = 12;
/// AES-GCM authentication tag length in bytes.
pub const TAG_LEN: usize = 16;
/// X25519 public key length in bytes.
pub const DH_PUB_LEN: usize = 32;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CryptoError>;
