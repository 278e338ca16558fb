use thiserror::Error;

/// Every failure the core can surface. Errors carry numeric codes and
/// byte counts only; key material never appears in messages.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    /// Input size or state precondition violated. Caller can correct.
    #[error("invalid argument: {0}")]
    InvalidArg(&'static str),

    /// Operation attempted before initialization or before a required
    /// chain exists.
    #[error("not ready: {0}")]
    NotReady(&'static str),

    /// Curve operation produced no usable result. Protocol failure;
    /// callers should tear down the channel.
    #[error("Diffie-Hellman derivation failed")]
    DhFailure,

    /// Wire framing could not be parsed.
    #[error("malformed message: {0}")]
    MalformedMessage(&'static str),

    /// AEAD tag verification failed. No plaintext is returned.
    #[error("authentication failed")]
    AuthFailed,

    /// Duplicate (sender key, message number) pair.
    #[error("replayed message {message_num}")]
    Replay { message_num: u32 },

    /// Stream chunk names a key generation no longer retained.
    #[error("unknown stream key generation {0}")]
    UnknownGeneration(u64),
}
