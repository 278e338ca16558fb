//! Dual-channel coordinator.
//!
//! Owns one Double Ratchet (control) and one stream cipher (data) and
//! keeps the data channel's key generation synchronized with the
//! ratchet's. After every control-channel operation the ratchet may have
//! advanced a generation, so the coordinator re-reads it and re-keys the
//! stream cipher when it lags. Before bulk encryption the stream
//! cipher's rotation budget is consulted; exceeding it forces a ratchet
//! step, which the next sync turns into a fresh stream key.

use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;
use zeroize::Zeroize;

use gt_crypto::dh::DhKeyPair;
use gt_crypto::error::CryptoError;
use gt_crypto::provider::{CryptoProvider, StdProvider};
use gt_crypto::ratchet::{DoubleRatchet, EncryptedMessage, RatchetStats};
use gt_crypto::stream::{RotationCallback, StreamCipher, StreamConfig, StreamStats};
use gt_crypto::{Result, DH_PUB_LEN, KEY_LEN};

/// Combined statistics for both channels.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ChannelStats {
    pub control: RatchetStats,
    pub data: StreamStats,
}

struct Inner<P: CryptoProvider> {
    provider: P,
    control: Option<DoubleRatchet<P>>,
    data: StreamCipher<P>,
}

/// Thread-safe coordinator for one encrypted IPC session. All public
/// operations run under a single internal lock.
pub struct DualChannel<P: CryptoProvider + Clone = StdProvider> {
    inner: Mutex<Inner<P>>,
}

impl DualChannel {
    pub fn new() -> Self {
        Self::with_config(StreamConfig::default())
    }

    pub fn with_config(config: StreamConfig) -> Self {
        Self::with_provider(StdProvider, config)
    }
}

impl Default for DualChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: CryptoProvider + Clone> DualChannel<P> {
    pub fn with_provider(provider: P, config: StreamConfig) -> Self {
        let data = StreamCipher::with_provider(provider.clone(), config);
        Self {
            inner: Mutex::new(Inner {
                provider,
                control: None,
                data,
            }),
        }
    }

    /// Initialize as the side that knows the peer's ratchet public key.
    /// The data channel is keyed immediately (generation 1).
    pub fn init_initiator(
        &self,
        shared_secret: &[u8],
        responder_public: [u8; DH_PUB_LEN],
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let ratchet = DoubleRatchet::init_initiator_with(
            inner.provider.clone(),
            shared_secret,
            responder_public,
        )?;
        inner.control = Some(ratchet);
        sync_data_channel_key(&mut inner)?;
        info!("dual channel initialized as initiator");
        Ok(())
    }

    /// Initialize as the side that contributed its own key pair to the
    /// out-of-band agreement. The data channel stays un-keyed until the
    /// first control message arrives and the ratchet produces its first
    /// session master key.
    pub fn init_responder(&self, shared_secret: &[u8], own_keypair: DhKeyPair) -> Result<()> {
        let mut inner = self.inner.lock();
        let ratchet =
            DoubleRatchet::init_responder_with(inner.provider.clone(), shared_secret, own_keypair)?;
        inner.control = Some(ratchet);
        sync_data_channel_key(&mut inner)?;
        info!("dual channel initialized as responder");
        Ok(())
    }

    /// Encrypt a control message, returning the full wire envelope.
    pub fn encrypt_control(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock();
        let message = inner
            .control
            .as_mut()
            .ok_or(CryptoError::NotReady("channel not initialized"))?
            .encrypt(plaintext)?;
        sync_data_channel_key(&mut inner)?;
        Ok(message.to_wire())
    }

    /// Parse and decrypt a control-message wire envelope.
    pub fn decrypt_control(&self, wire: &[u8]) -> Result<Vec<u8>> {
        let message = EncryptedMessage::from_wire(wire)?;
        let mut inner = self.inner.lock();
        let plaintext = inner
            .control
            .as_mut()
            .ok_or(CryptoError::NotReady("channel not initialized"))?
            .decrypt(&message)?;
        sync_data_channel_key(&mut inner)?;
        Ok(plaintext)
    }

    /// Encrypt bulk data. If the current stream key has outlived its
    /// budget, a ratchet step is forced first and the stream re-keys, so
    /// the returned chunks already carry the new generation.
    pub fn encrypt_data(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock();
        if inner.data.needs_rotation() {
            info!("data channel rotation budget exceeded, forcing ratchet step");
            inner
                .control
                .as_mut()
                .ok_or(CryptoError::NotReady("channel not initialized"))?
                .force_ratchet()?;
            sync_data_channel_key(&mut inner)?;
        }
        inner.data.encrypt(data)
    }

    /// Decrypt bulk data chunks.
    pub fn decrypt_data(&self, data: &[u8]) -> Result<Vec<u8>> {
        self.inner.lock().data.decrypt(data)
    }

    /// Force a key rotation on both channels right now.
    pub fn rotate_keys(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner
            .control
            .as_mut()
            .ok_or(CryptoError::NotReady("channel not initialized"))?
            .force_ratchet()?;
        sync_data_channel_key(&mut inner)
    }

    /// Whether the data channel's rotation budget is exhausted.
    pub fn data_channel_needs_rotation(&self) -> bool {
        self.inner.lock().data.needs_rotation()
    }

    /// Our current DH ratchet public key, for the session manager to
    /// hand to the peer.
    pub fn public_key(&self) -> Result<[u8; DH_PUB_LEN]> {
        self.inner
            .lock()
            .control
            .as_ref()
            .map(|c| c.public_key())
            .ok_or(CryptoError::NotReady("channel not initialized"))
    }

    /// Snapshot of the control channel's session master key and its
    /// generation, taken under the lock. The session manager transports
    /// this to the peer's data channel; it goes stale at the next
    /// rotation and must not be cached across one.
    pub fn session_key_snapshot(&self) -> Result<([u8; KEY_LEN], u64)> {
        let inner = self.inner.lock();
        let control = inner
            .control
            .as_ref()
            .ok_or(CryptoError::NotReady("channel not initialized"))?;
        Ok((control.session_master_key(), control.generation()))
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.lock().control.is_some()
    }

    /// Register a callback invoked with the new generation whenever the
    /// data channel re-keys.
    pub fn set_rotation_callback(&self, callback: RotationCallback) {
        self.inner.lock().data.set_rotation_callback(callback);
    }

    pub fn stats(&self) -> ChannelStats {
        let inner = self.inner.lock();
        ChannelStats {
            control: inner
                .control
                .as_ref()
                .map(|c| c.stats())
                .unwrap_or_default(),
            data: inner.data.stats(),
        }
    }
}

/// Re-key the data channel if the ratchet has moved past it. Never
/// downgrades, and does nothing while the ratchet is still at
/// generation 0 (a responder that has not received yet).
fn sync_data_channel_key<P: CryptoProvider>(inner: &mut Inner<P>) -> Result<()> {
    let Some(control) = inner.control.as_ref() else {
        return Ok(());
    };
    let generation = control.generation();
    if generation == 0 || inner.data.generation() >= generation {
        return Ok(());
    }

    let mut master = control.session_master_key();
    let result = if inner.data.generation() == 0 {
        inner.data.init(&master, generation)
    } else {
        inner.data.update_key(&master, generation)
    };
    master.zeroize();
    result
}
