//! Generation-keyed chunked stream cipher for the bulk data channel.
//!
//! Bulk payloads are split into chunks, each sealed under the current
//! stream key with its 20-byte header as associated data. Keys are
//! derived per generation from the ratchet's session master key; the
//! previous generation is kept alive so chunks that were in flight when
//! a rotation landed still decrypt. A byte and time budget decides when
//! the owner should force the next rotation.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use zeroize::Zeroize;

use crate::error::CryptoError;
use crate::kdf::STREAM_KEY_INFO;
use crate::provider::{CryptoProvider, StdProvider};
use crate::{Result, KEY_LEN, NONCE_LEN, TAG_LEN};

/// Serialized chunk header length.
pub const CHUNK_HEADER_LEN: usize = 20;

// ── Chunk header ─────────────────────────────────────────────────────────────

/// Precedes every encrypted chunk on the wire and doubles as the chunk's
/// AEAD associated data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Key generation the chunk was sealed under.
    pub key_generation: u64,
    /// Running index within the sending stream; resets on rotation.
    pub chunk_index: u32,
    /// Plaintext byte count.
    pub chunk_size: u32,
    /// Reserved for future versioning; must be zero.
    pub flags: u32,
}

impl ChunkHeader {
    /// Fixed 20-byte little-endian wire form.
    pub fn to_bytes(&self) -> [u8; CHUNK_HEADER_LEN] {
        let mut out = [0u8; CHUNK_HEADER_LEN];
        out[..8].copy_from_slice(&self.key_generation.to_le_bytes());
        out[8..12].copy_from_slice(&self.chunk_index.to_le_bytes());
        out[12..16].copy_from_slice(&self.chunk_size.to_le_bytes());
        out[16..20].copy_from_slice(&self.flags.to_le_bytes());
        out
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < CHUNK_HEADER_LEN {
            return Err(CryptoError::MalformedMessage("short chunk header"));
        }
        let header = Self {
            key_generation: u64::from_le_bytes(
                data[..8]
                    .try_into()
                    .map_err(|_| CryptoError::MalformedMessage("short chunk header"))?,
            ),
            chunk_index: u32::from_le_bytes(
                data[8..12]
                    .try_into()
                    .map_err(|_| CryptoError::MalformedMessage("short chunk header"))?,
            ),
            chunk_size: u32::from_le_bytes(
                data[12..16]
                    .try_into()
                    .map_err(|_| CryptoError::MalformedMessage("short chunk header"))?,
            ),
            flags: u32::from_le_bytes(
                data[16..20]
                    .try_into()
                    .map_err(|_| CryptoError::MalformedMessage("short chunk header"))?,
            ),
        };
        if header.flags != 0 {
            return Err(CryptoError::MalformedMessage("unknown chunk flags"));
        }
        Ok(header)
    }
}

// ── Configuration ────────────────────────────────────────────────────────────

/// Rotation thresholds and chunking. The thresholds are advisory: they
/// make [`StreamCipher::needs_rotation`] answer true, the owner decides
/// when to act on it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Rotate after this many plaintext bytes under one key.
    pub rotation_bytes: u64,
    /// Rotate after this long under one key.
    pub rotation_interval: Duration,
    /// Maximum plaintext bytes per chunk.
    pub chunk_size: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            rotation_bytes: 10 * 1024 * 1024,
            rotation_interval: Duration::from_secs(300),
            chunk_size: 64 * 1024,
        }
    }
}

// ── Stream key ───────────────────────────────────────────────────────────────

/// One generation's key with its rotation bookkeeping. Wiped on drop.
struct StreamKey {
    key: [u8; KEY_LEN],
    generation: u64,
    created_at: Instant,
    bytes_encrypted: u64,
}

impl Drop for StreamKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

// ── Cipher ───────────────────────────────────────────────────────────────────

/// Data-channel statistics snapshot.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StreamStats {
    pub total_bytes_encrypted: u64,
    pub total_bytes_decrypted: u64,
    pub key_rotations: u64,
    pub current_generation: u64,
}

/// Invoked with the new generation whenever the stream re-keys.
pub type RotationCallback = Box<dyn Fn(u64) + Send>;

/// High-throughput chunked AEAD for the data channel. Holds at most two
/// key generations: *current* for sending and receiving, *previous*
/// only to drain chunks that were in flight across the last rotation.
pub struct StreamCipher<P: CryptoProvider = StdProvider> {
    provider: P,
    config: StreamConfig,
    current: Option<StreamKey>,
    previous: Option<StreamKey>,
    send_chunk_index: u32,
    total_encrypted: u64,
    total_decrypted: u64,
    rotations: u64,
    rotation_callback: Option<RotationCallback>,
}

impl StreamCipher {
    pub fn new(config: StreamConfig) -> Self {
        Self::with_provider(StdProvider, config)
    }
}

impl<P: CryptoProvider> StreamCipher<P> {
    pub fn with_provider(provider: P, config: StreamConfig) -> Self {
        Self {
            provider,
            config,
            current: None,
            previous: None,
            send_chunk_index: 0,
            total_encrypted: 0,
            total_decrypted: 0,
            rotations: 0,
            rotation_callback: None,
        }
    }

    fn derive_stream_key(&self, master: &[u8; KEY_LEN], generation: u64) -> Result<[u8; KEY_LEN]> {
        let salt = generation.to_le_bytes();
        let mut key = [0u8; KEY_LEN];
        self.provider.hkdf(&salt, master, STREAM_KEY_INFO, &mut key)?;
        Ok(key)
    }

    /// Install the first key. Does not count as a rotation.
    pub fn init(&mut self, master: &[u8; KEY_LEN], generation: u64) -> Result<()> {
        let key = self.derive_stream_key(master, generation)?;
        self.current = Some(StreamKey {
            key,
            generation,
            created_at: self.provider.now(),
            bytes_encrypted: 0,
        });
        self.send_chunk_index = 0;
        info!(generation, "stream cipher initialized");
        Ok(())
    }

    /// Install a new generation. The current key becomes the previous
    /// one (the displaced previous key is wiped), the send chunk index
    /// resets, and the rotation callback fires.
    pub fn update_key(&mut self, master: &[u8; KEY_LEN], generation: u64) -> Result<()> {
        let key = self.derive_stream_key(master, generation)?;
        if let Some(displaced) = self.current.take() {
            self.previous = Some(displaced);
        }
        self.current = Some(StreamKey {
            key,
            generation,
            created_at: self.provider.now(),
            bytes_encrypted: 0,
        });
        self.send_chunk_index = 0;
        self.rotations += 1;

        if let Some(callback) = &self.rotation_callback {
            callback(generation);
        }

        info!(generation, "stream key rotated");
        Ok(())
    }

    /// Encrypt a payload as a sequence of chunks, each at most
    /// `chunk_size` bytes. Empty payloads produce empty wire output.
    pub fn encrypt(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        if self.config.chunk_size == 0 {
            return Err(CryptoError::InvalidArg("zero chunk size"));
        }
        let current = self
            .current
            .as_mut()
            .ok_or(CryptoError::NotReady("stream cipher has no key"))?;

        let mut out =
            Vec::with_capacity(data.len() + CHUNK_HEADER_LEN + NONCE_LEN + TAG_LEN);
        for chunk in data.chunks(self.config.chunk_size) {
            let header = ChunkHeader {
                key_generation: current.generation,
                chunk_index: self.send_chunk_index,
                chunk_size: chunk.len() as u32,
                flags: 0,
            };
            let header_bytes = header.to_bytes();
            let frame = self.provider.aead_seal(&current.key, chunk, &header_bytes)?;

            out.extend_from_slice(&header_bytes);
            out.extend_from_slice(&frame);

            self.send_chunk_index = self.send_chunk_index.wrapping_add(1);
            current.bytes_encrypted += chunk.len() as u64;
            self.total_encrypted += chunk.len() as u64;
        }
        Ok(out)
    }

    /// Decrypt a sequence of chunks. Any chunk failure aborts the whole
    /// batch; no partial plaintext is returned.
    pub fn decrypt(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        if self.current.is_none() {
            return Err(CryptoError::NotReady("stream cipher has no key"));
        }

        let mut out = Vec::new();
        let mut offset = 0usize;
        while offset < data.len() {
            let header = ChunkHeader::parse(&data[offset..])?;
            offset += CHUNK_HEADER_LEN;

            let frame_len = (header.chunk_size as usize)
                .checked_add(NONCE_LEN + TAG_LEN)
                .ok_or(CryptoError::MalformedMessage("oversized chunk"))?;
            if data.len() - offset < frame_len {
                return Err(CryptoError::MalformedMessage("truncated chunk"));
            }
            let frame = &data[offset..offset + frame_len];

            let key = self.key_for_generation(header.key_generation)?;
            let plaintext = self.provider.aead_open(key, frame, &header.to_bytes())?;
            out.extend_from_slice(&plaintext);
            offset += frame_len;
        }

        self.total_decrypted += out.len() as u64;
        Ok(out)
    }

    fn key_for_generation(&self, generation: u64) -> Result<&[u8; KEY_LEN]> {
        if let Some(current) = &self.current {
            if current.generation == generation {
                return Ok(&current.key);
            }
        }
        if let Some(previous) = &self.previous {
            if previous.generation == generation {
                return Ok(&previous.key);
            }
        }
        warn!(generation, "no stream key retained for generation");
        Err(CryptoError::UnknownGeneration(generation))
    }

    /// Whether the current key has outlived its byte or time budget.
    pub fn needs_rotation(&self) -> bool {
        match &self.current {
            None => false,
            Some(key) => {
                key.bytes_encrypted >= self.config.rotation_bytes
                    || self
                        .provider
                        .now()
                        .saturating_duration_since(key.created_at)
                        >= self.config.rotation_interval
            }
        }
    }

    /// Current key generation, 0 while uninitialized.
    pub fn generation(&self) -> u64 {
        self.current.as_ref().map_or(0, |k| k.generation)
    }

    /// Plaintext bytes sealed under the current key.
    pub fn bytes_encrypted(&self) -> u64 {
        self.current.as_ref().map_or(0, |k| k.bytes_encrypted)
    }

    pub fn set_rotation_callback(&mut self, callback: RotationCallback) {
        self.rotation_callback = Some(callback);
    }

    pub fn stats(&self) -> StreamStats {
        StreamStats {
            total_bytes_encrypted: self.total_encrypted,
            total_bytes_decrypted: self.total_decrypted,
            key_rotations: self.rotations,
            current_generation: self.generation(),
        }
    }
}
