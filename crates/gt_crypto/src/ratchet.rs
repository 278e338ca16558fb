//! Double Ratchet control channel.
//!
//! State separation:
//!   RK  - root key, updated on every DH ratchet step
//!   CKs - sending chain key, advances once per sent message
//!   CKr - receiving chain key, advances once per received message
//!   MK  - message key, derived from a chain key, used once, then wiped
//!   SMK - session master key, exported to the bulk data channel and
//!         re-derived (with a generation bump) whenever a new sending
//!         chain appears
//!
//! Each party generates a new X25519 ratchet key pair per turn; the DH
//! output is mixed into the root key via HKDF, producing a new root key
//! and a new chain key. Old chain keys and message keys are deleted, so
//! compromise of the current state exposes neither past traffic nor,
//! after the next turn, future traffic.
//!
//! Message keys for out-of-order delivery are cached in a bounded FIFO;
//! a per-sender-key replay set rejects duplicates. Decryption stages all
//! state transitions on a copy of the record and commits only after the
//! AEAD tag verifies, so adversarial traffic cannot desynchronize the
//! receive chain.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::Serialize;
use tracing::{debug, info, warn};
use zeroize::Zeroize;

use crate::dh::DhKeyPair;
use crate::error::CryptoError;
use crate::kdf::{CK_INFO, RK_INFO, SMK_INFO};
use crate::provider::{CryptoProvider, StdProvider};
use crate::{Result, DH_PUB_LEN, KEY_LEN};

/// Maximum number of message keys cached for out-of-order delivery.
/// Bounds both memory use and the per-decrypt work an attacker can
/// force with a huge counter jump.
pub const MAX_SKIP: usize = 1000;

/// Serialized message header length: DH public key + two u32 counters.
pub const HEADER_LEN: usize = DH_PUB_LEN + 8;

// ── Message header ───────────────────────────────────────────────────────────

/// Sent in the clear with every control message so the recipient can
/// advance its ratchet. Authenticated as AEAD associated data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Sender's current DH ratchet public key.
    pub dh_public: [u8; DH_PUB_LEN],
    /// Number of messages in the sender's previous sending chain.
    pub prev_chain_len: u32,
    /// Message number within the current sending chain.
    pub message_num: u32,
}

impl MessageHeader {
    /// Fixed 40-byte little-endian wire form.
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..DH_PUB_LEN].copy_from_slice(&self.dh_public);
        out[DH_PUB_LEN..DH_PUB_LEN + 4].copy_from_slice(&self.prev_chain_len.to_le_bytes());
        out[DH_PUB_LEN + 4..].copy_from_slice(&self.message_num.to_le_bytes());
        out
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(CryptoError::MalformedMessage("short header"));
        }
        let mut dh_public = [0u8; DH_PUB_LEN];
        dh_public.copy_from_slice(&data[..DH_PUB_LEN]);
        let prev_chain_len = u32::from_le_bytes(
            data[DH_PUB_LEN..DH_PUB_LEN + 4]
                .try_into()
                .map_err(|_| CryptoError::MalformedMessage("short header"))?,
        );
        let message_num = u32::from_le_bytes(
            data[DH_PUB_LEN + 4..HEADER_LEN]
                .try_into()
                .map_err(|_| CryptoError::MalformedMessage("short header"))?,
        );
        Ok(Self {
            dh_public,
            prev_chain_len,
            message_num,
        })
    }
}

// ── Wire envelope ────────────────────────────────────────────────────────────

/// An encrypted control message: public header plus AEAD frame.
///
/// Wire form: `u32 LE header_length || header || nonce || ct || tag`.
/// The header length is fixed at 40 for this protocol version; any other
/// value is rejected so future versions can repurpose the field.
#[derive(Debug, Clone)]
pub struct EncryptedMessage {
    pub header: MessageHeader,
    pub ciphertext: Vec<u8>,
}

impl EncryptedMessage {
    pub fn to_wire(&self) -> Vec<u8> {
        let header = self.header.to_bytes();
        let mut out = Vec::with_capacity(4 + HEADER_LEN + self.ciphertext.len());
        out.extend_from_slice(&(HEADER_LEN as u32).to_le_bytes());
        out.extend_from_slice(&header);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    pub fn from_wire(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(CryptoError::MalformedMessage("short envelope"));
        }
        let header_len = u32::from_le_bytes(
            data[..4]
                .try_into()
                .map_err(|_| CryptoError::MalformedMessage("short envelope"))?,
        ) as usize;
        if header_len != HEADER_LEN {
            return Err(CryptoError::MalformedMessage("unsupported header length"));
        }
        if data.len() < 4 + HEADER_LEN {
            return Err(CryptoError::MalformedMessage("envelope shorter than header"));
        }
        let header = MessageHeader::parse(&data[4..4 + HEADER_LEN])?;
        Ok(Self {
            header,
            ciphertext: data[4 + HEADER_LEN..].to_vec(),
        })
    }
}

// ── Ratchet state ────────────────────────────────────────────────────────────

/// Message key cached for an out-of-order message. Wiped on removal.
#[derive(Clone)]
struct SkippedKey {
    dh_public: [u8; DH_PUB_LEN],
    message_num: u32,
    message_key: [u8; KEY_LEN],
}

impl Drop for SkippedKey {
    fn drop(&mut self) {
        self.message_key.zeroize();
    }
}

/// Everything mutable the ratchet owns. Cloneable so `decrypt` can stage
/// transitions and commit them atomically; both copies wipe on drop.
#[derive(Clone)]
struct RatchetState {
    dh_self: DhKeyPair,
    dh_remote: Option<[u8; DH_PUB_LEN]>,
    root_key: [u8; KEY_LEN],
    chain_key_send: Option<[u8; KEY_LEN]>,
    chain_key_recv: Option<[u8; KEY_LEN]>,
    send_count: u32,
    recv_count: u32,
    prev_send_count: u32,
    /// FIFO of cached message keys, oldest first, bounded by MAX_SKIP.
    skipped_keys: VecDeque<SkippedKey>,
    /// Replay filter: message numbers already accepted, per sender key.
    received_messages: HashMap<[u8; DH_PUB_LEN], HashSet<u32>>,
    session_master_key: [u8; KEY_LEN],
    session_generation: u64,
}

impl RatchetState {
    fn new(dh_self: DhKeyPair, dh_remote: Option<[u8; DH_PUB_LEN]>, root_key: [u8; KEY_LEN]) -> Self {
        Self {
            dh_self,
            dh_remote,
            root_key,
            chain_key_send: None,
            chain_key_recv: None,
            send_count: 0,
            recv_count: 0,
            prev_send_count: 0,
            skipped_keys: VecDeque::new(),
            received_messages: HashMap::new(),
            session_master_key: [0u8; KEY_LEN],
            session_generation: 0,
        }
    }
}

impl Drop for RatchetState {
    fn drop(&mut self) {
        self.root_key.zeroize();
        self.chain_key_send.zeroize();
        self.chain_key_recv.zeroize();
        self.session_master_key.zeroize();
        // dh_self and the skipped keys wipe themselves.
    }
}

// ── KDF steps ────────────────────────────────────────────────────────────────

/// KDF_RK: mix a DH output into the root key.
/// Returns (new_root_key, new_chain_key).
fn kdf_rk<P: CryptoProvider>(
    provider: &P,
    rk: &[u8; KEY_LEN],
    dh_out: &[u8],
) -> Result<([u8; KEY_LEN], [u8; KEY_LEN])> {
    let mut okm = [0u8; KEY_LEN * 2];
    provider.hkdf(rk, dh_out, RK_INFO, &mut okm)?;
    let mut new_rk = [0u8; KEY_LEN];
    let mut ck = [0u8; KEY_LEN];
    new_rk.copy_from_slice(&okm[..KEY_LEN]);
    ck.copy_from_slice(&okm[KEY_LEN..]);
    okm.zeroize();
    Ok((new_rk, ck))
}

/// KDF_CK: advance a chain key. Salt-only derivation, no DH input.
/// Returns (next_chain_key, message_key).
fn kdf_ck<P: CryptoProvider>(
    provider: &P,
    ck: &[u8; KEY_LEN],
) -> Result<([u8; KEY_LEN], [u8; KEY_LEN])> {
    let mut okm = [0u8; KEY_LEN * 2];
    provider.hkdf(ck, CK_INFO, &[], &mut okm)?;
    let mut next_ck = [0u8; KEY_LEN];
    let mut mk = [0u8; KEY_LEN];
    next_ck.copy_from_slice(&okm[..KEY_LEN]);
    mk.copy_from_slice(&okm[KEY_LEN..]);
    okm.zeroize();
    Ok((next_ck, mk))
}

/// Re-derive the session master key after a new sending chain appeared
/// and bump the session generation.
fn derive_session_master_key<P: CryptoProvider>(
    provider: &P,
    state: &mut RatchetState,
) -> Result<()> {
    let Some(ck) = state.chain_key_send.as_ref() else {
        return Ok(());
    };
    let mut smk = [0u8; KEY_LEN];
    provider.hkdf(&state.root_key, ck, SMK_INFO, &mut smk)?;
    state.session_master_key = smk;
    state.session_generation += 1;
    Ok(())
}

// ── Engine ───────────────────────────────────────────────────────────────────

/// Control-channel statistics snapshot.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RatchetStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub ratchet_steps: u64,
    pub skipped_keys: u64,
}

/// Double Ratchet engine. Exclusive `&mut` access serializes mutation;
/// wrap it behind a lock to share across threads.
pub struct DoubleRatchet<P: CryptoProvider = StdProvider> {
    provider: P,
    state: RatchetState,
    messages_sent: u64,
    messages_received: u64,
    ratchet_steps: u64,
}

impl DoubleRatchet {
    /// Initialize as the initiating side, which knows the responder's
    /// ratchet public key and can send immediately.
    pub fn init_initiator(shared_secret: &[u8], remote_public: [u8; DH_PUB_LEN]) -> Result<Self> {
        Self::init_initiator_with(StdProvider, shared_secret, remote_public)
    }

    /// Initialize as the responding side, which contributed `own_keypair`
    /// to the out-of-band agreement and must receive before sending.
    pub fn init_responder(shared_secret: &[u8], own_keypair: DhKeyPair) -> Result<Self> {
        Self::init_responder_with(StdProvider, shared_secret, own_keypair)
    }
}

impl<P: CryptoProvider> DoubleRatchet<P> {
    pub fn init_initiator_with(
        provider: P,
        shared_secret: &[u8],
        remote_public: [u8; DH_PUB_LEN],
    ) -> Result<Self> {
        let root_key = root_from_secret(shared_secret)?;
        let dh_self = provider.generate_keypair()?;

        let mut state = RatchetState::new(dh_self, Some(remote_public), root_key);

        let mut dh_out = provider.dh(state.dh_self.secret_bytes(), &remote_public)?;
        let (new_root, send_ck) = kdf_rk(&provider, &state.root_key, &dh_out)?;
        dh_out.zeroize();
        state.root_key = new_root;
        state.chain_key_send = Some(send_ck);

        derive_session_master_key(&provider, &mut state)?;

        info!(generation = state.session_generation, "ratchet initialized as initiator");
        Ok(Self {
            provider,
            state,
            messages_sent: 0,
            messages_received: 0,
            ratchet_steps: 1,
        })
    }

    pub fn init_responder_with(
        provider: P,
        shared_secret: &[u8],
        own_keypair: DhKeyPair,
    ) -> Result<Self> {
        let root_key = root_from_secret(shared_secret)?;
        let state = RatchetState::new(own_keypair, None, root_key);

        info!("ratchet initialized as responder");
        Ok(Self {
            provider,
            state,
            messages_sent: 0,
            messages_received: 0,
            ratchet_steps: 0,
        })
    }

    /// Encrypt a control message. Advances the sending chain by one.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<EncryptedMessage> {
        let ck = self
            .state
            .chain_key_send
            .as_ref()
            .ok_or(CryptoError::NotReady("no sending chain"))?;
        let (mut new_ck, mut mk) = kdf_ck(&self.provider, ck)?;

        let header = MessageHeader {
            dh_public: self.state.dh_self.public,
            prev_chain_len: self.state.prev_send_count,
            message_num: self.state.send_count,
        };
        let ad = header.to_bytes();
        let sealed = self.provider.aead_seal(&mk, plaintext, &ad);
        mk.zeroize();

        let ciphertext = match sealed {
            Ok(ct) => ct,
            Err(e) => {
                new_ck.zeroize();
                return Err(e);
            }
        };

        self.state.chain_key_send = Some(new_ck);
        self.state.send_count += 1;
        self.messages_sent += 1;

        Ok(EncryptedMessage { header, ciphertext })
    }

    /// Decrypt a control message.
    ///
    /// Handles, in order: replay rejection, the skipped-key cache, a DH
    /// ratchet step when the header carries a new sender key, intra-chain
    /// skips, and finally the in-order case. All transitions are staged
    /// and committed only once the AEAD tag verifies.
    pub fn decrypt(&mut self, message: &EncryptedMessage) -> Result<Vec<u8>> {
        let header = &message.header;

        if let Some(seen) = self.state.received_messages.get(&header.dh_public) {
            if seen.contains(&header.message_num) {
                warn!(message_num = header.message_num, "replayed control message rejected");
                return Err(CryptoError::Replay {
                    message_num: header.message_num,
                });
            }
        }

        let ad = header.to_bytes();

        // Out-of-order message whose key was cached earlier.
        if let Some(pos) = self
            .state
            .skipped_keys
            .iter()
            .position(|sk| sk.dh_public == header.dh_public && sk.message_num == header.message_num)
        {
            let plaintext = self.provider.aead_open(
                &self.state.skipped_keys[pos].message_key,
                &message.ciphertext,
                &ad,
            )?;
            // Committed: drop the entry (wiping its key) and record receipt.
            self.state.skipped_keys.remove(pos);
            self.state
                .received_messages
                .entry(header.dh_public)
                .or_default()
                .insert(header.message_num);
            self.messages_received += 1;
            return Ok(plaintext);
        }

        let mut staged = self.state.clone();
        let mut stepped = false;

        if staged.dh_remote != Some(header.dh_public) {
            // Cache the keys still owed from the outgoing chain epoch.
            if staged.chain_key_recv.is_some() && staged.dh_remote.is_some() {
                skip_message_keys(&self.provider, &mut staged, header.prev_chain_len)?;
            }
            dh_ratchet(&self.provider, &mut staged, header.dh_public)?;
            // Sets for retired sender keys can no longer match live
            // traffic; keep only the newly active key's set.
            staged
                .received_messages
                .retain(|key, _| *key == header.dh_public);
            stepped = true;
        }

        skip_message_keys(&self.provider, &mut staged, header.message_num)?;

        let Some(ck) = staged.chain_key_recv.as_ref() else {
            return Err(CryptoError::NotReady("no receiving chain"));
        };
        let (mut new_ck, mut mk) = kdf_ck(&self.provider, ck)?;
        let opened = self.provider.aead_open(&mk, &message.ciphertext, &ad);
        mk.zeroize();

        let plaintext = match opened {
            Ok(pt) => pt,
            Err(e) => {
                new_ck.zeroize();
                // `staged` drops here, wiping every derived secret.
                return Err(e);
            }
        };

        staged.chain_key_recv = Some(new_ck);
        staged.recv_count += 1;
        staged
            .received_messages
            .entry(header.dh_public)
            .or_default()
            .insert(header.message_num);

        self.state = staged;
        if stepped {
            self.ratchet_steps += 1;
        }
        self.messages_received += 1;

        Ok(plaintext)
    }

    /// Rotate the sending side without waiting for the peer: new ratchet
    /// key pair, new sending chain, new session master key.
    pub fn force_ratchet(&mut self) -> Result<()> {
        let remote = self
            .state
            .dh_remote
            .ok_or(CryptoError::NotReady("no remote ratchet key"))?;

        let new_pair = self.provider.generate_keypair()?;
        let mut dh_out = self.provider.dh(new_pair.secret_bytes(), &remote)?;
        let (new_root, send_ck) = kdf_rk(&self.provider, &self.state.root_key, &dh_out)?;
        dh_out.zeroize();

        self.state.dh_self = new_pair;
        self.state.root_key = new_root;
        self.state.chain_key_send = Some(send_ck);
        self.state.prev_send_count = self.state.send_count;
        self.state.send_count = 0;

        derive_session_master_key(&self.provider, &mut self.state)?;
        self.ratchet_steps += 1;

        info!(generation = self.state.session_generation, "forced ratchet step");
        Ok(())
    }

    /// Snapshot of the current session master key for the data channel.
    /// Stale after the next ratchet step; callers must not cache it
    /// across a known rotation.
    pub fn session_master_key(&self) -> [u8; KEY_LEN] {
        self.state.session_master_key
    }

    /// Monotonic generation counter; increments with every session
    /// master key derivation.
    pub fn generation(&self) -> u64 {
        self.state.session_generation
    }

    /// Our current DH ratchet public key.
    pub fn public_key(&self) -> [u8; DH_PUB_LEN] {
        self.state.dh_self.public
    }

    pub fn stats(&self) -> RatchetStats {
        RatchetStats {
            messages_sent: self.messages_sent,
            messages_received: self.messages_received,
            ratchet_steps: self.ratchet_steps,
            skipped_keys: self.state.skipped_keys.len() as u64,
        }
    }
}

fn root_from_secret(shared_secret: &[u8]) -> Result<[u8; KEY_LEN]> {
    if shared_secret.len() < KEY_LEN {
        return Err(CryptoError::InvalidArg("shared secret too short"));
    }
    let mut root = [0u8; KEY_LEN];
    root.copy_from_slice(&shared_secret[..KEY_LEN]);
    Ok(root)
}

/// One full DH ratchet turn: derive the receiving chain from the peer's
/// new key, generate our next key pair, derive the sending chain, then
/// re-derive the session master key.
fn dh_ratchet<P: CryptoProvider>(
    provider: &P,
    state: &mut RatchetState,
    remote_public: [u8; DH_PUB_LEN],
) -> Result<()> {
    state.prev_send_count = state.send_count;
    state.send_count = 0;
    state.recv_count = 0;
    state.dh_remote = Some(remote_public);

    let mut dh_out = provider.dh(state.dh_self.secret_bytes(), &remote_public)?;
    let (new_root, recv_ck) = kdf_rk(provider, &state.root_key, &dh_out)?;
    dh_out.zeroize();
    state.root_key = new_root;
    state.chain_key_recv = Some(recv_ck);

    state.dh_self = provider.generate_keypair()?;

    let mut dh_out = provider.dh(state.dh_self.secret_bytes(), &remote_public)?;
    let (new_root, send_ck) = kdf_rk(provider, &state.root_key, &dh_out)?;
    dh_out.zeroize();
    state.root_key = new_root;
    state.chain_key_send = Some(send_ck);

    derive_session_master_key(provider, state)?;

    debug!(
        generation = state.session_generation,
        peer = %hex::encode(&remote_public[..4]),
        "DH ratchet step"
    );
    Ok(())
}

/// Advance the receiving chain up to (not including) `until`, caching
/// each produced message key. Jumps beyond the skip window are ignored;
/// the decrypt that follows then fails authentication and is rejected.
fn skip_message_keys<P: CryptoProvider>(
    provider: &P,
    state: &mut RatchetState,
    until: u32,
) -> Result<()> {
    let Some(dh_remote) = state.dh_remote else {
        return Ok(());
    };
    if state.chain_key_recv.is_none() {
        return Ok(());
    }
    if state.recv_count.saturating_add(MAX_SKIP as u32) < until {
        warn!(
            pending = until - state.recv_count,
            "skip window exceeded, message will be rejected"
        );
        return Ok(());
    }

    while state.recv_count < until {
        let (next_ck, mk) = match state.chain_key_recv.as_ref() {
            Some(ck) => kdf_ck(provider, ck)?,
            None => return Ok(()),
        };
        state.chain_key_recv = Some(next_ck);
        state.skipped_keys.push_back(SkippedKey {
            dh_public: dh_remote,
            message_num: state.recv_count,
            message_key: mk,
        });
        state.recv_count += 1;

        if state.skipped_keys.len() > MAX_SKIP {
            // Oldest first; the entry wipes its key as it drops.
            state.skipped_keys.pop_front();
        }
    }
    Ok(())
}
