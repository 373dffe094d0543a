//! Per-peer-device ratchet state.
//!
//! A state always has exactly one sender chain. Receiver chains are kept in
//! arrival order and bounded; dropping a chain also drops the message keys
//! cached for it.

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::curve::{KeyPair, PrivateKey, PublicKey};
use crate::error::SessionFault;
use crate::identity::IdentityKey;
use crate::ratchet::{ChainKey, MessageKeys, RootKey};
use crate::skipped::SkippedKeyCache;

#[derive(Clone, Serialize, Deserialize)]
struct SenderChain {
    ratchet_key_pair: KeyPair,
    chain_key: ChainKey,
}

#[derive(Clone, Serialize, Deserialize)]
struct ReceiverChain {
    ratchet_key: PublicKey,
    chain_key: ChainKey,
}

/// Bundle identifiers echoed in every outgoing message until the peer
/// answers, so the peer can build its side of the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingPreKey {
    pub pre_key_id: Option<u32>,
    pub signed_pre_key_id: u32,
    pub base_key: PublicKey,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct SessionState {
    version: u8,
    local_identity: IdentityKey,
    remote_identity: IdentityKey,
    root_key: RootKey,
    previous_counter: u32,
    sender_chain: SenderChain,
    receiver_chains: VecDeque<ReceiverChain>,
    skipped_keys: SkippedKeyCache,
    pending_pre_key: Option<PendingPreKey>,
    local_registration_id: u32,
    remote_registration_id: u32,
    alice_base_key: PublicKey,
}

impl SessionState {
    pub fn new(
        version: u8,
        local_identity: IdentityKey,
        remote_identity: IdentityKey,
        root_key: RootKey,
        alice_base_key: PublicKey,
        sender_ratchet_key_pair: KeyPair,
        sender_chain_key: ChainKey,
    ) -> Self {
        Self {
            version,
            local_identity,
            remote_identity,
            root_key,
            previous_counter: 0,
            sender_chain: SenderChain {
                ratchet_key_pair: sender_ratchet_key_pair,
                chain_key: sender_chain_key,
            },
            receiver_chains: VecDeque::new(),
            skipped_keys: SkippedKeyCache::new(),
            pending_pre_key: None,
            local_registration_id: 0,
            remote_registration_id: 0,
            alice_base_key,
        }
    }

    /// Seed a freshly initialised state with its first receiver chain.
    pub fn with_receiver_chain(mut self, ratchet_key: PublicKey, chain_key: ChainKey) -> Self {
        self.receiver_chains.push_back(ReceiverChain {
            ratchet_key,
            chain_key,
        });
        self
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn local_identity_key(&self) -> &IdentityKey {
        &self.local_identity
    }

    pub fn remote_identity_key(&self) -> &IdentityKey {
        &self.remote_identity
    }

    pub fn alice_base_key(&self) -> &PublicKey {
        &self.alice_base_key
    }

    pub fn root_key(&self) -> &RootKey {
        &self.root_key
    }

    pub fn set_root_key(&mut self, root_key: RootKey) {
        self.root_key = root_key;
    }

    pub fn previous_counter(&self) -> u32 {
        self.previous_counter
    }

    pub fn set_previous_counter(&mut self, counter: u32) {
        self.previous_counter = counter;
    }

    // ── Sender chain ────────────────────────────────────────────────────

    pub fn sender_ratchet_key(&self) -> &PublicKey {
        &self.sender_chain.ratchet_key_pair.public_key
    }

    pub fn sender_ratchet_private_key(&self) -> &PrivateKey {
        &self.sender_chain.ratchet_key_pair.private_key
    }

    pub fn sender_chain_key(&self) -> &ChainKey {
        &self.sender_chain.chain_key
    }

    /// Replace the sender chain after a DH ratchet step.
    pub fn set_sender_chain(&mut self, ratchet_key_pair: KeyPair, chain_key: ChainKey) {
        self.sender_chain = SenderChain {
            ratchet_key_pair,
            chain_key,
        };
    }

    pub fn set_sender_chain_key(&mut self, chain_key: ChainKey) {
        self.sender_chain.chain_key = chain_key;
    }

    // ── Receiver chains ─────────────────────────────────────────────────

    pub fn receiver_chain_count(&self) -> usize {
        self.receiver_chains.len()
    }

    pub fn has_receiver_chain(&self, ratchet_key: &PublicKey) -> bool {
        self.receiver_chain(ratchet_key).is_some()
    }

    pub fn receiver_chain_key(&self, ratchet_key: &PublicKey) -> Option<&ChainKey> {
        self.receiver_chain(ratchet_key).map(|chain| &chain.chain_key)
    }

    /// Ratchet keys of the receiver chains, oldest first.
    pub fn receiver_ratchet_keys(&self) -> impl Iterator<Item = &PublicKey> {
        self.receiver_chains.iter().map(|chain| &chain.ratchet_key)
    }

    /// Append a receiver chain, evicting the oldest beyond `max_chains`.
    /// Returns the ratchet keys of evicted chains.
    pub fn add_receiver_chain(
        &mut self,
        ratchet_key: PublicKey,
        chain_key: ChainKey,
        max_chains: usize,
    ) -> Vec<PublicKey> {
        self.receiver_chains.push_back(ReceiverChain {
            ratchet_key,
            chain_key,
        });

        let mut evicted = Vec::new();
        while self.receiver_chains.len() > max_chains.max(1) {
            if let Some(oldest) = self.receiver_chains.pop_front() {
                self.skipped_keys.purge_chain(&oldest.ratchet_key);
                evicted.push(oldest.ratchet_key);
            }
        }
        evicted
    }

    pub fn set_receiver_chain_key(
        &mut self,
        ratchet_key: &PublicKey,
        chain_key: ChainKey,
    ) -> Result<(), SessionFault> {
        let chain = self
            .receiver_chains
            .iter_mut()
            .find(|chain| &chain.ratchet_key == ratchet_key)
            .ok_or(SessionFault::InvalidState("no receiver chain for ratchet key"))?;
        chain.chain_key = chain_key;
        Ok(())
    }

    fn receiver_chain(&self, ratchet_key: &PublicKey) -> Option<&ReceiverChain> {
        self.receiver_chains
            .iter()
            .find(|chain| &chain.ratchet_key == ratchet_key)
    }

    // ── Skipped message keys ────────────────────────────────────────────

    pub fn skipped_keys(&self) -> &SkippedKeyCache {
        &self.skipped_keys
    }

    pub fn cache_message_keys(
        &mut self,
        ratchet_key: PublicKey,
        keys: MessageKeys,
        stored_at: u64,
        capacity: usize,
    ) -> usize {
        self.skipped_keys.insert(ratchet_key, keys, stored_at, capacity)
    }

    pub fn take_message_keys(&mut self, ratchet_key: &PublicKey, counter: u32) -> Option<MessageKeys> {
        self.skipped_keys.take(ratchet_key, counter)
    }

    pub fn prune_skipped_keys(&mut self, cutoff: u64) -> usize {
        self.skipped_keys.prune_older_than(cutoff)
    }

    // ── Pending pre-key ─────────────────────────────────────────────────

    pub fn set_pending_pre_key(
        &mut self,
        pre_key_id: Option<u32>,
        signed_pre_key_id: u32,
        base_key: PublicKey,
    ) {
        self.pending_pre_key = Some(PendingPreKey {
            pre_key_id,
            signed_pre_key_id,
            base_key,
        });
    }

    pub fn pending_pre_key(&self) -> Option<&PendingPreKey> {
        self.pending_pre_key.as_ref()
    }

    pub fn clear_pending_pre_key(&mut self) {
        self.pending_pre_key = None;
    }

    // ── Registration ids ────────────────────────────────────────────────

    pub fn local_registration_id(&self) -> u32 {
        self.local_registration_id
    }

    pub fn set_local_registration_id(&mut self, id: u32) {
        self.local_registration_id = id;
    }

    pub fn remote_registration_id(&self) -> u32 {
        self.remote_registration_id
    }

    pub fn set_remote_registration_id(&mut self, id: u32) {
        self.remote_registration_id = id;
    }
}

impl fmt::Debug for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionState")
            .field("version", &self.version)
            .field("sender_ratchet_key", self.sender_ratchet_key())
            .field("sender_index", &self.sender_chain.chain_key.index())
            .field("receiver_chains", &self.receiver_chains.len())
            .field("skipped_keys", &self.skipped_keys.len())
            .field("pending_pre_key", &self.pending_pre_key.is_some())
            .finish()
    }
}
