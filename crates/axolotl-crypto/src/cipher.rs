//! Per-message encryption and decryption over a stored session.
//!
//! Every call works on a copy of the stored record and writes it back only
//! once the whole operation has succeeded, so a rejected message leaves the
//! stored session untouched. Calls for the same peer device must not overlap;
//! see [`crate::locks::SessionLocks`].

use std::time::{SystemTime, UNIX_EPOCH};

use axolotl_protocol::{CiphertextMessage, PreKeySignalMessage, ProtocolAddress, SignalMessage};
use rand::rngs::OsRng;
use tracing::{debug, info, warn};

use crate::builder::process_prekey;
use crate::config::SessionConfig;
use crate::curve::{KeyPair, PublicKey};
use crate::error::{MessageError, Result, SessionError, SessionFault};
use crate::identity::IdentityKey;
use crate::kdf::{aes_256_cbc_decrypt, aes_256_cbc_encrypt};
use crate::ratchet::{ChainKey, MessageKeys};
use crate::record::SessionRecord;
use crate::state::SessionState;
use crate::stores::{
    Direction, IdentityKeyStore, PreKeyStore, ProtocolStores, SessionStore, SignedPreKeyStore,
};

pub struct SessionCipher<'a> {
    remote_address: ProtocolAddress,
    session_store: &'a mut dyn SessionStore,
    identity_store: &'a mut dyn IdentityKeyStore,
    pre_key_store: &'a mut dyn PreKeyStore,
    signed_pre_key_store: &'a mut dyn SignedPreKeyStore,
    config: SessionConfig,
    clock: fn() -> u64,
}

impl<'a> SessionCipher<'a> {
    pub fn new(
        remote_address: ProtocolAddress,
        session_store: &'a mut dyn SessionStore,
        identity_store: &'a mut dyn IdentityKeyStore,
        pre_key_store: &'a mut dyn PreKeyStore,
        signed_pre_key_store: &'a mut dyn SignedPreKeyStore,
        config: SessionConfig,
    ) -> Self {
        Self {
            remote_address,
            session_store,
            identity_store,
            pre_key_store,
            signed_pre_key_store,
            config,
            clock: unix_now,
        }
    }

    pub fn from_stores(
        remote_address: ProtocolAddress,
        stores: &'a mut ProtocolStores,
        config: SessionConfig,
    ) -> Self {
        Self::new(
            remote_address,
            &mut stores.session,
            &mut stores.identity,
            &mut stores.prekey,
            &mut stores.signed_prekey,
            config,
        )
    }

    /// Replace the source of unix seconds used to age cached message keys.
    pub fn with_clock(mut self, clock: fn() -> u64) -> Self {
        self.clock = clock;
        self
    }

    pub fn remote_address(&self) -> &ProtocolAddress {
        &self.remote_address
    }

    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<CiphertextMessage> {
        let mut record = self.session_store.load_session(&self.remote_address)?;
        let state = record
            .session_state_mut()
            .ok_or_else(|| SessionFault::NoSession(self.remote_address.clone()))?;

        let chain_key = state.sender_chain_key().clone();
        if chain_key.index() == u32::MAX {
            return Err(SessionFault::InvalidState("sender chain exhausted").into());
        }
        let message_keys = chain_key.message_keys()?;

        let local_identity = *state.local_identity_key();
        let remote_identity = *state.remote_identity_key();

        let ciphertext = aes_256_cbc_encrypt(plaintext, message_keys.cipher_key(), message_keys.iv())?;

        let signal_message = SignalMessage::new(
            state.version(),
            message_keys.mac_key(),
            *state.sender_ratchet_key().public_key_bytes(),
            chain_key.index(),
            state.previous_counter(),
            &ciphertext,
            local_identity.public_key().public_key_bytes(),
            remote_identity.public_key().public_key_bytes(),
        );

        let message = match state.pending_pre_key() {
            Some(pending) => CiphertextMessage::PreKey(PreKeySignalMessage::new(
                state.version(),
                state.local_registration_id(),
                pending.pre_key_id,
                pending.signed_pre_key_id,
                *pending.base_key.public_key_bytes(),
                *local_identity.public_key().public_key_bytes(),
                signal_message,
            )),
            None => CiphertextMessage::Signal(signal_message),
        };

        state.set_sender_chain_key(chain_key.next_chain_key());

        if !self
            .identity_store
            .is_trusted_identity(&self.remote_address, &remote_identity, Direction::Sending)?
        {
            warn!(address = %self.remote_address, "refusing to encrypt to untrusted identity");
            return Err(SessionFault::UntrustedIdentity(self.remote_address.clone()).into());
        }

        self.identity_store
            .save_identity(&self.remote_address, &remote_identity)?;
        self.session_store
            .store_session(&self.remote_address, &record)?;

        Ok(message)
    }

    pub fn decrypt(&mut self, message: &CiphertextMessage) -> Result<Vec<u8>> {
        match message {
            CiphertextMessage::Signal(m) => self.decrypt_signal_message(m),
            CiphertextMessage::PreKey(m) => self.decrypt_prekey_message(m),
        }
    }

    pub fn decrypt_signal_message(&mut self, message: &SignalMessage) -> Result<Vec<u8>> {
        let mut record = self.session_store.load_session(&self.remote_address)?;
        let plaintext = self.decrypt_message_with_record(&mut record, message)?;

        let remote_identity = *record
            .session_state()
            .ok_or(SessionFault::InvalidState("decrypted without a current state"))?
            .remote_identity_key();

        if !self
            .identity_store
            .is_trusted_identity(&self.remote_address, &remote_identity, Direction::Receiving)?
        {
            warn!(address = %self.remote_address, "message from untrusted identity");
            return Err(SessionFault::UntrustedIdentity(self.remote_address.clone()).into());
        }

        self.identity_store
            .save_identity(&self.remote_address, &remote_identity)?;
        self.session_store
            .store_session(&self.remote_address, &record)?;

        Ok(plaintext)
    }

    pub fn decrypt_prekey_message(&mut self, message: &PreKeySignalMessage) -> Result<Vec<u8>> {
        let mut record = self.session_store.load_session(&self.remote_address)?;

        let pre_key_used = process_prekey(
            message,
            &self.remote_address,
            &mut record,
            &*self.identity_store,
            &*self.pre_key_store,
            &*self.signed_pre_key_store,
            &self.config,
        )?;

        let plaintext = self.decrypt_message_with_record(&mut record, message.message())?;

        let their_identity = IdentityKey::new(PublicKey::from_raw(*message.identity_key()));
        self.identity_store
            .save_identity(&self.remote_address, &their_identity)?;
        self.session_store
            .store_session(&self.remote_address, &record)?;

        if let Some(id) = pre_key_used {
            self.pre_key_store.remove_pre_key(id)?;
            debug!(address = %self.remote_address, pre_key_id = id, "consumed one-time pre-key");
        }

        Ok(plaintext)
    }

    pub fn remote_registration_id(&self) -> Result<u32> {
        Ok(self.current_state()?.remote_registration_id())
    }

    pub fn session_version(&self) -> Result<u8> {
        Ok(self.current_state()?.version())
    }

    fn current_state(&self) -> Result<SessionState> {
        let record = self.session_store.load_session(&self.remote_address)?;
        record
            .session_state()
            .cloned()
            .ok_or_else(|| SessionFault::NoSession(self.remote_address.clone()).into())
    }

    /// Try the current state, then archived ones, each on a copy. The copy
    /// that decrypts replaces its original and becomes current.
    fn decrypt_message_with_record(
        &self,
        record: &mut SessionRecord,
        message: &SignalMessage,
    ) -> Result<Vec<u8>> {
        if record.session_state().is_none() && record.previous_session_count() == 0 {
            return Err(SessionFault::NoSession(self.remote_address.clone()).into());
        }

        let mut too_many_skipped = None;

        if let Some(current) = record.session_state() {
            let mut state = current.clone();
            match self.decrypt_with_state(&mut state, message) {
                Ok(plaintext) => {
                    record.set_session_state(state);
                    return Ok(plaintext);
                }
                Err(e) => Self::keep_trying(e, &mut too_many_skipped)?,
            }
        }

        for index in 0..record.previous_session_count() {
            let Some(previous) = record.previous_session_state(index) else {
                break;
            };
            let mut state = previous.clone();
            match self.decrypt_with_state(&mut state, message) {
                Ok(plaintext) => {
                    info!(
                        address = %self.remote_address,
                        archived_index = index,
                        "promoted archived session state"
                    );
                    record.promote_old_session(index, state, self.config.max_archived_states)?;
                    return Ok(plaintext);
                }
                Err(e) => Self::keep_trying(e, &mut too_many_skipped)?,
            }
        }

        debug!(
            address = %self.remote_address,
            states = record.previous_session_count() + usize::from(record.session_state().is_some()),
            "no session state decrypted the message"
        );
        Err(too_many_skipped
            .unwrap_or(MessageError::InvalidMessage)
            .into())
    }

    // A failed state lets the next one try unless the failure is final.
    fn keep_trying(error: SessionError, too_many_skipped: &mut Option<MessageError>) -> Result<()> {
        match error {
            SessionError::Message(MessageError::InvalidMessage) => Ok(()),
            SessionError::Message(e @ MessageError::TooManySkippedMessages { .. }) => {
                too_many_skipped.get_or_insert(e);
                Ok(())
            }
            other => Err(other),
        }
    }

    fn decrypt_with_state(&self, state: &mut SessionState, message: &SignalMessage) -> Result<Vec<u8>> {
        if message.message_version() != state.version() {
            return Err(SessionFault::UnsupportedVersion(message.message_version()).into());
        }

        if let Some(max_age) = self.config.skipped_key_max_age_secs {
            let pruned = state.prune_skipped_keys((self.clock)().saturating_sub(max_age));
            if pruned > 0 {
                debug!(address = %self.remote_address, pruned, "dropped expired message keys");
            }
        }

        let their_ephemeral = PublicKey::from_raw(*message.sender_ratchet_key());
        let counter = message.counter();

        let chain_key = self.get_or_create_chain_key(state, &their_ephemeral)?;
        let message_keys = self.get_or_create_message_keys(state, &their_ephemeral, &chain_key, counter)?;

        let mac_valid = message.verify_mac(
            state.remote_identity_key().public_key().public_key_bytes(),
            state.local_identity_key().public_key().public_key_bytes(),
            message_keys.mac_key(),
        );
        if !mac_valid {
            return Err(MessageError::InvalidMessage.into());
        }

        let plaintext = aes_256_cbc_decrypt(message.body(), message_keys.cipher_key(), message_keys.iv())
            .map_err(|_| MessageError::InvalidMessage)?;

        state.clear_pending_pre_key();

        Ok(plaintext)
    }

    fn get_or_create_chain_key(&self, state: &mut SessionState, their_ephemeral: &PublicKey) -> Result<ChainKey> {
        if let Some(chain_key) = state.receiver_chain_key(their_ephemeral) {
            return Ok(chain_key.clone());
        }

        let (receiver_root, receiver_chain) = state
            .root_key()
            .create_chain(their_ephemeral, state.sender_ratchet_private_key())?;

        let our_new_ephemeral = KeyPair::generate(&mut OsRng);
        let (sender_root, sender_chain) =
            receiver_root.create_chain(their_ephemeral, &our_new_ephemeral.private_key)?;

        let current_index = state.sender_chain_key().index();

        state.set_root_key(sender_root);
        let evicted = state.add_receiver_chain(
            *their_ephemeral,
            receiver_chain.clone(),
            self.config.max_receiver_chains,
        );
        state.set_previous_counter(current_index.saturating_sub(1));
        state.set_sender_chain(our_new_ephemeral, sender_chain);

        debug!(
            address = %self.remote_address,
            their_ratchet = %their_ephemeral.fingerprint(),
            our_ratchet = %state.sender_ratchet_key().fingerprint(),
            evicted_chains = evicted.len(),
            "ratchet step"
        );

        Ok(receiver_chain)
    }

    fn get_or_create_message_keys(
        &self,
        state: &mut SessionState,
        their_ephemeral: &PublicKey,
        chain_key: &ChainKey,
        counter: u32,
    ) -> Result<MessageKeys> {
        let chain_index = chain_key.index();

        if chain_index > counter {
            return match state.take_message_keys(their_ephemeral, counter) {
                Some(keys) => Ok(keys),
                None => Err(MessageError::DuplicateMessage {
                    chain_index,
                    counter,
                }
                .into()),
            };
        }

        let jump = counter - chain_index;
        if jump > self.config.max_forward_jump || counter == u32::MAX {
            return Err(MessageError::TooManySkippedMessages {
                counter,
                jump,
                limit: self.config.max_forward_jump,
            }
            .into());
        }

        let now = (self.clock)();
        let mut chain_key = chain_key.clone();
        let mut evicted = 0;
        while chain_key.index() < counter {
            evicted += state.cache_message_keys(
                *their_ephemeral,
                chain_key.message_keys()?,
                now,
                self.config.max_skipped_keys,
            );
            chain_key = chain_key.next_chain_key();
        }

        if jump > 0 {
            debug!(
                address = %self.remote_address,
                skipped = jump,
                evicted,
                "cached message keys for skipped messages"
            );
        }

        state.set_receiver_chain_key(their_ephemeral, chain_key.next_chain_key())?;
        Ok(chain_key.message_keys()?)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
