//! Store interfaces the session engine consumes, and in-memory
//! implementations of them.
//!
//! The traits are synchronous: every engine call is a short bounded
//! computation and the host decides how its store reaches disk. The in-memory
//! stores are serde types so the whole set can be sealed to a file by the
//! persistence module.

use std::collections::{BTreeMap, HashMap};

use axolotl_protocol::{PreKeyId, ProtocolAddress, SignedPreKeyId};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{MessageError, Result};
use crate::identity::{IdentityKey, IdentityKeyPair};
use crate::prekey::{PreKeyRecord, SignedPreKeyRecord};
use crate::record::SessionRecord;

/// Which way a message is travelling when an identity is checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sending,
    Receiving,
}

pub trait IdentityKeyStore {
    fn identity_key_pair(&self) -> Result<IdentityKeyPair>;

    fn local_registration_id(&self) -> Result<u32>;

    /// Record the identity of a remote party. Returns `true` when a different
    /// key was stored for that address before.
    fn save_identity(&mut self, address: &ProtocolAddress, identity: &IdentityKey) -> Result<bool>;

    fn is_trusted_identity(
        &self,
        address: &ProtocolAddress,
        identity: &IdentityKey,
        direction: Direction,
    ) -> Result<bool>;

    fn identity(&self, address: &ProtocolAddress) -> Result<Option<IdentityKey>>;
}

pub trait PreKeyStore {
    /// Fails with `InvalidPreKeyId` when the id is unknown.
    fn load_pre_key(&self, id: PreKeyId) -> Result<PreKeyRecord>;

    fn store_pre_key(&mut self, id: PreKeyId, record: &PreKeyRecord) -> Result<()>;

    fn remove_pre_key(&mut self, id: PreKeyId) -> Result<()>;

    fn contains_pre_key(&self, id: PreKeyId) -> Result<bool>;
}

pub trait SignedPreKeyStore {
    /// Fails with `InvalidSignedPreKeyId` when the id is unknown.
    fn load_signed_pre_key(&self, id: SignedPreKeyId) -> Result<SignedPreKeyRecord>;

    fn store_signed_pre_key(&mut self, id: SignedPreKeyId, record: &SignedPreKeyRecord) -> Result<()>;

    fn contains_signed_pre_key(&self, id: SignedPreKeyId) -> Result<bool>;
}

pub trait SessionStore {
    /// Never absent: an unknown address yields a fresh record.
    fn load_session(&self, address: &ProtocolAddress) -> Result<SessionRecord>;

    /// Overwrite the record for `address` in one step.
    fn store_session(&mut self, address: &ProtocolAddress, record: &SessionRecord) -> Result<()>;

    fn contains_session(&self, address: &ProtocolAddress) -> Result<bool>;

    fn delete_session(&mut self, address: &ProtocolAddress) -> Result<()>;

    /// Delete the sessions of every device of `name`. Returns how many went.
    fn delete_all_sessions(&mut self, name: &str) -> Result<usize>;
}

/// All stores bundled together.
#[derive(Clone, Serialize, Deserialize)]
pub struct ProtocolStores {
    pub identity: InMemIdentityKeyStore,
    pub prekey: InMemPreKeyStore,
    pub signed_prekey: InMemSignedPreKeyStore,
    pub session: InMemSessionStore,
}

impl ProtocolStores {
    pub fn new(identity_key_pair: IdentityKeyPair, registration_id: u32) -> Self {
        Self {
            identity: InMemIdentityKeyStore::new(identity_key_pair, registration_id),
            prekey: InMemPreKeyStore::default(),
            signed_prekey: InMemSignedPreKeyStore::default(),
            session: InMemSessionStore::default(),
        }
    }
}

// ── Identity Key Store ──────────────────────────────────────────────────

#[derive(Clone, Serialize, Deserialize)]
pub struct InMemIdentityKeyStore {
    key_pair: IdentityKeyPair,
    registration_id: u32,
    /// Remote identities pinned on first contact.
    known_identities: HashMap<ProtocolAddress, IdentityKey>,
}

impl InMemIdentityKeyStore {
    pub fn new(key_pair: IdentityKeyPair, registration_id: u32) -> Self {
        Self {
            key_pair,
            registration_id,
            known_identities: HashMap::new(),
        }
    }

    pub fn registration_id(&self) -> u32 {
        self.registration_id
    }

    pub fn known_identities(&self) -> impl Iterator<Item = (&ProtocolAddress, &IdentityKey)> {
        self.known_identities.iter()
    }
}

impl IdentityKeyStore for InMemIdentityKeyStore {
    fn identity_key_pair(&self) -> Result<IdentityKeyPair> {
        Ok(self.key_pair.clone())
    }

    fn local_registration_id(&self) -> Result<u32> {
        Ok(self.registration_id)
    }

    fn save_identity(&mut self, address: &ProtocolAddress, identity: &IdentityKey) -> Result<bool> {
        let existing = self.known_identities.insert(address.clone(), *identity);
        let changed = existing.is_some_and(|old| old != *identity);
        if changed {
            warn!(%address, "replaced pinned identity key");
        }
        Ok(changed)
    }

    fn is_trusted_identity(
        &self,
        address: &ProtocolAddress,
        identity: &IdentityKey,
        _direction: Direction,
    ) -> Result<bool> {
        match self.known_identities.get(address) {
            // Trust on first use
            None => Ok(true),
            Some(stored) => Ok(stored == identity),
        }
    }

    fn identity(&self, address: &ProtocolAddress) -> Result<Option<IdentityKey>> {
        Ok(self.known_identities.get(address).copied())
    }
}

// ── Pre-Key Store ───────────────────────────────────────────────────────

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct InMemPreKeyStore {
    prekeys: BTreeMap<PreKeyId, PreKeyRecord>,
}

impl InMemPreKeyStore {
    pub fn len(&self) -> usize {
        self.prekeys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prekeys.is_empty()
    }

    /// Highest id in use, for picking the start of the next batch.
    pub fn max_id(&self) -> Option<PreKeyId> {
        self.prekeys.keys().next_back().copied()
    }

    pub fn records(&self) -> impl Iterator<Item = &PreKeyRecord> {
        self.prekeys.values()
    }
}

impl PreKeyStore for InMemPreKeyStore {
    fn load_pre_key(&self, id: PreKeyId) -> Result<PreKeyRecord> {
        self.prekeys
            .get(&id)
            .cloned()
            .ok_or_else(|| MessageError::InvalidPreKeyId(id).into())
    }

    fn store_pre_key(&mut self, id: PreKeyId, record: &PreKeyRecord) -> Result<()> {
        self.prekeys.insert(id, record.clone());
        Ok(())
    }

    fn remove_pre_key(&mut self, id: PreKeyId) -> Result<()> {
        self.prekeys.remove(&id);
        Ok(())
    }

    fn contains_pre_key(&self, id: PreKeyId) -> Result<bool> {
        Ok(self.prekeys.contains_key(&id))
    }
}

// ── Signed Pre-Key Store ────────────────────────────────────────────────

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct InMemSignedPreKeyStore {
    signed_prekeys: BTreeMap<SignedPreKeyId, SignedPreKeyRecord>,
}

impl InMemSignedPreKeyStore {
    /// The most recently generated signed pre-key, if any.
    pub fn latest(&self) -> Option<&SignedPreKeyRecord> {
        self.signed_prekeys.values().max_by_key(|record| record.timestamp())
    }

    pub fn max_id(&self) -> Option<SignedPreKeyId> {
        self.signed_prekeys.keys().next_back().copied()
    }
}

impl SignedPreKeyStore for InMemSignedPreKeyStore {
    fn load_signed_pre_key(&self, id: SignedPreKeyId) -> Result<SignedPreKeyRecord> {
        self.signed_prekeys
            .get(&id)
            .cloned()
            .ok_or_else(|| MessageError::InvalidSignedPreKeyId(id).into())
    }

    fn store_signed_pre_key(&mut self, id: SignedPreKeyId, record: &SignedPreKeyRecord) -> Result<()> {
        self.signed_prekeys.insert(id, record.clone());
        Ok(())
    }

    fn contains_signed_pre_key(&self, id: SignedPreKeyId) -> Result<bool> {
        Ok(self.signed_prekeys.contains_key(&id))
    }
}

// ── Session Store ───────────────────────────────────────────────────────

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct InMemSessionStore {
    sessions: HashMap<ProtocolAddress, SessionRecord>,
}

impl InMemSessionStore {
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Stored records in address order.
    pub fn records(&self) -> Vec<(&ProtocolAddress, &SessionRecord)> {
        let mut records: Vec<_> = self.sessions.iter().collect();
        records.sort_by(|a, b| a.0.cmp(b.0));
        records
    }
}

impl SessionStore for InMemSessionStore {
    fn load_session(&self, address: &ProtocolAddress) -> Result<SessionRecord> {
        Ok(self
            .sessions
            .get(address)
            .cloned()
            .unwrap_or_else(SessionRecord::new_fresh))
    }

    fn store_session(&mut self, address: &ProtocolAddress, record: &SessionRecord) -> Result<()> {
        self.sessions.insert(address.clone(), record.clone());
        Ok(())
    }

    fn contains_session(&self, address: &ProtocolAddress) -> Result<bool> {
        Ok(self
            .sessions
            .get(address)
            .is_some_and(|record| record.session_state().is_some()))
    }

    fn delete_session(&mut self, address: &ProtocolAddress) -> Result<()> {
        self.sessions.remove(address);
        Ok(())
    }

    fn delete_all_sessions(&mut self, name: &str) -> Result<usize> {
        let before = self.sessions.len();
        self.sessions.retain(|address, _| address.name() != name);
        Ok(before - self.sessions.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curve::KeyPair;
    use crate::error::SessionError;
    use rand::rngs::OsRng;

    fn stores() -> ProtocolStores {
        ProtocolStores::new(IdentityKeyPair::generate(&mut OsRng), 42)
    }

    #[test]
    fn identity_trust_on_first_use() {
        let mut store = stores().identity;
        let bob = ProtocolAddress::new("bob", 1);
        let first = *IdentityKeyPair::generate(&mut OsRng).identity_key();
        let second = *IdentityKeyPair::generate(&mut OsRng).identity_key();

        assert!(store.is_trusted_identity(&bob, &first, Direction::Receiving).unwrap());
        assert!(!store.save_identity(&bob, &first).unwrap());
        assert!(store.is_trusted_identity(&bob, &first, Direction::Sending).unwrap());
        assert!(!store.is_trusted_identity(&bob, &second, Direction::Sending).unwrap());

        // pinning is per device
        let bob2 = ProtocolAddress::new("bob", 2);
        assert!(store.is_trusted_identity(&bob2, &second, Direction::Sending).unwrap());

        assert!(store.save_identity(&bob, &second).unwrap());
        assert_eq!(store.identity(&bob).unwrap(), Some(second));
    }

    #[test]
    fn session_store_returns_fresh_record() {
        let mut store = InMemSessionStore::default();
        let addr = ProtocolAddress::new("alice", 1);
        assert!(store.load_session(&addr).unwrap().is_fresh());
        assert!(!store.contains_session(&addr).unwrap());

        store.store_session(&addr, &SessionRecord::new_fresh()).unwrap();
        // a stored empty record is still not a session
        assert!(!store.contains_session(&addr).unwrap());
    }

    #[test]
    fn delete_all_sessions_by_name() {
        let mut store = InMemSessionStore::default();
        for device in 1..=3 {
            store
                .store_session(&ProtocolAddress::new("carol", device), &SessionRecord::new_fresh())
                .unwrap();
        }
        store
            .store_session(&ProtocolAddress::new("dave", 1), &SessionRecord::new_fresh())
            .unwrap();
        assert_eq!(store.delete_all_sessions("carol").unwrap(), 3);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn missing_prekeys_are_message_errors() {
        let s = stores();
        assert!(matches!(
            s.prekey.load_pre_key(7),
            Err(SessionError::Message(MessageError::InvalidPreKeyId(7)))
        ));
        assert!(matches!(
            s.signed_prekey.load_signed_pre_key(3),
            Err(SessionError::Message(MessageError::InvalidSignedPreKeyId(3)))
        ));
    }

    #[test]
    fn prekey_store_roundtrip() {
        let mut store = InMemPreKeyStore::default();
        let record = PreKeyRecord::new(5, KeyPair::generate(&mut OsRng));
        store.store_pre_key(5, &record).unwrap();
        assert!(store.contains_pre_key(5).unwrap());
        assert_eq!(store.max_id(), Some(5));
        assert_eq!(store.load_pre_key(5).unwrap().public_key(), record.public_key());
        store.remove_pre_key(5).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn stores_serialize() {
        let mut s = stores();
        s.session
            .store_session(&ProtocolAddress::new("erin", 1), &SessionRecord::new_fresh())
            .unwrap();
        let bytes = postcard::to_allocvec(&s).unwrap();
        let restored: ProtocolStores = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(restored.identity.registration_id(), 42);
        assert_eq!(restored.session.len(), 1);
    }
}
