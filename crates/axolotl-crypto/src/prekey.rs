//! Pre-key and signed pre-key generation.
//!
//! Pre-keys are one-time-use Curve25519 key pairs consumed by the first
//! message of a session. Signed pre-keys are medium-term keys signed by the
//! identity key so an initiator can tell they belong to the responder.

use std::time::{SystemTime, UNIX_EPOCH};

use axolotl_protocol::{DeviceId, OneTimePreKey, PreKeyBundleData, PreKeyId, SignedPreKeyId};
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::curve::{KeyPair, PublicKey};
use crate::error::{MessageError, Result, SessionFault};
use crate::identity::{IdentityKey, IdentityKeyPair};
use crate::stores::{IdentityKeyStore, PreKeyStore, ProtocolStores, SignedPreKeyStore};

/// Number of one-time pre-keys to generate initially.
pub const INITIAL_PREKEY_COUNT: u32 = 100;

/// Threshold below which we should replenish pre-keys.
pub const PREKEY_REPLENISH_THRESHOLD: u32 = 10;

#[derive(Clone, Serialize, Deserialize)]
pub struct PreKeyRecord {
    id: PreKeyId,
    key_pair: KeyPair,
}

impl PreKeyRecord {
    pub fn new(id: PreKeyId, key_pair: KeyPair) -> Self {
        Self { id, key_pair }
    }

    pub fn id(&self) -> PreKeyId {
        self.id
    }

    pub fn key_pair(&self) -> &KeyPair {
        &self.key_pair
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.key_pair.public_key
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct SignedPreKeyRecord {
    id: SignedPreKeyId,
    /// Unix milliseconds at generation.
    timestamp: u64,
    key_pair: KeyPair,
    signature: Vec<u8>,
}

impl SignedPreKeyRecord {
    pub fn new(id: SignedPreKeyId, timestamp: u64, key_pair: KeyPair, signature: &[u8]) -> Self {
        Self {
            id,
            timestamp,
            key_pair,
            signature: signature.to_vec(),
        }
    }

    /// Generate a key pair and sign its wire form with the identity key.
    pub fn generate<R: CryptoRng + RngCore>(
        id: SignedPreKeyId,
        identity_key_pair: &IdentityKeyPair,
        rng: &mut R,
    ) -> Self {
        let key_pair = KeyPair::generate(rng);
        let signature = identity_key_pair
            .private_key()
            .calculate_signature(&key_pair.public_key.serialize(), rng);
        Self::new(id, now_millis(), key_pair, &signature)
    }

    pub fn id(&self) -> SignedPreKeyId {
        self.id
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn key_pair(&self) -> &KeyPair {
        &self.key_pair
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.key_pair.public_key
    }

    pub fn signature(&self) -> &[u8] {
        &self.signature
    }
}

/// A peer's published keys, parsed and ready for session setup.
#[derive(Debug, Clone)]
pub struct PreKeyBundle {
    registration_id: u32,
    device_id: DeviceId,
    pre_key: Option<(PreKeyId, PublicKey)>,
    signed_pre_key_id: SignedPreKeyId,
    signed_pre_key: PublicKey,
    signed_pre_key_signature: Vec<u8>,
    identity_key: IdentityKey,
}

impl PreKeyBundle {
    pub fn new(
        registration_id: u32,
        device_id: DeviceId,
        pre_key: Option<(PreKeyId, PublicKey)>,
        signed_pre_key_id: SignedPreKeyId,
        signed_pre_key: PublicKey,
        signed_pre_key_signature: Vec<u8>,
        identity_key: IdentityKey,
    ) -> Self {
        Self {
            registration_id,
            device_id,
            pre_key,
            signed_pre_key_id,
            signed_pre_key,
            signed_pre_key_signature,
            identity_key,
        }
    }

    pub fn registration_id(&self) -> u32 {
        self.registration_id
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn pre_key_id(&self) -> Option<PreKeyId> {
        self.pre_key.map(|(id, _)| id)
    }

    pub fn pre_key_public(&self) -> Option<&PublicKey> {
        self.pre_key.as_ref().map(|(_, key)| key)
    }

    pub fn signed_pre_key_id(&self) -> SignedPreKeyId {
        self.signed_pre_key_id
    }

    pub fn signed_pre_key_public(&self) -> &PublicKey {
        &self.signed_pre_key
    }

    pub fn signed_pre_key_signature(&self) -> &[u8] {
        &self.signed_pre_key_signature
    }

    pub fn identity_key(&self) -> &IdentityKey {
        &self.identity_key
    }

    /// Whether the identity key signed the signed pre-key.
    pub fn has_valid_signature(&self) -> bool {
        self.identity_key
            .public_key()
            .verify_signature(&self.signed_pre_key.serialize(), &self.signed_pre_key_signature)
    }
}

/// Parse published bundle data, choosing one one-time pre-key.
///
/// With `pre_key_id` set that key must be present; otherwise the first
/// published key is used, or none if the batch is empty.
pub fn bundle_from_data(data: &PreKeyBundleData, pre_key_id: Option<PreKeyId>) -> Result<PreKeyBundle> {
    let identity_key = IdentityKey::decode(&data.identity_key)?;
    let signed_pre_key = PublicKey::deserialize(&data.signed_prekey)?;

    let chosen = match pre_key_id {
        Some(id) => Some(
            data.prekeys
                .iter()
                .find(|k| k.id == id)
                .ok_or(MessageError::InvalidPreKeyId(id))?,
        ),
        None => data.prekeys.first(),
    };
    let pre_key = chosen
        .map(|k| PublicKey::deserialize(&k.public_key).map(|key| (k.id, key)))
        .transpose()?;

    Ok(PreKeyBundle::new(
        data.registration_id,
        data.device_id,
        pre_key,
        data.signed_prekey_id,
        signed_pre_key,
        data.signed_prekey_signature.clone(),
        identity_key,
    ))
}

/// Generate a fresh signed pre-key plus `count` one-time pre-keys, store the
/// private halves and return the public set for publishing.
pub fn generate_prekeys<R: CryptoRng + RngCore>(
    stores: &mut ProtocolStores,
    device_id: DeviceId,
    start_id: PreKeyId,
    count: u32,
    rng: &mut R,
) -> Result<PreKeyBundleData> {
    let identity_key_pair = stores.identity.identity_key_pair()?;

    let prekeys = generate_replenish_prekeys(stores, start_id, count, rng)?;

    let signed_prekey_id = stores
        .signed_prekey
        .max_id()
        .map_or(Ok(1), |id| {
            id.checked_add(1)
                .ok_or(SessionFault::InvalidState("signed pre-key ids exhausted"))
        })?;
    let signed = SignedPreKeyRecord::generate(signed_prekey_id, &identity_key_pair, rng);
    stores
        .signed_prekey
        .store_signed_pre_key(signed_prekey_id, &signed)?;

    debug!(
        signed_prekey_id,
        one_time = prekeys.len(),
        "generated pre-keys"
    );

    Ok(PreKeyBundleData {
        registration_id: stores.identity.local_registration_id()?,
        device_id,
        identity_key: identity_key_pair.identity_key().serialize().to_vec(),
        signed_prekey_id,
        signed_prekey: signed.public_key().serialize().to_vec(),
        signed_prekey_signature: signed.signature().to_vec(),
        prekeys,
    })
}

/// Generate additional one-time pre-keys to replenish supply.
pub fn generate_replenish_prekeys<R: CryptoRng + RngCore>(
    stores: &mut ProtocolStores,
    start_id: PreKeyId,
    count: u32,
    rng: &mut R,
) -> Result<Vec<OneTimePreKey>> {
    let mut prekeys = Vec::with_capacity(count as usize);

    for i in 0..count {
        let id = start_id
            .checked_add(i)
            .ok_or(SessionFault::InvalidState("pre-key ids exhausted"))?;
        let record = PreKeyRecord::new(id, KeyPair::generate(rng));
        stores.prekey.store_pre_key(id, &record)?;
        prekeys.push(OneTimePreKey {
            id,
            public_key: record.public_key().serialize().to_vec(),
        });
    }

    Ok(prekeys)
}

/// The published bundle for the current signed pre-key and all remaining
/// one-time pre-keys.
pub fn current_bundle(stores: &ProtocolStores, device_id: DeviceId) -> Result<PreKeyBundleData> {
    let identity_key_pair = stores.identity.identity_key_pair()?;
    let signed = stores
        .signed_prekey
        .latest()
        .ok_or(SessionFault::InvalidState("no signed pre-key generated"))?;

    Ok(PreKeyBundleData {
        registration_id: stores.identity.local_registration_id()?,
        device_id,
        identity_key: identity_key_pair.identity_key().serialize().to_vec(),
        signed_prekey_id: signed.id(),
        signed_prekey: signed.public_key().serialize().to_vec(),
        signed_prekey_signature: signed.signature().to_vec(),
        prekeys: stores
            .prekey
            .records()
            .map(|record| OneTimePreKey {
                id: record.id(),
                public_key: record.public_key().serialize().to_vec(),
            })
            .collect(),
    })
}

/// One-time pre-keys to generate to get back to the initial supply, or zero
/// while above the replenish threshold.
pub fn prekeys_to_replenish(stores: &ProtocolStores) -> u32 {
    let remaining = stores.prekey.len() as u32;
    if remaining < PREKEY_REPLENISH_THRESHOLD {
        INITIAL_PREKEY_COUNT - remaining
    } else {
        0
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SessionError;
    use rand::rngs::OsRng;

    fn stores() -> ProtocolStores {
        ProtocolStores::new(IdentityKeyPair::generate(&mut OsRng), 7)
    }

    #[test]
    fn generated_bundle_is_signed_and_stored() {
        let mut s = stores();
        let data = generate_prekeys(&mut s, 1, 1, 5, &mut OsRng).unwrap();
        assert_eq!(data.registration_id, 7);
        assert_eq!(data.signed_prekey_id, 1);
        assert_eq!(data.prekeys.len(), 5);
        assert_eq!(s.prekey.len(), 5);
        assert!(s.signed_prekey.contains_signed_pre_key(1).unwrap());

        let bundle = bundle_from_data(&data, None).unwrap();
        assert!(bundle.has_valid_signature());
        assert_eq!(bundle.pre_key_id(), Some(1));
    }

    #[test]
    fn tampered_signature_fails_verification() {
        let mut s = stores();
        let mut data = generate_prekeys(&mut s, 1, 1, 1, &mut OsRng).unwrap();
        data.signed_prekey_signature[0] ^= 0x01;
        let bundle = bundle_from_data(&data, None).unwrap();
        assert!(!bundle.has_valid_signature());
    }

    #[test]
    fn bundle_picks_requested_prekey() {
        let mut s = stores();
        let data = generate_prekeys(&mut s, 1, 10, 3, &mut OsRng).unwrap();
        let bundle = bundle_from_data(&data, Some(12)).unwrap();
        assert_eq!(bundle.pre_key_id(), Some(12));
        assert!(matches!(
            bundle_from_data(&data, Some(99)),
            Err(SessionError::Message(MessageError::InvalidPreKeyId(99)))
        ));
    }

    #[test]
    fn bundle_without_one_time_keys() {
        let mut s = stores();
        let data = generate_prekeys(&mut s, 1, 1, 0, &mut OsRng).unwrap();
        let bundle = bundle_from_data(&data, None).unwrap();
        assert_eq!(bundle.pre_key_id(), None);
        assert!(bundle.pre_key_public().is_none());
    }

    #[test]
    fn second_generation_rotates_signed_prekey() {
        let mut s = stores();
        generate_prekeys(&mut s, 1, 1, 1, &mut OsRng).unwrap();
        let data = generate_prekeys(&mut s, 1, 2, 1, &mut OsRng).unwrap();
        assert_eq!(data.signed_prekey_id, 2);
        let current = current_bundle(&s, 1).unwrap();
        assert_eq!(current.prekeys.len(), 2);
    }

    #[test]
    fn replenish_below_threshold() {
        let mut s = stores();
        assert_eq!(prekeys_to_replenish(&s), INITIAL_PREKEY_COUNT);
        generate_replenish_prekeys(&mut s, 1, PREKEY_REPLENISH_THRESHOLD, &mut OsRng).unwrap();
        assert_eq!(prekeys_to_replenish(&s), 0);
    }
}
