use std::fmt;

use serde::{Deserialize, Serialize};

/// Device identifier within one remote party's account.
pub type DeviceId = u32;

/// Identifier of a one-time pre-key.
pub type PreKeyId = u32;

/// Identifier of a signed pre-key.
pub type SignedPreKeyId = u32;

/// Addresses one device of one remote party. Every session is keyed by this pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProtocolAddress {
    name: String,
    device_id: DeviceId,
}

impl ProtocolAddress {
    pub fn new(name: impl Into<String>, device_id: DeviceId) -> Self {
        Self {
            name: name.into(),
            device_id,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }
}

impl fmt::Display for ProtocolAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.name, self.device_id)
    }
}

/// The public half of a party's pre-keys, as published for others to start
/// sessions while the party is offline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyBundleData {
    pub registration_id: u32,
    pub device_id: DeviceId,
    /// 33-byte serialized Curve25519 identity public key.
    pub identity_key: Vec<u8>,
    pub signed_prekey_id: SignedPreKeyId,
    /// 33-byte serialized Curve25519 public key.
    pub signed_prekey: Vec<u8>,
    /// 64-byte XEdDSA signature over the serialized signed pre-key.
    pub signed_prekey_signature: Vec<u8>,
    /// Batch of one-time pre-keys.
    pub prekeys: Vec<OneTimePreKey>,
}

/// A single one-time pre-key's public portion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimePreKey {
    pub id: PreKeyId,
    /// 33-byte serialized Curve25519 public key.
    pub public_key: Vec<u8>,
}
