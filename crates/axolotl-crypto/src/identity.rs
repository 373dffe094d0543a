//! Identity key generation and serialization.
//!
//! Each party has a long-term Curve25519 identity key pair generated once
//! and persisted; the public half is what peers pin on first contact.

use rand::rngs::OsRng;
use rand::{CryptoRng, Rng, RngCore};
use serde::{Deserialize, Serialize};

use crate::curve::{KeyPair, PrivateKey, PublicKey};
use crate::error::KeyError;

/// The public identity key of a party.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityKey(PublicKey);

impl IdentityKey {
    pub fn new(public_key: PublicKey) -> Self {
        Self(public_key)
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.0
    }

    /// Type-prefixed wire form, as carried in pre-key messages and bundles.
    pub fn serialize(&self) -> [u8; 33] {
        self.0.serialize()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, KeyError> {
        PublicKey::deserialize(bytes).map(Self)
    }
}

impl From<PublicKey> for IdentityKey {
    fn from(public_key: PublicKey) -> Self {
        Self(public_key)
    }
}

/// A party's identity key together with its private half.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityKeyPair {
    identity_key: IdentityKey,
    private_key: PrivateKey,
}

impl IdentityKeyPair {
    pub fn new(identity_key: IdentityKey, private_key: PrivateKey) -> Self {
        Self {
            identity_key,
            private_key,
        }
    }

    pub fn generate<R: CryptoRng + RngCore>(rng: &mut R) -> Self {
        let pair = KeyPair::generate(rng);
        Self {
            identity_key: IdentityKey(pair.public_key),
            private_key: pair.private_key,
        }
    }

    pub fn identity_key(&self) -> &IdentityKey {
        &self.identity_key
    }

    pub fn public_key(&self) -> &PublicKey {
        self.identity_key.public_key()
    }

    pub fn private_key(&self) -> &PrivateKey {
        &self.private_key
    }

    pub fn key_pair(&self) -> KeyPair {
        KeyPair::new(*self.identity_key.public_key(), self.private_key.clone())
    }
}

/// Generate a fresh identity key pair.
pub fn generate_identity_key_pair() -> IdentityKeyPair {
    IdentityKeyPair::generate(&mut OsRng)
}

/// Generate a registration id in the 14-bit range peers expect.
pub fn generate_registration_id<R: CryptoRng + RngCore>(rng: &mut R) -> u32 {
    rng.gen_range(1..16380)
}

/// Serialize an identity key's public half to bytes (for bundles).
pub fn identity_key_to_bytes(key: &IdentityKey) -> Vec<u8> {
    key.serialize().to_vec()
}

/// Deserialize an identity key from bytes (from bundles or messages).
pub fn identity_key_from_bytes(bytes: &[u8]) -> Result<IdentityKey, KeyError> {
    IdentityKey::decode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_and_roundtrip() {
        let pair = generate_identity_key_pair();
        let bytes = postcard::to_allocvec(&pair).unwrap();
        let restored: IdentityKeyPair = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(pair.identity_key(), restored.identity_key());
        assert_eq!(
            restored.private_key().public_key(),
            *pair.public_key()
        );
    }

    #[test]
    fn public_key_serialization() {
        let pair = generate_identity_key_pair();
        let bytes = identity_key_to_bytes(pair.identity_key());
        assert_eq!(bytes.len(), 33);
        let restored = identity_key_from_bytes(&bytes).unwrap();
        assert_eq!(pair.identity_key(), &restored);
    }

    #[test]
    fn registration_id_range() {
        for _ in 0..100 {
            let id = generate_registration_id(&mut OsRng);
            assert!((1..16380).contains(&id));
        }
    }
}
