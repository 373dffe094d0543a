//! Root / chain / message key ladder.
//!
//! Every value here is immutable: advancing produces a new key and the old
//! one is wiped when dropped.

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::curve::{PrivateKey, PublicKey};
use crate::error::KeyError;
use crate::kdf::{hkdf_sha256, hmac_sha256};

const MESSAGE_KEY_SEED: [u8; 1] = [0x01];
const CHAIN_KEY_SEED: [u8; 1] = [0x02];
const RATCHET_INFO: &[u8] = b"WhisperRatchet";
const MESSAGE_KEYS_INFO: &[u8] = b"WhisperMessageKeys";

/// Keys for exactly one message.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct MessageKeys {
    cipher_key: [u8; 32],
    mac_key: [u8; 32],
    iv: [u8; 16],
    #[zeroize(skip)]
    counter: u32,
}

impl MessageKeys {
    /// Split 80 bytes of derived material into cipher key, MAC key and IV.
    pub fn derive_keys(input_key_material: &[u8], counter: u32) -> Result<Self, KeyError> {
        let mut okm = hkdf_sha256(input_key_material, None, MESSAGE_KEYS_INFO, 80)?;
        let mut keys = Self {
            cipher_key: [0u8; 32],
            mac_key: [0u8; 32],
            iv: [0u8; 16],
            counter,
        };
        keys.cipher_key.copy_from_slice(&okm[..32]);
        keys.mac_key.copy_from_slice(&okm[32..64]);
        keys.iv.copy_from_slice(&okm[64..80]);
        okm.zeroize();
        Ok(keys)
    }

    pub fn cipher_key(&self) -> &[u8; 32] {
        &self.cipher_key
    }

    pub fn mac_key(&self) -> &[u8; 32] {
        &self.mac_key
    }

    pub fn iv(&self) -> &[u8; 16] {
        &self.iv
    }

    pub fn counter(&self) -> u32 {
        self.counter
    }
}

/// A symmetric chain key at a given index.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct ChainKey {
    key: [u8; 32],
    #[zeroize(skip)]
    index: u32,
}

impl ChainKey {
    pub fn new(key: [u8; 32], index: u32) -> Self {
        Self { key, index }
    }

    pub fn key(&self) -> &[u8; 32] {
        &self.key
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// The next link of the chain. The current key cannot be recovered from it.
    pub fn next_chain_key(&self) -> Self {
        Self {
            key: hmac_sha256(&self.key, &CHAIN_KEY_SEED),
            index: self.index + 1,
        }
    }

    /// Message keys for the message at this chain index.
    pub fn message_keys(&self) -> Result<MessageKeys, KeyError> {
        let mut seed = hmac_sha256(&self.key, &MESSAGE_KEY_SEED);
        let keys = MessageKeys::derive_keys(&seed, self.index);
        seed.zeroize();
        keys
    }
}

#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct RootKey {
    key: [u8; 32],
}

impl RootKey {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    pub fn key(&self) -> &[u8; 32] {
        &self.key
    }

    /// One DH ratchet step: mix a fresh agreement into the root key to get
    /// the next root key and a new chain starting at index 0.
    pub fn create_chain(
        &self,
        their_ratchet_key: &PublicKey,
        our_ratchet_key: &PrivateKey,
    ) -> Result<(RootKey, ChainKey), KeyError> {
        let mut shared_secret = our_ratchet_key.calculate_agreement(their_ratchet_key)?;
        let derived = hkdf_sha256(&shared_secret, Some(&self.key), RATCHET_INFO, 64);
        shared_secret.zeroize();
        let mut derived = derived?;

        let mut root = [0u8; 32];
        let mut chain = [0u8; 32];
        root.copy_from_slice(&derived[..32]);
        chain.copy_from_slice(&derived[32..]);
        derived.zeroize();

        Ok((RootKey::new(root), ChainKey::new(chain, 0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curve::KeyPair;
    use crate::testing::{from_hex, hex32, key_pair, ALICE_PRIVATE, BOB_PUBLIC};
    use rand::rngs::OsRng;

    #[test]
    fn chain_key_advances_index() {
        let chain_key = ChainKey::new([1u8; 32], 0);
        let next = chain_key.next_chain_key();
        assert_eq!(next.index(), 1);
        assert_ne!(next.key(), chain_key.key());
        // advancing does not touch the original value
        assert_eq!(chain_key.index(), 0);
    }

    #[test]
    fn message_keys_tagged_with_index() {
        let chain_key = ChainKey::new([1u8; 32], 7);
        let keys = chain_key.message_keys().unwrap();
        assert_eq!(keys.counter(), 7);
        assert_ne!(keys.cipher_key(), keys.mac_key());
    }

    #[test]
    fn message_and_chain_derivations_are_separated() {
        let chain_key = ChainKey::new([3u8; 32], 0);
        let next = chain_key.next_chain_key();
        let keys = chain_key.message_keys().unwrap();
        assert_ne!(next.key(), keys.cipher_key());
        assert_ne!(next.key(), keys.mac_key());
        let next_keys = next.message_keys().unwrap();
        assert_ne!(next_keys.cipher_key(), keys.cipher_key());
    }

    #[test]
    fn chain_is_deterministic() {
        let a = ChainKey::new([9u8; 32], 0).next_chain_key().next_chain_key();
        let b = ChainKey::new([9u8; 32], 0).next_chain_key().next_chain_key();
        assert_eq!(a.key(), b.key());
        assert_eq!(a.index(), 2);
    }

    #[test]
    fn chain_key_vector() {
        // libsignal ChainKeyTest
        let seed = hex32("8ab72d6f4cc5ac0d387eaf463378ddb28edd07385b1cb01250c715982e7ad48f");
        let chain_key = ChainKey::new(seed, 0);
        let keys = chain_key.message_keys().unwrap();

        assert_eq!(
            keys.cipher_key(),
            &hex32("bf51e9d75e0e31031051f82a2491ffc084fa298b7793bd9db620056febf45217")
        );
        assert_eq!(
            keys.mac_key(),
            &hex32("c6c77d6a73a354337a56435e34607dfe48e3ace14e77314dc6abc172e7a7030b")
        );
        assert_eq!(&keys.iv()[..], &from_hex("afa8207986b692a116d4b40bbff72d6c")[..]);
        assert_eq!(keys.counter(), 0);

        let next = chain_key.next_chain_key();
        assert_eq!(
            next.key(),
            &hex32("28e8f8fee54b801eef7c5cfb2f17f32c7b334485bbb70fac6ec10342a246d15d")
        );
        assert_eq!(next.index(), 1);
    }

    #[test]
    fn create_chain_vector() {
        let root = RootKey::new(hex32(
            "7ba6debc2bc1bbf91abbc1367404176ca623095b7ec66b45f602d93538942dcc",
        ));
        let ours = key_pair(ALICE_PRIVATE);
        let theirs = PublicKey::from_raw(hex32(BOB_PUBLIC));

        let (next_root, chain) = root.create_chain(&theirs, &ours.private_key).unwrap();
        assert_eq!(
            next_root.key(),
            &hex32("19e075ba3aef42cbf606d50d0be93bcfc6b16830991b36918b9a795a45a15de8")
        );
        assert_eq!(
            chain.key(),
            &hex32("81eae49b6aad97867c2a843c9c5a09d4d3a7f38c90055819b73649d1cf913b70")
        );
        assert_eq!(chain.index(), 0);
    }

    #[test]
    fn create_chain_agrees_on_both_sides() {
        let root = RootKey::new([5u8; 32]);
        let alice = KeyPair::generate(&mut OsRng);
        let bob = KeyPair::generate(&mut OsRng);

        let (alice_root, alice_chain) = root
            .create_chain(&bob.public_key, &alice.private_key)
            .unwrap();
        let (bob_root, bob_chain) = root
            .create_chain(&alice.public_key, &bob.private_key)
            .unwrap();

        assert_eq!(alice_root.key(), bob_root.key());
        assert_eq!(alice_chain.key(), bob_chain.key());
        assert_eq!(alice_chain.index(), 0);
        assert_ne!(alice_root.key(), root.key());
    }

    #[test]
    fn create_chain_rejects_low_order_key() {
        let root = RootKey::new([5u8; 32]);
        let ours = KeyPair::generate(&mut OsRng);
        let bad = PublicKey::from_raw([0u8; 32]);
        assert!(root.create_chain(&bad, &ours.private_key).is_err());
    }
}
