//! Double Ratchet key ladder and X3DH-style session initialisation.
//!
//! The initiator ("Alice") combines her identity and a fresh base key with the
//! responder's identity, signed pre-key and optional one-time pre-key. Both
//! sides derive the same root key and first chain; Alice then immediately
//! ratchets to a fresh sending key while Bob sends on his signed pre-key.

pub mod keys;

pub use keys::{ChainKey, MessageKeys, RootKey};

use axolotl_protocol::CIPHERTEXT_MESSAGE_CURRENT_VERSION;
use rand::{CryptoRng, RngCore};
use zeroize::Zeroize;

use crate::curve::{KeyPair, PublicKey};
use crate::error::KeyError;
use crate::identity::{IdentityKey, IdentityKeyPair};
use crate::kdf::hkdf_sha256;
use crate::state::SessionState;

const ROOT_INFO: &[u8] = b"WhisperText";

/// Key material the initiator needs.
pub struct AliceParameters {
    pub our_identity_key_pair: IdentityKeyPair,
    pub our_base_key_pair: KeyPair,
    pub their_identity_key: IdentityKey,
    pub their_signed_pre_key: PublicKey,
    pub their_one_time_pre_key: Option<PublicKey>,
    pub their_ratchet_key: PublicKey,
}

/// Key material the responder needs.
pub struct BobParameters {
    pub our_identity_key_pair: IdentityKeyPair,
    pub our_signed_pre_key_pair: KeyPair,
    pub our_one_time_pre_key_pair: Option<KeyPair>,
    pub our_ratchet_key_pair: KeyPair,
    pub their_identity_key: IdentityKey,
    pub their_base_key: PublicKey,
}

fn derive_keys(secret_input: &[u8]) -> Result<(RootKey, ChainKey), KeyError> {
    let mut secrets = hkdf_sha256(secret_input, None, ROOT_INFO, 64)?;
    let mut root = [0u8; 32];
    let mut chain = [0u8; 32];
    root.copy_from_slice(&secrets[..32]);
    chain.copy_from_slice(&secrets[32..]);
    secrets.zeroize();
    Ok((RootKey::new(root), ChainKey::new(chain, 0)))
}

// Discontinuity bytes prefixed to the agreement outputs.
fn discontinuity() -> Vec<u8> {
    let mut secrets = Vec::with_capacity(32 * 5);
    secrets.extend_from_slice(&[0xFFu8; 32]);
    secrets
}

pub fn initialize_alice_session<R: CryptoRng + RngCore>(
    parameters: &AliceParameters,
    rng: &mut R,
) -> Result<SessionState, KeyError> {
    let our_base = &parameters.our_base_key_pair;
    let sending_ratchet_key = KeyPair::generate(rng);

    let mut secrets = discontinuity();
    secrets.extend_from_slice(
        &parameters
            .our_identity_key_pair
            .private_key()
            .calculate_agreement(&parameters.their_signed_pre_key)?,
    );
    secrets.extend_from_slice(
        &our_base.calculate_agreement(parameters.their_identity_key.public_key())?,
    );
    secrets.extend_from_slice(&our_base.calculate_agreement(&parameters.their_signed_pre_key)?);
    if let Some(their_one_time_pre_key) = &parameters.their_one_time_pre_key {
        secrets.extend_from_slice(&our_base.calculate_agreement(their_one_time_pre_key)?);
    }

    let derived = derive_keys(&secrets);
    secrets.zeroize();
    let (root_key, chain_key) = derived?;

    let (sending_chain_root_key, sending_chain_chain_key) =
        root_key.create_chain(&parameters.their_ratchet_key, &sending_ratchet_key.private_key)?;

    let state = SessionState::new(
        CIPHERTEXT_MESSAGE_CURRENT_VERSION,
        *parameters.our_identity_key_pair.identity_key(),
        parameters.their_identity_key,
        sending_chain_root_key,
        our_base.public_key,
        sending_ratchet_key,
        sending_chain_chain_key,
    )
    .with_receiver_chain(parameters.their_ratchet_key, chain_key);

    Ok(state)
}

pub fn initialize_bob_session(parameters: &BobParameters) -> Result<SessionState, KeyError> {
    let their_base = &parameters.their_base_key;

    let mut secrets = discontinuity();
    secrets.extend_from_slice(
        &parameters
            .our_signed_pre_key_pair
            .calculate_agreement(parameters.their_identity_key.public_key())?,
    );
    secrets.extend_from_slice(
        &parameters
            .our_identity_key_pair
            .private_key()
            .calculate_agreement(their_base)?,
    );
    secrets.extend_from_slice(&parameters.our_signed_pre_key_pair.calculate_agreement(their_base)?);
    if let Some(our_one_time_pre_key_pair) = &parameters.our_one_time_pre_key_pair {
        secrets.extend_from_slice(&our_one_time_pre_key_pair.calculate_agreement(their_base)?);
    }

    let derived = derive_keys(&secrets);
    secrets.zeroize();
    let (root_key, chain_key) = derived?;

    Ok(SessionState::new(
        CIPHERTEXT_MESSAGE_CURRENT_VERSION,
        *parameters.our_identity_key_pair.identity_key(),
        parameters.their_identity_key,
        root_key,
        *their_base,
        parameters.our_ratchet_key_pair.clone(),
        chain_key,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{hex32, key_pair, ALICE_PRIVATE, BOB_PRIVATE, SIGNER_PRIVATE};
    use rand::rngs::OsRng;

    struct Handshake {
        alice: SessionState,
        bob: SessionState,
        bob_signed: KeyPair,
    }

    fn handshake(with_one_time_key: bool) -> Handshake {
        let alice_identity = IdentityKeyPair::generate(&mut OsRng);
        let bob_identity = IdentityKeyPair::generate(&mut OsRng);
        let alice_base = KeyPair::generate(&mut OsRng);
        let bob_signed = KeyPair::generate(&mut OsRng);
        let bob_one_time = with_one_time_key.then(|| KeyPair::generate(&mut OsRng));

        let alice = initialize_alice_session(
            &AliceParameters {
                our_identity_key_pair: alice_identity.clone(),
                our_base_key_pair: alice_base.clone(),
                their_identity_key: *bob_identity.identity_key(),
                their_signed_pre_key: bob_signed.public_key,
                their_one_time_pre_key: bob_one_time.as_ref().map(|k| k.public_key),
                their_ratchet_key: bob_signed.public_key,
            },
            &mut OsRng,
        )
        .unwrap();

        let bob = initialize_bob_session(&BobParameters {
            our_identity_key_pair: bob_identity,
            our_signed_pre_key_pair: bob_signed.clone(),
            our_one_time_pre_key_pair: bob_one_time,
            our_ratchet_key_pair: bob_signed.clone(),
            their_identity_key: *alice_identity.identity_key(),
            their_base_key: alice_base.public_key,
        })
        .unwrap();

        Handshake {
            alice,
            bob,
            bob_signed,
        }
    }

    fn assert_agreement(h: &Handshake) {
        // Alice's first receiver chain is Bob's first sender chain.
        let alice_receiver = h.alice.receiver_chain_key(&h.bob_signed.public_key).unwrap();
        assert_eq!(alice_receiver.key(), h.bob.sender_chain_key().key());

        // Bob's ratchet step on Alice's sending key lands on her sending chain.
        let (root, chain) = h
            .bob
            .root_key()
            .create_chain(h.alice.sender_ratchet_key(), &h.bob_signed.private_key)
            .unwrap();
        assert_eq!(chain.key(), h.alice.sender_chain_key().key());
        assert_eq!(root.key(), h.alice.root_key().key());
    }

    #[test]
    fn both_sides_agree_with_one_time_key() {
        assert_agreement(&handshake(true));
    }

    #[test]
    fn both_sides_agree_without_one_time_key() {
        assert_agreement(&handshake(false));
    }

    #[test]
    fn alice_records_base_key() {
        let h = handshake(true);
        assert_eq!(h.alice.alice_base_key(), h.bob.alice_base_key());
        assert_eq!(h.alice.receiver_chain_count(), 1);
        assert_eq!(h.bob.receiver_chain_count(), 0);
        assert_eq!(h.bob.sender_ratchet_key(), &h.bob_signed.public_key);
    }

    fn identity(private_hex: &str) -> IdentityKeyPair {
        let pair = key_pair(private_hex);
        IdentityKeyPair::new(IdentityKey::new(pair.public_key), pair.private_key)
    }

    // Fixed inputs: Alice's identity and Bob's identity are the RFC 7748 pairs,
    // Alice's base key is the signature-test identity key.
    fn fixed_agreement(with_one_time_key: bool) -> (SessionState, SessionState, PublicKey) {
        let alice_identity = identity(ALICE_PRIVATE);
        let bob_identity = identity(BOB_PRIVATE);
        let alice_base = key_pair(SIGNER_PRIVATE);
        let bob_signed = key_pair("0102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f20");
        let bob_one_time = with_one_time_key
            .then(|| key_pair("4242424242424242424242424242424242424242424242424242424242424242"));

        let alice = initialize_alice_session(
            &AliceParameters {
                our_identity_key_pair: alice_identity.clone(),
                our_base_key_pair: alice_base.clone(),
                their_identity_key: *bob_identity.identity_key(),
                their_signed_pre_key: bob_signed.public_key,
                their_one_time_pre_key: bob_one_time.as_ref().map(|k| k.public_key),
                their_ratchet_key: bob_signed.public_key,
            },
            &mut OsRng,
        )
        .unwrap();
        let bob = initialize_bob_session(&BobParameters {
            our_identity_key_pair: bob_identity,
            our_signed_pre_key_pair: bob_signed.clone(),
            our_one_time_pre_key_pair: bob_one_time,
            our_ratchet_key_pair: bob_signed.clone(),
            their_identity_key: *alice_identity.identity_key(),
            their_base_key: alice_base.public_key,
        })
        .unwrap();
        (alice, bob, bob_signed.public_key)
    }

    #[test]
    fn master_secret_vector_with_one_time_key() {
        let (alice, bob, bob_signed) = fixed_agreement(true);
        let root = hex32("cd8e9819b3339545bf018a3b31f7d5e16a7c1fd808691c99b1422fecbb835328");
        let chain = hex32("084cab5b88ee2d1943d78b0b8ed7251cbcaf48031aa521547f17d6517aff6291");

        assert_eq!(bob.root_key().key(), &root);
        assert_eq!(bob.sender_chain_key().key(), &chain);
        assert_eq!(bob.sender_chain_key().index(), 0);
        assert_eq!(alice.receiver_chain_key(&bob_signed).unwrap().key(), &chain);
    }

    #[test]
    fn master_secret_vector_without_one_time_key() {
        let (alice, bob, bob_signed) = fixed_agreement(false);
        let root = hex32("39f2c23df34a36f1bb18b080579d7c8a27b2bbc073edd9d3648333b66a0735dd");
        let chain = hex32("9fa7b6392e5c86d036505a1b94eeb382d0e177d0d9393891ecc72a6213c3afc5");

        assert_eq!(bob.root_key().key(), &root);
        assert_eq!(bob.sender_chain_key().key(), &chain);
        assert_eq!(alice.receiver_chain_key(&bob_signed).unwrap().key(), &chain);
    }
}
