//! Session setup from a published bundle (initiator) or from the first
//! pre-key message of a peer (responder).

use axolotl_protocol::{PreKeyId, PreKeySignalMessage, ProtocolAddress};
use rand::{CryptoRng, RngCore};
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::curve::{KeyPair, PublicKey};
use crate::error::{Result, SessionFault};
use crate::identity::IdentityKey;
use crate::prekey::PreKeyBundle;
use crate::ratchet::{initialize_alice_session, initialize_bob_session, AliceParameters, BobParameters};
use crate::record::SessionRecord;
use crate::stores::{Direction, IdentityKeyStore, PreKeyStore, SessionStore, SignedPreKeyStore};

/// Start a session with `remote_address` from its published bundle.
///
/// Messages encrypted on the new session carry the bundle identifiers until
/// the peer replies.
pub fn process_prekey_bundle<R: CryptoRng + RngCore>(
    remote_address: &ProtocolAddress,
    session_store: &mut dyn SessionStore,
    identity_store: &mut dyn IdentityKeyStore,
    bundle: &PreKeyBundle,
    config: &SessionConfig,
    rng: &mut R,
) -> Result<()> {
    let their_identity_key = bundle.identity_key();

    if !identity_store.is_trusted_identity(remote_address, their_identity_key, Direction::Sending)? {
        warn!(address = %remote_address, "untrusted identity in pre-key bundle");
        return Err(SessionFault::UntrustedIdentity(remote_address.clone()).into());
    }

    if !bundle.has_valid_signature() {
        return Err(SessionFault::SignatureValidationFailed.into());
    }

    let mut session_record = session_store.load_session(remote_address)?;

    let our_base_key_pair = KeyPair::generate(rng);
    let their_signed_prekey = *bundle.signed_pre_key_public();

    let parameters = AliceParameters {
        our_identity_key_pair: identity_store.identity_key_pair()?,
        our_base_key_pair: our_base_key_pair.clone(),
        their_identity_key: *their_identity_key,
        their_signed_pre_key: their_signed_prekey,
        their_one_time_pre_key: bundle.pre_key_public().copied(),
        their_ratchet_key: their_signed_prekey,
    };

    let mut session = initialize_alice_session(&parameters, rng)?;

    info!(
        address = %remote_address,
        signed_prekey_id = bundle.signed_pre_key_id(),
        one_time_prekey_id = ?bundle.pre_key_id(),
        base_key = %our_base_key_pair.public_key.fingerprint(),
        "set up outgoing session"
    );

    session.set_pending_pre_key(
        bundle.pre_key_id(),
        bundle.signed_pre_key_id(),
        our_base_key_pair.public_key,
    );
    session.set_local_registration_id(identity_store.local_registration_id()?);
    session.set_remote_registration_id(bundle.registration_id());

    identity_store.save_identity(remote_address, their_identity_key)?;

    session_record.promote_state(session, config.max_archived_states);
    session_store.store_session(remote_address, &session_record)?;

    Ok(())
}

/// Build the responder side of a session from an incoming pre-key message.
///
/// Returns the one-time pre-key id the message consumed, which the caller
/// removes once the session is stored. Returns `None` when the record already
/// holds a state built from the same base key (a retransmitted first message).
pub(crate) fn process_prekey(
    message: &PreKeySignalMessage,
    remote_address: &ProtocolAddress,
    session_record: &mut SessionRecord,
    identity_store: &dyn IdentityKeyStore,
    pre_key_store: &dyn PreKeyStore,
    signed_pre_key_store: &dyn SignedPreKeyStore,
    config: &SessionConfig,
) -> Result<Option<PreKeyId>> {
    let their_identity_key = IdentityKey::new(PublicKey::from_raw(*message.identity_key()));

    if !identity_store.is_trusted_identity(remote_address, &their_identity_key, Direction::Receiving)? {
        warn!(address = %remote_address, "untrusted identity in pre-key message");
        return Err(SessionFault::UntrustedIdentity(remote_address.clone()).into());
    }

    let their_base_key = PublicKey::from_raw(*message.base_key());

    if session_record.has_session_state(message.message_version(), &their_base_key) {
        debug!(address = %remote_address, "pre-key message for an existing session");
        return Ok(None);
    }

    let our_signed_pre_key_pair = signed_pre_key_store
        .load_signed_pre_key(message.signed_pre_key_id())?
        .key_pair()
        .clone();

    let our_one_time_pre_key_pair = match message.pre_key_id() {
        Some(id) => Some(pre_key_store.load_pre_key(id)?.key_pair().clone()),
        None => {
            warn!(address = %remote_address, "pre-key message without a one-time pre-key");
            None
        }
    };

    let parameters = BobParameters {
        our_identity_key_pair: identity_store.identity_key_pair()?,
        our_ratchet_key_pair: our_signed_pre_key_pair.clone(),
        our_signed_pre_key_pair,
        our_one_time_pre_key_pair,
        their_identity_key,
        their_base_key,
    };

    let mut new_session = initialize_bob_session(&parameters)?;
    new_session.set_local_registration_id(identity_store.local_registration_id()?);
    new_session.set_remote_registration_id(message.registration_id());

    info!(
        address = %remote_address,
        signed_prekey_id = message.signed_pre_key_id(),
        one_time_prekey_id = ?message.pre_key_id(),
        base_key = %their_base_key.fingerprint(),
        "set up incoming session"
    );

    session_record.promote_state(new_session, config.max_archived_states);

    Ok(message.pre_key_id())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{MessageError, SessionError};
    use crate::identity::IdentityKeyPair;
    use crate::prekey::{bundle_from_data, generate_prekeys};
    use crate::stores::ProtocolStores;
    use axolotl_protocol::{SignalMessage, CIPHERTEXT_MESSAGE_CURRENT_VERSION};
    use rand::rngs::OsRng;

    fn party(registration_id: u32) -> ProtocolStores {
        ProtocolStores::new(IdentityKeyPair::generate(&mut OsRng), registration_id)
    }

    fn bob_bundle(bob: &mut ProtocolStores) -> PreKeyBundle {
        let data = generate_prekeys(bob, 1, 1, 2, &mut OsRng).unwrap();
        bundle_from_data(&data, None).unwrap()
    }

    #[test]
    fn bundle_sets_pending_prekey() {
        let mut alice = party(1);
        let mut bob = party(2);
        let bundle = bob_bundle(&mut bob);
        let bob_address = ProtocolAddress::new("bob", 1);

        process_prekey_bundle(
            &bob_address,
            &mut alice.session,
            &mut alice.identity,
            &bundle,
            &SessionConfig::default(),
            &mut OsRng,
        )
        .unwrap();

        let record = alice.session.load_session(&bob_address).unwrap();
        let state = record.session_state().unwrap();
        let pending = state.pending_pre_key().unwrap();
        assert_eq!(pending.pre_key_id, Some(1));
        assert_eq!(pending.signed_pre_key_id, 1);
        assert_eq!(state.remote_registration_id(), 2);
        assert_eq!(state.local_registration_id(), 1);
        assert_eq!(
            alice.identity.identity(&bob_address).unwrap(),
            Some(*bundle.identity_key())
        );
    }

    #[test]
    fn bad_signature_is_rejected() {
        let mut alice = party(1);
        let mut bob = party(2);
        let mut data = generate_prekeys(&mut bob, 1, 1, 1, &mut OsRng).unwrap();
        data.signed_prekey_signature[5] ^= 0x80;
        let bundle = bundle_from_data(&data, None).unwrap();
        let bob_address = ProtocolAddress::new("bob", 1);

        let err = process_prekey_bundle(
            &bob_address,
            &mut alice.session,
            &mut alice.identity,
            &bundle,
            &SessionConfig::default(),
            &mut OsRng,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            SessionError::Session(SessionFault::SignatureValidationFailed)
        ));
        assert!(!alice.session.contains_session(&bob_address).unwrap());
    }

    #[test]
    fn changed_identity_is_untrusted() {
        let mut alice = party(1);
        let mut bob = party(2);
        let bundle = bob_bundle(&mut bob);
        let bob_address = ProtocolAddress::new("bob", 1);
        alice
            .identity
            .save_identity(&bob_address, IdentityKeyPair::generate(&mut OsRng).identity_key())
            .unwrap();

        let err = process_prekey_bundle(
            &bob_address,
            &mut alice.session,
            &mut alice.identity,
            &bundle,
            &SessionConfig::default(),
            &mut OsRng,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            SessionError::Session(SessionFault::UntrustedIdentity(_))
        ));
    }

    fn dummy_prekey_message(signed_pre_key_id: u32, pre_key_id: Option<u32>) -> PreKeySignalMessage {
        let identity = IdentityKeyPair::generate(&mut OsRng);
        let inner = SignalMessage::new(
            CIPHERTEXT_MESSAGE_CURRENT_VERSION,
            &[0u8; 32],
            *KeyPair::generate(&mut OsRng).public_key.public_key_bytes(),
            0,
            0,
            &[0u8; 16],
            identity.public_key().public_key_bytes(),
            identity.public_key().public_key_bytes(),
        );
        PreKeySignalMessage::new(
            CIPHERTEXT_MESSAGE_CURRENT_VERSION,
            9,
            pre_key_id,
            signed_pre_key_id,
            *KeyPair::generate(&mut OsRng).public_key.public_key_bytes(),
            *identity.public_key().public_key_bytes(),
            inner,
        )
    }

    #[test]
    fn unknown_prekey_ids_are_reported() {
        let mut bob = party(2);
        bob_bundle(&mut bob);
        let alice_address = ProtocolAddress::new("alice", 1);
        let config = SessionConfig::default();

        let mut record = SessionRecord::new_fresh();
        let err = process_prekey(
            &dummy_prekey_message(77, Some(1)),
            &alice_address,
            &mut record,
            &bob.identity,
            &bob.prekey,
            &bob.signed_prekey,
            &config,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            SessionError::Message(MessageError::InvalidSignedPreKeyId(77))
        ));

        let err = process_prekey(
            &dummy_prekey_message(1, Some(500)),
            &alice_address,
            &mut record,
            &bob.identity,
            &bob.prekey,
            &bob.signed_prekey,
            &config,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            SessionError::Message(MessageError::InvalidPreKeyId(500))
        ));
        assert!(record.is_fresh());
    }

    #[test]
    fn repeated_base_key_short_circuits() {
        let mut bob = party(2);
        bob_bundle(&mut bob);
        let alice_address = ProtocolAddress::new("alice", 1);
        let config = SessionConfig::default();
        let message = dummy_prekey_message(1, Some(1));

        let mut record = SessionRecord::new_fresh();
        let used = process_prekey(
            &message,
            &alice_address,
            &mut record,
            &bob.identity,
            &bob.prekey,
            &bob.signed_prekey,
            &config,
        )
        .unwrap();
        assert_eq!(used, Some(1));
        assert!(record.session_state().is_some());

        let again = process_prekey(
            &message,
            &alice_address,
            &mut record,
            &bob.identity,
            &bob.prekey,
            &bob.signed_prekey,
            &config,
        )
        .unwrap();
        assert_eq!(again, None);
        assert_eq!(record.previous_session_count(), 0);
    }
}
