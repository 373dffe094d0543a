//! Store maintenance and messaging commands.
//!
//! Every command that advances a session seals the store back to disk before
//! anything derived from the new state is handed to the caller.

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use axolotl_crypto::persistence::{load_from_file, save_to_file};
use axolotl_crypto::prekey::{current_bundle, generate_prekeys, generate_replenish_prekeys, prekeys_to_replenish};
use axolotl_crypto::session::establish_session;
use axolotl_crypto::{
    generate_registration_id, IdentityKeyPair, IdentityKeyStore, ProtocolStores, SessionCipher, SessionConfig,
};
use axolotl_protocol::{encode_envelope, try_decode_envelope, PreKeyBundleData, ProtocolAddress};
use bytes::BytesMut;
use rand::rngs::OsRng;
use tracing::{debug, info};

pub fn init(store_path: &Path, password: &str, device_id: u32, prekeys: u32, force: bool) -> Result<()> {
    if store_path.exists() && !force {
        bail!(
            "{} already exists (use --force to replace it)",
            store_path.display()
        );
    }

    let identity = IdentityKeyPair::generate(&mut OsRng);
    let mut stores = ProtocolStores::new(identity, generate_registration_id(&mut OsRng));
    let bundle = generate_prekeys(&mut stores, device_id, 1, prekeys, &mut OsRng)?;
    save_to_file(store_path, &stores, password)?;

    info!(
        path = %store_path.display(),
        registration_id = bundle.registration_id,
        prekeys = bundle.prekeys.len(),
        identity = %stores.identity.identity_key_pair()?.public_key().fingerprint(),
        "initialized store"
    );
    Ok(())
}

pub fn bundle(store_path: &Path, password: &str, device_id: u32, replenish: bool) -> Result<PreKeyBundleData> {
    let mut stores = load_from_file(store_path, password)?;

    if replenish {
        let needed = prekeys_to_replenish(&stores);
        if needed > 0 {
            let start_id = stores.prekey.max_id().map_or(1, |id| id.saturating_add(1));
            generate_replenish_prekeys(&mut stores, start_id, needed, &mut OsRng)?;
            save_to_file(store_path, &stores, password)?;
            info!(added = needed, start_id, "replenished one-time pre-keys");
        }
    }

    Ok(current_bundle(&stores, device_id)?)
}

/// Start a session with `peer` from a bundle previously printed by `bundle`.
pub fn establish(
    store_path: &Path,
    password: &str,
    peer: &ProtocolAddress,
    bundle_path: &Path,
    config: &SessionConfig,
) -> Result<()> {
    let mut stores = load_from_file(store_path, password)?;
    let content = fs::read_to_string(bundle_path)
        .with_context(|| format!("failed to read bundle: {}", bundle_path.display()))?;
    let data: PreKeyBundleData = serde_json::from_str(&content)?;

    establish_session(&mut stores, peer, &data, config)?;
    save_to_file(store_path, &stores, password)?;
    info!(%peer, registration_id = data.registration_id, "established session");
    Ok(())
}

/// Encrypt `plaintext` for `peer` and return the framed envelope.
pub fn encrypt(
    store_path: &Path,
    password: &str,
    peer: &ProtocolAddress,
    plaintext: &[u8],
    config: &SessionConfig,
) -> Result<Vec<u8>> {
    let mut stores = load_from_file(store_path, password)?;
    let message = SessionCipher::from_stores(peer.clone(), &mut stores, config.clone()).encrypt(plaintext)?;
    let framed = encode_envelope(&message)?;

    // the advanced sender chain must be durable before the message leaves
    save_to_file(store_path, &stores, password)?;
    debug!(%peer, message_type = ?message.message_type(), bytes = framed.len(), "encrypted");
    Ok(framed)
}

/// Decrypt a framed envelope from `peer`.
pub fn decrypt(
    store_path: &Path,
    password: &str,
    peer: &ProtocolAddress,
    framed: &[u8],
    config: &SessionConfig,
) -> Result<Vec<u8>> {
    let mut stores = load_from_file(store_path, password)?;
    let mut buf = BytesMut::from(framed);
    let message = try_decode_envelope(&mut buf)?.context("truncated message envelope")?;
    if !buf.is_empty() {
        bail!("{} trailing bytes after message envelope", buf.len());
    }

    let plaintext = SessionCipher::from_stores(peer.clone(), &mut stores, config.clone()).decrypt(&message)?;

    // consumed keys are gone on disk before the plaintext is released
    save_to_file(store_path, &stores, password)?;
    debug!(%peer, message_type = ?message.message_type(), "decrypted");
    Ok(plaintext)
}

pub fn inspect(store_path: &Path, password: &str) -> Result<Vec<String>> {
    let stores = load_from_file(store_path, password)?;
    Ok(describe(&stores))
}

fn describe(stores: &ProtocolStores) -> Vec<String> {
    let mut lines = Vec::new();
    let identity = stores
        .identity
        .identity_key_pair()
        .map(|pair| pair.public_key().fingerprint())
        .unwrap_or_else(|_| "unavailable".into());
    lines.push(format!(
        "identity {identity} registration {} one-time pre-keys {}",
        stores.identity.registration_id(),
        stores.prekey.len()
    ));

    for (address, record) in stores.session.records() {
        match record.session_state() {
            Some(state) => lines.push(format!(
                "{address}: v{} sender {} @{} receiver chains {} skipped keys {} archived {}{}",
                state.version(),
                state.sender_ratchet_key().fingerprint(),
                state.sender_chain_key().index(),
                state.receiver_chain_count(),
                state.skipped_keys().len(),
                record.previous_session_count(),
                if state.pending_pre_key().is_some() {
                    " (unacknowledged)"
                } else {
                    ""
                },
            )),
            None => lines.push(format!(
                "{address}: no current session, archived {}",
                record.previous_session_count()
            )),
        }
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use axolotl_crypto::persistence::{seal_stores_with_iterations, write_atomic};
    use axolotl_crypto::{MessageError, SessionError};

    #[test]
    fn describe_lists_sessions() {
        let mut alice = ProtocolStores::new(IdentityKeyPair::generate(&mut OsRng), 1);
        let mut bob = ProtocolStores::new(IdentityKeyPair::generate(&mut OsRng), 2);
        let data = generate_prekeys(&mut bob, 1, 1, 2, &mut OsRng).unwrap();
        establish_session(
            &mut alice,
            &ProtocolAddress::new("bob", 1),
            &data,
            &SessionConfig::default(),
        )
        .unwrap();

        let lines = describe(&alice);
        assert_eq!(lines.len(), 2);
        assert!(lines[1].starts_with("bob.1: v3"));
        assert!(lines[1].ends_with("(unacknowledged)"));
    }

    #[test]
    fn bundle_replenishes_and_persists() {
        let path = std::env::temp_dir().join(format!("axolotl-tool-bundle-{}.bin", std::process::id()));
        let mut stores = ProtocolStores::new(IdentityKeyPair::generate(&mut OsRng), 5);
        generate_prekeys(&mut stores, 1, 1, 2, &mut OsRng).unwrap();
        write_atomic(&path, &seal_stores_with_iterations(&stores, "pw", 1_000).unwrap()).unwrap();

        let published = bundle(&path, "pw", 1, true).unwrap();
        assert_eq!(published.registration_id, 5);
        assert_eq!(
            published.prekeys.len(),
            axolotl_crypto::prekey::INITIAL_PREKEY_COUNT as usize
        );
        // the top-up was written back
        let reloaded = load_from_file(&path, "pw").unwrap();
        assert_eq!(
            reloaded.prekey.len(),
            axolotl_crypto::prekey::INITIAL_PREKEY_COUNT as usize
        );
        assert_eq!(inspect(&path, "pw").unwrap().len(), 1);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn init_refuses_to_overwrite() {
        let path = std::env::temp_dir().join(format!("axolotl-tool-init-{}.bin", std::process::id()));
        fs::write(&path, b"existing").unwrap();
        assert!(init(&path, "pw", 1, 1, false).is_err());
        assert_eq!(fs::read(&path).unwrap(), b"existing");
        fs::remove_file(&path).unwrap();
    }

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("axolotl-tool-{name}-{}.bin", std::process::id()))
    }

    fn seeded_store(path: &Path, registration_id: u32, prekeys: u32) {
        let mut stores = ProtocolStores::new(IdentityKeyPair::generate(&mut OsRng), registration_id);
        if prekeys > 0 {
            generate_prekeys(&mut stores, 1, 1, prekeys, &mut OsRng).unwrap();
        }
        write_atomic(path, &seal_stores_with_iterations(&stores, "pw", 1_000).unwrap()).unwrap();
    }

    #[test]
    fn decrypted_message_stays_consumed_on_disk() {
        let config = SessionConfig::default();
        let alice_path = temp_path("alice");
        let bob_path = temp_path("bob");
        let bundle_path = temp_path("bob-bundle").with_extension("json");
        seeded_store(&alice_path, 1, 0);
        seeded_store(&bob_path, 2, 3);
        let alice = ProtocolAddress::new("alice", 1);
        let bob = ProtocolAddress::new("bob", 1);

        let published = bundle(&bob_path, "pw", 1, false).unwrap();
        fs::write(&bundle_path, serde_json::to_string(&published).unwrap()).unwrap();
        establish(&alice_path, "pw", &bob, &bundle_path, &config).unwrap();

        let framed = encrypt(&alice_path, "pw", &bob, b"persisted", &config).unwrap();
        assert_eq!(decrypt(&bob_path, "pw", &alice, &framed, &config).unwrap(), b"persisted");

        // a fresh load from disk must remember the consumed message key
        let err = decrypt(&bob_path, "pw", &alice, &framed, &config).unwrap_err();
        let session_error = err.downcast_ref::<SessionError>().unwrap();
        assert!(matches!(
            session_error.message_error(),
            Some(MessageError::DuplicateMessage { .. })
        ));

        // and the sender's chain advanced on disk too
        let second = encrypt(&alice_path, "pw", &bob, b"again", &config).unwrap();
        assert_ne!(second, framed);
        assert_eq!(decrypt(&bob_path, "pw", &alice, &second, &config).unwrap(), b"again");
        assert_eq!(inspect(&bob_path, "pw").unwrap().len(), 2);

        for path in [alice_path, bob_path, bundle_path] {
            fs::remove_file(&path).unwrap();
        }
    }

    #[test]
    fn decrypt_rejects_truncated_envelope() {
        let path = temp_path("truncated");
        seeded_store(&path, 3, 0);
        let err = decrypt(&path, "pw", &ProtocolAddress::new("x", 1), &[0x03], &SessionConfig::default());
        assert!(err.is_err());
        fs::remove_file(&path).unwrap();
    }
}
