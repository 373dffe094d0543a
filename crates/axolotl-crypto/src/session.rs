//! Convenience calls over [`ProtocolStores`] for hosts that keep every store
//! in memory and move ciphertexts around as (bytes, type number) pairs.

use axolotl_protocol::{CiphertextMessage, PreKeyBundleData, ProtocolAddress};
use rand::rngs::OsRng;

use crate::builder::process_prekey_bundle;
use crate::cipher::SessionCipher;
use crate::config::SessionConfig;
use crate::error::Result;
use crate::prekey::bundle_from_data;
use crate::stores::{ProtocolStores, SessionStore};

/// Process a remote device's published bundle to establish a session.
pub fn establish_session(
    stores: &mut ProtocolStores,
    remote: &ProtocolAddress,
    bundle_data: &PreKeyBundleData,
    config: &SessionConfig,
) -> Result<()> {
    let bundle = bundle_from_data(bundle_data, None)?;
    process_prekey_bundle(
        remote,
        &mut stores.session,
        &mut stores.identity,
        &bundle,
        config,
        &mut OsRng,
    )
}

/// Encrypt for an established session.
/// Returns the serialized message and its type number.
pub fn encrypt_message(
    stores: &mut ProtocolStores,
    remote: &ProtocolAddress,
    plaintext: &[u8],
    config: &SessionConfig,
) -> Result<(Vec<u8>, u8)> {
    let message = SessionCipher::from_stores(remote.clone(), stores, config.clone()).encrypt(plaintext)?;
    Ok((message.serialize().to_vec(), message.message_type() as u8))
}

/// Decrypt a serialized message of the given type number.
pub fn decrypt_message(
    stores: &mut ProtocolStores,
    remote: &ProtocolAddress,
    ciphertext: &[u8],
    message_type: u8,
    config: &SessionConfig,
) -> Result<Vec<u8>> {
    let message = CiphertextMessage::deserialize(message_type, ciphertext)?;
    SessionCipher::from_stores(remote.clone(), stores, config.clone()).decrypt(&message)
}

/// Check if we have an established session with a device.
pub fn has_session(stores: &ProtocolStores, remote: &ProtocolAddress) -> bool {
    stores.session.contains_session(remote).unwrap_or(false)
}
