//! Sealed sender: hides who sent a message from everyone but the recipient.
//!
//! The envelope is sealed in two layers. An agreement between a fresh
//! ephemeral key and the recipient's identity key seals the sender's identity
//! key. An agreement between the two identity keys then seals the content:
//! the sender certificate plus the session message it wraps. The recipient
//! trusts the sender's address only after the certificate chains back to a
//! known trust root.

use axolotl_protocol::{
    CiphertextMessageType, PreKeySignalMessage, ProtocolAddress, SealedContent, SealedEnvelope,
    SealedMessageType, SenderCertificate, ServerCertificate, SignalMessage,
};
use rand::{CryptoRng, RngCore};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::cipher::SessionCipher;
use crate::config::SessionConfig;
use crate::curve::{KeyPair, PrivateKey, PublicKey};
use crate::error::{KeyError, SealedSenderError};
use crate::identity::{IdentityKey, IdentityKeyPair};
use crate::kdf::{aes_256_ctr, hkdf_sha256, hmac_sha256};
use crate::stores::{IdentityKeyStore, PreKeyStore, ProtocolStores, SessionStore, SignedPreKeyStore};

const SALT_PREFIX: &[u8] = b"UnidentifiedDelivery";
const MAC_LENGTH: usize = 10;
const DERIVED_LENGTH: usize = 96;

const FALLBACK_INFO: &[u8] = b"AxolotlFallbackCipher";
const FALLBACK_NONCE_LENGTH: usize = 12;

type SealedResult<T> = std::result::Result<T, SealedSenderError>;

/// Sign a server key with the trust root.
pub fn issue_server_certificate<R: CryptoRng + RngCore>(
    trust_root: &PrivateKey,
    key_id: u32,
    key: &PublicKey,
    rng: &mut R,
) -> SealedResult<ServerCertificate> {
    let certificate = ServerCertificate::certificate_bytes(key_id, key.public_key_bytes());
    let signature = trust_root.calculate_signature(&certificate, rng);
    Ok(ServerCertificate::from_signed(certificate, signature.to_vec())?)
}

/// Vouch for `sender`'s identity key until `expires` (unix milliseconds).
pub fn issue_sender_certificate<R: CryptoRng + RngCore>(
    signer: &ServerCertificate,
    signing_key: &PrivateKey,
    sender: &ProtocolAddress,
    identity_key: &IdentityKey,
    expires: u64,
    rng: &mut R,
) -> SealedResult<SenderCertificate> {
    let certificate = SenderCertificate::certificate_bytes(
        sender.name(),
        sender.device_id(),
        expires,
        identity_key.public_key().public_key_bytes(),
        signer,
    );
    let signature = signing_key.calculate_signature(&certificate, rng);
    Ok(SenderCertificate::from_signed(certificate, signature.to_vec())?)
}

/// Checks sender certificates against a trust root.
#[derive(Debug, Clone)]
pub struct CertificateValidator {
    trust_root: PublicKey,
}

impl CertificateValidator {
    pub fn new(trust_root: PublicKey) -> Self {
        Self { trust_root }
    }

    /// `validation_time` is in the same unit as the certificate's expiry.
    pub fn validate(&self, certificate: &SenderCertificate, validation_time: u64) -> SealedResult<()> {
        let server = certificate.signer();
        if !self
            .trust_root
            .verify_signature(server.certificate(), server.signature())
        {
            return Err(SealedSenderError::InvalidCertificate("server certificate not signed by trust root"));
        }

        let server_key = PublicKey::from_raw(*server.key());
        if !server_key.verify_signature(certificate.certificate(), certificate.signature()) {
            return Err(SealedSenderError::InvalidCertificate("bad sender certificate signature"));
        }

        if validation_time > certificate.expires() {
            return Err(SealedSenderError::InvalidCertificate("sender certificate expired"));
        }

        Ok(())
    }
}

#[derive(Zeroize, ZeroizeOnDrop)]
struct EphemeralKeys {
    chain_key: [u8; 32],
    cipher_key: [u8; 32],
    mac_key: [u8; 32],
}

#[derive(Zeroize, ZeroizeOnDrop)]
struct StaticKeys {
    cipher_key: [u8; 32],
    mac_key: [u8; 32],
}

fn derive_secrets(their_key: &PublicKey, our_key: &PrivateKey, salt: &[u8]) -> Result<[[u8; 32]; 3], KeyError> {
    let mut shared = our_key.calculate_agreement(their_key)?;
    let derived = hkdf_sha256(&shared, Some(salt), &[], DERIVED_LENGTH);
    shared.zeroize();
    let mut derived = derived?;

    let mut parts = [[0u8; 32]; 3];
    for (part, chunk) in parts.iter_mut().zip(derived.chunks_exact(32)) {
        part.copy_from_slice(chunk);
    }
    derived.zeroize();
    Ok(parts)
}

impl EphemeralKeys {
    fn derive(their_key: &PublicKey, our_key: &PrivateKey, salt: &[u8]) -> Result<Self, KeyError> {
        let [chain_key, cipher_key, mac_key] = derive_secrets(their_key, our_key, salt)?;
        Ok(Self {
            chain_key,
            cipher_key,
            mac_key,
        })
    }
}

impl StaticKeys {
    fn derive(their_key: &PublicKey, our_key: &PrivateKey, salt: &[u8]) -> Result<Self, KeyError> {
        let [mut unused, cipher_key, mac_key] = derive_secrets(their_key, our_key, salt)?;
        unused.zeroize();
        Ok(Self { cipher_key, mac_key })
    }
}

fn ephemeral_salt(recipient_identity: &PublicKey, ephemeral: &PublicKey) -> Vec<u8> {
    let mut salt = Vec::with_capacity(SALT_PREFIX.len() + 66);
    salt.extend_from_slice(SALT_PREFIX);
    salt.extend_from_slice(&recipient_identity.serialize());
    salt.extend_from_slice(&ephemeral.serialize());
    salt
}

fn static_salt(chain_key: &[u8; 32], encrypted_static: &[u8]) -> Vec<u8> {
    [&chain_key[..], encrypted_static].concat()
}

// AES-256-CTR followed by a truncated HMAC-SHA256 of the ciphertext.
fn encrypt_with_mac(cipher_key: &[u8; 32], mac_key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, KeyError> {
    let mut ciphertext = aes_256_ctr(plaintext, cipher_key)?;
    let mac = hmac_sha256(mac_key, &ciphertext);
    ciphertext.extend_from_slice(&mac[..MAC_LENGTH]);
    Ok(ciphertext)
}

fn decrypt_with_mac(cipher_key: &[u8; 32], mac_key: &[u8; 32], data: &[u8]) -> SealedResult<Vec<u8>> {
    if data.len() < MAC_LENGTH {
        return Err(SealedSenderError::InvalidMessage);
    }
    let (ciphertext, their_mac) = data.split_at(data.len() - MAC_LENGTH);
    let our_mac = hmac_sha256(mac_key, ciphertext);
    if !bool::from(our_mac[..MAC_LENGTH].ct_eq(their_mac)) {
        return Err(SealedSenderError::InvalidMessage);
    }
    aes_256_ctr(ciphertext, cipher_key).map_err(|_| SealedSenderError::InvalidMessage)
}

fn seal(
    ephemeral: &KeyPair,
    recipient_identity: &IdentityKey,
    our_identity: &IdentityKeyPair,
    content: &SealedContent,
) -> Result<SealedEnvelope, KeyError> {
    let salt = ephemeral_salt(recipient_identity.public_key(), &ephemeral.public_key);
    let ephemeral_keys = EphemeralKeys::derive(recipient_identity.public_key(), &ephemeral.private_key, &salt)?;
    let encrypted_static = encrypt_with_mac(
        &ephemeral_keys.cipher_key,
        &ephemeral_keys.mac_key,
        &our_identity.identity_key().serialize(),
    )?;

    let salt = static_salt(&ephemeral_keys.chain_key, &encrypted_static);
    let static_keys = StaticKeys::derive(recipient_identity.public_key(), our_identity.private_key(), &salt)?;
    let encrypted_message = encrypt_with_mac(&static_keys.cipher_key, &static_keys.mac_key, &content.serialize())?;

    Ok(SealedEnvelope::new(
        *ephemeral.public_key.public_key_bytes(),
        encrypted_static,
        encrypted_message,
    ))
}

// Recovers the sender's identity key and the sealed content.
fn unseal(envelope: &SealedEnvelope, our_identity: &IdentityKeyPair) -> SealedResult<(IdentityKey, SealedContent)> {
    let ephemeral = PublicKey::from_raw(*envelope.ephemeral_public());
    let salt = ephemeral_salt(our_identity.public_key(), &ephemeral);
    let ephemeral_keys = EphemeralKeys::derive(&ephemeral, our_identity.private_key(), &salt)?;
    let static_bytes = decrypt_with_mac(
        &ephemeral_keys.cipher_key,
        &ephemeral_keys.mac_key,
        envelope.encrypted_static(),
    )?;
    let sender_identity = IdentityKey::decode(&static_bytes).map_err(|_| SealedSenderError::InvalidMessage)?;

    let salt = static_salt(&ephemeral_keys.chain_key, envelope.encrypted_static());
    let static_keys = StaticKeys::derive(sender_identity.public_key(), our_identity.private_key(), &salt)?;
    let content_bytes = decrypt_with_mac(&static_keys.cipher_key, &static_keys.mac_key, envelope.encrypted_message())?;
    let content = SealedContent::try_from(&content_bytes[..]).map_err(|_| SealedSenderError::InvalidMessage)?;

    Ok((sender_identity, content))
}

fn fallback_key(our_key: &PrivateKey, their_identity: &IdentityKey) -> Result<LessSafeKey, KeyError> {
    let mut shared = our_key.calculate_agreement(their_identity.public_key())?;
    let derived = hkdf_sha256(&shared, None, FALLBACK_INFO, 32);
    shared.zeroize();
    let mut derived = derived?;
    let unbound = UnboundKey::new(&AES_256_GCM, &derived).map_err(|_| KeyError::InvalidCipherInput);
    derived.zeroize();
    Ok(LessSafeKey::new(unbound?))
}

// Session-less encryption straight to the peer's identity key: nonce || AES-256-GCM.
fn fallback_encrypt<R: CryptoRng + RngCore>(
    our_key: &PrivateKey,
    their_identity: &IdentityKey,
    plaintext: &[u8],
    rng: &mut R,
) -> Result<Vec<u8>, KeyError> {
    let key = fallback_key(our_key, their_identity)?;
    let mut nonce_bytes = [0u8; FALLBACK_NONCE_LENGTH];
    rng.fill_bytes(&mut nonce_bytes);

    let mut in_out = plaintext.to_vec();
    key.seal_in_place_append_tag(Nonce::assume_unique_for_key(nonce_bytes), Aad::empty(), &mut in_out)
        .map_err(|_| KeyError::InvalidCipherInput)?;

    let mut out = Vec::with_capacity(FALLBACK_NONCE_LENGTH + in_out.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&in_out);
    Ok(out)
}

fn fallback_decrypt(our_key: &PrivateKey, their_identity: &IdentityKey, data: &[u8]) -> SealedResult<Vec<u8>> {
    if data.len() < FALLBACK_NONCE_LENGTH + AES_256_GCM.tag_len() {
        return Err(SealedSenderError::InvalidMessage);
    }
    let key = fallback_key(our_key, their_identity)?;
    let (nonce_bytes, ciphertext) = data.split_at(FALLBACK_NONCE_LENGTH);
    let nonce = Nonce::try_assume_unique_for_key(nonce_bytes).map_err(|_| SealedSenderError::InvalidMessage)?;

    let mut in_out = ciphertext.to_vec();
    let plaintext = key
        .open_in_place(nonce, Aad::empty(), &mut in_out)
        .map_err(|_| SealedSenderError::InvalidMessage)?;
    Ok(plaintext.to_vec())
}

/// What a sealed envelope turned out to contain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedDecryption {
    pub sender: ProtocolAddress,
    pub message_type: SealedMessageType,
    pub plaintext: Vec<u8>,
}

/// Wraps [`SessionCipher`] so that messages travel in sealed envelopes.
pub struct SealedSessionCipher<'a> {
    session_store: &'a mut dyn SessionStore,
    identity_store: &'a mut dyn IdentityKeyStore,
    pre_key_store: &'a mut dyn PreKeyStore,
    signed_pre_key_store: &'a mut dyn SignedPreKeyStore,
    config: SessionConfig,
}

impl<'a> SealedSessionCipher<'a> {
    pub fn new(
        session_store: &'a mut dyn SessionStore,
        identity_store: &'a mut dyn IdentityKeyStore,
        pre_key_store: &'a mut dyn PreKeyStore,
        signed_pre_key_store: &'a mut dyn SignedPreKeyStore,
        config: SessionConfig,
    ) -> Self {
        Self {
            session_store,
            identity_store,
            pre_key_store,
            signed_pre_key_store,
            config,
        }
    }

    pub fn from_stores(stores: &'a mut ProtocolStores, config: SessionConfig) -> Self {
        Self::new(
            &mut stores.session,
            &mut stores.identity,
            &mut stores.prekey,
            &mut stores.signed_prekey,
            config,
        )
    }

    fn session_cipher(&mut self, remote_address: ProtocolAddress) -> SessionCipher<'_> {
        SessionCipher::new(
            remote_address,
            &mut *self.session_store,
            &mut *self.identity_store,
            &mut *self.pre_key_store,
            &mut *self.signed_pre_key_store,
            self.config.clone(),
        )
    }

    /// Encrypt `plaintext` for `destination` and seal it with our certificate.
    ///
    /// With `use_fallback` the content is encrypted straight to the
    /// recipient's identity key and no session is needed or touched.
    pub fn encrypt<R: CryptoRng + RngCore>(
        &mut self,
        destination: &ProtocolAddress,
        sender_certificate: &SenderCertificate,
        plaintext: &[u8],
        use_fallback: bool,
        rng: &mut R,
    ) -> SealedResult<Vec<u8>> {
        let our_identity = self.identity_store.identity_key_pair()?;
        let their_identity = self
            .identity_store
            .identity(destination)?
            .ok_or_else(|| SealedSenderError::UnknownRecipientIdentity(destination.clone()))?;

        let (message_type, content) = if use_fallback {
            let content = fallback_encrypt(our_identity.private_key(), &their_identity, plaintext, rng)?;
            (SealedMessageType::Fallback, content)
        } else {
            let message = self.session_cipher(destination.clone()).encrypt(plaintext)?;
            let message_type = match message.message_type() {
                CiphertextMessageType::PreKey => SealedMessageType::PreKey,
                CiphertextMessageType::Whisper => SealedMessageType::Whisper,
            };
            (message_type, message.serialize().to_vec())
        };

        let content = SealedContent::new(message_type, sender_certificate.clone(), content);
        let ephemeral = KeyPair::generate(rng);
        let envelope = seal(&ephemeral, &their_identity, &our_identity, &content)?;

        debug!(address = %destination, ?message_type, "sealed message");
        Ok(envelope.serialize())
    }

    /// Open a sealed envelope addressed to `local_address`.
    ///
    /// `timestamp` is checked against the sender certificate's expiry.
    pub fn decrypt(
        &mut self,
        validator: &CertificateValidator,
        ciphertext: &[u8],
        timestamp: u64,
        local_address: &ProtocolAddress,
    ) -> SealedResult<SealedDecryption> {
        let our_identity = self.identity_store.identity_key_pair()?;
        let envelope = SealedEnvelope::try_from(ciphertext)?;
        let (sender_identity, content) = unseal(&envelope, &our_identity)?;

        let certificate = content.sender_certificate();
        let sender = ProtocolAddress::new(certificate.sender(), certificate.sender_device());
        let message_type = content.message_type();

        if &sender == local_address {
            info!(address = %sender, "discarding self-sent message");
            return Err(SealedSenderError::SelfSend);
        }

        let known_sender = |source: SealedSenderError| SealedSenderError::KnownSender {
            sender: sender.clone(),
            message_type,
            source: Box::new(source),
        };

        validator
            .validate(certificate, timestamp)
            .map_err(&known_sender)?;

        let certified_key = certificate.identity_key();
        if !bool::from(certified_key[..].ct_eq(&sender_identity.public_key().public_key_bytes()[..])) {
            warn!(address = %sender, "sender certificate does not match sealed identity");
            return Err(known_sender(SealedSenderError::SenderKeyMismatch));
        }

        let plaintext = self
            .decrypt_content(&sender, &sender_identity, &our_identity, &content)
            .map_err(&known_sender)?;

        debug!(address = %sender, ?message_type, "opened sealed message");
        Ok(SealedDecryption {
            sender,
            message_type,
            plaintext,
        })
    }

    fn decrypt_content(
        &mut self,
        sender: &ProtocolAddress,
        sender_identity: &IdentityKey,
        our_identity: &IdentityKeyPair,
        content: &SealedContent,
    ) -> SealedResult<Vec<u8>> {
        match content.message_type() {
            SealedMessageType::Fallback => fallback_decrypt(our_identity.private_key(), sender_identity, content.content()),
            SealedMessageType::PreKey => {
                let message = PreKeySignalMessage::try_from(content.content())?;
                Ok(self.session_cipher(sender.clone()).decrypt_prekey_message(&message)?)
            }
            SealedMessageType::Whisper => {
                let message = SignalMessage::try_from(content.content())?;
                Ok(self.session_cipher(sender.clone()).decrypt_signal_message(&message)?)
            }
        }
    }
}
