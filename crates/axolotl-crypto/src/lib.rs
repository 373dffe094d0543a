//! Axolotl session engine: pairwise sessions with X3DH-style setup and the
//! Double Ratchet.
//!
//! This crate provides:
//! - Curve25519 key pairs, XEdDSA signatures, HKDF/HMAC and the message cipher
//! - The root / chain / message key ladder
//! - Per-device session state and the bounded session record
//! - Session setup from pre-key bundles and pre-key messages
//! - The session cipher that encrypts and decrypts individual messages
//! - Sealed-sender envelopes that hide the sender behind a certificate
//! - Store interfaces with in-memory implementations and sealed persistence

pub mod builder;
pub mod cipher;
pub mod config;
pub mod curve;
pub mod error;
pub mod identity;
pub mod kdf;
pub mod locks;
pub mod persistence;
pub mod prekey;
pub mod ratchet;
pub mod record;
pub mod sealed;
pub mod session;
pub mod skipped;
pub mod state;
pub mod stores;

#[cfg(test)]
mod testing;

// Re-export key types for convenience
pub use builder::process_prekey_bundle;
pub use cipher::SessionCipher;
pub use config::SessionConfig;
pub use curve::{KeyPair, PrivateKey, PublicKey};
pub use error::{KeyError, MessageError, Result, SealedSenderError, SessionError, SessionFault};
pub use identity::{generate_identity_key_pair, generate_registration_id, IdentityKey, IdentityKeyPair};
pub use locks::SessionLocks;
pub use prekey::{PreKeyBundle, PreKeyRecord, SignedPreKeyRecord};
pub use record::SessionRecord;
pub use sealed::{CertificateValidator, SealedDecryption, SealedSessionCipher};
pub use state::SessionState;
pub use stores::{
    Direction, IdentityKeyStore, PreKeyStore, ProtocolStores, SessionStore, SignedPreKeyStore,
};
