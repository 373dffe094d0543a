//! Axolotl wire layer: ratchet message formats, key point encoding,
//! transport envelope framing, sealed-sender envelopes and the published
//! pre-key bundle type.
//!
//! The message formats are bit-compatible with the rest of the protocol
//! ecosystem; nothing in this crate holds secret state.

pub mod codec;
pub mod error;
pub mod messages;
pub mod sealed;
pub mod types;

pub use codec::{
    decode_bundle, decode_point, encode_bundle, encode_envelope, encode_point, try_decode_envelope,
    CIPHERTEXT_MESSAGE_CURRENT_VERSION,
};
pub use error::ProtocolError;
pub use messages::{CiphertextMessage, CiphertextMessageType, PreKeySignalMessage, SignalMessage};
pub use sealed::{SealedContent, SealedEnvelope, SealedMessageType, SenderCertificate, ServerCertificate};
pub use types::{DeviceId, OneTimePreKey, PreKeyBundleData, PreKeyId, ProtocolAddress, SignedPreKeyId};
