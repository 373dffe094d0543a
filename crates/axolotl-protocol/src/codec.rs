use bytes::{Buf, BufMut, BytesMut};
use tracing::trace;

use crate::error::ProtocolError;
use crate::messages::{CiphertextMessage, CiphertextMessageType, PreKeySignalMessage, SignalMessage};
use crate::types::PreKeyBundleData;

/// Current ciphertext message version. Older peers are rejected as legacy.
pub const CIPHERTEXT_MESSAGE_CURRENT_VERSION: u8 = 3;

/// Type byte prefixed to serialized Curve25519 public keys.
pub const DJB_TYPE: u8 = 0x05;

/// Raw Curve25519 public key length.
pub const PUBLIC_KEY_LENGTH: usize = 32;

/// Serialized (type-prefixed) public key length.
pub const SERIALIZED_PUBLIC_KEY_LENGTH: usize = 33;

/// Maximum envelope body size: 64 KiB.
pub const MAX_ENVELOPE_SIZE: u32 = 65_536;

/// Serialize a raw public key in its wire form (`0x05 || key`).
pub fn encode_point(key: &[u8; PUBLIC_KEY_LENGTH]) -> [u8; SERIALIZED_PUBLIC_KEY_LENGTH] {
    let mut out = [0u8; SERIALIZED_PUBLIC_KEY_LENGTH];
    out[0] = DJB_TYPE;
    out[1..].copy_from_slice(key);
    out
}

/// Parse a wire-form public key back into its raw 32 bytes.
pub fn decode_point(bytes: &[u8]) -> Result<[u8; PUBLIC_KEY_LENGTH], ProtocolError> {
    if bytes.len() != SERIALIZED_PUBLIC_KEY_LENGTH {
        return Err(ProtocolError::BadKeyEncoding(format!(
            "expected {} bytes, got {}",
            SERIALIZED_PUBLIC_KEY_LENGTH,
            bytes.len()
        )));
    }
    if bytes[0] != DJB_TYPE {
        return Err(ProtocolError::BadKeyEncoding(format!(
            "unknown key type 0x{:02x}",
            bytes[0]
        )));
    }
    let mut key = [0u8; PUBLIC_KEY_LENGTH];
    key.copy_from_slice(&bytes[1..]);
    Ok(key)
}

/// Pack the message version into the leading byte: high nibble is the
/// message version, low nibble the current version.
pub fn version_byte(message_version: u8) -> u8 {
    ((message_version & 0x0F) << 4) | CIPHERTEXT_MESSAGE_CURRENT_VERSION
}

/// Validate the leading version byte and return the message version.
pub fn check_version_byte(byte: u8) -> Result<u8, ProtocolError> {
    let message_version = byte >> 4;
    if message_version < CIPHERTEXT_MESSAGE_CURRENT_VERSION {
        return Err(ProtocolError::LegacyCiphertextVersion(message_version));
    }
    if message_version > CIPHERTEXT_MESSAGE_CURRENT_VERSION {
        return Err(ProtocolError::UnrecognizedCiphertextVersion(message_version));
    }
    Ok(message_version)
}

/// Encode a ciphertext message into a length-prefixed envelope for the transport.
///
/// Layout: `[length u32 BE][message type][serialized message]`, where length
/// covers the type byte and the body.
pub fn encode_envelope(message: &CiphertextMessage) -> Result<Vec<u8>, ProtocolError> {
    let body = message.serialize();
    let length = body.len() + 1;
    if length > MAX_ENVELOPE_SIZE as usize {
        return Err(ProtocolError::EnvelopeTooLarge(length));
    }
    let mut buf = Vec::with_capacity(4 + length);
    buf.put_u32(length as u32);
    buf.put_u8(message.message_type() as u8);
    buf.extend_from_slice(body);
    Ok(buf)
}

/// Attempt to extract one complete envelope from a byte buffer.
///
/// Returns `Ok(Some(message))` if a complete envelope is available,
/// `Ok(None)` if more data is needed, or `Err` if the envelope is oversized
/// or its contents do not parse.
///
/// Advances the buffer past the consumed envelope.
pub fn try_decode_envelope(buf: &mut BytesMut) -> Result<Option<CiphertextMessage>, ProtocolError> {
    if buf.len() < 4 {
        return Ok(None);
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if length > MAX_ENVELOPE_SIZE as usize {
        return Err(ProtocolError::EnvelopeTooLarge(length));
    }
    if length == 0 {
        return Err(ProtocolError::MessageTooShort { expected: 1, got: 0 });
    }

    if buf.len() < 4 + length {
        return Ok(None);
    }

    buf.advance(4);
    let mut frame = buf.split_to(length);
    let message_type = CiphertextMessageType::try_from(frame.get_u8())?;
    trace!(?message_type, length, "decoded envelope");
    let message = match message_type {
        CiphertextMessageType::Whisper => CiphertextMessage::Signal(SignalMessage::try_from(&frame[..])?),
        CiphertextMessageType::PreKey => {
            CiphertextMessage::PreKey(PreKeySignalMessage::try_from(&frame[..])?)
        }
    };
    Ok(Some(message))
}

/// Encode a published pre-key bundle for upload to a key directory.
pub fn encode_bundle(bundle: &PreKeyBundleData) -> Result<Vec<u8>, ProtocolError> {
    Ok(postcard::to_allocvec(bundle)?)
}

/// Decode a pre-key bundle fetched from a key directory.
pub fn decode_bundle(payload: &[u8]) -> Result<PreKeyBundleData, ProtocolError> {
    Ok(postcard::from_bytes(payload)?)
}
