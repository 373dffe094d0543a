//! Ratchet wire messages.
//!
//! Both message kinds are a version byte followed by a protobuf body. Ordinary
//! ratchet messages additionally carry a truncated HMAC-SHA256 tag computed
//! over both parties' identity keys and the serialized body.

use bytes::Bytes;
use hmac::{Hmac, Mac};
use prost::Message;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::codec::{check_version_byte, decode_point, encode_point, version_byte, PUBLIC_KEY_LENGTH};
use crate::error::ProtocolError;
use crate::types::{PreKeyId, SignedPreKeyId};

type HmacSha256 = Hmac<Sha256>;

/// Length of the truncated MAC appended to every ordinary ratchet message.
pub const MAC_LENGTH: usize = 8;

mod proto {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct WhisperMessage {
        #[prost(bytes = "vec", optional, tag = "1")]
        pub ratchet_key: Option<Vec<u8>>,
        #[prost(uint32, optional, tag = "2")]
        pub counter: Option<u32>,
        #[prost(uint32, optional, tag = "3")]
        pub previous_counter: Option<u32>,
        #[prost(bytes = "vec", optional, tag = "4")]
        pub ciphertext: Option<Vec<u8>>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct PreKeyWhisperMessage {
        #[prost(uint32, optional, tag = "5")]
        pub registration_id: Option<u32>,
        #[prost(uint32, optional, tag = "1")]
        pub pre_key_id: Option<u32>,
        #[prost(uint32, optional, tag = "6")]
        pub signed_pre_key_id: Option<u32>,
        #[prost(bytes = "vec", optional, tag = "2")]
        pub base_key: Option<Vec<u8>>,
        #[prost(bytes = "vec", optional, tag = "3")]
        pub identity_key: Option<Vec<u8>>,
        #[prost(bytes = "vec", optional, tag = "4")]
        pub message: Option<Vec<u8>>,
    }
}

/// Message type numbers shared with the rest of the protocol ecosystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CiphertextMessageType {
    Whisper = 2,
    PreKey = 3,
}

impl TryFrom<u8> for CiphertextMessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            2 => Ok(CiphertextMessageType::Whisper),
            3 => Ok(CiphertextMessageType::PreKey),
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }
}

/// Either kind of message a session cipher produces.
#[derive(Debug, Clone)]
pub enum CiphertextMessage {
    Signal(SignalMessage),
    PreKey(PreKeySignalMessage),
}

impl CiphertextMessage {
    pub fn message_type(&self) -> CiphertextMessageType {
        match self {
            CiphertextMessage::Signal(_) => CiphertextMessageType::Whisper,
            CiphertextMessage::PreKey(_) => CiphertextMessageType::PreKey,
        }
    }

    pub fn serialize(&self) -> &[u8] {
        match self {
            CiphertextMessage::Signal(m) => m.serialized(),
            CiphertextMessage::PreKey(m) => m.serialized(),
        }
    }

    /// Parse a message body given the type number it was transported with.
    pub fn deserialize(message_type: u8, body: &[u8]) -> Result<Self, ProtocolError> {
        match CiphertextMessageType::try_from(message_type)? {
            CiphertextMessageType::Whisper => Ok(CiphertextMessage::Signal(SignalMessage::try_from(body)?)),
            CiphertextMessageType::PreKey => {
                Ok(CiphertextMessage::PreKey(PreKeySignalMessage::try_from(body)?))
            }
        }
    }
}

/// An ordinary ratchet message.
#[derive(Debug, Clone)]
pub struct SignalMessage {
    message_version: u8,
    sender_ratchet_key: [u8; PUBLIC_KEY_LENGTH],
    counter: u32,
    previous_counter: u32,
    ciphertext: Box<[u8]>,
    serialized: Bytes,
}

impl SignalMessage {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        message_version: u8,
        mac_key: &[u8],
        sender_ratchet_key: [u8; PUBLIC_KEY_LENGTH],
        counter: u32,
        previous_counter: u32,
        ciphertext: &[u8],
        sender_identity_key: &[u8; PUBLIC_KEY_LENGTH],
        receiver_identity_key: &[u8; PUBLIC_KEY_LENGTH],
    ) -> Self {
        let body = proto::WhisperMessage {
            ratchet_key: Some(encode_point(&sender_ratchet_key).to_vec()),
            counter: Some(counter),
            previous_counter: Some(previous_counter),
            ciphertext: Some(ciphertext.to_vec()),
        };
        let mut serialized = Vec::with_capacity(1 + body.encoded_len() + MAC_LENGTH);
        serialized.push(version_byte(message_version));
        body.encode(&mut serialized)
            .expect("Vec<u8> grows to fit the encoded message");
        let mac = compute_mac(sender_identity_key, receiver_identity_key, mac_key, &serialized);
        serialized.extend_from_slice(&mac);

        Self {
            message_version,
            sender_ratchet_key,
            counter,
            previous_counter,
            ciphertext: ciphertext.into(),
            serialized: Bytes::from(serialized),
        }
    }

    pub fn message_version(&self) -> u8 {
        self.message_version
    }

    pub fn sender_ratchet_key(&self) -> &[u8; PUBLIC_KEY_LENGTH] {
        &self.sender_ratchet_key
    }

    pub fn counter(&self) -> u32 {
        self.counter
    }

    pub fn previous_counter(&self) -> u32 {
        self.previous_counter
    }

    pub fn body(&self) -> &[u8] {
        &self.ciphertext
    }

    pub fn serialized(&self) -> &[u8] {
        &self.serialized
    }

    /// Check the truncated MAC in constant time.
    pub fn verify_mac(
        &self,
        sender_identity_key: &[u8; PUBLIC_KEY_LENGTH],
        receiver_identity_key: &[u8; PUBLIC_KEY_LENGTH],
        mac_key: &[u8],
    ) -> bool {
        let split = self.serialized.len() - MAC_LENGTH;
        let expected = compute_mac(
            sender_identity_key,
            receiver_identity_key,
            mac_key,
            &self.serialized[..split],
        );
        bool::from(expected[..].ct_eq(&self.serialized[split..]))
    }
}

impl TryFrom<&[u8]> for SignalMessage {
    type Error = ProtocolError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        if value.len() < MAC_LENGTH + 1 {
            return Err(ProtocolError::MessageTooShort {
                expected: MAC_LENGTH + 1,
                got: value.len(),
            });
        }
        let message_version = check_version_byte(value[0])?;
        let body = proto::WhisperMessage::decode(&value[1..value.len() - MAC_LENGTH])?;

        let sender_ratchet_key = decode_point(
            body.ratchet_key
                .as_deref()
                .ok_or(ProtocolError::MissingField("ratchet_key"))?,
        )?;
        let counter = body.counter.ok_or(ProtocolError::MissingField("counter"))?;
        let previous_counter = body.previous_counter.unwrap_or(0);
        let ciphertext = body
            .ciphertext
            .ok_or(ProtocolError::MissingField("ciphertext"))?;

        Ok(Self {
            message_version,
            sender_ratchet_key,
            counter,
            previous_counter,
            ciphertext: ciphertext.into_boxed_slice(),
            serialized: Bytes::copy_from_slice(value),
        })
    }
}

fn compute_mac(
    sender_identity_key: &[u8; PUBLIC_KEY_LENGTH],
    receiver_identity_key: &[u8; PUBLIC_KEY_LENGTH],
    mac_key: &[u8],
    message: &[u8],
) -> [u8; MAC_LENGTH] {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(mac_key)
        .expect("HMAC-SHA256 accepts keys of any length");
    mac.update(&encode_point(sender_identity_key));
    mac.update(&encode_point(receiver_identity_key));
    mac.update(message);
    let full = mac.finalize().into_bytes();
    let mut out = [0u8; MAC_LENGTH];
    out.copy_from_slice(&full[..MAC_LENGTH]);
    out
}

/// The first message(s) of a session: an ordinary ratchet message wrapped
/// with the bundle identifiers the recipient needs to build its own session.
#[derive(Debug, Clone)]
pub struct PreKeySignalMessage {
    message_version: u8,
    registration_id: u32,
    pre_key_id: Option<PreKeyId>,
    signed_pre_key_id: SignedPreKeyId,
    base_key: [u8; PUBLIC_KEY_LENGTH],
    identity_key: [u8; PUBLIC_KEY_LENGTH],
    message: SignalMessage,
    serialized: Bytes,
}

impl PreKeySignalMessage {
    pub fn new(
        message_version: u8,
        registration_id: u32,
        pre_key_id: Option<PreKeyId>,
        signed_pre_key_id: SignedPreKeyId,
        base_key: [u8; PUBLIC_KEY_LENGTH],
        identity_key: [u8; PUBLIC_KEY_LENGTH],
        message: SignalMessage,
    ) -> Self {
        let body = proto::PreKeyWhisperMessage {
            registration_id: Some(registration_id),
            pre_key_id,
            signed_pre_key_id: Some(signed_pre_key_id),
            base_key: Some(encode_point(&base_key).to_vec()),
            identity_key: Some(encode_point(&identity_key).to_vec()),
            message: Some(message.serialized().to_vec()),
        };
        let mut serialized = Vec::with_capacity(1 + body.encoded_len());
        serialized.push(version_byte(message_version));
        body.encode(&mut serialized)
            .expect("Vec<u8> grows to fit the encoded message");

        Self {
            message_version,
            registration_id,
            pre_key_id,
            signed_pre_key_id,
            base_key,
            identity_key,
            message,
            serialized: Bytes::from(serialized),
        }
    }

    pub fn message_version(&self) -> u8 {
        self.message_version
    }

    pub fn registration_id(&self) -> u32 {
        self.registration_id
    }

    pub fn pre_key_id(&self) -> Option<PreKeyId> {
        self.pre_key_id
    }

    pub fn signed_pre_key_id(&self) -> SignedPreKeyId {
        self.signed_pre_key_id
    }

    pub fn base_key(&self) -> &[u8; PUBLIC_KEY_LENGTH] {
        &self.base_key
    }

    pub fn identity_key(&self) -> &[u8; PUBLIC_KEY_LENGTH] {
        &self.identity_key
    }

    pub fn message(&self) -> &SignalMessage {
        &self.message
    }

    pub fn serialized(&self) -> &[u8] {
        &self.serialized
    }
}

impl TryFrom<&[u8]> for PreKeySignalMessage {
    type Error = ProtocolError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        if value.is_empty() {
            return Err(ProtocolError::MessageTooShort { expected: 1, got: 0 });
        }
        let message_version = check_version_byte(value[0])?;
        let body = proto::PreKeyWhisperMessage::decode(&value[1..])?;

        let signed_pre_key_id = body
            .signed_pre_key_id
            .ok_or(ProtocolError::MissingField("signed_pre_key_id"))?;
        let base_key = decode_point(
            body.base_key
                .as_deref()
                .ok_or(ProtocolError::MissingField("base_key"))?,
        )?;
        let identity_key = decode_point(
            body.identity_key
                .as_deref()
                .ok_or(ProtocolError::MissingField("identity_key"))?,
        )?;
        let message = SignalMessage::try_from(
            body.message
                .as_deref()
                .ok_or(ProtocolError::MissingField("message"))?,
        )?;

        Ok(Self {
            message_version,
            registration_id: body.registration_id.unwrap_or(0),
            pre_key_id: body.pre_key_id,
            signed_pre_key_id,
            base_key,
            identity_key,
            message,
            serialized: Bytes::copy_from_slice(value),
        })
    }
}
