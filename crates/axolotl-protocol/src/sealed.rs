//! Sealed-sender wire formats.
//!
//! A sealed message hides who sent it from everyone but the recipient: the
//! sender's identity and certificate travel encrypted inside the envelope.
//! The certificate chain is a server certificate signed by a trust root and
//! a sender certificate signed by that server key. Signing and checking the
//! signatures happens in the engine; this module only lays out the bytes.

use prost::Message;

use crate::codec::{decode_point, encode_point, PUBLIC_KEY_LENGTH};
use crate::error::ProtocolError;
use crate::types::DeviceId;

/// Version of the sealed envelope layout.
pub const SEALED_SENDER_VERSION: u8 = 1;

mod proto {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ServerCertificateBody {
        #[prost(uint32, optional, tag = "1")]
        pub id: Option<u32>,
        #[prost(bytes = "vec", optional, tag = "2")]
        pub key: Option<Vec<u8>>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ServerCertificate {
        #[prost(bytes = "vec", optional, tag = "1")]
        pub certificate: Option<Vec<u8>>,
        #[prost(bytes = "vec", optional, tag = "2")]
        pub signature: Option<Vec<u8>>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct SenderCertificateBody {
        #[prost(string, optional, tag = "1")]
        pub sender: Option<String>,
        #[prost(uint32, optional, tag = "2")]
        pub sender_device: Option<u32>,
        #[prost(fixed64, optional, tag = "3")]
        pub expires: Option<u64>,
        #[prost(bytes = "vec", optional, tag = "4")]
        pub identity_key: Option<Vec<u8>>,
        #[prost(message, optional, tag = "5")]
        pub signer: Option<ServerCertificate>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct SenderCertificate {
        #[prost(bytes = "vec", optional, tag = "1")]
        pub certificate: Option<Vec<u8>>,
        #[prost(bytes = "vec", optional, tag = "2")]
        pub signature: Option<Vec<u8>>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct SealedContent {
        #[prost(uint32, optional, tag = "1")]
        pub r#type: Option<u32>,
        #[prost(message, optional, tag = "2")]
        pub sender_certificate: Option<SenderCertificate>,
        #[prost(bytes = "vec", optional, tag = "3")]
        pub content: Option<Vec<u8>>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct SealedEnvelope {
        #[prost(bytes = "vec", optional, tag = "1")]
        pub ephemeral_public: Option<Vec<u8>>,
        #[prost(bytes = "vec", optional, tag = "2")]
        pub encrypted_static: Option<Vec<u8>>,
        #[prost(bytes = "vec", optional, tag = "3")]
        pub encrypted_message: Option<Vec<u8>>,
    }
}

fn encode<M: Message>(message: &M) -> Vec<u8> {
    message.encode_to_vec()
}

fn required<T>(field: Option<T>, name: &'static str) -> Result<T, ProtocolError> {
    field.ok_or(ProtocolError::MissingField(name))
}

/// A server key vouched for by the trust root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerCertificate {
    key_id: u32,
    key: [u8; PUBLIC_KEY_LENGTH],
    certificate: Vec<u8>,
    signature: Vec<u8>,
}

impl ServerCertificate {
    /// The bytes the trust root signs.
    pub fn certificate_bytes(key_id: u32, key: &[u8; PUBLIC_KEY_LENGTH]) -> Vec<u8> {
        encode(&proto::ServerCertificateBody {
            id: Some(key_id),
            key: Some(encode_point(key).to_vec()),
        })
    }

    /// Assemble a certificate from its signed body and the trust root's signature.
    pub fn from_signed(certificate: Vec<u8>, signature: Vec<u8>) -> Result<Self, ProtocolError> {
        let body = proto::ServerCertificateBody::decode(&certificate[..])?;
        let key_id = required(body.id, "server certificate id")?;
        let key = decode_point(&required(body.key, "server certificate key")?)?;
        Ok(Self {
            key_id,
            key,
            certificate,
            signature,
        })
    }

    pub fn key_id(&self) -> u32 {
        self.key_id
    }

    pub fn key(&self) -> &[u8; PUBLIC_KEY_LENGTH] {
        &self.key
    }

    pub fn certificate(&self) -> &[u8] {
        &self.certificate
    }

    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    fn to_proto(&self) -> proto::ServerCertificate {
        proto::ServerCertificate {
            certificate: Some(self.certificate.clone()),
            signature: Some(self.signature.clone()),
        }
    }

    fn from_proto(message: proto::ServerCertificate) -> Result<Self, ProtocolError> {
        Self::from_signed(
            required(message.certificate, "server certificate")?,
            required(message.signature, "server certificate signature")?,
        )
    }

    pub fn serialize(&self) -> Vec<u8> {
        encode(&self.to_proto())
    }
}

impl TryFrom<&[u8]> for ServerCertificate {
    type Error = ProtocolError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        Self::from_proto(proto::ServerCertificate::decode(value)?)
    }
}

/// Binds a sender address and identity key until an expiry time, signed by
/// a server key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderCertificate {
    sender: String,
    sender_device: DeviceId,
    expires: u64,
    identity_key: [u8; PUBLIC_KEY_LENGTH],
    signer: ServerCertificate,
    certificate: Vec<u8>,
    signature: Vec<u8>,
}

impl SenderCertificate {
    /// The bytes the server key signs.
    pub fn certificate_bytes(
        sender: &str,
        sender_device: DeviceId,
        expires: u64,
        identity_key: &[u8; PUBLIC_KEY_LENGTH],
        signer: &ServerCertificate,
    ) -> Vec<u8> {
        encode(&proto::SenderCertificateBody {
            sender: Some(sender.to_owned()),
            sender_device: Some(sender_device),
            expires: Some(expires),
            identity_key: Some(encode_point(identity_key).to_vec()),
            signer: Some(signer.to_proto()),
        })
    }

    pub fn from_signed(certificate: Vec<u8>, signature: Vec<u8>) -> Result<Self, ProtocolError> {
        let body = proto::SenderCertificateBody::decode(&certificate[..])?;
        Ok(Self {
            sender: required(body.sender, "sender")?,
            sender_device: required(body.sender_device, "sender device")?,
            expires: required(body.expires, "expires")?,
            identity_key: decode_point(&required(body.identity_key, "identity key")?)?,
            signer: ServerCertificate::from_proto(required(body.signer, "signer")?)?,
            certificate,
            signature,
        })
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn sender_device(&self) -> DeviceId {
        self.sender_device
    }

    /// Unix milliseconds after which the certificate is no longer valid.
    pub fn expires(&self) -> u64 {
        self.expires
    }

    pub fn identity_key(&self) -> &[u8; PUBLIC_KEY_LENGTH] {
        &self.identity_key
    }

    pub fn signer(&self) -> &ServerCertificate {
        &self.signer
    }

    pub fn certificate(&self) -> &[u8] {
        &self.certificate
    }

    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    fn to_proto(&self) -> proto::SenderCertificate {
        proto::SenderCertificate {
            certificate: Some(self.certificate.clone()),
            signature: Some(self.signature.clone()),
        }
    }

    fn from_proto(message: proto::SenderCertificate) -> Result<Self, ProtocolError> {
        Self::from_signed(
            required(message.certificate, "sender certificate")?,
            required(message.signature, "sender certificate signature")?,
        )
    }

    pub fn serialize(&self) -> Vec<u8> {
        encode(&self.to_proto())
    }
}

impl TryFrom<&[u8]> for SenderCertificate {
    type Error = ProtocolError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        Self::from_proto(proto::SenderCertificate::decode(value)?)
    }
}

/// What the sealed content carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SealedMessageType {
    PreKey = 1,
    Whisper = 2,
    /// Encrypted to the recipient's identity key directly, without a session.
    Fallback = 3,
}

impl TryFrom<u32> for SealedMessageType {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(SealedMessageType::PreKey),
            2 => Ok(SealedMessageType::Whisper),
            3 => Ok(SealedMessageType::Fallback),
            other => Err(ProtocolError::UnknownSealedMessageType(other)),
        }
    }
}

/// The inner plaintext of a sealed envelope: the sender's certificate and
/// the message it wraps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedContent {
    message_type: SealedMessageType,
    sender_certificate: SenderCertificate,
    content: Vec<u8>,
}

impl SealedContent {
    pub fn new(message_type: SealedMessageType, sender_certificate: SenderCertificate, content: Vec<u8>) -> Self {
        Self {
            message_type,
            sender_certificate,
            content,
        }
    }

    pub fn message_type(&self) -> SealedMessageType {
        self.message_type
    }

    pub fn sender_certificate(&self) -> &SenderCertificate {
        &self.sender_certificate
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    pub fn serialize(&self) -> Vec<u8> {
        encode(&proto::SealedContent {
            r#type: Some(self.message_type as u32),
            sender_certificate: Some(self.sender_certificate.to_proto()),
            content: Some(self.content.clone()),
        })
    }
}

impl TryFrom<&[u8]> for SealedContent {
    type Error = ProtocolError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let message = proto::SealedContent::decode(value)?;
        Ok(Self {
            message_type: SealedMessageType::try_from(required(message.r#type, "type")?)?,
            sender_certificate: SenderCertificate::from_proto(required(
                message.sender_certificate,
                "sender certificate",
            )?)?,
            content: required(message.content, "content")?,
        })
    }
}

/// The outer envelope: a version byte, then the ephemeral key, the sealed
/// sender identity and the sealed content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedEnvelope {
    ephemeral_public: [u8; PUBLIC_KEY_LENGTH],
    encrypted_static: Vec<u8>,
    encrypted_message: Vec<u8>,
}

impl SealedEnvelope {
    pub fn new(
        ephemeral_public: [u8; PUBLIC_KEY_LENGTH],
        encrypted_static: Vec<u8>,
        encrypted_message: Vec<u8>,
    ) -> Self {
        Self {
            ephemeral_public,
            encrypted_static,
            encrypted_message,
        }
    }

    pub fn ephemeral_public(&self) -> &[u8; PUBLIC_KEY_LENGTH] {
        &self.ephemeral_public
    }

    pub fn encrypted_static(&self) -> &[u8] {
        &self.encrypted_static
    }

    pub fn encrypted_message(&self) -> &[u8] {
        &self.encrypted_message
    }

    pub fn serialize(&self) -> Vec<u8> {
        let body = proto::SealedEnvelope {
            ephemeral_public: Some(encode_point(&self.ephemeral_public).to_vec()),
            encrypted_static: Some(self.encrypted_static.clone()),
            encrypted_message: Some(self.encrypted_message.clone()),
        };
        let mut out = Vec::with_capacity(1 + body.encoded_len());
        out.push((SEALED_SENDER_VERSION << 4) | SEALED_SENDER_VERSION);
        out.extend_from_slice(&body.encode_to_vec());
        out
    }
}

impl TryFrom<&[u8]> for SealedEnvelope {
    type Error = ProtocolError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let (&version, body) = value.split_first().ok_or(ProtocolError::MessageTooShort {
            expected: 1,
            got: 0,
        })?;
        let version = version >> 4;
        if version != SEALED_SENDER_VERSION {
            return Err(ProtocolError::UnrecognizedSealedVersion(version));
        }
        let message = proto::SealedEnvelope::decode(body)?;
        Ok(Self {
            ephemeral_public: decode_point(&required(message.ephemeral_public, "ephemeral public")?)?,
            encrypted_static: required(message.encrypted_static, "encrypted static")?,
            encrypted_message: required(message.encrypted_message, "encrypted message")?,
        })
    }
}
