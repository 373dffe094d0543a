use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("message too short: expected at least {expected} bytes, got {got}")]
    MessageTooShort { expected: usize, got: usize },

    #[error("legacy ciphertext version: {0}")]
    LegacyCiphertextVersion(u8),

    #[error("unrecognized ciphertext version: {0}")]
    UnrecognizedCiphertextVersion(u8),

    #[error("unknown ciphertext message type: {0}")]
    UnknownMessageType(u8),

    #[error("unknown sealed message type: {0}")]
    UnknownSealedMessageType(u32),

    #[error("unrecognized sealed sender version: {0}")]
    UnrecognizedSealedVersion(u8),

    #[error("envelope too large: {0} bytes (max 65536)")]
    EnvelopeTooLarge(usize),

    #[error("invalid protobuf encoding: {0}")]
    InvalidProtobuf(#[from] prost::DecodeError),

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("bad key encoding: {0}")]
    BadKeyEncoding(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),
}

impl ProtocolError {
    /// True when the failure is a version mismatch rather than a malformed message.
    pub fn is_version_error(&self) -> bool {
        matches!(
            self,
            ProtocolError::LegacyCiphertextVersion(_) | ProtocolError::UnrecognizedCiphertextVersion(_)
        )
    }
}
