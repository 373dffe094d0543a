//! Error taxonomy of the session engine.
//!
//! Failures are split by what the caller has to do about them:
//! [`MessageError`] means drop this one message and keep the session,
//! [`SessionFault`] means the session (or the peer's identity) needs attention
//! before anything else is exchanged. The engine itself never retries.

use axolotl_protocol::{ProtocolAddress, ProtocolError, SealedMessageType};
use thiserror::Error;

/// Failures of the key primitives.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("invalid key: {0}")]
    InvalidKey(&'static str),

    #[error("requested {requested} bytes of key material, at most {max} available")]
    InvalidLength { requested: usize, max: usize },

    #[error("invalid cipher input")]
    InvalidCipherInput,
}

/// Fatal for one message; the session remains usable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessageError {
    /// Malformed encoding, MAC mismatch or bad padding. Deliberately carries
    /// no detail about which check failed.
    #[error("invalid message")]
    InvalidMessage,

    #[error("duplicate message: chain is at index {chain_index}, counter {counter} already used")]
    DuplicateMessage { chain_index: u32, counter: u32 },

    #[error("message counter {counter} is {jump} ahead of its chain (limit {limit})")]
    TooManySkippedMessages { counter: u32, jump: u32, limit: u32 },

    #[error("unknown pre-key id {0}")]
    InvalidPreKeyId(u32),

    #[error("unknown signed pre-key id {0}")]
    InvalidSignedPreKeyId(u32),
}

/// Fatal for the session; the caller should re-negotiate or surface the
/// problem to the user.
#[derive(Debug, Error)]
pub enum SessionFault {
    #[error("no session with {0}")]
    NoSession(ProtocolAddress),

    #[error("untrusted identity key for {0}")]
    UntrustedIdentity(ProtocolAddress),

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("invalid key material: {0}")]
    InvalidKey(#[from] KeyError),

    #[error("signed pre-key signature did not verify")]
    SignatureValidationFailed,

    #[error("invalid session state: {0}")]
    InvalidState(&'static str),

    #[error("store failure: {0}")]
    Store(String),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("message rejected: {0}")]
    Message(#[from] MessageError),

    #[error("session unusable: {0}")]
    Session(#[from] SessionFault),
}

pub type Result<T> = std::result::Result<T, SessionError>;

impl SessionError {
    /// The message should be dropped; the session is unaffected.
    pub fn is_message_fatal(&self) -> bool {
        matches!(self, SessionError::Message(_))
    }

    /// The session cannot be used until the caller re-negotiates or the
    /// user resolves an identity change.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, SessionError::Session(_))
    }

    pub fn message_error(&self) -> Option<&MessageError> {
        match self {
            SessionError::Message(e) => Some(e),
            SessionError::Session(_) => None,
        }
    }

    pub fn session_fault(&self) -> Option<&SessionFault> {
        match self {
            SessionError::Session(e) => Some(e),
            SessionError::Message(_) => None,
        }
    }
}

impl From<KeyError> for SessionError {
    fn from(e: KeyError) -> Self {
        SessionError::Session(SessionFault::InvalidKey(e))
    }
}

impl From<ProtocolError> for SessionError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::LegacyCiphertextVersion(v)
            | ProtocolError::UnrecognizedCiphertextVersion(v) => {
                SessionError::Session(SessionFault::UnsupportedVersion(v))
            }
            _ => SessionError::Message(MessageError::InvalidMessage),
        }
    }
}

/// Failures of sealed-sender envelopes.
///
/// Anything that goes wrong after the sender certificate has been read is
/// reported as [`SealedSenderError::KnownSender`] so the caller can still
/// tell which peer the message came from.
#[derive(Debug, Error)]
pub enum SealedSenderError {
    #[error("invalid sealed message")]
    InvalidMessage,

    #[error("unsupported sealed sender version {0}")]
    UnsupportedVersion(u8),

    #[error("discarding self-sent message")]
    SelfSend,

    #[error("sender certificate does not match the sealed identity key")]
    SenderKeyMismatch,

    #[error("invalid sender certificate: {0}")]
    InvalidCertificate(&'static str),

    #[error("no identity key known for {0}")]
    UnknownRecipientIdentity(ProtocolAddress),

    #[error("sealed {message_type:?} message from {sender} rejected: {source}")]
    KnownSender {
        sender: ProtocolAddress,
        message_type: SealedMessageType,
        source: Box<SealedSenderError>,
    },

    #[error(transparent)]
    Session(#[from] SessionError),
}

impl SealedSenderError {
    /// The error with any sender wrapping removed.
    pub fn inner(&self) -> &SealedSenderError {
        match self {
            SealedSenderError::KnownSender { source, .. } => source.inner(),
            other => other,
        }
    }
}

impl From<ProtocolError> for SealedSenderError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::UnrecognizedSealedVersion(v) => SealedSenderError::UnsupportedVersion(v),
            _ => SealedSenderError::InvalidMessage,
        }
    }
}

impl From<KeyError> for SealedSenderError {
    fn from(e: KeyError) -> Self {
        SealedSenderError::Session(e.into())
    }
}
