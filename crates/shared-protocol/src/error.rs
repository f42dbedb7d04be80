//! Error types for the protocol

use thiserror::Error;

/// Protocol error
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Packet too short: {size} bytes (need at least {min})")]
    PacketTooShort { size: usize, min: usize },

    #[error("Invalid packet code: {0}")]
    InvalidPacketCode(u8),

    #[error("Missing remote session id")]
    MissingRemoteSessionId,

    #[error("Unsupported cipher: {0}")]
    UnsupportedCipher(String),

    #[error("Unsupported digest: {0}")]
    UnsupportedDigest(String),

    #[error("Invalid static key: {0}")]
    InvalidStaticKey(String),

    #[error("Malformed push reply: {0}")]
    MalformedPushReply(String),

    #[error("Invalid option `{option}`: {reason}")]
    InvalidOption { option: String, reason: String },

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Malformed auth message: {0}")]
    MalformedAuthMessage(String),
}

/// Result type alias for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;
