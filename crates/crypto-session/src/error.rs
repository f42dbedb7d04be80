//! Crypto session error types

use shared_protocol::ProtocolError;
use thiserror::Error;

/// Cryptographic operation error
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: authentication tag mismatch")]
    DecryptionFailed,

    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Packet id overflow: maximum message count exceeded")]
    NonceOverflow,

    #[error("Replayed packet id {0}")]
    ReplayedPacket(u32),

    #[error("Packet for key {actual} delivered to data channel {expected}")]
    KeyMismatch { expected: u8, actual: u8 },

    #[error("Control packet authentication failed")]
    ControlAuthentication,

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("TLS handshake not completed")]
    TlsNotConnected,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

pub type CryptoResult<T> = Result<T, CryptoError>;
