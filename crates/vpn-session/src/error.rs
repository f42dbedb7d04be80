//! Session error types

use crypto_session::CryptoError;
use net_transport::TransportError;
use shared_protocol::ProtocolError;
use thiserror::Error;

/// Reason a session stopped
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Negotiation timed out")]
    NegotiationTimeout,

    #[error("Server did not answer the hard reset")]
    HardResetTimeout,

    #[error("No data received within the keep-alive timeout")]
    PingTimeout,

    #[error("Authentication failed")]
    BadCredentials,

    /// Authentication failed while the local options string was sent
    #[error("Authentication failed with local options")]
    BadCredentialsWithLocalOptions,

    #[error("Network changed")]
    NetworkChanged,

    #[error("Server requested shutdown")]
    ServerShutdown,

    #[error("Assertion failed: {0}")]
    Assertion(String),

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl SessionError {
    /// Network changes still allow the exit notification
    pub fn is_network_changed(&self) -> bool {
        matches!(self, Self::NetworkChanged)
    }

    pub fn is_bad_credentials_with_local_options(&self) -> bool {
        matches!(self, Self::BadCredentialsWithLocalOptions)
    }
}

pub type SessionResult<T> = Result<T, SessionError>;
