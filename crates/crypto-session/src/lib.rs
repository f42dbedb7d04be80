//! Crypto Session - pluggable cryptographic capabilities for the VPN session
//!
//! Provides the PRNG, TLS engine and crypto engine abstractions together with
//! the control channel wrapping and the AEAD data channel built from them.

mod control;
mod data;
mod engine;
mod error;
mod prng;
mod replay;
mod tls;

pub use control::*;
pub use data::*;
pub use engine::*;
pub use error::*;
pub use prng::*;
pub use replay::*;
pub use tls::*;

/// Nonce size for the AEAD ciphers (96 bits / 12 bytes)
pub const NONCE_SIZE: usize = 12;

/// Authentication tag size (128 bits / 16 bytes)
pub const TAG_SIZE: usize = 16;

/// Implicit IV size taken from the hmac slot of the key material
pub const IMPLICIT_IV_SIZE: usize = 8;

/// Direction of a channel endpoint (selects key slots)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// We initiated the connection (client)
    Initiator,
    /// We received the connection (server)
    Responder,
}
