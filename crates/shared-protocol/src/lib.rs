//! Shared Protocol Definitions for the OpenVPN session engine
//!
//! This crate contains the configuration, pushed options, packet opcodes
//! and sentinel payloads shared by the crypto, transport and session crates.

mod configuration;
mod error;
mod packets;
mod push_reply;

pub use configuration::*;
pub use error::*;
pub use packets::*;
pub use push_reply::*;

/// Keep-alive payload sent over the data channel.
pub const PING_STRING: [u8; 16] = [
    0x2a, 0x18, 0x7b, 0xf3, 0x64, 0x1e, 0xb4, 0xcb, 0x07, 0xed, 0x2d, 0x0a, 0x98, 0x1f, 0xc7, 0x48,
];

/// Prefix of every OCC (options consistency check) message.
pub const OCC_MAGIC: [u8; 16] = [
    0x28, 0x7f, 0x34, 0x6b, 0xd4, 0xef, 0x7a, 0x81, 0x2d, 0x56, 0xb8, 0xd3, 0xaf, 0xc5, 0x45, 0x9c,
];

/// Number of distinct key ids representable on the wire.
pub const KEY_ID_COUNT: u8 = 8;

/// Label for TLS keying material export of data channel keys.
pub const DATA_KEYS_EXPORT_LABEL: &str = "EXPORTER-OpenVPN-datakeys";

/// Length of exported data channel key material (two directions of cipher + hmac slots).
pub const DATA_KEYS_LENGTH: usize = 256;
