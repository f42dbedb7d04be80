//! Network Transport - link and tunnel endpoints for the VPN session
//!
//! The link carries encrypted OpenVPN packets to the server over UDP or TCP.
//! The tunnel exchanges cleartext IP packets with the local network stack.

mod error;
mod link;
mod tunnel;

pub use error::*;
pub use link::*;
pub use tunnel::*;

/// Largest packet accepted on either side of the session
pub const MAX_PACKET_SIZE: usize = 65_535;

/// Upper bound of packets returned by a single read
pub const MAX_READ_BATCH: usize = 64;
