//! VPN Session - client-side OpenVPN session engine
//!
//! A [`Session`] negotiates key generations over a control channel, moves
//! tunnel packets through the per-key data channels, keeps the connection
//! alive and tears it down within a bounded time.

mod data_count;
mod delegate;
mod error;
mod keepalive;
mod negotiator;
mod options;
mod session;

#[cfg(test)]
mod testing;

pub use data_count::*;
pub use delegate::*;
pub use error::*;
pub use keepalive::*;
pub use options::*;
pub use session::*;
