//! Session observer

use std::net::IpAddr;

use shared_protocol::{EndpointProtocol, RemoteOptions};

use crate::SessionError;

/// Cumulative tunnel traffic in bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DataCount {
    pub inbound: u64,
    pub outbound: u64,
}

/// Receives session lifecycle and traffic notifications
///
/// Called from the session task; implementations must not block.
pub trait SessionDelegate: Send + Sync {
    /// First key negotiated, the tunnel can be configured
    fn session_did_start(
        &self,
        remote_address: IpAddr,
        remote_protocol: EndpointProtocol,
        options: &RemoteOptions,
    );

    fn session_did_stop(&self, error: Option<&SessionError>);

    fn did_update_data_count(&self, count: DataCount);
}
