//! Tunnel interface endpoint

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

use crate::{MAX_READ_BATCH, TransportError, TransportResult};

/// Source of outbound and sink of inbound cleartext IP packets
#[async_trait]
pub trait Tunnel: Send + Sync {
    /// Wait for packets the local stack wants sent through the VPN
    async fn read_packets(&self) -> TransportResult<Vec<Vec<u8>>>;

    /// Deliver packets received from the VPN to the local stack
    fn write_packets(&self, packets: Vec<Vec<u8>>) -> TransportResult<()>;
}

/// Tunnel backed by in-process channels
///
/// The paired [`TunnelHandle`] plays the role of the network stack.
pub struct ChannelTunnel {
    outbound: Mutex<mpsc::Receiver<Vec<u8>>>,
    inbound: mpsc::Sender<Vec<u8>>,
}

/// Network stack side of a [`ChannelTunnel`]
pub struct TunnelHandle {
    outbound: mpsc::Sender<Vec<u8>>,
    inbound: mpsc::Receiver<Vec<u8>>,
}

impl ChannelTunnel {
    pub fn new(capacity: usize) -> (Self, TunnelHandle) {
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        (
            Self {
                outbound: Mutex::new(outbound_rx),
                inbound: inbound_tx,
            },
            TunnelHandle {
                outbound: outbound_tx,
                inbound: inbound_rx,
            },
        )
    }
}

#[async_trait]
impl Tunnel for ChannelTunnel {
    async fn read_packets(&self) -> TransportResult<Vec<Vec<u8>>> {
        let mut outbound = self.outbound.lock().await;
        let first = outbound
            .recv()
            .await
            .ok_or_else(|| TransportError::ConnectionClosed("tunnel closed".into()))?;

        let mut packets = vec![first];
        while packets.len() < MAX_READ_BATCH {
            match outbound.try_recv() {
                Ok(packet) => packets.push(packet),
                Err(_) => break,
            }
        }
        Ok(packets)
    }

    fn write_packets(&self, packets: Vec<Vec<u8>>) -> TransportResult<()> {
        for packet in packets {
            match self.inbound.try_send(packet) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!("Tunnel: queue full, dropping packet")
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    return Err(TransportError::ConnectionClosed("tunnel closed".into()));
                }
            }
        }
        Ok(())
    }
}

impl TunnelHandle {
    /// Inject a packet as if the local stack routed it into the tunnel
    pub async fn send(&self, packet: Vec<u8>) -> TransportResult<()> {
        self.outbound
            .send(packet)
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    /// Next packet delivered by the session
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.inbound.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Vec<u8>> {
        self.inbound.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_batches_outbound_packets() {
        let (tunnel, handle) = ChannelTunnel::new(8);
        handle.send(vec![1]).await.unwrap();
        handle.send(vec![2]).await.unwrap();
        assert_eq!(tunnel.read_packets().await.unwrap(), vec![vec![1], vec![2]]);

        drop(handle);
        assert!(tunnel.read_packets().await.is_err());
    }

    #[tokio::test]
    async fn test_full_queue_drops_inbound() {
        let (tunnel, mut handle) = ChannelTunnel::new(1);
        tunnel.write_packets(vec![vec![1], vec![2]]).unwrap();
        assert_eq!(handle.recv().await, Some(vec![1]));
        assert_eq!(handle.try_recv(), None);
    }
}
