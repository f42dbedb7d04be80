//! Link to the VPN server

use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use shared_protocol::{EndpointProtocol, SocketType};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{MAX_PACKET_SIZE, MAX_READ_BATCH, TransportError, TransportResult};

/// Packet-oriented connection to the server
#[async_trait]
pub trait Link: Send + Sync {
    /// True if the link guarantees delivery (TCP)
    fn is_reliable(&self) -> bool;

    fn remote_address(&self) -> Option<IpAddr>;

    fn remote_protocol(&self) -> Option<EndpointProtocol>;

    /// Wait for the next batch of packets
    async fn read_packets(&self) -> TransportResult<Vec<Vec<u8>>>;

    async fn write_packets(&self, packets: Vec<Vec<u8>>) -> TransportResult<()>;

    /// Abort pending reads and refuse further I/O
    fn shutdown(&self);
}

fn check_size(packet: &[u8], max: usize) -> TransportResult<()> {
    if packet.len() > max {
        return Err(TransportError::PacketTooLarge {
            size: packet.len(),
            max,
        });
    }
    Ok(())
}

/// Connected UDP socket
pub struct UdpLink {
    socket: UdpSocket,
    remote: SocketAddr,
    cancel: CancellationToken,
}

impl UdpLink {
    /// Bind an ephemeral port and connect it to the server
    pub async fn connect(remote: SocketAddr) -> TransportResult<Self> {
        let local: SocketAddr = match remote {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|e| TransportError::Bind(e.to_string()))?;
        socket
            .connect(remote)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        info!("UDP link connected to {}", remote);
        Self::from_socket(socket)
    }

    /// Wrap a socket that is already connected
    pub fn from_socket(socket: UdpSocket) -> TransportResult<Self> {
        let remote = socket.peer_addr()?;
        Ok(Self {
            socket,
            remote,
            cancel: CancellationToken::new(),
        })
    }
}

#[async_trait]
impl Link for UdpLink {
    fn is_reliable(&self) -> bool {
        false
    }

    fn remote_address(&self) -> Option<IpAddr> {
        Some(self.remote.ip())
    }

    fn remote_protocol(&self) -> Option<EndpointProtocol> {
        Some(EndpointProtocol::new(SocketType::Udp, self.remote.port()))
    }

    async fn read_packets(&self) -> TransportResult<Vec<Vec<u8>>> {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        let size = tokio::select! {
            _ = self.cancel.cancelled() => return Err(TransportError::Shutdown),
            result = self.socket.recv(&mut buf) => {
                result.map_err(|e| TransportError::Receive(e.to_string()))?
            }
        };

        let mut packets = vec![buf[..size].to_vec()];
        while packets.len() < MAX_READ_BATCH {
            match self.socket.try_recv(&mut buf) {
                Ok(size) => packets.push(buf[..size].to_vec()),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => return Err(TransportError::Receive(e.to_string())),
            }
        }
        Ok(packets)
    }

    async fn write_packets(&self, packets: Vec<Vec<u8>>) -> TransportResult<()> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Shutdown);
        }
        for packet in &packets {
            check_size(packet, MAX_PACKET_SIZE)?;
            self.socket
                .send(packet)
                .await
                .map_err(|e| TransportError::Send(e.to_string()))?;
        }
        Ok(())
    }

    fn shutdown(&self) {
        if !self.cancel.is_cancelled() {
            debug!("UDP link to {} shut down", self.remote);
            self.cancel.cancel();
        }
    }
}

/// TCP stream with 16-bit length-prefixed packets
pub struct TcpLink {
    reader: Mutex<BufReader<OwnedReadHalf>>,
    writer: Mutex<OwnedWriteHalf>,
    remote: SocketAddr,
    cancel: CancellationToken,
}

impl TcpLink {
    pub async fn connect(remote: SocketAddr) -> TransportResult<Self> {
        let stream = TcpStream::connect(remote)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        info!("TCP link connected to {}", remote);
        Self::from_stream(stream)
    }

    pub fn from_stream(stream: TcpStream) -> TransportResult<Self> {
        let remote = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: Mutex::new(BufReader::new(reader)),
            writer: Mutex::new(writer),
            remote,
            cancel: CancellationToken::new(),
        })
    }

    async fn read_packet(reader: &mut BufReader<OwnedReadHalf>) -> TransportResult<Vec<u8>> {
        let length = match reader.read_u16().await {
            Ok(length) => length as usize,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                return Err(TransportError::ConnectionClosed("server closed the stream".into()));
            }
            Err(e) => return Err(TransportError::Receive(e.to_string())),
        };
        let mut packet = vec![0u8; length];
        reader
            .read_exact(&mut packet)
            .await
            .map_err(|e| TransportError::Receive(e.to_string()))?;
        Ok(packet)
    }

    /// True if a whole frame is already buffered
    fn has_buffered_frame(reader: &BufReader<OwnedReadHalf>) -> bool {
        let buffer = reader.buffer();
        buffer.len() >= 2 && buffer.len() >= 2 + u16::from_be_bytes([buffer[0], buffer[1]]) as usize
    }
}

#[async_trait]
impl Link for TcpLink {
    fn is_reliable(&self) -> bool {
        true
    }

    fn remote_address(&self) -> Option<IpAddr> {
        Some(self.remote.ip())
    }

    fn remote_protocol(&self) -> Option<EndpointProtocol> {
        Some(EndpointProtocol::new(SocketType::Tcp, self.remote.port()))
    }

    async fn read_packets(&self) -> TransportResult<Vec<Vec<u8>>> {
        let mut reader = self.reader.lock().await;
        let first = tokio::select! {
            _ = self.cancel.cancelled() => return Err(TransportError::Shutdown),
            result = Self::read_packet(&mut reader) => result?,
        };

        let mut packets = vec![first];
        while packets.len() < MAX_READ_BATCH && Self::has_buffered_frame(&reader) {
            packets.push(Self::read_packet(&mut reader).await?);
        }
        Ok(packets)
    }

    async fn write_packets(&self, packets: Vec<Vec<u8>>) -> TransportResult<()> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Shutdown);
        }
        let mut frames = BytesMut::new();
        for packet in &packets {
            check_size(packet, u16::MAX as usize)?;
            frames.put_u16(packet.len() as u16);
            frames.put_slice(packet);
        }

        let mut writer = self.writer.lock().await;
        tokio::select! {
            _ = self.cancel.cancelled() => Err(TransportError::Shutdown),
            result = writer.write_all(&frames) => {
                result.map_err(|e| TransportError::Send(e.to_string()))
            }
        }
    }

    fn shutdown(&self) {
        if !self.cancel.is_cancelled() {
            debug!("TCP link to {} shut down", self.remote);
            self.cancel.cancel();
        }
    }
}
