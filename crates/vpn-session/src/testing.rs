//! In-process doubles for driving sessions and negotiators in tests
//!
//! [`FakeServer`] speaks just enough of the server side of the protocol over a
//! [`ScriptedLink`] to complete negotiations, renegotiate on demand and
//! decrypt what the client sends. TLS is replaced by [`PassthroughTls`].

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use crypto_session::{
    ControlChannel, CryptoResult, DataChannel, Direction, OsPrng, TlsEngine, TlsOptions,
    default_crypto_factory,
};
use net_transport::{Link, TransportError, TransportResult};
use parking_lot::Mutex;
use shared_protocol::{
    Cipher, Configuration, DATA_KEYS_LENGTH, EndpointProtocol, OccPacket, PING_STRING, PacketCode,
    PushReply, RemoteOptions, SocketType, parse_header,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;

use crate::negotiator::{Reliable, client_options, server_auth_message};
use crate::{DataCount, SessionDelegate, SessionEngines, SessionError};

pub(crate) const REMOTE_ADDRESS: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
pub(crate) const REMOTE_PORT: u16 = 1194;

/// Route session logs to the test harness; `RUST_LOG` selects the level
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub(crate) fn test_configuration() -> Configuration {
    Configuration {
        ca: Some("-----BEGIN CERTIFICATE-----\nplaceholder\n-----END CERTIFICATE-----\n".into()),
        cipher: Some(Cipher::Aes256Gcm),
        ..Default::default()
    }
}

pub(crate) fn test_engines() -> SessionEngines {
    SessionEngines {
        prng: Arc::new(OsPrng),
        tls_factory: Arc::new(passthrough_tls),
        crypto_factory: default_crypto_factory(),
    }
}

fn passthrough_tls(_: &TlsOptions) -> CryptoResult<Box<dyn TlsEngine>> {
    Ok(Box::new(PassthroughTls::default()))
}

fn keying_material(length: usize) -> Vec<u8> {
    (0..length).map(|i| i as u8).collect()
}

/// Poll `condition` until it holds, advancing (possibly paused) time
pub(crate) async fn wait_until(condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(300);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        sleep(Duration::from_millis(10)).await;
    }
}

// MARK: Delegate

#[derive(Debug, Clone)]
pub(crate) enum DelegateEvent {
    Started {
        address: IpAddr,
        protocol: EndpointProtocol,
        options: RemoteOptions,
    },
    Stopped(Option<String>),
    DataCount(DataCount),
}

#[derive(Default)]
pub(crate) struct RecordingDelegate {
    events: Mutex<Vec<DelegateEvent>>,
}

impl RecordingDelegate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<DelegateEvent> {
        self.events.lock().clone()
    }

    pub fn started_count(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, DelegateEvent::Started { .. }))
            .count()
    }

    pub fn stopped_count(&self) -> usize {
        self.stop_errors().len()
    }

    pub fn stop_errors(&self) -> Vec<Option<String>> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                DelegateEvent::Stopped(error) => Some(error.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn data_counts(&self) -> Vec<DataCount> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                DelegateEvent::DataCount(count) => Some(*count),
                _ => None,
            })
            .collect()
    }
}

impl SessionDelegate for RecordingDelegate {
    fn session_did_start(
        &self,
        address: IpAddr,
        protocol: EndpointProtocol,
        options: &RemoteOptions,
    ) {
        self.events.lock().push(DelegateEvent::Started {
            address,
            protocol,
            options: options.clone(),
        });
    }

    fn session_did_stop(&self, error: Option<&SessionError>) {
        self.events
            .lock()
            .push(DelegateEvent::Stopped(error.map(ToString::to_string)));
    }

    fn did_update_data_count(&self, count: DataCount) {
        self.events.lock().push(DelegateEvent::DataCount(count));
    }
}

// MARK: Link

/// Link whose far end is a [`LinkPeer`]
pub(crate) struct ScriptedLink {
    reliable: bool,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    stalled: Arc<AtomicBool>,
    cancel: CancellationToken,
}

/// Server side of a [`ScriptedLink`]
pub(crate) struct LinkPeer {
    pub to_client: mpsc::UnboundedSender<Vec<u8>>,
    pub from_client: mpsc::UnboundedReceiver<Vec<u8>>,
    stalled: Arc<AtomicBool>,
}

impl ScriptedLink {
    pub fn new(reliable: bool) -> (Arc<dyn Link>, LinkPeer) {
        let (to_client, inbound) = mpsc::unbounded_channel();
        let (outbound, from_client) = mpsc::unbounded_channel();
        let stalled = Arc::new(AtomicBool::new(false));
        let link = Self {
            reliable,
            inbound: tokio::sync::Mutex::new(inbound),
            outbound,
            stalled: stalled.clone(),
            cancel: CancellationToken::new(),
        };
        let peer = LinkPeer {
            to_client,
            from_client,
            stalled,
        };
        (Arc::new(link), peer)
    }
}

#[async_trait]
impl Link for ScriptedLink {
    fn is_reliable(&self) -> bool {
        self.reliable
    }

    fn remote_address(&self) -> Option<IpAddr> {
        Some(IpAddr::V4(REMOTE_ADDRESS))
    }

    fn remote_protocol(&self) -> Option<EndpointProtocol> {
        let socket_type = if self.reliable { SocketType::Tcp } else { SocketType::Udp };
        Some(EndpointProtocol::new(socket_type, REMOTE_PORT))
    }

    async fn read_packets(&self) -> TransportResult<Vec<Vec<u8>>> {
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            _ = self.cancel.cancelled() => Err(TransportError::Shutdown),
            packet = inbound.recv() => {
                let first = packet
                    .ok_or_else(|| TransportError::ConnectionClosed("peer gone".into()))?;
                let mut packets = vec![first];
                while let Ok(packet) = inbound.try_recv() {
                    packets.push(packet);
                }
                Ok(packets)
            }
        }
    }

    async fn write_packets(&self, packets: Vec<Vec<u8>>) -> TransportResult<()> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Shutdown);
        }
        if self.stalled.load(Ordering::Acquire) {
            std::future::pending::<()>().await;
        }
        for packet in packets {
            self.outbound
                .send(packet)
                .map_err(|_| TransportError::ConnectionClosed("peer gone".into()))?;
        }
        Ok(())
    }

    fn shutdown(&self) {
        self.cancel.cancel();
    }
}

// MARK: TLS

/// TLS stand-in that forwards bytes unchanged
#[derive(Debug, Default)]
pub(crate) struct PassthroughTls {
    started: bool,
    incoming: Vec<u8>,
    outgoing: Vec<u8>,
}

impl TlsEngine for PassthroughTls {
    fn start(&mut self) -> CryptoResult<()> {
        self.started = true;
        Ok(())
    }

    fn put_ciphertext(&mut self, data: &[u8]) -> CryptoResult<()> {
        self.incoming.extend_from_slice(data);
        Ok(())
    }

    fn pull_ciphertext(&mut self) -> CryptoResult<Vec<u8>> {
        Ok(std::mem::take(&mut self.outgoing))
    }

    fn put_plaintext(&mut self, data: &[u8]) -> CryptoResult<()> {
        self.outgoing.extend_from_slice(data);
        Ok(())
    }

    fn pull_plaintext(&mut self) -> CryptoResult<Vec<u8>> {
        Ok(std::mem::take(&mut self.incoming))
    }

    fn is_connected(&self) -> bool {
        self.started
    }

    fn export_keying_material(&self, _label: &str, length: usize) -> CryptoResult<Vec<u8>> {
        Ok(keying_material(length))
    }
}

// MARK: Server

/// How the fake server answers
#[derive(Debug, Clone)]
pub(crate) struct ServerScript {
    pub push_reply: String,
    pub auth_failed: bool,
    pub restart: bool,
    /// Never answer PUSH_REQUEST
    pub silent: bool,
}

impl Default for ServerScript {
    fn default() -> Self {
        Self {
            push_reply: "PUSH_REPLY,ifconfig 10.8.0.2 10.8.0.1,peer-id 1,cipher AES-256-GCM".into(),
            auth_failed: false,
            restart: false,
            silent: false,
        }
    }
}

/// What the fake server observed
#[derive(Debug, Clone, Default)]
pub(crate) struct ServerLog {
    pub client_options: Vec<String>,
    pub data: Vec<Vec<u8>>,
    pub pings: usize,
    pub exits: usize,
}

enum ServerCommand {
    SendData(u8, Vec<u8>),
    SoftReset(u8),
}

pub(crate) struct FakeServer {
    log: Arc<Mutex<ServerLog>>,
    commands: mpsc::UnboundedSender<ServerCommand>,
    stalled: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl FakeServer {
    pub fn spawn(peer: LinkPeer, script: ServerScript) -> Self {
        let log = Arc::new(Mutex::new(ServerLog::default()));
        let (commands, mut inbox) = mpsc::unbounded_channel();
        let stalled = peer.stalled.clone();
        let LinkPeer {
            to_client,
            mut from_client,
            ..
        } = peer;

        let pushed = PushReply::parse(&script.push_reply).ok().flatten();
        let mut server = ServerState {
            cipher: pushed
                .as_ref()
                .and_then(|r| r.options.cipher)
                .unwrap_or(Cipher::Aes256Gcm),
            peer_id: pushed.as_ref().and_then(|r| r.options.peer_id),
            script,
            log: log.clone(),
            control: ControlChannel::plain(&OsPrng),
            keys: HashMap::new(),
            data_channels: HashMap::new(),
            to_client,
        };

        let task = tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(50));
            loop {
                tokio::select! {
                    packet = from_client.recv() => match packet {
                        Some(packet) => server.receive(&packet),
                        None => break,
                    },
                    command = inbox.recv() => match command {
                        Some(command) => server.command(command),
                        None => break,
                    },
                    _ = tick.tick() => {}
                }
                server.flush();
            }
        });

        Self {
            log,
            commands,
            stalled,
            task,
        }
    }

    pub fn log(&self) -> ServerLog {
        self.log.lock().clone()
    }

    pub fn send_data(&self, key: u8, payload: Vec<u8>) {
        let _ = self.commands.send(ServerCommand::SendData(key, payload));
    }

    /// Start a server-initiated renegotiation of `key`
    pub fn soft_reset(&self, key: u8) {
        let _ = self.commands.send(ServerCommand::SoftReset(key));
    }

    /// Make every further client write hang
    pub fn stall_writes(&self) {
        self.stalled.store(true, Ordering::Release);
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct ServerKey {
    reliable: Reliable,
    buffer: Vec<u8>,
    authenticated: bool,
}

struct ServerState {
    script: ServerScript,
    log: Arc<Mutex<ServerLog>>,
    control: ControlChannel,
    keys: HashMap<u8, ServerKey>,
    data_channels: HashMap<u8, DataChannel>,
    to_client: mpsc::UnboundedSender<Vec<u8>>,
    cipher: Cipher,
    peer_id: Option<u32>,
}

/// Length of a complete client key method 2 message at the start of `data`
fn client_message_length(data: &[u8]) -> Option<usize> {
    if *data.get(..5)? != [0u8, 0, 0, 0, 2] {
        return None;
    }
    let mut offset = 5 + 48 + 2 * 32;
    // options, username, password, peer info
    for _ in 0..4 {
        let header = data.get(offset..offset + 2)?;
        offset += 2 + u16::from_be_bytes([header[0], header[1]]) as usize;
    }
    (offset <= data.len()).then_some(offset)
}

impl ServerState {
    fn reset(&mut self, key: u8, code: PacketCode) {
        let mut reliable = Reliable::new(key, Duration::from_millis(100));
        reliable.enqueue(code, &[]);
        self.keys.insert(
            key,
            ServerKey {
                reliable,
                buffer: Vec::new(),
                authenticated: false,
            },
        );
    }

    fn command(&mut self, command: ServerCommand) {
        match command {
            ServerCommand::SendData(key, payload) => {
                let Some(data_channel) = self.data_channels.get_mut(&key) else {
                    return;
                };
                if let Ok(packet) = data_channel.encrypt_packet(&payload) {
                    let _ = self.to_client.send(packet);
                }
            }
            ServerCommand::SoftReset(key) => self.reset(key, PacketCode::SoftResetV1),
        }
    }

    fn receive(&mut self, data: &[u8]) {
        let Ok((code, key)) = parse_header(data) else {
            return;
        };
        if code.is_data() {
            let Some(plaintext) = self
                .data_channels
                .get_mut(&key)
                .and_then(|dc| dc.decrypt_packet(data).ok())
            else {
                return;
            };
            let mut log = self.log.lock();
            if plaintext == PING_STRING {
                log.pings += 1;
            } else if plaintext == OccPacket::Exit.serialized() {
                log.exits += 1;
            } else {
                log.data.push(plaintext);
            }
            return;
        }

        let Ok(packet) = self.control.deserialize(data) else {
            return;
        };
        self.control.set_remote_session_id(packet.session_id);
        let fresh = self.keys.get(&key).is_none_or(|k| k.authenticated);
        match packet.code {
            PacketCode::HardResetClientV2 if fresh => {
                self.reset(key, PacketCode::HardResetServerV2)
            }
            PacketCode::SoftResetV1 if fresh => self.reset(key, PacketCode::SoftResetV1),
            _ => {}
        }

        let Some(state) = self.keys.get_mut(&key) else {
            return;
        };
        for (code, payload) in state.reliable.receive(packet) {
            if code == PacketCode::ControlV1 {
                state.buffer.extend_from_slice(&payload);
            }
        }
        self.process(key);
    }

    fn process(&mut self, key: u8) {
        let Some(state) = self.keys.get_mut(&key) else {
            return;
        };

        if !state.authenticated {
            let Some(length) = client_message_length(&state.buffer) else {
                return;
            };
            let message: Vec<u8> = state.buffer.drain(..length).collect();
            self.log
                .lock()
                .client_options
                .push(client_options(&message).unwrap_or_default());
            state
                .reliable
                .enqueue(PacketCode::ControlV1, &server_auth_message("V4,dev-type tun"));
            state.authenticated = true;

            let material = keying_material(DATA_KEYS_LENGTH);
            let responder = DataChannel::with_direction(
                key,
                self.cipher,
                &material,
                self.peer_id,
                Direction::Responder,
            );
            if let Ok(data_channel) = responder {
                self.data_channels.insert(key, data_channel);
            }
        }

        while let Some(end) = state.buffer.iter().position(|b| *b == 0) {
            let message: Vec<u8> = state.buffer.drain(..=end).collect();
            if message[..end] != *b"PUSH_REQUEST" || self.script.silent {
                continue;
            }
            let answer = if self.script.auth_failed {
                "AUTH_FAILED".to_string()
            } else if self.script.restart {
                "RESTART".to_string()
            } else {
                self.script.push_reply.clone()
            };
            let mut answer = answer.into_bytes();
            answer.push(0);
            state.reliable.enqueue(PacketCode::ControlV1, &answer);
        }
    }

    fn flush(&mut self) {
        let now = Instant::now();
        for state in self.keys.values_mut() {
            let Ok(packets) = state.reliable.outgoing(&mut self.control, now) else {
                continue;
            };
            for packet in packets {
                let _ = self.to_client.send(packet);
            }
        }
    }
}
