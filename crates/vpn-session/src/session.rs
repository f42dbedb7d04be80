//! Session - the orchestrator
//!
//! All mutable session state lives in a single actor task fed by one inbox.
//! Public calls, link and tunnel reads, negotiator outcomes and timers are
//! all turned into [`Command`]s and applied one at a time. Background tasks
//! only hold weak senders, so the actor ends once every [`Session`] handle
//! is dropped.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use crypto_session::{
    ControlChannel, CryptoEngine, CryptoFactory, DataChannel, OsPrng, Prng, TlsFactory, TlsOptions,
    default_crypto_factory, default_tls_factory,
};
use net_transport::{Link, TransportError, Tunnel};
use parking_lot::Mutex;
use shared_protocol::{
    Configuration, Credentials, KEY_ID_COUNT, OccPacket, PING_STRING, PacketCode, PushReply,
    parse_header,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::negotiator::{Negotiator, NegotiatorSettings};
use crate::{
    DataCounter, LocalOptionsFlag, SessionDelegate, SessionError, SessionOptions, SessionResult,
    is_ping_timed_out, keep_alive_interval, keep_alive_timeout, renegotiation_interval,
};

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Stopped,
    Starting,
    Started,
    Stopping,
}

/// Pluggable capabilities of a session
#[derive(Clone)]
pub struct SessionEngines {
    pub prng: Arc<dyn Prng>,
    pub tls_factory: TlsFactory,
    pub crypto_factory: CryptoFactory,
}

impl Default for SessionEngines {
    fn default() -> Self {
        Self {
            prng: Arc::new(OsPrng),
            tls_factory: default_tls_factory(),
            crypto_factory: default_crypto_factory(),
        }
    }
}

/// Key ids currently held by the session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeySnapshot {
    pub current_negotiator: Option<u8>,
    pub current_data_channel: Option<u8>,
    pub negotiators: Vec<u8>,
    pub data_channels: Vec<u8>,
    pub retired: Vec<u8>,
}

enum Command {
    SetLink(Arc<dyn Link>, oneshot::Sender<bool>),
    SetTunnel(Arc<dyn Tunnel>, oneshot::Sender<bool>),
    HasLink(oneshot::Sender<bool>),
    State(oneshot::Sender<SessionState>),
    KeySnapshot(oneshot::Sender<KeySnapshot>),
    Shutdown {
        error: Option<SessionError>,
        timeout: Option<Duration>,
        done: oneshot::Sender<()>,
    },
    LinkPackets(Vec<Vec<u8>>),
    LinkFailed(TransportError),
    TunnelPackets(Vec<Vec<u8>>),
    Negotiated {
        key: u8,
        data_channel: DataChannel,
        push_reply: PushReply,
    },
    NegotiationFailed {
        key: u8,
        error: SessionError,
    },
    Ping,
    Renegotiate,
    RetireExpired,
    ExitNotified,
}

/// Handle to a running session
///
/// Cheap to clone. Every method is applied by the session task in the order
/// it was called.
#[derive(Clone)]
pub struct Session {
    commands: mpsc::UnboundedSender<Command>,
}

impl Session {
    /// Validate the configuration and spawn the session task
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        configuration: Configuration,
        credentials: Option<Credentials>,
        engines: SessionEngines,
        options: SessionOptions,
        local_options: LocalOptionsFlag,
        delegate: Arc<dyn SessionDelegate>,
    ) -> SessionResult<Self> {
        let tls_options = TlsOptions::from_configuration(&configuration)
            .map_err(|e| SessionError::Configuration(e.to_string()))?;
        let crypto: Arc<dyn CryptoEngine> = Arc::from((engines.crypto_factory)());
        let control = crypto.new_control_channel(
            engines.prng.as_ref(),
            configuration.tls_wrap.as_ref(),
            configuration.fallback_digest(),
        )?;

        let (commands, inbox) = mpsc::unbounded_channel();
        let actor = SessionActor {
            state: SessionState::Stopped,
            configuration: Arc::new(configuration),
            credentials,
            counter: DataCounter::new(options.min_data_count_interval),
            options,
            local_options,
            delegate,
            prng: engines.prng,
            tls_factory: engines.tls_factory,
            tls_options,
            crypto,
            control: Arc::new(Mutex::new(control)),
            commands: commands.downgrade(),
            link: None,
            link_tasks: Vec::new(),
            link_writer: None,
            tunnel: None,
            tunnel_reader: None,
            negotiators: HashMap::new(),
            data_channels: HashMap::new(),
            retired: VecDeque::new(),
            current_negotiator_key: None,
            current_data_channel_key: None,
            push_reply: None,
            last_received: None,
            ping_task: None,
            renegotiation_task: None,
            retire_task: None,
            exit_task: None,
            stop_error: None,
            shutdown_waiters: Vec::new(),
        };
        tokio::spawn(actor.run(inbox));

        Ok(Self { commands })
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Option<T> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(command(tx)).ok()?;
        rx.await.ok()
    }

    /// Install the link and start negotiating; false if a link is already set
    pub async fn set_link(&self, link: Arc<dyn Link>) -> bool {
        self.request(|tx| Command::SetLink(link, tx)).await.unwrap_or(false)
    }

    /// Install the tunnel once; false if one is already set
    pub async fn set_tunnel(&self, tunnel: Arc<dyn Tunnel>) -> bool {
        self.request(|tx| Command::SetTunnel(tunnel, tx))
            .await
            .unwrap_or(false)
    }

    pub async fn has_link(&self) -> bool {
        self.request(Command::HasLink).await.unwrap_or(false)
    }

    pub async fn state(&self) -> SessionState {
        self.request(Command::State)
            .await
            .unwrap_or(SessionState::Stopped)
    }

    pub async fn key_snapshot(&self) -> KeySnapshot {
        self.request(Command::KeySnapshot).await.unwrap_or_default()
    }

    /// Stop the session and wait until it is stopped
    ///
    /// The exit notification is bounded by `timeout`, or by the configured
    /// write timeout when `None`. Does nothing if already stopping or stopped.
    pub async fn shutdown(&self, error: Option<SessionError>, timeout: Option<Duration>) {
        self.request(|done| Command::Shutdown {
            error,
            timeout,
            done,
        })
        .await;
    }
}

struct NegotiatorHandle {
    inbound: mpsc::UnboundedSender<Vec<u8>>,
    cancel: CancellationToken,
}

impl NegotiatorHandle {
    fn cancel(&self) {
        self.cancel.cancel();
    }
}

struct SessionActor {
    state: SessionState,
    configuration: Arc<Configuration>,
    credentials: Option<Credentials>,
    options: SessionOptions,
    local_options: LocalOptionsFlag,
    delegate: Arc<dyn SessionDelegate>,
    prng: Arc<dyn Prng>,
    tls_factory: TlsFactory,
    tls_options: TlsOptions,
    crypto: Arc<dyn CryptoEngine>,
    control: Arc<Mutex<ControlChannel>>,
    commands: mpsc::WeakUnboundedSender<Command>,

    link: Option<Arc<dyn Link>>,
    link_tasks: Vec<JoinHandle<()>>,
    link_writer: Option<mpsc::Sender<Vec<Vec<u8>>>>,
    tunnel: Option<Arc<dyn Tunnel>>,
    tunnel_reader: Option<JoinHandle<()>>,

    negotiators: HashMap<u8, NegotiatorHandle>,
    data_channels: HashMap<u8, DataChannel>,
    retired: VecDeque<u8>,
    current_negotiator_key: Option<u8>,
    current_data_channel_key: Option<u8>,
    push_reply: Option<PushReply>,

    counter: DataCounter,
    last_received: Option<Instant>,

    ping_task: Option<JoinHandle<()>>,
    renegotiation_task: Option<JoinHandle<()>>,
    retire_task: Option<JoinHandle<()>>,
    exit_task: Option<JoinHandle<()>>,

    stop_error: Option<SessionError>,
    shutdown_waiters: Vec<oneshot::Sender<()>>,
}

fn abort(task: &mut Option<JoinHandle<()>>) {
    if let Some(task) = task.take() {
        task.abort();
    }
}

impl SessionActor {
    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = inbox.recv().await {
            self.handle(command);
        }
        debug!("Session handles dropped, releasing resources");
        self.cleanup();
        abort(&mut self.tunnel_reader);
        abort(&mut self.exit_task);
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::SetLink(link, reply) => {
                let _ = reply.send(self.set_link(link));
            }
            Command::SetTunnel(tunnel, reply) => {
                let _ = reply.send(self.set_tunnel(tunnel));
            }
            Command::HasLink(reply) => {
                let _ = reply.send(self.link.is_some());
            }
            Command::State(reply) => {
                let _ = reply.send(self.state);
            }
            Command::KeySnapshot(reply) => {
                let _ = reply.send(self.key_snapshot());
            }
            Command::Shutdown {
                error,
                timeout,
                done,
            } => {
                self.shutdown(error, timeout);
                if self.state == SessionState::Stopping {
                    self.shutdown_waiters.push(done);
                } else {
                    let _ = done.send(());
                }
            }
            Command::LinkPackets(packets) => self.receive_link_packets(packets),
            Command::LinkFailed(e) => {
                if self.is_stopping() {
                    return;
                }
                error!("Link failed: {}", e);
                self.shutdown(Some(e.into()), None);
            }
            Command::TunnelPackets(packets) => self.send_tunnel_packets(packets),
            Command::Negotiated {
                key,
                data_channel,
                push_reply,
            } => self.did_negotiate(key, data_channel, push_reply),
            Command::NegotiationFailed { key, error } => {
                if self.is_stopping() || !self.negotiators.contains_key(&key) {
                    debug!(key, "Ignoring stale negotiation failure: {}", error);
                    return;
                }
                error!(key, "Negotiation failed: {}", error);
                self.shutdown(Some(error), None);
            }
            Command::Ping => {
                self.ping_task = None;
                self.ping();
            }
            Command::Renegotiate => {
                self.renegotiation_task = None;
                self.renegotiate();
            }
            Command::RetireExpired => {
                self.retire_task = None;
                while let Some(key) = self.retired.pop_front() {
                    debug!(key, "Transition window elapsed, evicting key");
                    self.evict(key);
                }
            }
            Command::ExitNotified => {
                self.exit_task = None;
                self.finish_shutdown();
            }
        }
    }

    fn is_stopping(&self) -> bool {
        matches!(self.state, SessionState::Stopping | SessionState::Stopped)
    }

    /// Send a command to ourselves from a background task
    fn spawn_delayed(&self, delay: Duration, command: fn() -> Command) -> JoinHandle<()> {
        let commands = self.commands.clone();
        tokio::spawn(async move {
            sleep(delay).await;
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(command());
            }
        })
    }

    fn key_snapshot(&self) -> KeySnapshot {
        let mut negotiators: Vec<u8> = self.negotiators.keys().copied().collect();
        negotiators.sort_unstable();
        let mut data_channels: Vec<u8> = self.data_channels.keys().copied().collect();
        data_channels.sort_unstable();
        KeySnapshot {
            current_negotiator: self.current_negotiator_key,
            current_data_channel: self.current_data_channel_key,
            negotiators,
            data_channels,
            retired: self.retired.iter().copied().collect(),
        }
    }

    // MARK: Link and tunnel

    fn set_link(&mut self, link: Arc<dyn Link>) -> bool {
        if self.link.is_some() {
            warn!("Link already set, ignoring");
            return false;
        }
        if self.state == SessionState::Stopping {
            warn!("Session is stopping, ignoring link");
            return false;
        }

        info!(
            remote = ?link.remote_address(),
            reliable = link.is_reliable(),
            "Link installed"
        );
        self.link = Some(link.clone());
        self.spawn_link_tasks(link);
        self.state = SessionState::Starting;
        self.start_negotiation(0, false, None);
        true
    }

    fn spawn_link_tasks(&mut self, link: Arc<dyn Link>) {
        let commands = self.commands.clone();
        let reader_link = link.clone();
        let reader = tokio::spawn(async move {
            loop {
                let result = reader_link.read_packets().await;
                let Some(commands) = commands.upgrade() else {
                    break;
                };
                let command = match result {
                    Ok(packets) => Command::LinkPackets(packets),
                    Err(TransportError::Shutdown) => break,
                    Err(e) => Command::LinkFailed(e),
                };
                let failed = matches!(command, Command::LinkFailed(_));
                if commands.send(command).is_err() || failed {
                    break;
                }
            }
            debug!("Link reader finished");
        });

        let (writer_tx, mut writer_rx) = mpsc::channel::<Vec<Vec<u8>>>(self.options.max_packets);
        let commands = self.commands.clone();
        let writer = tokio::spawn(async move {
            while let Some(packets) = writer_rx.recv().await {
                if let Err(e) = link.write_packets(packets).await {
                    if !matches!(e, TransportError::Shutdown) {
                        if let Some(commands) = commands.upgrade() {
                            let _ = commands.send(Command::LinkFailed(e));
                        }
                    }
                    break;
                }
            }
        });

        self.link_tasks = vec![reader, writer];
        self.link_writer = Some(writer_tx);
    }

    fn write_link(&self, packets: Vec<Vec<u8>>) {
        let Some(writer) = &self.link_writer else {
            return;
        };
        if let Err(e) = writer.try_send(packets) {
            debug!("Dropping outbound packets: {}", e);
        }
    }

    fn set_tunnel(&mut self, tunnel: Arc<dyn Tunnel>) -> bool {
        if self.tunnel.is_some() {
            warn!("Tunnel already set, ignoring");
            return false;
        }
        info!("Tunnel installed");
        self.tunnel = Some(tunnel.clone());

        let commands = self.commands.clone();
        self.tunnel_reader = Some(tokio::spawn(async move {
            loop {
                match tunnel.read_packets().await {
                    Ok(packets) => {
                        let Some(commands) = commands.upgrade() else {
                            break;
                        };
                        if commands.send(Command::TunnelPackets(packets)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("Tunnel reader finished: {}", e);
                        break;
                    }
                }
            }
        }));
        true
    }

    fn receive_link_packets(&mut self, packets: Vec<Vec<u8>>) {
        if self.is_stopping() {
            return;
        }
        self.last_received = Some(Instant::now());

        let mut inbound = Vec::new();
        for packet in packets {
            let (code, key) = match parse_header(&packet) {
                Ok(header) => header,
                Err(e) => {
                    debug!("Dropping link packet: {}", e);
                    continue;
                }
            };
            if code.is_control() {
                self.route_control_packet(code, key, packet);
                continue;
            }

            let Some(data_channel) = self.data_channels.get_mut(&key) else {
                debug!(key, "No data channel for key, dropping packet");
                continue;
            };
            match data_channel.decrypt_packet(&packet) {
                Ok(plaintext) if plaintext == PING_STRING => debug!("Received ping"),
                Ok(plaintext) => inbound.push(plaintext),
                Err(e) => warn!(key, "Unable to decrypt packet: {}", e),
            }
        }

        if inbound.is_empty() {
            return;
        }
        let bytes = inbound.iter().map(|p| p.len() as u64).sum();
        if let Some(tunnel) = &self.tunnel {
            if let Err(e) = tunnel.write_packets(inbound) {
                warn!("Unable to write to tunnel: {}", e);
            }
        }
        self.count(bytes, 0);
    }

    fn route_control_packet(&mut self, code: PacketCode, key: u8, packet: Vec<u8>) {
        if let Some(negotiator) = self.negotiators.get(&key) {
            if negotiator.inbound.send(packet).is_err() {
                debug!(key, "Negotiator finished, dropping control packet");
            }
            return;
        }
        if code == PacketCode::SoftResetV1 && self.state == SessionState::Started {
            info!(key, "Server requested renegotiation");
            self.start_negotiation(key, true, Some(packet));
            return;
        }
        debug!(key, ?code, "No negotiator for key, dropping control packet");
    }

    fn send_tunnel_packets(&mut self, packets: Vec<Vec<u8>>) {
        if self.is_stopping() {
            return;
        }
        let Some(data_channel) = self
            .current_data_channel_key
            .and_then(|key| self.data_channels.get_mut(&key))
        else {
            debug!("No data channel yet, dropping {} tunnel packets", packets.len());
            return;
        };

        let bytes = packets.iter().map(|p| p.len() as u64).sum();
        match data_channel.encrypt(&packets) {
            Ok(encrypted) => {
                self.write_link(encrypted);
                self.count(0, bytes);
            }
            Err(e) => warn!("Unable to encrypt packets: {}", e),
        }
    }

    fn count(&mut self, inbound: u64, outbound: u64) {
        if let Some(count) = self.counter.record(inbound, outbound, Instant::now()) {
            self.delegate.did_update_data_count(count);
        }
    }

    // MARK: Negotiation

    fn next_key(&self) -> u8 {
        match self.current_negotiator_key {
            None => 0,
            Some(key) if key + 1 >= KEY_ID_COUNT => 1,
            Some(key) => key + 1,
        }
    }

    fn start_negotiation(&mut self, key: u8, renegotiation: bool, initial: Option<Vec<u8>>) {
        let Some(link) = self.link.clone() else {
            debug!(key, "No link, not negotiating");
            return;
        };
        let tls = match (self.tls_factory)(&self.tls_options) {
            Ok(tls) => tls,
            Err(e) => {
                error!(key, "Unable to create TLS engine: {}", e);
                self.shutdown(Some(e.into()), None);
                return;
            }
        };

        if renegotiation {
            // a new generation supersedes whatever is still retiring
            while let Some(retired) = self.retired.pop_front() {
                self.evict(retired);
            }
            abort(&mut self.retire_task);
        }
        if let Some(previous) = self.negotiators.remove(&key) {
            previous.cancel();
        }

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        if let Some(packet) = initial {
            let _ = inbound_tx.send(packet);
        }
        let settings = NegotiatorSettings {
            key,
            renegotiation,
            configuration: self.configuration.clone(),
            credentials: self.credentials.clone(),
            with_local_options: self.local_options.is_enabled(),
            previous_reply: self.push_reply.clone(),
            options: self.options.clone(),
        };
        let negotiator = Negotiator::new(
            settings,
            link,
            self.control.clone(),
            tls,
            self.crypto.clone(),
            self.prng.clone(),
            inbound_rx,
        );

        let cancel = CancellationToken::new();
        let cancelled = cancel.clone();
        let commands = self.commands.clone();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                _ = cancelled.cancelled() => return,
                outcome = negotiator.run() => outcome,
            };
            let Some(commands) = commands.upgrade() else {
                return;
            };
            let command = match outcome {
                Ok(negotiated) => Command::Negotiated {
                    key,
                    data_channel: negotiated.data_channel,
                    push_reply: negotiated.push_reply,
                },
                Err(error) => Command::NegotiationFailed { key, error },
            };
            let _ = commands.send(command);
        });

        info!(key, renegotiation, "Negotiation started");
        self.negotiators.insert(
            key,
            NegotiatorHandle {
                inbound: inbound_tx,
                cancel,
            },
        );
    }

    fn did_negotiate(&mut self, key: u8, data_channel: DataChannel, push_reply: PushReply) {
        if self.is_stopping() {
            debug!(key, "Ignoring negotiation completed during shutdown");
            return;
        }
        if !self.negotiators.contains_key(&key) {
            debug!(key, "Ignoring negotiation of an evicted key");
            return;
        }

        self.data_channels.insert(key, data_channel);
        if let Some(previous) = self.current_data_channel_key {
            if previous != key {
                self.retired.push_back(previous);
            }
        }
        self.current_negotiator_key = Some(key);
        self.current_data_channel_key = Some(key);
        while self.retired.len() > 1 {
            if let Some(old) = self.retired.pop_front() {
                self.evict(old);
            }
        }
        info!(key, retired = ?self.retired, "Data channel installed");

        if self.state != SessionState::Started {
            let remote = self
                .link
                .as_ref()
                .and_then(|link| Some((link.remote_address()?, link.remote_protocol()?)));
            let Some((address, protocol)) = remote else {
                self.shutdown(
                    Some(SessionError::Assertion("unresolved remote address or protocol".into())),
                    None,
                );
                return;
            };
            self.state = SessionState::Started;
            info!(%address, %protocol, "Session started");
            self.delegate
                .session_did_start(address, protocol, &push_reply.options);
        }
        self.push_reply = Some(push_reply);

        if !self.retired.is_empty() {
            abort(&mut self.retire_task);
            self.retire_task = Some(self.spawn_delayed(self.options.transition_window, || {
                Command::RetireExpired
            }));
        }
        self.schedule_ping();
        self.schedule_renegotiation();
    }

    fn evict(&mut self, key: u8) {
        if let Some(negotiator) = self.negotiators.remove(&key) {
            negotiator.cancel();
        }
        self.data_channels.remove(&key);
        debug!(key, "Key evicted");
    }

    fn schedule_renegotiation(&mut self) {
        abort(&mut self.renegotiation_task);
        let pushed = self.push_reply.as_ref().map(|r| &r.options);
        if let Some(interval) = renegotiation_interval(pushed, &self.configuration) {
            debug!(?interval, "Scheduling renegotiation");
            self.renegotiation_task = Some(self.spawn_delayed(interval, || Command::Renegotiate));
        }
    }

    fn renegotiate(&mut self) {
        if self.state != SessionState::Started || self.link.is_none() {
            return;
        }
        let key = self.next_key();
        info!(key, "Renegotiating");
        self.start_negotiation(key, true, None);
    }

    // MARK: Keep-alive

    fn schedule_ping(&mut self) {
        abort(&mut self.ping_task);
        let pushed = self.push_reply.as_ref().map(|r| &r.options);
        let delay = keep_alive_interval(pushed, &self.configuration)
            .unwrap_or(self.options.ping_timeout_check_interval);
        debug!(?delay, "Scheduling ping");
        self.ping_task = Some(self.spawn_delayed(delay, || Command::Ping));
    }

    fn ping(&mut self) {
        if self.is_stopping() || self.link.is_none() {
            return;
        }
        let Some(key) = self.current_data_channel_key else {
            return;
        };

        let pushed = self.push_reply.as_ref().map(|r| &r.options);
        let timeout = keep_alive_timeout(pushed, &self.configuration, self.options.ping_timeout);
        if is_ping_timed_out(self.last_received, Instant::now(), timeout) {
            error!(?timeout, "Ping timeout");
            self.shutdown(Some(SessionError::PingTimeout), None);
            return;
        }

        if keep_alive_interval(pushed, &self.configuration).is_some() {
            if let Some(data_channel) = self.data_channels.get_mut(&key) {
                match data_channel.encrypt_packet(&PING_STRING) {
                    Ok(packet) => {
                        debug!(key, "Send ping");
                        self.write_link(vec![packet]);
                    }
                    Err(e) => warn!(key, "Unable to encrypt ping: {}", e),
                }
            }
        }
        self.schedule_ping();
    }

    // MARK: Shutdown

    fn shutdown(&mut self, error: Option<SessionError>, timeout: Option<Duration>) {
        if self.is_stopping() {
            debug!("Already stopping or stopped");
            return;
        }
        match &error {
            Some(e) => info!("Shutting down: {}", e),
            None => info!("Shutting down"),
        }
        self.state = SessionState::Stopping;

        let notifies = error.as_ref().is_none_or(SessionError::is_network_changed);
        self.stop_error = error;
        if notifies {
            if let Some(task) = self.notify_exit(timeout.unwrap_or(self.options.write_timeout)) {
                self.exit_task = Some(task);
                return;
            }
        }
        self.finish_shutdown();
    }

    /// Best-effort OCC exit on unreliable links, bounded by `timeout`
    fn notify_exit(&mut self, timeout: Duration) -> Option<JoinHandle<()>> {
        let link = self.link.clone().filter(|link| !link.is_reliable())?;
        let key = self.current_data_channel_key?;
        let data_channel = self.data_channels.get_mut(&key)?;
        let packet = match data_channel.encrypt_packet(&OccPacket::Exit.serialized()) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("Unable to encrypt exit notification: {}", e);
                return None;
            }
        };

        let deadline = Instant::now() + timeout;
        let commands = self.commands.clone();
        Some(tokio::spawn(async move {
            match timeout_at(deadline, link.write_packets(vec![packet])).await {
                Ok(Ok(())) => debug!("Sent exit notification"),
                Ok(Err(e)) => warn!("Unable to send exit notification: {}", e),
                Err(_) => warn!(?timeout, "Timed out sending exit notification"),
            }
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(Command::ExitNotified);
            }
        }))
    }

    fn finish_shutdown(&mut self) {
        if self.state != SessionState::Stopping {
            return;
        }
        self.cleanup();
        self.state = SessionState::Stopped;

        let error = self.stop_error.take();
        if error
            .as_ref()
            .is_some_and(SessionError::is_bad_credentials_with_local_options)
        {
            info!("Disabling local options for the next attempt");
            self.local_options.set(false);
        }
        info!("Session stopped");
        self.delegate.session_did_stop(error.as_ref());
        for waiter in self.shutdown_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    fn cleanup(&mut self) {
        if let Some(link) = self.link.take() {
            link.shutdown();
        }
        for task in self.link_tasks.drain(..) {
            task.abort();
        }
        self.link_writer = None;

        for (_, negotiator) in self.negotiators.drain() {
            negotiator.cancel();
        }
        self.data_channels.clear();
        self.retired.clear();
        self.current_negotiator_key = None;
        self.current_data_channel_key = None;
        self.push_reply = None;

        abort(&mut self.ping_task);
        abort(&mut self.renegotiation_task);
        abort(&mut self.retire_task);
        self.counter.reset();
        self.last_received = None;
    }
}
