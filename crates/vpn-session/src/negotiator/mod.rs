//! Handshake driver for one key id
//!
//! A negotiator runs as its own task. It exchanges resets with the server,
//! tunnels TLS through CONTROL_V1 packets, performs the key method 2
//! authentication and waits for the pushed options. The outcome is returned
//! once; the session decides what to do with it.

mod auth;
mod reliable;

use std::sync::Arc;

use crypto_session::{ControlChannel, CryptoEngine, DataChannel, Prng, TlsEngine};
use net_transport::Link;
use parking_lot::Mutex;
use shared_protocol::{
    Configuration, Credentials, DATA_KEYS_EXPORT_LABEL, DATA_KEYS_LENGTH, PacketCode, PushReply,
    SocketType,
};
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info};

use crate::{SessionError, SessionOptions, SessionResult};

#[cfg(test)]
pub(crate) use auth::{client_options, server_auth_message};
pub(crate) use reliable::Reliable;

const PUSH_REQUEST: &[u8] = b"PUSH_REQUEST\0";

/// Everything a negotiator needs besides its I/O
pub(crate) struct NegotiatorSettings {
    pub key: u8,
    /// Soft reset of an established session
    pub renegotiation: bool,
    pub configuration: Arc<Configuration>,
    pub credentials: Option<Credentials>,
    pub with_local_options: bool,
    /// Options of the current key, reused by a renegotiation
    pub previous_reply: Option<PushReply>,
    pub options: SessionOptions,
}

/// Result of a successful handshake
pub(crate) struct Negotiated {
    pub data_channel: DataChannel,
    pub push_reply: PushReply,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingReset,
    Tls,
    AwaitingAuthReply,
    AwaitingPushReply,
}

pub(crate) struct Negotiator {
    settings: NegotiatorSettings,
    link: Arc<dyn Link>,
    control: Arc<Mutex<ControlChannel>>,
    tls: Box<dyn TlsEngine>,
    crypto: Arc<dyn CryptoEngine>,
    prng: Arc<dyn Prng>,
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    reliable: Reliable,
    phase: Phase,
    plaintext: Vec<u8>,
    partial_reply: Option<PushReply>,
    last_push_request: Option<Instant>,
}

impl Negotiator {
    pub fn new(
        settings: NegotiatorSettings,
        link: Arc<dyn Link>,
        control: Arc<Mutex<ControlChannel>>,
        tls: Box<dyn TlsEngine>,
        crypto: Arc<dyn CryptoEngine>,
        prng: Arc<dyn Prng>,
        inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> Self {
        let reliable = Reliable::new(settings.key, settings.options.retx_interval);
        Self {
            settings,
            link,
            control,
            tls,
            crypto,
            prng,
            inbound,
            reliable,
            phase: Phase::AwaitingReset,
            plaintext: Vec::new(),
            partial_reply: None,
            last_push_request: None,
        }
    }

    pub async fn run(mut self) -> SessionResult<Negotiated> {
        let key = self.settings.key;
        let options = self.settings.options.clone();
        let started = Instant::now();
        let deadline = started
            + if self.settings.renegotiation {
                options.soft_negotiation_timeout
            } else {
                options.negotiation_timeout
            };
        let hard_reset_deadline = started + options.hard_reset_timeout;

        let reset = if self.settings.renegotiation {
            PacketCode::SoftResetV1
        } else {
            PacketCode::HardResetClientV2
        };
        self.reliable.enqueue(reset, &[]);
        debug!(key, ?reset, "Sending reset");

        loop {
            self.flush().await?;

            let next_tick = Instant::now() + options.tick_interval;
            tokio::select! {
                packet = self.inbound.recv() => match packet {
                    Some(packet) => self.handle_packet(&packet)?,
                    None => return Err(SessionError::Assertion("negotiator input closed".into())),
                },
                _ = sleep_until(next_tick) => {}
            }

            let now = Instant::now();
            if let Some(negotiated) = self.step(now)? {
                self.flush().await?;
                return Ok(negotiated);
            }
            if self.phase == Phase::AwaitingReset
                && !self.settings.renegotiation
                && now >= hard_reset_deadline
            {
                return Err(SessionError::HardResetTimeout);
            }
            if now >= deadline {
                return Err(SessionError::NegotiationTimeout);
            }
        }
    }

    async fn flush(&mut self) -> SessionResult<()> {
        let packets = {
            let mut control = self.control.lock();
            self.reliable.outgoing(&mut control, Instant::now())?
        };
        if !packets.is_empty() {
            self.link.write_packets(packets).await?;
        }
        Ok(())
    }

    fn handle_packet(&mut self, data: &[u8]) -> SessionResult<()> {
        let key = self.settings.key;
        let packet = {
            let mut control = self.control.lock();
            let packet = match control.deserialize(data) {
                Ok(packet) => packet,
                Err(e) => {
                    debug!(key, "Dropping control packet: {}", e);
                    return Ok(());
                }
            };
            if packet.remote_session_id.is_some_and(|id| id != control.session_id()) {
                debug!(key, "Dropping control packet for another session");
                return Ok(());
            }
            match control.remote_session_id() {
                Some(remote)
                    if remote != packet.session_id
                        && packet.code != PacketCode::HardResetServerV2 =>
                {
                    debug!(key, "Dropping control packet from unknown peer session");
                    return Ok(());
                }
                _ => control.set_remote_session_id(packet.session_id),
            }
            packet
        };

        for (code, payload) in self.reliable.receive(packet) {
            match (self.phase, code) {
                (Phase::AwaitingReset, PacketCode::HardResetServerV2 | PacketCode::SoftResetV1) => {
                    debug!(key, "Peer reset received, starting TLS");
                    self.tls.start()?;
                    self.phase = Phase::Tls;
                }
                (Phase::AwaitingReset, _) => debug!(key, ?code, "Ignoring packet before reset"),
                (_, PacketCode::ControlV1) => self.tls.put_ciphertext(&payload)?,
                _ => {}
            }
        }
        Ok(())
    }

    /// Advance the handshake; `Some` once the data channel is ready
    fn step(&mut self, now: Instant) -> SessionResult<Option<Negotiated>> {
        let key = self.settings.key;
        if self.phase == Phase::AwaitingReset {
            return Ok(None);
        }

        if self.phase == Phase::Tls && self.tls.is_connected() {
            let message = self.auth_message()?;
            self.tls.put_plaintext(&message)?;
            self.phase = Phase::AwaitingAuthReply;
            debug!(key, "TLS connected, sent auth message");
        }

        if self.phase != Phase::Tls {
            let plaintext = self.tls.pull_plaintext()?;
            self.plaintext.extend_from_slice(&plaintext);
        }

        if self.phase == Phase::AwaitingAuthReply {
            if let Some((reply, consumed)) = auth::ServerAuthReply::parse(&self.plaintext)? {
                self.plaintext.drain(..consumed);
                debug!(key, options = %reply.options, "Server auth reply");
                if self.settings.renegotiation {
                    if let Some(previous) = self.settings.previous_reply.clone() {
                        return self.complete(previous).map(Some);
                    }
                }
                self.phase = Phase::AwaitingPushReply;
            }
        }

        if self.phase == Phase::AwaitingPushReply {
            while let Some(end) = self.plaintext.iter().position(|b| *b == 0) {
                let message: Vec<u8> = self.plaintext.drain(..=end).collect();
                let message = String::from_utf8_lossy(&message[..end]).into_owned();
                if let Some(negotiated) = self.handle_message(&message)? {
                    return Ok(Some(negotiated));
                }
            }
            let interval = self.settings.options.push_request_interval;
            let due = self
                .last_push_request
                .is_none_or(|last| now.saturating_duration_since(last) >= interval);
            if due {
                self.tls.put_plaintext(PUSH_REQUEST)?;
                self.last_push_request = Some(now);
                debug!(key, "Sent PUSH_REQUEST");
            }
        }

        let ciphertext = self.tls.pull_ciphertext()?;
        if !ciphertext.is_empty() {
            self.reliable.enqueue(PacketCode::ControlV1, &ciphertext);
        }
        Ok(None)
    }

    fn auth_message(&self) -> SessionResult<Vec<u8>> {
        let configuration = &self.settings.configuration;
        let options = if self.settings.with_local_options {
            let socket_type = if self.link.is_reliable() {
                SocketType::Tcp
            } else {
                SocketType::Udp
            };
            auth::options_string(configuration, socket_type)
        } else {
            String::new()
        };
        let credentials = self
            .settings
            .credentials
            .as_ref()
            .map(Credentials::for_authentication)
            .transpose()?;
        let peer_info = auth::peer_info(&configuration.offered_ciphers());
        Ok(auth::client_auth_message(
            self.prng.as_ref(),
            &options,
            credentials.as_ref(),
            &peer_info,
        ))
    }

    fn handle_message(&mut self, message: &str) -> SessionResult<Option<Negotiated>> {
        let key = self.settings.key;
        if message.starts_with("AUTH_FAILED") {
            info!(key, "Server rejected credentials: {}", message);
            return Err(if self.settings.with_local_options {
                SessionError::BadCredentialsWithLocalOptions
            } else {
                SessionError::BadCredentials
            });
        }
        if message.starts_with("RESTART") || message.starts_with("HALT") {
            info!(key, "Server shutting down: {}", message);
            return Err(SessionError::ServerShutdown);
        }

        let Some(reply) = PushReply::parse(message)? else {
            debug!(key, "Ignoring control message: {}", message);
            return Ok(None);
        };
        let reply = match self.partial_reply.take() {
            Some(mut partial) => {
                partial.merge(reply);
                partial
            }
            None => reply,
        };
        if !reply.is_complete() {
            debug!(key, "Awaiting push reply continuation");
            self.partial_reply = Some(reply);
            return Ok(None);
        }
        self.complete(reply).map(Some)
    }

    fn complete(&mut self, push_reply: PushReply) -> SessionResult<Negotiated> {
        let key = self.settings.key;
        let material = self
            .tls
            .export_keying_material(DATA_KEYS_EXPORT_LABEL, DATA_KEYS_LENGTH)?;
        let cipher = push_reply
            .options
            .cipher
            .unwrap_or_else(|| self.settings.configuration.fallback_cipher());
        let data_channel =
            self.crypto
                .new_data_channel(key, cipher, &material, push_reply.options.peer_id)?;
        info!(key, %cipher, peer_id = ?push_reply.options.peer_id, "Negotiation completed");
        Ok(Negotiated {
            data_channel,
            push_reply,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::testing::{
        FakeServer, PassthroughTls, ScriptedLink, ServerScript, test_configuration,
    };
    use crypto_session::{AeadCryptoEngine, OsPrng};
    use shared_protocol::Cipher;
    use std::time::Duration;

    fn settings(with_local_options: bool) -> NegotiatorSettings {
        NegotiatorSettings {
            key: 0,
            renegotiation: false,
            configuration: Arc::new(test_configuration()),
            credentials: Some(Credentials::new("alice", "secret")),
            with_local_options,
            previous_reply: None,
            options: SessionOptions::default(),
        }
    }

    async fn negotiate(
        settings: NegotiatorSettings,
        script: ServerScript,
    ) -> SessionResult<Negotiated> {
        let (link, peer) = ScriptedLink::new(false);
        let _server = FakeServer::spawn(peer, script);

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let reader = link.clone();
        tokio::spawn(async move {
            while let Ok(packets) = reader.read_packets().await {
                for packet in packets {
                    if inbound_tx.send(packet).is_err() {
                        return;
                    }
                }
            }
        });

        let control = Arc::new(Mutex::new(ControlChannel::plain(&OsPrng)));
        Negotiator::new(
            settings,
            link,
            control,
            Box::new(PassthroughTls::default()),
            Arc::new(AeadCryptoEngine),
            Arc::new(OsPrng),
            inbound_rx,
        )
        .run()
        .await
    }

    #[tokio::test(start_paused = true)]
    async fn test_negotiation_yields_data_channel_and_push_reply() {
        let negotiated = negotiate(settings(true), ServerScript::default()).await.unwrap();
        assert_eq!(negotiated.data_channel.key(), 0);
        assert_eq!(negotiated.data_channel.cipher(), Cipher::Aes256Gcm);
        assert_eq!(negotiated.data_channel.peer_id(), Some(1));
        assert_eq!(negotiated.push_reply.options.peer_id, Some(1));
        assert!(negotiated.push_reply.options.ipv4.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_failed_depends_on_local_options() {
        let script = ServerScript {
            auth_failed: true,
            ..Default::default()
        };
        let with = negotiate(settings(true), script.clone()).await;
        assert!(matches!(with, Err(SessionError::BadCredentialsWithLocalOptions)));
        let without = negotiate(settings(false), script).await;
        assert!(matches!(without, Err(SessionError::BadCredentials)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_is_server_shutdown() {
        let script = ServerScript {
            restart: true,
            ..Default::default()
        };
        let result = negotiate(settings(true), script).await;
        assert!(matches!(result, Err(SessionError::ServerShutdown)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_push_reply_times_out() {
        let script = ServerScript {
            silent: true,
            ..Default::default()
        };
        let started = Instant::now();
        let result = negotiate(settings(true), script).await;
        assert!(matches!(result, Err(SessionError::NegotiationTimeout)));
        assert!(started.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_hard_reset_times_out_first() {
        let (link, _peer) = ScriptedLink::new(false);
        let (_inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let started = Instant::now();
        let result = Negotiator::new(
            settings(true),
            link,
            Arc::new(Mutex::new(ControlChannel::plain(&OsPrng))),
            Box::new(PassthroughTls::default()),
            Arc::new(AeadCryptoEngine),
            Arc::new(OsPrng),
            inbound_rx,
        )
        .run()
        .await;
        assert!(matches!(result, Err(SessionError::HardResetTimeout)));
        assert!(started.elapsed() < Duration::from_secs(11));
    }
}
