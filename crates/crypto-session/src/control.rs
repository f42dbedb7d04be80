//! Control channel identity and pre-shared key wrapping

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{BufMut, BytesMut};
use chacha20poly1305::{
    ChaCha20Poly1305, Nonce,
    aead::{Aead, Payload},
};
use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use sha2::{Sha256, Sha512};
use shared_protocol::{
    ControlPacket, Digest, KeyDirection, SESSION_ID_LENGTH, SessionId, StaticKey,
};
use tracing::debug;
use zeroize::Zeroizing;

use crate::{CryptoError, CryptoResult, Direction, NONCE_SIZE, Prng, ReplayWindow, TAG_SIZE};

/// Offset of the hmac key inside a static key slot
const HMAC_OFFSET: usize = 64;

/// Replay packet id + timestamp
const REPLAY_HEADER_LENGTH: usize = 8;

/// Slots used for (outbound, inbound) traffic
fn slots(direction: Option<KeyDirection>) -> (usize, usize) {
    match direction {
        None => (0, 0),
        Some(KeyDirection::Server) => (0, 1),
        Some(KeyDirection::Client) => (1, 0),
    }
}

fn timestamp() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or_default()
}

struct ReplayCounter {
    outbound: u32,
    inbound: ReplayWindow,
}

impl ReplayCounter {
    fn new() -> Self {
        Self {
            outbound: 0,
            inbound: ReplayWindow::new(),
        }
    }

    fn next_header(&mut self) -> CryptoResult<[u8; REPLAY_HEADER_LENGTH]> {
        if self.outbound == u32::MAX {
            return Err(CryptoError::NonceOverflow);
        }
        self.outbound += 1;
        let mut header = [0u8; REPLAY_HEADER_LENGTH];
        header[..4].copy_from_slice(&self.outbound.to_be_bytes());
        header[4..].copy_from_slice(&timestamp().to_be_bytes());
        Ok(header)
    }

    fn accept(&mut self, header: &[u8]) -> CryptoResult<()> {
        let mut id = [0u8; 4];
        id.copy_from_slice(&header[..4]);
        let id = u32::from_be_bytes(id);
        if !self.inbound.check_and_update(id) {
            return Err(CryptoError::ReplayedPacket(id));
        }
        Ok(())
    }
}

/// `tls-auth`: HMAC over replay header, prefix and body
struct AuthWrap {
    digest: Digest,
    outbound_key: Zeroizing<Vec<u8>>,
    inbound_key: Zeroizing<Vec<u8>>,
    replay: ReplayCounter,
}

fn keyed<M: Mac + KeyInit>(key: &[u8], parts: &[&[u8]]) -> CryptoResult<M> {
    let mut mac =
        <M as Mac>::new_from_slice(key).map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac)
}

impl AuthWrap {
    fn mac(&self, key: &[u8], parts: &[&[u8]]) -> CryptoResult<Vec<u8>> {
        Ok(match self.digest {
            Digest::Sha256 => keyed::<Hmac<Sha256>>(key, parts)?.finalize().into_bytes().to_vec(),
            Digest::Sha512 => keyed::<Hmac<Sha512>>(key, parts)?.finalize().into_bytes().to_vec(),
        })
    }

    fn verify(&self, key: &[u8], parts: &[&[u8]], tag: &[u8]) -> CryptoResult<()> {
        match self.digest {
            Digest::Sha256 => keyed::<Hmac<Sha256>>(key, parts)?.verify_slice(tag),
            Digest::Sha512 => keyed::<Hmac<Sha512>>(key, parts)?.verify_slice(tag),
        }
        .map_err(|_| CryptoError::ControlAuthentication)
    }

    fn wrap(&mut self, prefix: &[u8], body: &[u8]) -> CryptoResult<Vec<u8>> {
        let replay = self.replay.next_header()?;
        let tag = self.mac(&self.outbound_key, &[&replay[..], prefix, body])?;

        let mut packet = Vec::with_capacity(prefix.len() + tag.len() + replay.len() + body.len());
        packet.extend_from_slice(prefix);
        packet.extend_from_slice(&tag);
        packet.extend_from_slice(&replay);
        packet.extend_from_slice(body);
        Ok(packet)
    }

    fn unwrap<'a>(&mut self, prefix: &[u8], rest: &'a [u8]) -> CryptoResult<&'a [u8]> {
        let tag_length = self.digest.length();
        if rest.len() < tag_length + REPLAY_HEADER_LENGTH {
            return Err(CryptoError::ControlAuthentication);
        }
        let (tag, rest) = rest.split_at(tag_length);
        let (replay, body) = rest.split_at(REPLAY_HEADER_LENGTH);

        self.verify(&self.inbound_key, &[replay, prefix, body], tag)?;
        self.replay.accept(replay)?;
        Ok(body)
    }
}

/// `tls-crypt`: AEAD-encrypted body, prefix and replay header as associated data
struct CryptWrap {
    encrypter: ChaCha20Poly1305,
    decrypter: ChaCha20Poly1305,
    replay: ReplayCounter,
}

impl CryptWrap {
    fn nonce(replay: &[u8]) -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[..REPLAY_HEADER_LENGTH].copy_from_slice(replay);
        nonce
    }

    fn wrap(&mut self, prefix: &[u8], body: &[u8]) -> CryptoResult<Vec<u8>> {
        let replay = self.replay.next_header()?;
        let mut aad = prefix.to_vec();
        aad.extend_from_slice(&replay);

        let nonce = Self::nonce(&replay);
        let ciphertext = self
            .encrypter
            .encrypt(Nonce::from_slice(&nonce), Payload { msg: body, aad: &aad })
            .map_err(|e| CryptoError::Encryption(e.to_string()))?;

        aad.extend_from_slice(&ciphertext);
        Ok(aad)
    }

    fn unwrap(&mut self, prefix: &[u8], rest: &[u8]) -> CryptoResult<Vec<u8>> {
        if rest.len() < REPLAY_HEADER_LENGTH + TAG_SIZE {
            return Err(CryptoError::ControlAuthentication);
        }
        let (replay, ciphertext) = rest.split_at(REPLAY_HEADER_LENGTH);
        let mut aad = prefix.to_vec();
        aad.extend_from_slice(replay);

        let nonce = Self::nonce(replay);
        let body = self
            .decrypter
            .decrypt(Nonce::from_slice(&nonce), Payload { msg: ciphertext, aad: &aad })
            .map_err(|_| CryptoError::ControlAuthentication)?;
        self.replay.accept(replay)?;
        Ok(body)
    }
}

enum ControlWrap {
    Plain,
    Auth(AuthWrap),
    Crypt(CryptWrap),
}

/// Control channel serializer shared by every negotiator of a session
pub struct ControlChannel {
    session_id: SessionId,
    remote_session_id: Option<SessionId>,
    wrap: ControlWrap,
}

impl ControlChannel {
    fn new_session_id(prng: &dyn Prng) -> SessionId {
        let mut session_id = [0u8; SESSION_ID_LENGTH];
        prng.fill_bytes(&mut session_id);
        session_id
    }

    /// Unwrapped control channel
    pub fn plain(prng: &dyn Prng) -> Self {
        Self {
            session_id: Self::new_session_id(prng),
            remote_session_id: None,
            wrap: ControlWrap::Plain,
        }
    }

    /// HMAC-authenticated control channel
    pub fn with_auth(prng: &dyn Prng, key: &StaticKey, digest: Digest) -> CryptoResult<Self> {
        let (outbound, inbound) = slots(key.direction);
        let hmac_key = |slot: usize| {
            Zeroizing::new(key.slot(slot)[HMAC_OFFSET..HMAC_OFFSET + digest.length()].to_vec())
        };
        Ok(Self {
            session_id: Self::new_session_id(prng),
            remote_session_id: None,
            wrap: ControlWrap::Auth(AuthWrap {
                digest,
                outbound_key: hmac_key(outbound),
                inbound_key: hmac_key(inbound),
                replay: ReplayCounter::new(),
            }),
        })
    }

    /// Encrypted and authenticated control channel
    ///
    /// The key direction follows the endpoint role, not the static key.
    pub fn with_crypt(prng: &dyn Prng, key: &StaticKey, role: Direction) -> CryptoResult<Self> {
        let (outbound, inbound) = slots(Some(match role {
            Direction::Initiator => KeyDirection::Client,
            Direction::Responder => KeyDirection::Server,
        }));
        let cipher = |slot: usize| {
            ChaCha20Poly1305::new_from_slice(&key.slot(slot)[..32])
                .map_err(|e| CryptoError::KeyGeneration(e.to_string()))
        };
        Ok(Self {
            session_id: Self::new_session_id(prng),
            remote_session_id: None,
            wrap: ControlWrap::Crypt(CryptWrap {
                encrypter: cipher(outbound)?,
                decrypter: cipher(inbound)?,
                replay: ReplayCounter::new(),
            }),
        })
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn remote_session_id(&self) -> Option<SessionId> {
        self.remote_session_id
    }

    pub fn set_remote_session_id(&mut self, remote_session_id: SessionId) {
        if self.remote_session_id != Some(remote_session_id) {
            debug!("Control: remote session id set");
        }
        self.remote_session_id = Some(remote_session_id);
    }

    /// Serialize a packet for the link, applying the wrap
    pub fn serialize(&mut self, packet: &ControlPacket) -> CryptoResult<Vec<u8>> {
        let prefix = packet.prefix();
        let mut body = BytesMut::new();
        packet.encode_body(&mut body)?;

        match &mut self.wrap {
            ControlWrap::Plain => {
                let mut data = Vec::with_capacity(prefix.len() + body.len());
                data.put_slice(&prefix);
                data.put_slice(&body);
                Ok(data)
            }
            ControlWrap::Auth(wrap) => wrap.wrap(&prefix, &body),
            ControlWrap::Crypt(wrap) => wrap.wrap(&prefix, &body),
        }
    }

    /// Parse a packet from the link, verifying the wrap
    pub fn deserialize(&mut self, data: &[u8]) -> CryptoResult<ControlPacket> {
        let (code, key, session_id) = ControlPacket::decode_prefix(data)?;
        let prefix = &data[..ControlPacket::PREFIX_LENGTH];
        let rest = &data[ControlPacket::PREFIX_LENGTH..];

        let packet = match &mut self.wrap {
            ControlWrap::Plain => ControlPacket::decode_body(code, key, session_id, rest)?,
            ControlWrap::Auth(wrap) => {
                let body = wrap.unwrap(prefix, rest)?;
                ControlPacket::decode_body(code, key, session_id, body)?
            }
            ControlWrap::Crypt(wrap) => {
                let body = wrap.unwrap(prefix, rest)?;
                ControlPacket::decode_body(code, key, session_id, &body)?
            }
        };
        Ok(packet)
    }
}
