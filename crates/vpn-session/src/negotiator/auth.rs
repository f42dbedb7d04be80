//! Key method 2 authentication messages

use crypto_session::Prng;
use shared_protocol::{
    Cipher, Configuration, Credentials, ProtocolError, ProtocolResult, SocketType, WrapStrategy,
};

const KEY_METHOD: u8 = 2;

const PRE_MASTER_LENGTH: usize = 48;
const RANDOM_LENGTH: usize = 32;

/// Zero prefix, key method, two randoms
const SERVER_PREFIX_LENGTH: usize = 4 + 1 + 2 * RANDOM_LENGTH;

/// IV_PROTO bits: DATA_V2, request push, TLS key export
const IV_PROTO: u32 = 2 | 4 | 8;

fn put_string(out: &mut Vec<u8>, value: &str) {
    if value.is_empty() {
        out.extend_from_slice(&0u16.to_be_bytes());
        return;
    }
    out.extend_from_slice(&((value.len() + 1) as u16).to_be_bytes());
    out.extend_from_slice(value.as_bytes());
    out.push(0);
}

/// Client key method 2 message
pub(crate) fn client_auth_message(
    prng: &dyn Prng,
    options: &str,
    credentials: Option<&Credentials>,
    peer_info: &str,
) -> Vec<u8> {
    let mut out = vec![0u8; 4];
    out.push(KEY_METHOD);
    out.extend_from_slice(&prng.data(PRE_MASTER_LENGTH));
    out.extend_from_slice(&prng.data(RANDOM_LENGTH));
    out.extend_from_slice(&prng.data(RANDOM_LENGTH));
    put_string(&mut out, options);
    match credentials {
        Some(credentials) => {
            put_string(&mut out, &credentials.username);
            put_string(&mut out, &credentials.password);
        }
        None => {
            put_string(&mut out, "");
            put_string(&mut out, "");
        }
    }
    put_string(&mut out, peer_info);
    out
}

/// Options string announced to the server
pub(crate) fn options_string(configuration: &Configuration, socket_type: SocketType) -> String {
    let cipher = configuration.fallback_cipher();
    let tun_mtu = configuration.mtu.unwrap_or(1500) as u32;
    let proto = match socket_type {
        SocketType::Udp => "UDPv4",
        SocketType::Tcp => "TCPv4_CLIENT",
    };
    let mut options = vec![
        "V4".to_string(),
        "dev-type tun".to_string(),
        format!("link-mtu {}", tun_mtu + 59),
        format!("tun-mtu {}", tun_mtu),
        format!("proto {}", proto),
        format!("cipher {}", cipher),
        "auth [null-digest]".to_string(),
        format!("keysize {}", cipher.key_length() * 8),
        "key-method 2".to_string(),
    ];
    if configuration
        .tls_wrap
        .as_ref()
        .is_some_and(|wrap| wrap.strategy == WrapStrategy::Auth)
    {
        options.push("tls-auth".to_string());
    }
    options.push("tls-client".to_string());
    options.join(",")
}

pub(crate) fn peer_info(ciphers: &[Cipher]) -> String {
    let ciphers: Vec<&str> = ciphers.iter().map(|c| c.name()).collect();
    format!(
        "IV_VER=2.6.0\nIV_PLAT={}\nIV_PROTO={}\nIV_NCP=2\nIV_CIPHERS={}\n",
        std::env::consts::OS,
        IV_PROTO,
        ciphers.join(":")
    )
}

/// Server key method 2 reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ServerAuthReply {
    pub options: String,
}

impl ServerAuthReply {
    /// Parse from buffered plaintext; `Ok(None)` until the reply is complete.
    ///
    /// Returns the reply and the number of bytes it occupied.
    pub fn parse(data: &[u8]) -> ProtocolResult<Option<(Self, usize)>> {
        if data.len() < SERVER_PREFIX_LENGTH + 2 {
            return Ok(None);
        }
        if data[..4] != [0, 0, 0, 0] || data[4] != KEY_METHOD {
            return Err(ProtocolError::MalformedAuthMessage(format!(
                "unexpected key method {}",
                data[4]
            )));
        }

        let mut offset = SERVER_PREFIX_LENGTH;
        let length = u16::from_be_bytes([data[offset], data[offset + 1]]) as usize;
        offset += 2;
        if data.len() < offset + length {
            return Ok(None);
        }
        let raw = &data[offset..offset + length];
        offset += length;
        let options = String::from_utf8_lossy(raw.strip_suffix(&[0]).unwrap_or(raw)).into_owned();

        // empty trailing fields (username, password, peer info)
        while data.len() >= offset + 2 && data[offset..offset + 2] == [0, 0] {
            offset += 2;
        }
        Ok(Some((Self { options }, offset)))
    }
}

/// Server side of the exchange, for driving a negotiator in tests
#[cfg(test)]
pub(crate) fn server_auth_message(options: &str) -> Vec<u8> {
    let mut out = vec![0, 0, 0, 0, KEY_METHOD];
    out.extend_from_slice(&[7u8; 2 * RANDOM_LENGTH]);
    put_string(&mut out, options);
    out
}

/// Options string of a client message, for inspecting a negotiator in tests
#[cfg(test)]
pub(crate) fn client_options(message: &[u8]) -> Option<String> {
    let offset = 5 + PRE_MASTER_LENGTH + 2 * RANDOM_LENGTH;
    let header = message.get(offset..offset + 2)?;
    let length = u16::from_be_bytes([header[0], header[1]]) as usize;
    let raw = message.get(offset + 2..offset + 2 + length)?;
    Some(String::from_utf8_lossy(raw.strip_suffix(&[0]).unwrap_or(raw)).into_owned())
}
