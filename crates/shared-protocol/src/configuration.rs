//! Tunnel configuration and credentials

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64_STANDARD};
use serde::{Deserialize, Serialize};

use crate::{ProtocolError, ProtocolResult};

/// Transport socket type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SocketType {
    Udp,
    Tcp,
}

/// Remote endpoint protocol (socket type + port)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointProtocol {
    pub socket_type: SocketType,
    pub port: u16,
}

impl EndpointProtocol {
    pub fn new(socket_type: SocketType, port: u16) -> Self {
        Self { socket_type, port }
    }
}

impl fmt::Display for EndpointProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.socket_type {
            SocketType::Udp => "UDP",
            SocketType::Tcp => "TCP",
        };
        write!(f, "{}:{}", name, self.port)
    }
}

/// Data channel AEAD cipher
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Cipher {
    Aes128Gcm,
    #[default]
    Aes256Gcm,
    ChaCha20Poly1305,
}

impl Cipher {
    /// Name as used in OpenVPN options
    pub fn name(self) -> &'static str {
        match self {
            Self::Aes128Gcm => "AES-128-GCM",
            Self::Aes256Gcm => "AES-256-GCM",
            Self::ChaCha20Poly1305 => "CHACHA20-POLY1305",
        }
    }

    /// Key length in bytes
    pub fn key_length(self) -> usize {
        match self {
            Self::Aes128Gcm => 16,
            Self::Aes256Gcm | Self::ChaCha20Poly1305 => 32,
        }
    }
}

impl FromStr for Cipher {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "AES-128-GCM" => Ok(Self::Aes128Gcm),
            "AES-256-GCM" => Ok(Self::Aes256Gcm),
            "CHACHA20-POLY1305" => Ok(Self::ChaCha20Poly1305),
            _ => Err(ProtocolError::UnsupportedCipher(s.to_string())),
        }
    }
}

impl fmt::Display for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// HMAC digest for control channel authentication
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Digest {
    #[default]
    Sha256,
    Sha512,
}

impl Digest {
    pub fn name(self) -> &'static str {
        match self {
            Self::Sha256 => "SHA256",
            Self::Sha512 => "SHA512",
        }
    }

    /// Output length in bytes
    pub fn length(self) -> usize {
        match self {
            Self::Sha256 => 32,
            Self::Sha512 => 64,
        }
    }
}

impl FromStr for Digest {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().replace('-', "").as_str() {
            "SHA256" => Ok(Self::Sha256),
            "SHA512" => Ok(Self::Sha512),
            _ => Err(ProtocolError::UnsupportedDigest(s.to_string())),
        }
    }
}

/// Pre-shared key hardening strategy for the control channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WrapStrategy {
    /// HMAC-authenticate only (`tls-auth`)
    Auth,
    /// Encrypt and authenticate (`tls-crypt`)
    Crypt,
}

/// Static key direction (`key-direction` option)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyDirection {
    /// Direction 0
    Server,
    /// Direction 1
    Client,
}

/// 2048-bit OpenVPN static key
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticKey {
    data: Vec<u8>,
    pub direction: Option<KeyDirection>,
}

impl StaticKey {
    /// Static key length in bytes
    pub const LENGTH: usize = 256;

    /// Length of one direction slot (cipher key + hmac key)
    pub const SLOT_LENGTH: usize = 128;

    pub fn new(data: Vec<u8>, direction: Option<KeyDirection>) -> ProtocolResult<Self> {
        if data.len() != Self::LENGTH {
            return Err(ProtocolError::InvalidStaticKey(format!(
                "expected {} bytes, got {}",
                Self::LENGTH,
                data.len()
            )));
        }
        Ok(Self { data, direction })
    }

    /// Parse the `-----BEGIN OpenVPN Static key V1-----` file format
    pub fn from_file_content(
        content: &str,
        direction: Option<KeyDirection>,
    ) -> ProtocolResult<Self> {
        let digits: String = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with("-----"))
            .collect();

        let data =
            hex::decode(&digits).map_err(|e| ProtocolError::InvalidStaticKey(e.to_string()))?;
        Self::new(data, direction)
    }

    /// One of the two 128-byte direction slots
    pub fn slot(&self, index: usize) -> &[u8] {
        let start = (index % 2) * Self::SLOT_LENGTH;
        &self.data[start..start + Self::SLOT_LENGTH]
    }
}

impl fmt::Debug for StaticKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticKey")
            .field("direction", &self.direction)
            .finish_non_exhaustive()
    }
}

/// Control channel wrapping (`tls-auth` / `tls-crypt`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsWrap {
    pub strategy: WrapStrategy,
    pub key: StaticKey,
}

/// Immutable tunnel configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Configuration {
    /// PEM-encoded certificate authority
    pub ca: Option<String>,
    /// PEM-encoded client certificate
    pub client_certificate: Option<String>,
    /// PEM-encoded client private key
    pub client_key: Option<String>,
    /// Require the server certificate to carry the TLS server EKU
    pub checks_eku: Option<bool>,
    /// Verify the server certificate SAN against `san_host`
    pub checks_san_host: Option<bool>,
    pub san_host: Option<String>,
    /// Security level hint for the TLS engine (0-5)
    pub tls_security_level: Option<u8>,
    pub tls_wrap: Option<TlsWrap>,
    /// Preferred data channel cipher
    pub cipher: Option<Cipher>,
    /// Ciphers offered for negotiation
    pub data_ciphers: Option<Vec<Cipher>>,
    /// Digest used by `tls-auth`
    pub fallback_digest: Option<Digest>,
    pub keep_alive_interval: Option<Duration>,
    pub keep_alive_timeout: Option<Duration>,
    pub renegotiates_after: Option<Duration>,
    pub mtu: Option<u16>,
}

impl Configuration {
    /// The CA PEM, which every session requires
    pub fn ca_pem(&self) -> ProtocolResult<&str> {
        self.ca
            .as_deref()
            .filter(|pem| !pem.trim().is_empty())
            .ok_or(ProtocolError::MissingField("ca"))
    }

    pub fn fallback_cipher(&self) -> Cipher {
        self.cipher.unwrap_or_default()
    }

    pub fn fallback_digest(&self) -> Digest {
        self.fallback_digest.unwrap_or_default()
    }

    /// Ciphers offered to the server, preferred first
    pub fn offered_ciphers(&self) -> Vec<Cipher> {
        let mut ciphers = self.data_ciphers.clone().unwrap_or_else(|| {
            vec![Cipher::Aes256Gcm, Cipher::Aes128Gcm, Cipher::ChaCha20Poly1305]
        });
        if let Some(preferred) = self.cipher {
            ciphers.retain(|c| *c != preferred);
            ciphers.insert(0, preferred);
        }
        ciphers
    }
}

/// One-time password handling
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OtpMethod {
    #[default]
    None,
    /// Append the OTP to the password
    Append,
    /// Send `SCRV1:base64(password):base64(otp)`
    Encode,
}

/// Username/password credentials
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub otp_method: OtpMethod,
    pub otp: Option<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            ..Default::default()
        }
    }

    pub fn with_otp(mut self, method: OtpMethod, otp: impl Into<String>) -> Self {
        self.otp_method = method;
        self.otp = Some(otp.into());
        self
    }

    /// Credentials as sent to the server, with the OTP folded into the password
    pub fn for_authentication(&self) -> ProtocolResult<Credentials> {
        let password = match self.otp_method {
            OtpMethod::None => self.password.clone(),
            OtpMethod::Append => {
                let otp = self.otp.as_deref().ok_or(ProtocolError::MissingField("otp"))?;
                format!("{}{}", self.password, otp)
            }
            OtpMethod::Encode => {
                let otp = self.otp.as_deref().ok_or(ProtocolError::MissingField("otp"))?;
                format!(
                    "SCRV1:{}:{}",
                    BASE64_STANDARD.encode(self.password.as_bytes()),
                    BASE64_STANDARD.encode(otp.as_bytes())
                )
            }
        };
        Ok(Credentials {
            username: self.username.clone(),
            password,
            otp_method: OtpMethod::None,
            otp: None,
        })
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("otp_method", &self.otp_method)
            .finish_non_exhaustive()
    }
}
