//! TLS engine capability for the control channel

use std::io::{ErrorKind, Read, Write};
use std::sync::Arc;

use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{
    CertificateError, ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore,
    SignatureScheme,
};
use shared_protocol::Configuration;
use tracing::{debug, warn};

use crate::{CryptoError, CryptoResult};

/// Server name presented when no SAN host is configured
pub const DEFAULT_SERVER_NAME: &str = "openvpn.server";

/// Inputs of a TLS engine, derived from the tunnel configuration
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    pub ca_pem: String,
    pub client_certificate_pem: Option<String>,
    pub client_key_pem: Option<String>,
    pub hostname: Option<String>,
    pub checks_eku: bool,
    pub checks_san_host: bool,
    pub security_level: Option<u8>,
}

impl TlsOptions {
    pub fn from_configuration(configuration: &Configuration) -> CryptoResult<Self> {
        Ok(Self {
            ca_pem: configuration.ca_pem()?.to_string(),
            client_certificate_pem: configuration.client_certificate.clone(),
            client_key_pem: configuration.client_key.clone(),
            hostname: configuration.san_host.clone(),
            checks_eku: configuration.checks_eku.unwrap_or(false),
            checks_san_host: configuration.checks_san_host.unwrap_or(false),
            security_level: configuration.tls_security_level,
        })
    }
}

/// In-memory TLS client driven by the control channel
///
/// Ciphertext moves through `put_ciphertext`/`pull_ciphertext`, application
/// data through `put_plaintext`/`pull_plaintext`. No I/O happens here.
pub trait TlsEngine: Send {
    /// Begin the handshake
    fn start(&mut self) -> CryptoResult<()>;

    fn put_ciphertext(&mut self, data: &[u8]) -> CryptoResult<()>;

    /// Pending records for the peer, empty when there are none
    fn pull_ciphertext(&mut self) -> CryptoResult<Vec<u8>>;

    fn put_plaintext(&mut self, data: &[u8]) -> CryptoResult<()>;

    /// Decrypted application data, empty when there is none
    fn pull_plaintext(&mut self) -> CryptoResult<Vec<u8>>;

    fn is_connected(&self) -> bool;

    fn export_keying_material(&self, label: &str, length: usize) -> CryptoResult<Vec<u8>>;
}

/// Produces a TLS engine per negotiation
pub type TlsFactory = Arc<dyn Fn(&TlsOptions) -> CryptoResult<Box<dyn TlsEngine>> + Send + Sync>;

pub fn default_tls_factory() -> TlsFactory {
    Arc::new(|options: &TlsOptions| {
        RustlsEngine::new(options).map(|engine| Box::new(engine) as Box<dyn TlsEngine>)
    })
}

/// TLS engine backed by a rustls client connection
pub struct RustlsEngine {
    connection: ClientConnection,
}

impl RustlsEngine {
    pub fn new(options: &TlsOptions) -> CryptoResult<Self> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let mut roots = RootCertStore::empty();
        for cert in parse_certificates(&options.ca_pem)? {
            roots
                .add(cert)
                .map_err(|e| CryptoError::Certificate(e.to_string()))?;
        }
        let verifier = OpenVpnServerVerifier::new(roots, provider.clone(), options)?;

        let versions: &[&rustls::SupportedProtocolVersion] = match options.security_level {
            Some(level) if level >= 4 => &[&rustls::version::TLS13],
            _ => rustls::ALL_VERSIONS,
        };
        let builder = ClientConfig::builder_with_provider(provider)
            .with_protocol_versions(versions)
            .map_err(|e| CryptoError::Tls(e.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier));

        let config = match (&options.client_certificate_pem, &options.client_key_pem) {
            (Some(certificate), Some(key)) => builder
                .with_client_auth_cert(parse_certificates(certificate)?, parse_private_key(key)?)
                .map_err(|e| CryptoError::Certificate(e.to_string()))?,
            _ => builder.with_no_client_auth(),
        };

        let hostname = match (&options.hostname, options.checks_san_host) {
            (Some(hostname), true) => hostname.clone(),
            _ => DEFAULT_SERVER_NAME.to_string(),
        };
        let server_name =
            ServerName::try_from(hostname).map_err(|e| CryptoError::Tls(e.to_string()))?;

        let connection = ClientConnection::new(Arc::new(config), server_name)
            .map_err(|e| CryptoError::Tls(e.to_string()))?;
        Ok(Self { connection })
    }
}

impl TlsEngine for RustlsEngine {
    fn start(&mut self) -> CryptoResult<()> {
        // ClientHello is queued when the connection is created
        debug!("TLS: handshake started");
        Ok(())
    }

    fn put_ciphertext(&mut self, mut data: &[u8]) -> CryptoResult<()> {
        while !data.is_empty() {
            self.connection
                .read_tls(&mut data)
                .map_err(|e| CryptoError::Tls(e.to_string()))?;
            self.connection.process_new_packets().map_err(|e| {
                warn!("TLS: {}", e);
                CryptoError::Tls(e.to_string())
            })?;
        }
        Ok(())
    }

    fn pull_ciphertext(&mut self) -> CryptoResult<Vec<u8>> {
        let mut out = Vec::new();
        while self.connection.wants_write() {
            self.connection
                .write_tls(&mut out)
                .map_err(|e| CryptoError::Tls(e.to_string()))?;
        }
        Ok(out)
    }

    fn put_plaintext(&mut self, data: &[u8]) -> CryptoResult<()> {
        self.connection
            .writer()
            .write_all(data)
            .map_err(|e| CryptoError::Tls(e.to_string()))
    }

    fn pull_plaintext(&mut self) -> CryptoResult<Vec<u8>> {
        let mut out = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            match self.connection.reader().read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => return Err(CryptoError::Tls(e.to_string())),
            }
        }
        Ok(out)
    }

    fn is_connected(&self) -> bool {
        !self.connection.is_handshaking()
    }

    fn export_keying_material(&self, label: &str, length: usize) -> CryptoResult<Vec<u8>> {
        if !self.is_connected() {
            return Err(CryptoError::TlsNotConnected);
        }
        self.connection
            .export_keying_material(vec![0u8; length], label.as_bytes(), None)
            .map_err(|e| CryptoError::Tls(e.to_string()))
    }
}

fn parse_certificates(pem: &str) -> CryptoResult<Vec<CertificateDer<'static>>> {
    let certificates = rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CryptoError::Certificate(e.to_string()))?;
    if certificates.is_empty() {
        return Err(CryptoError::Certificate("no certificate in PEM".into()));
    }
    Ok(certificates)
}

fn parse_private_key(pem: &str) -> CryptoResult<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut pem.as_bytes())
        .map_err(|e| CryptoError::Certificate(e.to_string()))?
        .ok_or_else(|| CryptoError::Certificate("no private key in PEM".into()))
}

/// Chain verification against the configured CA, with optional name and EKU checks
#[derive(Debug)]
struct OpenVpnServerVerifier {
    inner: Arc<WebPkiServerVerifier>,
    checks_eku: bool,
    checks_san_host: bool,
}

impl OpenVpnServerVerifier {
    fn new(
        roots: RootCertStore,
        provider: Arc<CryptoProvider>,
        options: &TlsOptions,
    ) -> CryptoResult<Self> {
        let inner = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider)
            .build()
            .map_err(|e| CryptoError::Certificate(e.to_string()))?;
        Ok(Self {
            inner,
            checks_eku: options.checks_eku,
            checks_san_host: options.checks_san_host,
        })
    }

    /// Certificate errors waived by configuration
    fn tolerated(&self, error: &rustls::Error) -> bool {
        match error {
            rustls::Error::InvalidCertificate(
                CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. },
            ) => !self.checks_san_host,
            rustls::Error::InvalidCertificate(
                CertificateError::InvalidPurpose | CertificateError::InvalidPurposeContext { .. },
            ) => !self.checks_eku,
            _ => false,
        }
    }
}

impl ServerCertVerifier for OpenVpnServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Err(e) if self.tolerated(&e) => {
                debug!("TLS: ignoring {:?}", e);
                Ok(ServerCertVerified::assertion())
            }
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}
