//! Crypto engine capability
//!
//! The session asks a fresh engine for every control channel it opens and for
//! the data channel of every negotiated key.

use std::sync::Arc;

use shared_protocol::{Cipher, Digest, TlsWrap, WrapStrategy};

use crate::{ControlChannel, CryptoResult, DataChannel, Prng};

/// Builds control and data channels for a session
pub trait CryptoEngine: Send + Sync {
    fn new_control_channel(
        &self,
        prng: &dyn Prng,
        tls_wrap: Option<&TlsWrap>,
        digest: Digest,
    ) -> CryptoResult<ControlChannel>;

    fn new_data_channel(
        &self,
        key: u8,
        cipher: Cipher,
        material: &[u8],
        peer_id: Option<u32>,
    ) -> CryptoResult<DataChannel>;
}

/// Produces a crypto engine per session
pub type CryptoFactory = Arc<dyn Fn() -> Box<dyn CryptoEngine> + Send + Sync>;

/// AEAD-only engine backed by RustCrypto
#[derive(Debug, Default, Clone, Copy)]
pub struct AeadCryptoEngine;

impl CryptoEngine for AeadCryptoEngine {
    fn new_control_channel(
        &self,
        prng: &dyn Prng,
        tls_wrap: Option<&TlsWrap>,
        digest: Digest,
    ) -> CryptoResult<ControlChannel> {
        match tls_wrap {
            None => Ok(ControlChannel::plain(prng)),
            Some(wrap) => match wrap.strategy {
                WrapStrategy::Auth => ControlChannel::with_auth(prng, &wrap.key, digest),
                WrapStrategy::Crypt => {
                    ControlChannel::with_crypt(prng, &wrap.key, crate::Direction::Initiator)
                }
            },
        }
    }

    fn new_data_channel(
        &self,
        key: u8,
        cipher: Cipher,
        material: &[u8],
        peer_id: Option<u32>,
    ) -> CryptoResult<DataChannel> {
        DataChannel::new(key, cipher, material, peer_id)
    }
}

pub fn default_crypto_factory() -> CryptoFactory {
    Arc::new(|| Box::new(AeadCryptoEngine) as Box<dyn CryptoEngine>)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::OsPrng;
    use shared_protocol::{DATA_KEYS_LENGTH, KeyDirection, StaticKey};

    #[test]
    fn test_factory_builds_channels() {
        let engine = default_crypto_factory()();
        let wrap = TlsWrap {
            strategy: WrapStrategy::Auth,
            key: StaticKey::new(vec![7; StaticKey::LENGTH], Some(KeyDirection::Client)).unwrap(),
        };
        let control = engine
            .new_control_channel(&OsPrng, Some(&wrap), Digest::Sha256)
            .unwrap();
        assert!(control.remote_session_id().is_none());

        let data = engine
            .new_data_channel(1, Cipher::Aes128Gcm, &[3; DATA_KEYS_LENGTH], Some(4))
            .unwrap();
        assert_eq!(data.key(), 1);
        assert_eq!(data.peer_id(), Some(4));
    }
}
