//! Data channel: per-key AEAD encryption of tunnel packets

use aes_gcm::{Aes128Gcm, Aes256Gcm};
use chacha20poly1305::{
    ChaCha20Poly1305, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use shared_protocol::{Cipher, DATA_KEYS_LENGTH, PacketCode, header_byte, parse_header};
use zeroize::Zeroizing;

use crate::{
    CryptoError, CryptoResult, Direction, IMPLICIT_IV_SIZE, NONCE_SIZE, ReplayWindow, TAG_SIZE,
};

/// Offset of the hmac key inside a 128-byte key material slot
const HMAC_OFFSET: usize = 64;

/// Length of one direction slot in the exported key material
const SLOT_LENGTH: usize = DATA_KEYS_LENGTH / 2;

enum AeadCipher {
    Aes128(Box<Aes128Gcm>),
    Aes256(Box<Aes256Gcm>),
    ChaCha(Box<ChaCha20Poly1305>),
}

impl AeadCipher {
    fn new(cipher: Cipher, key: &[u8]) -> CryptoResult<Self> {
        let invalid = |_| CryptoError::InvalidKeyLength {
            expected: cipher.key_length(),
            actual: key.len(),
        };
        Ok(match cipher {
            Cipher::Aes128Gcm => {
                Self::Aes128(Box::new(Aes128Gcm::new_from_slice(key).map_err(invalid)?))
            }
            Cipher::Aes256Gcm => {
                Self::Aes256(Box::new(Aes256Gcm::new_from_slice(key).map_err(invalid)?))
            }
            Cipher::ChaCha20Poly1305 => {
                Self::ChaCha(Box::new(ChaCha20Poly1305::new_from_slice(key).map_err(invalid)?))
            }
        })
    }

    fn seal(
        &self,
        nonce: &[u8; NONCE_SIZE],
        aad: &[u8],
        plaintext: &[u8],
    ) -> CryptoResult<Vec<u8>> {
        let payload = Payload { msg: plaintext, aad };
        let result = match self {
            Self::Aes128(c) => c.encrypt(Nonce::from_slice(nonce), payload),
            Self::Aes256(c) => c.encrypt(Nonce::from_slice(nonce), payload),
            Self::ChaCha(c) => c.encrypt(Nonce::from_slice(nonce), payload),
        };
        result.map_err(|e| CryptoError::Encryption(e.to_string()))
    }

    fn open(
        &self,
        nonce: &[u8; NONCE_SIZE],
        aad: &[u8],
        ciphertext: &[u8],
    ) -> CryptoResult<Vec<u8>> {
        let payload = Payload { msg: ciphertext, aad };
        let result = match self {
            Self::Aes128(c) => c.decrypt(Nonce::from_slice(nonce), payload),
            Self::Aes256(c) => c.decrypt(Nonce::from_slice(nonce), payload),
            Self::ChaCha(c) => c.decrypt(Nonce::from_slice(nonce), payload),
        };
        result.map_err(|_| CryptoError::DecryptionFailed)
    }
}

/// One direction of the data channel
struct DataKey {
    cipher: AeadCipher,
    implicit_iv: [u8; IMPLICIT_IV_SIZE],
}

impl DataKey {
    fn from_slot(cipher: Cipher, slot: &[u8]) -> CryptoResult<Self> {
        let key = Zeroizing::new(slot[..cipher.key_length()].to_vec());
        let mut implicit_iv = [0u8; IMPLICIT_IV_SIZE];
        implicit_iv.copy_from_slice(&slot[HMAC_OFFSET..HMAC_OFFSET + IMPLICIT_IV_SIZE]);
        Ok(Self {
            cipher: AeadCipher::new(cipher, &key)?,
            implicit_iv,
        })
    }

    /// Nonce format: [4 bytes packet id][8 bytes implicit IV]
    fn nonce(&self, packet_id: u32) -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[..4].copy_from_slice(&packet_id.to_be_bytes());
        nonce[4..].copy_from_slice(&self.implicit_iv);
        nonce
    }
}

/// Symmetric keys of one key generation
pub struct DataChannel {
    key: u8,
    cipher: Cipher,
    peer_id: Option<u32>,
    encrypter: DataKey,
    decrypter: DataKey,
    outbound_packet_id: u32,
    replay: ReplayWindow,
}

impl DataChannel {
    /// Build a client-side data channel from exported key material
    pub fn new(
        key: u8,
        cipher: Cipher,
        material: &[u8],
        peer_id: Option<u32>,
    ) -> CryptoResult<Self> {
        Self::with_direction(key, cipher, material, peer_id, Direction::Initiator)
    }

    /// Build a data channel for either endpoint
    ///
    /// Slot 0 of the material carries initiator-to-responder keys, slot 1 the reverse.
    pub fn with_direction(
        key: u8,
        cipher: Cipher,
        material: &[u8],
        peer_id: Option<u32>,
        direction: Direction,
    ) -> CryptoResult<Self> {
        if material.len() < DATA_KEYS_LENGTH {
            return Err(CryptoError::InvalidKeyLength {
                expected: DATA_KEYS_LENGTH,
                actual: material.len(),
            });
        }
        let (outbound, inbound) = match direction {
            Direction::Initiator => (0, 1),
            Direction::Responder => (1, 0),
        };
        let slot = |index: usize| &material[index * SLOT_LENGTH..(index + 1) * SLOT_LENGTH];

        Ok(Self {
            key,
            cipher,
            peer_id,
            encrypter: DataKey::from_slot(cipher, slot(outbound))?,
            decrypter: DataKey::from_slot(cipher, slot(inbound))?,
            outbound_packet_id: 0,
            replay: ReplayWindow::new(),
        })
    }

    pub fn key(&self) -> u8 {
        self.key
    }

    pub fn cipher(&self) -> Cipher {
        self.cipher
    }

    pub fn peer_id(&self) -> Option<u32> {
        self.peer_id
    }

    fn header(&self) -> Vec<u8> {
        match self.peer_id {
            Some(peer_id) => {
                let mut header = vec![header_byte(PacketCode::DataV2, self.key)];
                header.extend_from_slice(&peer_id.to_be_bytes()[1..]);
                header
            }
            None => vec![header_byte(PacketCode::DataV1, self.key)],
        }
    }

    /// Encrypt one tunnel packet
    ///
    /// Returns: [header][4-byte packet id][ciphertext][16-byte auth tag]
    pub fn encrypt_packet(&mut self, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        if self.outbound_packet_id == u32::MAX {
            return Err(CryptoError::NonceOverflow);
        }
        self.outbound_packet_id += 1;
        let packet_id = self.outbound_packet_id;

        let mut packet = self.header();
        packet.extend_from_slice(&packet_id.to_be_bytes());
        let nonce = self.encrypter.nonce(packet_id);
        let ciphertext = self.encrypter.cipher.seal(&nonce, &packet, plaintext)?;
        packet.extend_from_slice(&ciphertext);
        Ok(packet)
    }

    pub fn encrypt(&mut self, packets: &[Vec<u8>]) -> CryptoResult<Vec<Vec<u8>>> {
        packets.iter().map(|p| self.encrypt_packet(p)).collect()
    }

    /// Decrypt and verify one link packet
    pub fn decrypt_packet(&mut self, packet: &[u8]) -> CryptoResult<Vec<u8>> {
        let (code, key) = parse_header(packet)?;
        if key != self.key {
            return Err(CryptoError::KeyMismatch {
                expected: self.key,
                actual: key,
            });
        }
        let header_length = match code {
            PacketCode::DataV2 => 4,
            PacketCode::DataV1 => 1,
            _ => return Err(CryptoError::DecryptionFailed),
        };
        let aad_length = header_length + 4;
        if packet.len() < aad_length + TAG_SIZE {
            return Err(CryptoError::DecryptionFailed);
        }

        let mut id_bytes = [0u8; 4];
        id_bytes.copy_from_slice(&packet[header_length..aad_length]);
        let packet_id = u32::from_be_bytes(id_bytes);
        if !self.replay.check(packet_id) {
            return Err(CryptoError::ReplayedPacket(packet_id));
        }

        let nonce = self.decrypter.nonce(packet_id);
        let plaintext = self
            .decrypter
            .cipher
            .open(&nonce, &packet[..aad_length], &packet[aad_length..])?;
        self.replay.update(packet_id);
        Ok(plaintext)
    }
}

impl std::fmt::Debug for DataChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataChannel")
            .field("key", &self.key)
            .field("cipher", &self.cipher)
            .field("peer_id", &self.peer_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn material() -> Vec<u8> {
        (0..DATA_KEYS_LENGTH).map(|i| i as u8).collect()
    }

    fn pair(cipher: Cipher, peer_id: Option<u32>) -> (DataChannel, DataChannel) {
        let client = DataChannel::new(2, cipher, &material(), peer_id).unwrap();
        let server =
            DataChannel::with_direction(2, cipher, &material(), peer_id, Direction::Responder)
                .unwrap();
        (client, server)
    }

    #[test]
    fn test_exchange_for_every_cipher() {
        for cipher in [Cipher::Aes128Gcm, Cipher::Aes256Gcm, Cipher::ChaCha20Poly1305] {
            let (mut client, mut server) = pair(cipher, Some(7));

            let packet = client.encrypt_packet(b"ip packet").unwrap();
            assert_eq!(packet[0], header_byte(PacketCode::DataV2, 2));
            assert_eq!(&packet[1..4], &[0, 0, 7]);
            assert_eq!(server.decrypt_packet(&packet).unwrap(), b"ip packet");

            let reply = server.encrypt_packet(b"reply").unwrap();
            assert_eq!(client.decrypt_packet(&reply).unwrap(), b"reply");
        }
    }

    #[test]
    fn test_data_v1_without_peer_id() {
        let (mut client, mut server) = pair(Cipher::ChaCha20Poly1305, None);
        let packet = client.encrypt_packet(b"payload").unwrap();
        assert_eq!(packet[0], header_byte(PacketCode::DataV1, 2));
        assert_eq!(server.decrypt_packet(&packet).unwrap(), b"payload");
    }

    #[test]
    fn test_replay_is_rejected() {
        let (mut client, mut server) = pair(Cipher::Aes256Gcm, Some(1));
        let packet = client.encrypt_packet(b"once").unwrap();
        server.decrypt_packet(&packet).unwrap();
        assert!(matches!(
            server.decrypt_packet(&packet),
            Err(CryptoError::ReplayedPacket(1))
        ));
    }

    #[test]
    fn test_tampered_packet_is_rejected() {
        let (mut client, mut server) = pair(Cipher::Aes256Gcm, Some(1));
        let mut packet = client.encrypt_packet(b"payload").unwrap();
        let last = packet.len() - 1;
        packet[last] ^= 0xff;
        assert!(matches!(
            server.decrypt_packet(&packet),
            Err(CryptoError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_own_packets_do_not_decrypt() {
        let (mut client, _) = pair(Cipher::Aes256Gcm, Some(1));
        let packet = client.encrypt_packet(b"payload").unwrap();
        assert!(client.decrypt_packet(&packet).is_err());
    }

    #[test]
    fn test_short_material_is_rejected() {
        let result = DataChannel::new(0, Cipher::Aes256Gcm, &[0u8; 64], None);
        assert!(matches!(result, Err(CryptoError::InvalidKeyLength { .. })));
    }
}
