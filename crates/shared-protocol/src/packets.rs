//! Packet opcodes and the control packet body codec

use bytes::{Buf, BufMut, BytesMut};

use crate::{KEY_ID_COUNT, OCC_MAGIC, ProtocolError, ProtocolResult};

/// Length of a control channel session id
pub const SESSION_ID_LENGTH: usize = 8;

/// Maximum number of acks carried by a single control packet
pub const MAX_ACKS_PER_PACKET: usize = 8;

/// Control channel session id
pub type SessionId = [u8; SESSION_ID_LENGTH];

/// Opcode carried in the high 5 bits of the first packet byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketCode {
    SoftResetV1 = 3,
    ControlV1 = 4,
    AckV1 = 5,
    DataV1 = 6,
    HardResetClientV2 = 7,
    HardResetServerV2 = 8,
    DataV2 = 9,
}

impl PacketCode {
    pub fn is_data(self) -> bool {
        matches!(self, Self::DataV1 | Self::DataV2)
    }

    pub fn is_control(self) -> bool {
        !self.is_data()
    }
}

impl TryFrom<u8> for PacketCode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            3 => Ok(Self::SoftResetV1),
            4 => Ok(Self::ControlV1),
            5 => Ok(Self::AckV1),
            6 => Ok(Self::DataV1),
            7 => Ok(Self::HardResetClientV2),
            8 => Ok(Self::HardResetServerV2),
            9 => Ok(Self::DataV2),
            other => Err(ProtocolError::InvalidPacketCode(other)),
        }
    }
}

/// Compose the first packet byte
pub fn header_byte(code: PacketCode, key: u8) -> u8 {
    ((code as u8) << 3) | (key % KEY_ID_COUNT)
}

/// Split the first packet byte into opcode and key id
pub fn parse_header(packet: &[u8]) -> ProtocolResult<(PacketCode, u8)> {
    let first = *packet
        .first()
        .ok_or(ProtocolError::PacketTooShort { size: 0, min: 1 })?;
    let code = PacketCode::try_from(first >> 3)?;
    Ok((code, first & 0x07))
}

/// OCC messages understood by the data channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OccPacket {
    Exit,
}

impl OccPacket {
    pub fn serialized(self) -> Vec<u8> {
        let opcode = match self {
            Self::Exit => 0x06,
        };
        let mut data = OCC_MAGIC.to_vec();
        data.push(opcode);
        data
    }
}

/// Decoded control channel packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPacket {
    pub code: PacketCode,
    pub key: u8,
    pub session_id: SessionId,
    pub acks: Vec<u32>,
    pub remote_session_id: Option<SessionId>,
    /// Absent for `AckV1`
    pub packet_id: Option<u32>,
    pub payload: Vec<u8>,
}

impl ControlPacket {
    /// Length of opcode byte plus session id
    pub const PREFIX_LENGTH: usize = 1 + SESSION_ID_LENGTH;

    pub fn new(
        code: PacketCode,
        key: u8,
        session_id: SessionId,
        packet_id: u32,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            code,
            key,
            session_id,
            acks: Vec::new(),
            remote_session_id: None,
            packet_id: Some(packet_id),
            payload,
        }
    }

    /// Standalone acknowledgement
    pub fn ack(
        key: u8,
        session_id: SessionId,
        acks: Vec<u32>,
        remote_session_id: SessionId,
    ) -> Self {
        Self {
            code: PacketCode::AckV1,
            key,
            session_id,
            acks,
            remote_session_id: Some(remote_session_id),
            packet_id: None,
            payload: Vec::new(),
        }
    }

    /// Opcode byte and session id, the unwrapped part of every control packet
    pub fn prefix(&self) -> [u8; Self::PREFIX_LENGTH] {
        let mut prefix = [0u8; Self::PREFIX_LENGTH];
        prefix[0] = header_byte(self.code, self.key);
        prefix[1..].copy_from_slice(&self.session_id);
        prefix
    }

    /// Encode acks, remote session id, packet id and payload
    pub fn encode_body(&self, buf: &mut BytesMut) -> ProtocolResult<()> {
        buf.put_u8(self.acks.len() as u8);
        if !self.acks.is_empty() {
            for ack in &self.acks {
                buf.put_u32(*ack);
            }
            let remote = self
                .remote_session_id
                .ok_or(ProtocolError::MissingRemoteSessionId)?;
            buf.put_slice(&remote);
        }
        if self.code != PacketCode::AckV1 {
            let packet_id = self.packet_id.ok_or(ProtocolError::MissingField("packet_id"))?;
            buf.put_u32(packet_id);
            buf.put_slice(&self.payload);
        }
        Ok(())
    }

    /// Decode opcode, key id and session id
    pub fn decode_prefix(data: &[u8]) -> ProtocolResult<(PacketCode, u8, SessionId)> {
        if data.len() < Self::PREFIX_LENGTH {
            return Err(ProtocolError::PacketTooShort {
                size: data.len(),
                min: Self::PREFIX_LENGTH,
            });
        }
        let (code, key) = parse_header(data)?;
        let mut session_id = [0u8; SESSION_ID_LENGTH];
        session_id.copy_from_slice(&data[1..Self::PREFIX_LENGTH]);
        Ok((code, key, session_id))
    }

    /// Decode the body following the prefix (and any wrap header)
    pub fn decode_body(
        code: PacketCode,
        key: u8,
        session_id: SessionId,
        mut body: &[u8],
    ) -> ProtocolResult<Self> {
        let total = body.len();
        let short = |min: usize| ProtocolError::PacketTooShort { size: total, min };

        if body.remaining() < 1 {
            return Err(short(1));
        }
        let ack_count = body.get_u8() as usize;
        let mut acks = Vec::with_capacity(ack_count);
        let mut remote_session_id = None;
        if ack_count > 0 {
            let needed = ack_count * 4 + SESSION_ID_LENGTH;
            if body.remaining() < needed {
                return Err(short(1 + needed));
            }
            for _ in 0..ack_count {
                acks.push(body.get_u32());
            }
            let mut remote = [0u8; SESSION_ID_LENGTH];
            body.copy_to_slice(&mut remote);
            remote_session_id = Some(remote);
        }

        let (packet_id, payload) = if code == PacketCode::AckV1 {
            (None, Vec::new())
        } else {
            if body.remaining() < 4 {
                return Err(short(total - body.remaining() + 4));
            }
            (Some(body.get_u32()), body.to_vec())
        };

        Ok(Self {
            code,
            key,
            session_id,
            acks,
            remote_session_id,
            packet_id,
            payload,
        })
    }

    /// Unwrapped wire encoding
    pub fn encode_plain(&self) -> ProtocolResult<Vec<u8>> {
        let mut buf = BytesMut::with_capacity(Self::PREFIX_LENGTH + 64 + self.payload.len());
        buf.put_slice(&self.prefix());
        self.encode_body(&mut buf)?;
        Ok(buf.to_vec())
    }

    pub fn decode_plain(data: &[u8]) -> ProtocolResult<Self> {
        let (code, key, session_id) = Self::decode_prefix(data)?;
        Self::decode_body(code, key, session_id, &data[Self::PREFIX_LENGTH..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_byte_layout() {
        let byte = header_byte(PacketCode::DataV2, 3);
        assert_eq!(byte, 0x4b);
        assert_eq!(parse_header(&[byte]).unwrap(), (PacketCode::DataV2, 3));
        assert!(matches!(
            parse_header(&[0x00]),
            Err(ProtocolError::InvalidPacketCode(0))
        ));
    }

    #[test]
    fn test_control_packet_with_acks() {
        let mut packet =
            ControlPacket::new(PacketCode::ControlV1, 1, [1; 8], 42, b"hello".to_vec());
        packet.acks = vec![7, 8];
        packet.remote_session_id = Some([2; 8]);

        let encoded = packet.encode_plain().unwrap();
        // prefix + ack count + 2 acks + remote sid + packet id + payload
        assert_eq!(encoded.len(), 9 + 1 + 8 + 8 + 4 + 5);
        assert_eq!(ControlPacket::decode_plain(&encoded).unwrap(), packet);
    }

    #[test]
    fn test_ack_requires_remote_session_id() {
        let mut packet = ControlPacket::ack(0, [1; 8], vec![1], [2; 8]);
        packet.remote_session_id = None;
        assert!(matches!(
            packet.encode_plain(),
            Err(ProtocolError::MissingRemoteSessionId)
        ));
    }

    #[test]
    fn test_truncated_body_is_rejected() {
        let packet = ControlPacket::ack(0, [1; 8], vec![1, 2, 3], [2; 8]);
        let encoded = packet.encode_plain().unwrap();
        let result = ControlPacket::decode_plain(&encoded[..encoded.len() - 4]);
        assert!(matches!(result, Err(ProtocolError::PacketTooShort { .. })));
    }

    #[test]
    fn test_occ_exit_payload() {
        let exit = OccPacket::Exit.serialized();
        assert_eq!(&exit[..16], &OCC_MAGIC);
        assert_eq!(exit[16], 0x06);
    }
}
