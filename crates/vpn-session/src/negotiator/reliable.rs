//! Reliable, ordered delivery of control packets for one key

use std::collections::BTreeMap;
use std::time::Duration;

use crypto_session::{ControlChannel, CryptoResult};
use shared_protocol::{ControlPacket, MAX_ACKS_PER_PACKET, PacketCode};
use tokio::time::Instant;
use tracing::trace;

/// Largest payload carried by a single control packet
pub(crate) const MAX_CONTROL_PAYLOAD: usize = 1024;

struct Outbound {
    code: PacketCode,
    payload: Vec<u8>,
    sent_at: Option<Instant>,
}

/// Packet ids, acknowledgements and retransmission
pub(crate) struct Reliable {
    key: u8,
    retx_interval: Duration,
    next_packet_id: u32,
    outbound: BTreeMap<u32, Outbound>,
    pending_acks: Vec<u32>,
    next_inbound_id: u32,
    reorder: BTreeMap<u32, (PacketCode, Vec<u8>)>,
}

impl Reliable {
    pub fn new(key: u8, retx_interval: Duration) -> Self {
        Self {
            key,
            retx_interval,
            next_packet_id: 0,
            outbound: BTreeMap::new(),
            pending_acks: Vec::new(),
            next_inbound_id: 0,
            reorder: BTreeMap::new(),
        }
    }

    /// Queue a message, split into as many packets as needed
    pub fn enqueue(&mut self, code: PacketCode, payload: &[u8]) {
        if payload.is_empty() {
            self.push(code, Vec::new());
            return;
        }
        for chunk in payload.chunks(MAX_CONTROL_PAYLOAD) {
            self.push(code, chunk.to_vec());
        }
    }

    fn push(&mut self, code: PacketCode, payload: Vec<u8>) {
        let id = self.next_packet_id;
        self.next_packet_id += 1;
        self.outbound.insert(
            id,
            Outbound {
                code,
                payload,
                sent_at: None,
            },
        );
    }

    /// Process acks and return newly deliverable packets in order
    pub fn receive(&mut self, packet: ControlPacket) -> Vec<(PacketCode, Vec<u8>)> {
        for ack in &packet.acks {
            self.outbound.remove(ack);
        }
        let Some(id) = packet.packet_id else {
            return Vec::new();
        };

        // duplicates are acked again since our ack may have been lost
        if !self.pending_acks.contains(&id) {
            self.pending_acks.push(id);
        }
        if id < self.next_inbound_id || self.reorder.contains_key(&id) {
            trace!(key = self.key, id, "Duplicate control packet");
            return Vec::new();
        }
        self.reorder.insert(id, (packet.code, packet.payload));

        let mut delivered = Vec::new();
        while let Some(entry) = self.reorder.remove(&self.next_inbound_id) {
            delivered.push(entry);
            self.next_inbound_id += 1;
        }
        delivered
    }

    fn take_acks(&mut self) -> Vec<u32> {
        let count = self.pending_acks.len().min(MAX_ACKS_PER_PACKET);
        self.pending_acks.drain(..count).collect()
    }

    /// Packets due for (re)transmission, followed by standalone acks
    pub fn outgoing(
        &mut self,
        channel: &mut ControlChannel,
        now: Instant,
    ) -> CryptoResult<Vec<Vec<u8>>> {
        let session_id = channel.session_id();
        let remote_session_id = channel.remote_session_id();

        let due: Vec<u32> = self
            .outbound
            .iter()
            .filter(|(_, o)| {
                o.sent_at
                    .is_none_or(|sent| now.saturating_duration_since(sent) >= self.retx_interval)
            })
            .map(|(id, _)| *id)
            .collect();

        let mut packets = Vec::with_capacity(due.len());
        for id in due {
            let Some(outbound) = self.outbound.get(&id) else {
                continue;
            };
            let mut packet = ControlPacket::new(
                outbound.code,
                self.key,
                session_id,
                id,
                outbound.payload.clone(),
            );
            if let Some(remote) = remote_session_id {
                packet.acks = self.take_acks();
                if !packet.acks.is_empty() {
                    packet.remote_session_id = Some(remote);
                }
            }
            packets.push(channel.serialize(&packet)?);
            if let Some(outbound) = self.outbound.get_mut(&id) {
                outbound.sent_at = Some(now);
            }
        }

        if let Some(remote) = remote_session_id {
            while !self.pending_acks.is_empty() {
                let acks = self.take_acks();
                let ack = ControlPacket::ack(self.key, session_id, acks, remote);
                packets.push(channel.serialize(&ack)?);
            }
        }
        Ok(packets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crypto_session::OsPrng;

    fn channels() -> (ControlChannel, ControlChannel) {
        let mut client = ControlChannel::plain(&OsPrng);
        let mut server = ControlChannel::plain(&OsPrng);
        client.set_remote_session_id(server.session_id());
        server.set_remote_session_id(client.session_id());
        (client, server)
    }

    fn decode(packets: &[Vec<u8>]) -> Vec<ControlPacket> {
        packets
            .iter()
            .map(|p| ControlPacket::decode_plain(p).unwrap())
            .collect()
    }

    #[test]
    fn test_fragmentation_and_in_order_delivery() {
        let (mut client_channel, _) = channels();
        let mut client = Reliable::new(0, Duration::from_millis(100));
        let mut server = Reliable::new(0, Duration::from_millis(100));

        let payload: Vec<u8> = (0..2500).map(|i| i as u8).collect();
        client.enqueue(PacketCode::ControlV1, &payload);
        let packets = decode(&client.outgoing(&mut client_channel, Instant::now()).unwrap());
        assert_eq!(packets.len(), 3);

        // deliver out of order
        assert!(server.receive(packets[2].clone()).is_empty());
        assert!(server.receive(packets[1].clone()).is_empty());
        let delivered = server.receive(packets[0].clone());
        let joined: Vec<u8> = delivered.into_iter().flat_map(|(_, p)| p).collect();
        assert_eq!(joined, payload);
    }

    #[test]
    fn test_retransmit_until_acked() {
        let (mut client_channel, mut server_channel) = channels();
        let mut client = Reliable::new(1, Duration::from_millis(100));
        let mut server = Reliable::new(1, Duration::from_millis(100));
        let start = Instant::now();

        client.enqueue(PacketCode::SoftResetV1, &[]);
        let first = decode(&client.outgoing(&mut client_channel, start).unwrap());
        assert_eq!(first.len(), 1);
        assert!(client
            .outgoing(&mut client_channel, start + Duration::from_millis(50))
            .unwrap()
            .is_empty());
        let later = start + Duration::from_millis(100);
        let again = decode(&client.outgoing(&mut client_channel, later).unwrap());
        assert_eq!(again[0].packet_id, Some(0));

        // server delivers once, acks both copies
        assert_eq!(server.receive(first[0].clone()).len(), 1);
        assert!(server.receive(again[0].clone()).is_empty());
        let acks = decode(&server.outgoing(&mut server_channel, start).unwrap());
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].code, PacketCode::AckV1);
        assert_eq!(acks[0].acks, vec![0]);

        client.receive(acks[0].clone());
        assert!(client.outbound.is_empty());
        assert!(client
            .outgoing(&mut client_channel, start + Duration::from_secs(1))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_acks_are_piggybacked_and_capped() {
        let (mut client_channel, mut server_channel) = channels();
        let mut client = Reliable::new(0, Duration::from_millis(100));
        let mut server = Reliable::new(0, Duration::from_millis(100));

        for _ in 0..10 {
            client.enqueue(PacketCode::ControlV1, b"x");
        }
        for packet in decode(&client.outgoing(&mut client_channel, Instant::now()).unwrap()) {
            server.receive(packet);
        }

        server.enqueue(PacketCode::ControlV1, b"reply");
        let replies = decode(&server.outgoing(&mut server_channel, Instant::now()).unwrap());
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].code, PacketCode::ControlV1);
        assert_eq!(replies[0].acks.len(), MAX_ACKS_PER_PACKET);
        assert_eq!(replies[1].code, PacketCode::AckV1);
        assert_eq!(replies[1].acks, vec![8, 9]);
    }
}
