//! TDS packet framing (§4.1.1, §8 invariant (b)).
//!
//! Every message is chunked into packets sharing a type, with an 8-byte
//! big-endian header; the last packet in a message has the EOM status
//! bit set. The reader reassembles a logical message by concatenating
//! payloads until EOM; the writer splits an outgoing buffer into
//! packets of at most `negotiated_size - HEADER_LEN`.

use crate::error::{ProtocolError, ServerResult};

pub const HEADER_LEN: usize = 8;
pub const MIN_PACKET_SIZE: u16 = 512;
pub const MAX_PACKET_SIZE: u16 = 32767;
pub const DEFAULT_PACKET_SIZE: u16 = 4096;

/// `Packet.type` values (§3 Packet).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    SqlBatch = 0x01,
    PreTds7Login = 0x02,
    Rpc = 0x03,
    TabularResult = 0x04,
    AttentionSignal = 0x06,
    BulkLoadData = 0x07,
    FederatedAuthToken = 0x08,
    TransactionManagerRequest = 0x0E,
    Tds7Login = 0x10,
    Sspi = 0x11,
    PreLogin = 0x12,
}

impl PacketType {
    pub fn from_u8(value: u8) -> ServerResult<Self> {
        use PacketType::*;
        Ok(match value {
            0x01 => SqlBatch,
            0x02 => PreTds7Login,
            0x03 => Rpc,
            0x04 => TabularResult,
            0x06 => AttentionSignal,
            0x07 => BulkLoadData,
            0x08 => FederatedAuthToken,
            0x0E => TransactionManagerRequest,
            0x10 => Tds7Login,
            0x11 => Sspi,
            0x12 => PreLogin,
            other => {
                return Err(ProtocolError::InvalidFraming(format!(
                    "unknown packet type {other:#x}"
                ))
                .into())
            }
        })
    }
}

bitflags::bitflags! {
    /// `Packet.status` bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PacketStatus: u8 {
        const NORMAL = 0x00;
        const EOM = 0x01;
        const IGNORE = 0x02;
        const RESET_CONNECTION = 0x08;
        const RESET_CONNECTION_SKIP_TRAN = 0x10;
    }
}

/// One physical TDS packet: header fields plus payload.
#[derive(Debug, Clone)]
pub struct Packet {
    pub packet_type: PacketType,
    pub status: PacketStatus,
    pub spid: u16,
    pub packet_id: u8,
    pub window: u8,
    pub payload: Vec<u8>,
}

impl Packet {
    /// Parse one packet from a buffer that contains at least one full
    /// packet. Returns the packet and the number of bytes consumed.
    pub fn decode(buf: &[u8]) -> ServerResult<(Self, usize)> {
        if buf.len() < HEADER_LEN {
            return Err(ProtocolError::PacketTooShort {
                need: HEADER_LEN,
                got: buf.len(),
            }
            .into());
        }
        let packet_type = PacketType::from_u8(buf[0])?;
        let status = PacketStatus::from_bits_truncate(buf[1]);
        let length = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        let spid = u16::from_be_bytes([buf[4], buf[5]]);
        let packet_id = buf[6];
        let window = buf[7];

        if length < HEADER_LEN {
            return Err(ProtocolError::InvalidFraming(format!(
                "packet length {length} smaller than header"
            ))
            .into());
        }
        if buf.len() < length {
            return Err(ProtocolError::PacketTooShort {
                need: length,
                got: buf.len(),
            }
            .into());
        }

        let payload = buf[HEADER_LEN..length].to_vec();
        Ok((
            Packet {
                packet_type,
                status,
                spid,
                packet_id,
                window,
                payload,
            },
            length,
        ))
    }

    pub fn encode(&self) -> Vec<u8> {
        let length = (HEADER_LEN + self.payload.len()) as u16;
        let mut out = Vec::with_capacity(length as usize);
        out.push(self.packet_type as u8);
        out.push(self.status.bits());
        out.extend_from_slice(&length.to_be_bytes());
        out.extend_from_slice(&self.spid.to_be_bytes());
        out.push(self.packet_id);
        out.push(self.window);
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn is_eom(&self) -> bool {
        self.status.contains(PacketStatus::EOM)
    }

    pub fn is_reset_connection(&self) -> bool {
        self.status.contains(PacketStatus::RESET_CONNECTION)
    }

    pub fn is_reset_connection_skip_tran(&self) -> bool {
        self.status.contains(PacketStatus::RESET_CONNECTION_SKIP_TRAN)
    }
}

/// Wraps per-packet-id assignment, wrapping 1 → … → 255 → 1 (never 0,
/// which real drivers reserve as "unset"), and splits an outgoing
/// buffer into packets of at most `negotiated_size - HEADER_LEN` bytes.
pub struct PacketWriter {
    negotiated_size: u16,
    next_packet_id: u8,
    spid: u16,
}

impl PacketWriter {
    pub fn new(negotiated_size: u16, spid: u16) -> Self {
        Self {
            negotiated_size: negotiated_size.clamp(MIN_PACKET_SIZE, MAX_PACKET_SIZE),
            next_packet_id: 1,
            spid,
        }
    }

    fn next_id(&mut self) -> u8 {
        let id = self.next_packet_id;
        self.next_packet_id = if id == 255 { 1 } else { id + 1 };
        id
    }

    /// Split `payload` into one or more packets of `packet_type`,
    /// setting EOM on the last one (§8 invariant (b)).
    pub fn split(&mut self, packet_type: PacketType, payload: &[u8]) -> Vec<Packet> {
        let chunk_size = (self.negotiated_size as usize - HEADER_LEN).max(1);
        if payload.is_empty() {
            return vec![Packet {
                packet_type,
                status: PacketStatus::EOM,
                spid: self.spid,
                packet_id: self.next_id(),
                window: 0,
                payload: Vec::new(),
            }];
        }

        let mut packets = Vec::new();
        let mut offset = 0;
        while offset < payload.len() {
            let end = (offset + chunk_size).min(payload.len());
            let is_last = end == payload.len();
            packets.push(Packet {
                packet_type,
                status: if is_last {
                    PacketStatus::EOM
                } else {
                    PacketStatus::NORMAL
                },
                spid: self.spid,
                packet_id: self.next_id(),
                window: 0,
                payload: payload[offset..end].to_vec(),
            });
            offset = end;
        }
        packets
    }
}

/// Assembles one logical message out of a stream of packets, per the
/// reader side of §4.1.1: concatenate payloads of packets sharing a
/// type until EOM is observed.
#[derive(Default)]
pub struct MessageReader {
    buffer: Vec<u8>,
    packet_type: Option<PacketType>,
    first_status: Option<PacketStatus>,
}

pub enum ReadOutcome {
    /// More packets are needed before a full message is available.
    Incomplete,
    /// A full message was assembled; `first_status` carries the first
    /// packet's status byte so the caller can detect RESET-CONNECTION.
    Complete {
        packet_type: PacketType,
        message: Vec<u8>,
        first_status: PacketStatus,
    },
}

impl MessageReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one decoded packet into the assembler.
    pub fn feed(&mut self, packet: Packet) -> ServerResult<ReadOutcome> {
        if let Some(expected) = self.packet_type {
            if expected as u8 != packet.packet_type as u8 {
                return Err(ProtocolError::InvalidFraming(
                    "packet type changed mid-message".to_string(),
                )
                .into());
            }
        } else {
            self.packet_type = Some(packet.packet_type);
            self.first_status = Some(packet.status);
        }

        self.buffer.extend_from_slice(&packet.payload);
        let eom = packet.is_eom();

        if eom {
            let message = std::mem::take(&mut self.buffer);
            let packet_type = self.packet_type.take().expect("set above");
            let first_status = self.first_status.take().expect("set above");
            Ok(ReadOutcome::Complete {
                packet_type,
                message,
                first_status,
            })
        } else {
            Ok(ReadOutcome::Incomplete)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_packet(payload: Vec<u8>, status: PacketStatus, id: u8) -> Packet {
        Packet {
            packet_type: PacketType::SqlBatch,
            status,
            spid: 42,
            packet_id: id,
            window: 0,
            payload,
        }
    }

    #[test]
    fn packet_round_trips_through_encode_decode() {
        let packet = sample_packet(vec![1, 2, 3, 4], PacketStatus::EOM, 7);
        let bytes = packet.encode();
        let (decoded, consumed) = Packet::decode(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded.payload, vec![1, 2, 3, 4]);
        assert!(decoded.is_eom());
        assert_eq!(decoded.spid, 42);
        assert_eq!(decoded.packet_id, 7);
    }

    #[test]
    fn writer_splits_into_eom_terminated_chunks_and_reader_reassembles() {
        let payload = vec![9u8; 10_000];
        let negotiated = 512u16;
        let mut writer = PacketWriter::new(negotiated, 1);
        let packets = writer.split(PacketType::TabularResult, &payload);

        let expected_chunk = negotiated as usize - HEADER_LEN;
        let expected_count = (payload.len() + expected_chunk - 1) / expected_chunk;
        assert_eq!(packets.len(), expected_count);
        assert!(packets[..packets.len() - 1]
            .iter()
            .all(|p| !p.is_eom()));
        assert!(packets.last().unwrap().is_eom());

        let total_bytes: usize = packets.iter().map(|p| p.encode().len()).sum();
        assert_eq!(total_bytes, payload.len() + HEADER_LEN * packets.len());

        let mut reader = MessageReader::new();
        let mut reassembled = None;
        for packet in packets {
            if let ReadOutcome::Complete { message, .. } = reader.feed(packet).unwrap() {
                reassembled = Some(message);
            }
        }
        assert_eq!(reassembled.unwrap(), payload);
    }

    #[test]
    fn packet_id_wraps_from_255_to_1() {
        let mut writer = PacketWriter::new(DEFAULT_PACKET_SIZE, 1);
        writer.next_packet_id = 255;
        let packets = writer.split(PacketType::SqlBatch, b"x");
        assert_eq!(packets[0].packet_id, 255);
        assert_eq!(writer.next_packet_id, 1);
    }

    #[test]
    fn reader_surfaces_reset_connection_on_first_packet_status() {
        let mut reader = MessageReader::new();
        let packet = sample_packet(
            vec![1],
            PacketStatus::EOM | PacketStatus::RESET_CONNECTION,
            1,
        );
        let outcome = reader.feed(packet).unwrap();
        match outcome {
            ReadOutcome::Complete { first_status, .. } => {
                assert!(first_status.contains(PacketStatus::RESET_CONNECTION));
            }
            ReadOutcome::Incomplete => panic!("expected complete message"),
        }
    }
}
