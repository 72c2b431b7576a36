//! Datagram framing for the simulator UDP protocol.
//!
//! Layout: 1-byte flag field, 4-byte big-endian sequence number, 4-byte
//! big-endian message type, then the body. When `ACKS_APPENDED` is set,
//! a trailer of piggy-backed acknowledgments follows the body: count * 4
//! bytes of big-endian sequence numbers with a 1-byte count at the very
//! end of the datagram. Zero-coding covers the body only; the trailer is
//! written after encoding so the decoder can strip it before expansion.

pub mod io;
pub mod zerocode;

pub use io::{ByteReader, ByteWriter};

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Maximum datagram size on the wire.
pub const MAX_DATAGRAM: usize = 1500;

/// Flags byte + sequence + message type.
pub const HEADER_LEN: usize = 9;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PacketFlags: u8 {
        /// Receiver must acknowledge this sequence number.
        const ACK_NEEDED = 0x80;
        /// This datagram is a retransmission.
        const RESENT = 0x40;
        /// Eligible for retransmission until acknowledged.
        const RELIABLE = 0x20;
        /// Body is zero run-length coded.
        const ZEROCODED = 0x10;
        /// An ack trailer follows the body. Wire-only: stripped on parse.
        const ACKS_APPENDED = 0x08;
    }
}

/// Decode failures. All are recoverable: the receive loop drops the
/// datagram and continues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("datagram shorter than header or above MTU")]
    InvalidSize,

    #[error("unknown message type {0}")]
    UnknownType(u32),

    #[error("body decoder read past the body end")]
    Truncated,

    #[error("string field is not valid UTF-8")]
    BadUtf8,

    #[error("NaN in a NaN-forbidden float slot")]
    BadFloat,
}

/// A framed datagram, parsed or ready to serialize.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub flags: PacketFlags,
    pub sequence: u32,
    pub message_type: u32,
    pub body: Bytes,
    /// Piggy-backed acknowledgments. `ACKS_APPENDED` is derived from
    /// this list at serialization time and never kept in `flags`.
    pub acks: Vec<u32>,
}

impl Packet {
    pub fn new(flags: PacketFlags, sequence: u32, message_type: u32, body: Bytes) -> Self {
        Self {
            flags: flags - PacketFlags::ACKS_APPENDED,
            sequence,
            message_type,
            body,
            acks: Vec::new(),
        }
    }

    pub fn is_reliable(&self) -> bool {
        self.flags.contains(PacketFlags::RELIABLE)
    }

    pub fn wants_ack(&self) -> bool {
        self.flags.contains(PacketFlags::ACK_NEEDED)
    }

    /// Parse one datagram.
    pub fn parse(datagram: &[u8]) -> Result<Self, CodecError> {
        if datagram.len() < HEADER_LEN || datagram.len() > MAX_DATAGRAM {
            return Err(CodecError::InvalidSize);
        }

        let flags = PacketFlags::from_bits_truncate(datagram[0]);
        let sequence = u32::from_be_bytes([datagram[1], datagram[2], datagram[3], datagram[4]]);
        let message_type = u32::from_be_bytes([datagram[5], datagram[6], datagram[7], datagram[8]]);
        let mut rest = &datagram[HEADER_LEN..];

        let mut acks = Vec::new();
        if flags.contains(PacketFlags::ACKS_APPENDED) {
            let count = *rest.last().ok_or(CodecError::Truncated)? as usize;
            let trailer_len = 1 + count * 4;
            if rest.len() < trailer_len {
                return Err(CodecError::Truncated);
            }
            let trailer_start = rest.len() - trailer_len;
            let trailer = &rest[trailer_start..rest.len() - 1];
            for chunk in trailer.chunks_exact(4) {
                acks.push(u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
            }
            rest = &rest[..trailer_start];
        }

        let body = if flags.contains(PacketFlags::ZEROCODED) {
            Bytes::from(zerocode::decode(rest)?)
        } else {
            Bytes::copy_from_slice(rest)
        };

        Ok(Self {
            flags: flags - PacketFlags::ACKS_APPENDED,
            sequence,
            message_type,
            body,
            acks,
        })
    }

    /// Serialize to one datagram. Fails with `InvalidSize` if the result
    /// would exceed the MTU.
    pub fn serialize(&self) -> Result<Bytes, CodecError> {
        let mut wire_flags = self.flags;
        if !self.acks.is_empty() {
            wire_flags |= PacketFlags::ACKS_APPENDED;
        }

        let encoded_body;
        let body: &[u8] = if self.flags.contains(PacketFlags::ZEROCODED) {
            encoded_body = zerocode::encode(&self.body);
            &encoded_body
        } else {
            &self.body
        };

        let trailer_len = if self.acks.is_empty() {
            0
        } else {
            1 + self.acks.len() * 4
        };
        let total = HEADER_LEN + body.len() + trailer_len;
        if total > MAX_DATAGRAM || self.acks.len() > u8::MAX as usize {
            return Err(CodecError::InvalidSize);
        }

        let mut buf = BytesMut::with_capacity(total);
        buf.put_u8(wire_flags.bits());
        buf.put_u32(self.sequence);
        buf.put_u32(self.message_type);
        buf.put_slice(body);
        if !self.acks.is_empty() {
            for ack in &self.acks {
                buf.put_u32(*ack);
            }
            buf.put_u8(self.acks.len() as u8);
        }

        Ok(buf.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(flags: PacketFlags, body: &[u8]) -> Packet {
        Packet::new(flags, 42, 11, Bytes::copy_from_slice(body))
    }

    #[test]
    fn test_round_trip_plain() {
        let p = sample(PacketFlags::RELIABLE | PacketFlags::ACK_NEEDED, &[1, 2, 3]);
        let wire = p.serialize().unwrap();
        assert_eq!(Packet::parse(&wire).unwrap(), p);
    }

    #[test]
    fn test_round_trip_zerocoded() {
        let body: Vec<u8> = [vec![9u8], vec![0u8; 100], vec![7u8]].concat();
        let p = sample(PacketFlags::ZEROCODED, &body);
        let wire = p.serialize().unwrap();
        assert!(wire.len() < HEADER_LEN + body.len());
        assert_eq!(Packet::parse(&wire).unwrap(), p);
    }

    #[test]
    fn test_round_trip_with_acks() {
        let mut p = sample(PacketFlags::empty(), &[5, 5, 5]);
        p.acks = vec![100, 200, 300];
        let wire = p.serialize().unwrap();
        let parsed = Packet::parse(&wire).unwrap();
        assert_eq!(parsed, p);
        // The trailer marker never survives parsing.
        assert!(!parsed.flags.contains(PacketFlags::ACKS_APPENDED));
    }

    #[test]
    fn test_round_trip_zerocoded_with_acks() {
        let mut p = sample(PacketFlags::ZEROCODED | PacketFlags::RELIABLE, &[0u8; 64]);
        p.acks = vec![7];
        let wire = p.serialize().unwrap();
        assert_eq!(Packet::parse(&wire).unwrap(), p);
    }

    #[test]
    fn test_header_only_is_empty_body() {
        let p = sample(PacketFlags::empty(), &[]);
        let wire = p.serialize().unwrap();
        assert_eq!(wire.len(), HEADER_LEN);
        let parsed = Packet::parse(&wire).unwrap();
        assert!(parsed.body.is_empty());
    }

    #[test]
    fn test_short_datagram_rejected() {
        assert!(matches!(
            Packet::parse(&[0u8; HEADER_LEN - 1]),
            Err(CodecError::InvalidSize)
        ));
    }

    #[test]
    fn test_mtu_boundary() {
        let body = vec![1u8; MAX_DATAGRAM - HEADER_LEN];
        let p = sample(PacketFlags::empty(), &body);
        let wire = p.serialize().unwrap();
        assert_eq!(wire.len(), MAX_DATAGRAM);
        assert_eq!(Packet::parse(&wire).unwrap().body.len(), body.len());

        let over = sample(PacketFlags::empty(), &vec![1u8; MAX_DATAGRAM - HEADER_LEN + 1]);
        assert!(matches!(over.serialize(), Err(CodecError::InvalidSize)));
    }

    #[test]
    fn test_flag_bits_match_wire_constants() {
        assert_eq!(PacketFlags::ACK_NEEDED.bits(), 0x80);
        assert_eq!(PacketFlags::RESENT.bits(), 0x40);
        assert_eq!(PacketFlags::RELIABLE.bits(), 0x20);
        assert_eq!(PacketFlags::ZEROCODED.bits(), 0x10);
    }

    #[test]
    fn test_truncated_ack_trailer() {
        let mut wire = sample(PacketFlags::empty(), &[]).serialize().unwrap().to_vec();
        wire[0] |= PacketFlags::ACKS_APPENDED.bits();
        wire.push(3); // claims 3 acks, no trailer bytes
        assert!(matches!(Packet::parse(&wire), Err(CodecError::Truncated)));
    }
}
