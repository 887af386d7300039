//! Wire format of the protocol unit exchanged between the two endpoints.
//!
//! All multi-byte integers are big-endian.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Sequence Number                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                     Acknowledgment Number                     |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |             Flags             |   Priority    |  Window Size  |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           Checksum                            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                      UTF-8 payload ...                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! The checksum is the plain sum of the five numeric header fields and every
//! payload byte, truncated to 32 bits. [`Packet::decode`] does not check it;
//! callers run [`Packet::verify`] so that structural failures and integrity
//! failures stay distinguishable.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Byte length of the fixed-size header on the wire.
pub const HEADER_LEN: usize = 16;

/// Transmission priority carried in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Normal = 0,
    High = 1,
}

impl Priority {
    /// Interpret a raw header byte. Anything non-zero is treated as high.
    pub fn from_wire(value: u8) -> Self {
        if value == 0 {
            Priority::Normal
        } else {
            Priority::High
        }
    }

    pub fn as_wire(self) -> u8 {
        self as u8
    }
}

/// Numeric header fields, in host byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Header {
    pub seq_num: u32,
    /// Carried on the wire but not interpreted by either endpoint.
    pub ack_num: u32,
    /// Reserved.
    pub flags: u16,
    pub priority: u8,
    /// Sender's advertised window capacity, informational only.
    pub window_size: u8,
    pub checksum: u32,
}

impl Header {
    /// Checksum these header fields would carry for `payload`.
    pub fn expected_checksum(&self, payload: &[u8]) -> u32 {
        compute_checksum(
            self.seq_num,
            self.ack_num,
            self.flags,
            self.priority,
            self.window_size,
            payload,
        )
    }
}

/// `(seq + ack + flags + priority + window + Σ payload) mod 2^32`.
pub fn compute_checksum(
    seq_num: u32,
    ack_num: u32,
    flags: u16,
    priority: u8,
    window_size: u8,
    payload: &[u8],
) -> u32 {
    let header_sum = seq_num
        .wrapping_add(ack_num)
        .wrapping_add(u32::from(flags))
        .wrapping_add(u32::from(priority))
        .wrapping_add(u32::from(window_size));
    payload
        .iter()
        .fold(header_sum, |sum, &byte| sum.wrapping_add(u32::from(byte)))
}

/// A complete datagram: header plus UTF-8 payload.
///
/// Fields are private so a packet cannot be altered after construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Packet {
    header: Header,
    payload: String,
}

impl Packet {
    /// Build a packet and stamp it with its checksum.
    pub fn new(
        seq_num: u32,
        ack_num: u32,
        flags: u16,
        priority: Priority,
        window_size: u8,
        payload: impl Into<String>,
    ) -> Self {
        let payload = payload.into();
        let mut header = Header {
            seq_num,
            ack_num,
            flags,
            priority: priority.as_wire(),
            window_size,
            checksum: 0,
        };
        header.checksum = header.expected_checksum(payload.as_bytes());
        Self { header, payload }
    }

    /// Data packet as admitted by the sender.
    pub fn data(seq_num: u32, priority: Priority, window_size: u8, payload: impl Into<String>) -> Self {
        Self::new(seq_num, 0, 0, priority, window_size, payload)
    }

    /// Pure acknowledgment. The acknowledged sequence number travels in the
    /// `seq_num` field; the payload is empty.
    pub fn ack(acked_seq: u32, window_size: u8) -> Self {
        Self::new(acked_seq, 0, 0, Priority::Normal, window_size, String::new())
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn seq_num(&self) -> u32 {
        self.header.seq_num
    }

    pub fn priority(&self) -> Priority {
        Priority::from_wire(self.header.priority)
    }

    pub fn checksum(&self) -> u32 {
        self.header.checksum
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn is_pure_ack(&self) -> bool {
        self.payload.is_empty()
    }

    /// Check the carried checksum against the decoded fields.
    pub fn verify(&self) -> Result<(), PacketError> {
        let computed = self.header.expected_checksum(self.payload.as_bytes());
        if computed == self.header.checksum {
            Ok(())
        } else {
            Err(PacketError::ChecksumMismatch {
                carried: self.header.checksum,
                computed,
            })
        }
    }

    /// Serialise into a freshly allocated datagram.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u32(self.header.seq_num);
        buf.put_u32(self.header.ack_num);
        buf.put_u16(self.header.flags);
        buf.put_u8(self.header.priority);
        buf.put_u8(self.header.window_size);
        buf.put_u32(self.header.checksum);
        buf.put_slice(self.payload.as_bytes());
        buf.freeze()
    }

    /// Parse a datagram without verifying its checksum.
    pub fn decode(datagram: &[u8]) -> Result<Self, PacketError> {
        if datagram.len() < HEADER_LEN {
            return Err(PacketError::MalformedPacket(Malformation::Truncated {
                len: datagram.len(),
            }));
        }
        let (mut head, tail) = datagram.split_at(HEADER_LEN);
        let header = Header {
            seq_num: head.get_u32(),
            ack_num: head.get_u32(),
            flags: head.get_u16(),
            priority: head.get_u8(),
            window_size: head.get_u8(),
            checksum: head.get_u32(),
        };
        let payload = std::str::from_utf8(tail)
            .map_err(|_| PacketError::MalformedPacket(Malformation::InvalidUtf8))?
            .to_owned();
        Ok(Self { header, payload })
    }
}

/// Sequence number of a datagram, read without decoding the payload.
pub fn peek_seq_num(datagram: &[u8]) -> Option<u32> {
    let mut head = datagram.get(..4)?;
    Some(head.get_u32())
}

/// Why a datagram was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("malformed packet: {0}")]
    MalformedPacket(Malformation),
    #[error("checksum mismatch (carried {carried:#010x}, computed {computed:#010x})")]
    ChecksumMismatch { carried: u32, computed: u32 },
}

/// Structural decode failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Malformation {
    #[error("{len} bytes is shorter than the {HEADER_LEN}-byte header")]
    Truncated { len: usize },
    #[error("payload is not valid UTF-8")]
    InvalidUtf8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_reproduces_computed_checksum() {
        let pkt = Packet::data(42, Priority::High, 5, "Message 42");
        let decoded = Packet::decode(&pkt.encode()).unwrap();
        assert_eq!(decoded, pkt);
        assert_eq!(
            decoded.checksum(),
            compute_checksum(42, 0, 0, 1, 5, b"Message 42")
        );
        assert!(decoded.verify().is_ok());
    }

    #[test]
    fn checksum_is_plain_field_and_byte_sum() {
        let expected = 7 + 3 + 2 + 1 + 5 + u32::from(b'a') + u32::from(b'b');
        assert_eq!(compute_checksum(7, 3, 2, 1, 5, b"ab"), expected);
    }

    #[test]
    fn checksum_wraps_modulo_2_pow_32() {
        assert_eq!(compute_checksum(u32::MAX, 1, 0, 0, 0, b""), 0);
        assert_eq!(compute_checksum(u32::MAX, 0, 0, 0, 0, &[2]), 1);
    }

    #[test]
    fn header_fields_are_big_endian() {
        let pkt = Packet::new(0x0102_0304, 0x0506_0708, 0x090a, Priority::High, 5, "");
        let bytes = pkt.encode();
        assert_eq!(bytes.len(), HEADER_LEN);
        assert_eq!(&bytes[0..4], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&bytes[4..8], &[0x05, 0x06, 0x07, 0x08]);
        assert_eq!(&bytes[8..10], &[0x09, 0x0a]);
        assert_eq!(bytes[10], 1);
        assert_eq!(bytes[11], 5);
        assert_eq!(&bytes[12..16], &pkt.checksum().to_be_bytes());
    }

    #[test]
    fn short_datagram_is_malformed() {
        assert_eq!(
            Packet::decode(&[0u8; HEADER_LEN - 1]),
            Err(PacketError::MalformedPacket(Malformation::Truncated {
                len: HEADER_LEN - 1
            }))
        );
        assert!(matches!(
            Packet::decode(&[]),
            Err(PacketError::MalformedPacket(_))
        ));
    }

    #[test]
    fn invalid_utf8_payload_is_malformed() {
        let mut bytes = Packet::data(1, Priority::Normal, 5, "ok").encode().to_vec();
        bytes.push(0xff);
        assert_eq!(
            Packet::decode(&bytes),
            Err(PacketError::MalformedPacket(Malformation::InvalidUtf8))
        );
    }

    #[test]
    fn corrupted_payload_byte_fails_verification_but_decodes() {
        let mut bytes = Packet::data(9, Priority::Normal, 5, "Message 9").encode().to_vec();
        let last = bytes.len() - 1;
        bytes[last] = b'8';
        let decoded = Packet::decode(&bytes).unwrap();
        assert!(matches!(
            decoded.verify(),
            Err(PacketError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn corrupted_checksum_field_fails_verification() {
        let mut bytes = Packet::data(3, Priority::High, 5, "x").encode().to_vec();
        bytes[15] ^= 0x01;
        let decoded = Packet::decode(&bytes).unwrap();
        assert!(decoded.verify().is_err());
    }

    #[test]
    fn ack_is_empty_and_carries_seq() {
        let ack = Packet::ack(17, 5);
        assert!(ack.is_pure_ack());
        assert_eq!(ack.seq_num(), 17);
        assert_eq!(ack.header().ack_num, 0);
        assert_eq!(ack.encode().len(), HEADER_LEN);
        assert_eq!(peek_seq_num(&ack.encode()), Some(17));
    }

    #[test]
    fn priority_from_wire() {
        assert_eq!(Priority::from_wire(0), Priority::Normal);
        assert_eq!(Priority::from_wire(1), Priority::High);
        assert_eq!(Priority::High.as_wire(), 1);
    }
}
