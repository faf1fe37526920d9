//! Fixed-size packet envelope.
//!
//! The core treats packets as opaque beyond their self-declared length: an
//! 8-byte little-endian header followed by up to 72 bytes of payload, 80
//! bytes total. The [`Writer`](crate::writer::Writer) queues packets by
//! value and uses [`Packet::signature`] in its diagnostics.

use std::fmt;

use crate::error::{Error, Result};

/// Total size of the wire header in bytes.
pub const PACKET_HEADER_LENGTH: usize = 8;

/// Maximum payload size in bytes.
pub const PACKET_MAX_PAYLOAD_LENGTH: usize = 72;

/// Maximum total packet size in bytes.
pub const PACKET_MAX_LENGTH: usize = PACKET_HEADER_LENGTH + PACKET_MAX_PAYLOAD_LENGTH;

/// The 8-byte packet header.
///
/// `sequence_number_and_options` packs the sequence number into the upper
/// four bits, the response-expected flag into bit 3; the upper two bits of
/// `error_code_and_future_use` carry the error code of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Recipient (or sender) identifier.
    pub uid: u32,
    /// Total packet length including this header, 8 to 80.
    pub length: u8,
    /// Function being called or answered.
    pub function_id: u8,
    /// Sequence number (bits 4..8), response-expected flag (bit 3).
    pub sequence_number_and_options: u8,
    /// Error code (bits 6..8) of a response; remaining bits reserved.
    pub error_code_and_future_use: u8,
}

impl PacketHeader {
    /// Sequence number, 0 to 15.
    #[must_use]
    pub const fn sequence_number(&self) -> u8 {
        (self.sequence_number_and_options >> 4) & 0x0F
    }

    /// True if the sender expects a response.
    #[must_use]
    pub const fn response_expected(&self) -> bool {
        (self.sequence_number_and_options & (1 << 3)) != 0
    }

    /// Error code of a response, 0 to 3.
    #[must_use]
    pub const fn error_code(&self) -> u8 {
        (self.error_code_and_future_use >> 6) & 0x03
    }

    /// Serialize to the little-endian wire layout.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; PACKET_HEADER_LENGTH] {
        let mut bytes = [0u8; PACKET_HEADER_LENGTH];

        bytes[0..4].copy_from_slice(&self.uid.to_le_bytes());
        bytes[4] = self.length;
        bytes[5] = self.function_id;
        bytes[6] = self.sequence_number_and_options;
        bytes[7] = self.error_code_and_future_use;

        bytes
    }

    /// Parse from the little-endian wire layout.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Io`](crate::ErrorKind) if the declared length is
    /// outside 8 to 80.
    pub fn from_bytes(bytes: &[u8; PACKET_HEADER_LENGTH]) -> Result<Self> {
        let header = Self {
            uid: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            length: bytes[4],
            function_id: bytes[5],
            sequence_number_and_options: bytes[6],
            error_code_and_future_use: bytes[7],
        };

        if (header.length as usize) < PACKET_HEADER_LENGTH
            || (header.length as usize) > PACKET_MAX_LENGTH
        {
            return Err(Error::io(format!(
                "invalid packet length {}",
                header.length
            )));
        }

        Ok(header)
    }
}

/// A complete packet: header plus payload, at most 80 bytes on the wire.
#[derive(Debug, Clone, Copy)]
pub struct Packet {
    /// The wire header; `header.length` covers header and payload.
    pub header: PacketHeader,
    payload: [u8; PACKET_MAX_PAYLOAD_LENGTH],
}

impl Packet {
    /// Assemble a packet from a header stub and a payload.
    ///
    /// `header.length` is overwritten with the actual total length.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::TooBig`](crate::ErrorKind) if the payload
    /// exceeds 72 bytes.
    pub fn new(mut header: PacketHeader, payload: &[u8]) -> Result<Self> {
        if payload.len() > PACKET_MAX_PAYLOAD_LENGTH {
            return Err(Error::too_big(format!(
                "payload of {} bytes exceeds maximum of {} bytes",
                payload.len(),
                PACKET_MAX_PAYLOAD_LENGTH
            )));
        }

        header.length = (PACKET_HEADER_LENGTH + payload.len()) as u8;

        let mut buffer = [0u8; PACKET_MAX_PAYLOAD_LENGTH];
        buffer[..payload.len()].copy_from_slice(payload);

        Ok(Self {
            header,
            payload: buffer,
        })
    }

    /// Total length on the wire, header included.
    #[must_use]
    pub const fn total_length(&self) -> usize {
        self.header.length as usize
    }

    /// The payload bytes.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload[..self.total_length() - PACKET_HEADER_LENGTH]
    }

    /// Serialize to the wire layout; only the first
    /// [`total_length`](Self::total_length) bytes are meaningful.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; PACKET_MAX_LENGTH] {
        let mut bytes = [0u8; PACKET_MAX_LENGTH];

        bytes[..PACKET_HEADER_LENGTH].copy_from_slice(&self.header.to_bytes());
        bytes[PACKET_HEADER_LENGTH..].copy_from_slice(&self.payload);

        bytes
    }

    /// Parse a packet from wire bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Io`](crate::ErrorKind) if the header is invalid
    /// or `bytes` is shorter than the declared length.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < PACKET_HEADER_LENGTH {
            return Err(Error::io(format!(
                "packet of {} bytes is shorter than its header",
                bytes.len()
            )));
        }

        let mut header_bytes = [0u8; PACKET_HEADER_LENGTH];
        header_bytes.copy_from_slice(&bytes[..PACKET_HEADER_LENGTH]);

        let header = PacketHeader::from_bytes(&header_bytes)?;
        let total = header.length as usize;

        if bytes.len() < total {
            return Err(Error::io(format!(
                "packet declares {} bytes but only {} are present",
                total,
                bytes.len()
            )));
        }

        let mut payload = [0u8; PACKET_MAX_PAYLOAD_LENGTH];
        payload[..total - PACKET_HEADER_LENGTH]
            .copy_from_slice(&bytes[PACKET_HEADER_LENGTH..total]);

        Ok(Self { header, payload })
    }

    /// Compact description of the packet for diagnostics.
    #[must_use]
    pub fn signature(&self) -> String {
        format!(
            "U: {}, L: {}, F: {}, S: {}, R: {}",
            self.header.uid,
            self.header.length,
            self.header.function_id,
            self.header.sequence_number(),
            u8::from(self.header.response_expected()),
        )
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.signature())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_header(uid: u32, function_id: u8, sequence_number: u8) -> PacketHeader {
        PacketHeader {
            uid,
            length: 0,
            function_id,
            sequence_number_and_options: (sequence_number << 4) | (1 << 3),
            error_code_and_future_use: 0,
        }
    }

    #[test]
    fn test_wire_round_trip() {
        let packet = Packet::new(request_header(0x1234_5678, 17, 5), &[1, 2, 3, 4]).unwrap();
        assert_eq!(packet.total_length(), 12);

        let bytes = packet.to_bytes();
        assert_eq!(&bytes[0..4], &[0x78, 0x56, 0x34, 0x12]);
        assert_eq!(bytes[4], 12);

        let parsed = Packet::from_bytes(&bytes[..packet.total_length()]).unwrap();
        assert_eq!(parsed.header, packet.header);
        assert_eq!(parsed.payload(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_header_field_accessors() {
        let header = request_header(1, 2, 9);
        assert_eq!(header.sequence_number(), 9);
        assert!(header.response_expected());
        assert_eq!(header.error_code(), 0);
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let err = Packet::new(request_header(1, 2, 3), &[0u8; 73]).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::TooBig);
    }

    #[test]
    fn test_invalid_declared_length_rejected() {
        let mut bytes = Packet::new(request_header(1, 2, 3), &[]).unwrap().to_bytes();
        bytes[4] = 81;
        assert!(Packet::from_bytes(&bytes).is_err());

        bytes[4] = 7;
        assert!(Packet::from_bytes(&bytes).is_err());
    }
}
