//! Frame codec for the UDP discovery protocol.
//!
//! # Frame Format
//!
//! Each frame consists of:
//! - 4 bytes: magic `02 00 00 01`
//! - 2 bytes: payload length (big-endian, signed 16-bit)
//! - 2 bytes: packet type (`0x1100` request, `0x2201` response)
//! - 4 bytes: packet id
//! - 4 bytes: CRC32 (big-endian)
//! - N bytes: JSON payload
//!
//! # Checksum
//!
//! The CRC32 covers the whole frame with the fixed tag `5A 6B 7C 8D` in the
//! checksum slot. The encoder computes it that way and then overwrites the
//! tag; the decoder restores the tag before recomputing.

use crc32fast::Hasher;
use serde::Serialize;

use crate::error::{ProtocolError, Result};

/// Magic value opening every discovery frame.
pub const DISCOVERY_MAGIC: u32 = 0x0200_0001;

/// Placeholder occupying the checksum slot while the CRC is computed.
pub const CHECKSUM_TAG: [u8; 4] = [0x5A, 0x6B, 0x7C, 0x8D];

/// Packet id sent with discovery probes.
pub const DEFAULT_PACKET_ID: u32 = 0x0102_0304;

/// Frame header size: 4 (magic) + 2 (length) + 2 (type) + 4 (id) + 4 (crc).
pub const FRAME_HEADER_SIZE: usize = 16;

/// Largest payload the signed 16-bit length field can describe.
pub const MAX_PAYLOAD_SIZE: usize = i16::MAX as usize;

const CHECKSUM_OFFSET: usize = 12;

/// Discovery packet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    /// Onboarding probe sent by the client.
    Request,
    /// Reply sent by a device.
    Response,
    /// Any other type value.
    Other(u16),
}

impl PacketType {
    pub fn from_u16(value: u16) -> Self {
        match value {
            0x1100 => Self::Request,
            0x2201 => Self::Response,
            other => Self::Other(other),
        }
    }

    pub fn as_u16(self) -> u16 {
        match self {
            Self::Request => 0x1100,
            Self::Response => 0x2201,
            Self::Other(value) => value,
        }
    }
}

/// A decoded discovery frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryFrame {
    /// Packet type.
    pub packet_type: PacketType,
    /// Packet id echoed by devices.
    pub packet_id: u32,
    /// JSON payload bytes.
    pub payload: Vec<u8>,
}

impl DiscoveryFrame {
    /// Creates a frame with the default packet id.
    pub fn new(packet_type: PacketType, payload: Vec<u8>) -> Self {
        Self {
            packet_type,
            packet_id: DEFAULT_PACKET_ID,
            payload,
        }
    }

    /// Serializes `value` as the JSON payload of a new frame.
    pub fn from_json<T: Serialize>(packet_type: PacketType, value: &T) -> Result<Self> {
        Ok(Self::new(packet_type, serde_json::to_vec(value)?))
    }

    /// Encodes the frame, filling in the checksum.
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: self.payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        buf.extend_from_slice(&DISCOVERY_MAGIC.to_be_bytes());
        buf.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.packet_type.as_u16().to_be_bytes());
        buf.extend_from_slice(&self.packet_id.to_be_bytes());
        buf.extend_from_slice(&CHECKSUM_TAG);
        buf.extend_from_slice(&self.payload);

        let crc = checksum(&buf);
        buf[CHECKSUM_OFFSET..FRAME_HEADER_SIZE].copy_from_slice(&crc.to_be_bytes());
        Ok(buf)
    }

    /// Decodes and validates a frame.
    ///
    /// Rejects bad magic, a truncated payload and checksum mismatches.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < FRAME_HEADER_SIZE {
            return Err(ProtocolError::Deserialization(format!(
                "frame of {} bytes is shorter than the {} byte header",
                bytes.len(),
                FRAME_HEADER_SIZE
            )));
        }

        let magic = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if magic != DISCOVERY_MAGIC {
            return Err(ProtocolError::InvalidFrameMagic {
                expected: DISCOVERY_MAGIC,
                got: magic,
            });
        }

        let length = u16::from_be_bytes([bytes[4], bytes[5]]) as usize;
        if length > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: length,
                max: MAX_PAYLOAD_SIZE,
            });
        }
        let end = FRAME_HEADER_SIZE + length;
        if bytes.len() < end {
            return Err(ProtocolError::Deserialization(format!(
                "frame declares {} payload bytes but carries {}",
                length,
                bytes.len() - FRAME_HEADER_SIZE
            )));
        }

        let carried = u32::from_be_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]);
        let mut skeleton = bytes[..end].to_vec();
        skeleton[CHECKSUM_OFFSET..FRAME_HEADER_SIZE].copy_from_slice(&CHECKSUM_TAG);
        let computed = checksum(&skeleton);
        if carried != computed {
            return Err(ProtocolError::ChecksumMismatch {
                expected: carried,
                computed,
            });
        }

        Ok(Self {
            packet_type: PacketType::from_u16(u16::from_be_bytes([bytes[6], bytes[7]])),
            packet_id: u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            payload: bytes[FRAME_HEADER_SIZE..end].to_vec(),
        })
    }

    /// Parses the payload as JSON.
    pub fn json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// Builds the onboarding probe advertising `public_key_pem`.
pub fn discovery_request(public_key_pem: &str) -> Result<Vec<u8>> {
    let body = serde_json::json!({ "params": { "rsa_key": public_key_pem } });
    DiscoveryFrame::from_json(PacketType::Request, &body)?.encode()
}

fn checksum(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture_frame() -> DiscoveryFrame {
        DiscoveryFrame::new(
            PacketType::Request,
            br#"{"params":{"rsa_key":"KEY"}}"#.to_vec(),
        )
    }

    #[test]
    fn test_encode_matches_fixture_checksum() {
        let bytes = fixture_frame().encode().unwrap();

        assert_eq!(bytes.len(), FRAME_HEADER_SIZE + 28);
        assert_eq!(&bytes[..4], &[0x02, 0x00, 0x00, 0x01]);
        assert_eq!(&bytes[4..6], &[0x00, 28]);
        assert_eq!(&bytes[6..8], &[0x11, 0x00]);
        assert_eq!(&bytes[8..12], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&bytes[12..16], &0x5bf1_d9a9u32.to_be_bytes());
    }

    #[test]
    fn test_decode_accepts_encoded_frame() {
        let frame = fixture_frame();
        let bytes = frame.encode().unwrap();
        let decoded = DiscoveryFrame::decode(&bytes).unwrap();

        assert_eq!(decoded, frame);
        assert_eq!(decoded.encode().unwrap()[12..16], bytes[12..16]);
    }

    #[test]
    fn test_flipped_payload_byte_fails_checksum() {
        let mut bytes = fixture_frame().encode().unwrap();
        bytes[FRAME_HEADER_SIZE + 3] ^= 0x20;

        assert!(matches!(
            DiscoveryFrame::decode(&bytes),
            Err(ProtocolError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_flipped_header_byte_fails_checksum() {
        let mut bytes = fixture_frame().encode().unwrap();
        bytes[9] ^= 0x01;
        assert!(matches!(
            DiscoveryFrame::decode(&bytes),
            Err(ProtocolError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_bad_magic() {
        let mut bytes = fixture_frame().encode().unwrap();
        bytes[0] = 0x03;
        assert!(matches!(
            DiscoveryFrame::decode(&bytes),
            Err(ProtocolError::InvalidFrameMagic { got: 0x0300_0001, .. })
        ));
    }

    #[test]
    fn test_decode_rejects_short_input() {
        assert!(DiscoveryFrame::decode(&[0x02, 0x00, 0x00]).is_err());

        let bytes = fixture_frame().encode().unwrap();
        assert!(matches!(
            DiscoveryFrame::decode(&bytes[..bytes.len() - 1]),
            Err(ProtocolError::Deserialization(_))
        ));
    }

    #[test]
    fn test_decode_ignores_trailing_bytes() {
        let mut bytes = fixture_frame().encode().unwrap();
        bytes.extend_from_slice(b"\0\0");
        assert_eq!(DiscoveryFrame::decode(&bytes).unwrap(), fixture_frame());
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let frame = DiscoveryFrame::new(PacketType::Response, vec![b' '; MAX_PAYLOAD_SIZE + 1]);
        assert!(matches!(
            frame.encode(),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_discovery_request_payload() {
        let bytes = discovery_request("PEM").unwrap();
        let frame = DiscoveryFrame::decode(&bytes).unwrap();

        assert_eq!(frame.packet_type, PacketType::Request);
        assert_eq!(frame.json().unwrap()["params"]["rsa_key"], "PEM");
    }

    #[test]
    fn test_packet_type_values() {
        assert_eq!(PacketType::from_u16(0x2201), PacketType::Response);
        assert_eq!(PacketType::Request.as_u16(), 0x1100);
        assert_eq!(PacketType::from_u16(7), PacketType::Other(7));
    }
}
