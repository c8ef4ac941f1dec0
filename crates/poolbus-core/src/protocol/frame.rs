//! Frame encoding/decoding
//!
//! Implements the envelopes and checksums of the frame families that share
//! the RS-485 bus.
//!
//! Controller/pump frame:
//! - 3 bytes: preamble `255, 0, 255`
//! - 6 bytes: header `165, sub, dest, source, action, length`
//! - N bytes: data (N = length, at most 75)
//! - 2 bytes: checksum, big-endian sum of header and data
//!
//! Chlorinator frame:
//! - 4 bytes: header `16, 2, dest, action`
//! - N bytes: data
//! - 1 byte: checksum, sum of header and data modulo 256
//! - 2 bytes: trailer `16, 3`

use std::ops::RangeInclusive;

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};

use super::assembler::PartialFrame;
use super::ProtocolError;

/// Padding bytes ahead of every controller/pump header
pub const PREAMBLE: [u8; 3] = [255, 0, 255];
/// First header byte of a controller/pump frame
pub const HEADER_MARKER: u8 = 165;
/// Header length of a controller/pump frame
pub const HEADER_LEN: usize = 6;
/// Leading bytes of a chlorinator frame
pub const CHLOR_PREAMBLE: [u8; 2] = [16, 2];
/// Trailing bytes of a chlorinator frame
pub const CHLOR_TRAILER: [u8; 2] = [16, 3];
/// Header length of a chlorinator frame
pub const CHLOR_HEADER_LEN: usize = 4;
/// Largest data length a controller/pump header may declare
pub const MAX_DATA_LEN: usize = 75;
/// Largest chlorinator data section before the frame is abandoned
pub const MAX_CHLOR_DATA_LEN: usize = 25;
/// Addresses owned by pumps
pub const PUMP_ADDRESSES: RangeInclusive<u8> = 96..=111;

/// The three frame families seen on the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameFamily {
    /// Controller broadcast/config traffic
    Controller,
    /// Controller-format frame to or from a pump address
    Pump,
    /// Chlorinator framing
    Chlorinator,
}

impl FrameFamily {
    /// Classify a controller-format header by its addresses
    pub fn from_addresses(dest: u8, source: u8) -> Self {
        if PUMP_ADDRESSES.contains(&dest) || PUMP_ADDRESSES.contains(&source) {
            FrameFamily::Pump
        } else {
            FrameFamily::Controller
        }
    }

    /// Whether this family uses the controller envelope
    pub fn is_controller_format(&self) -> bool {
        !matches!(self, FrameFamily::Chlorinator)
    }

    /// Short lowercase name, as used in logs and captures
    pub fn name(&self) -> &'static str {
        match self {
            FrameFamily::Controller => "controller",
            FrameFamily::Pump => "pump",
            FrameFamily::Chlorinator => "chlorinator",
        }
    }
}

impl std::fmt::Display for FrameFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A complete frame, decoded from or destined for the wire
///
/// Built only by [`Frame::from_payload`] and [`Frame::from_bytes`], so the
/// header always has the length its family requires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub(crate) family: FrameFamily,
    /// 6 bytes for controller/pump, 4 for chlorinator
    pub(crate) header: Vec<u8>,
    pub(crate) data: Vec<u8>,
    /// As carried on the wire
    pub(crate) checksum: u16,
}

impl Frame {
    /// Build a frame from checksum-less payload bytes (header + data)
    ///
    /// The leading byte selects the family: `165` for controller/pump,
    /// `16, 2` for chlorinator.
    pub fn from_payload(payload: &[u8]) -> Result<Self, ProtocolError> {
        let (&first, _) = payload.split_first().ok_or(ProtocolError::EmptyPayload)?;

        let (family, header_len) = match first {
            HEADER_MARKER => {
                if payload.len() < HEADER_LEN {
                    return Err(ProtocolError::Malformed(format!(
                        "controller header needs {} bytes, got {}",
                        HEADER_LEN,
                        payload.len()
                    )));
                }
                let declared = payload[5] as usize;
                let actual = payload.len() - HEADER_LEN;
                if declared != actual {
                    return Err(ProtocolError::LengthMismatch { declared, actual });
                }
                if actual > MAX_DATA_LEN {
                    return Err(ProtocolError::PayloadTooLong(actual));
                }
                (FrameFamily::from_addresses(payload[2], payload[3]), HEADER_LEN)
            }
            b if b == CHLOR_PREAMBLE[0] => {
                if payload.len() < CHLOR_HEADER_LEN || payload[1] != CHLOR_PREAMBLE[1] {
                    return Err(ProtocolError::Malformed(
                        "chlorinator header must start 16, 2 and carry dest and action".into(),
                    ));
                }
                let actual = payload.len() - CHLOR_HEADER_LEN;
                if actual > MAX_CHLOR_DATA_LEN {
                    return Err(ProtocolError::PayloadTooLong(actual));
                }
                (FrameFamily::Chlorinator, CHLOR_HEADER_LEN)
            }
            other => return Err(ProtocolError::UnknownFamily(other)),
        };

        let header = payload[..header_len].to_vec();
        let data = payload[header_len..].to_vec();
        let checksum = compute_checksum(family, &header, &data);
        Ok(Self { family, header, data, checksum })
    }

    /// Decode exactly one complete frame from wire bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut partial = PartialFrame::new();
        let consumed = partial.read_packet(bytes);
        if partial.has_padding() {
            return Err(ProtocolError::Malformed("leading bytes before preamble".into()));
        }
        if !partial.is_complete() {
            if !partial.is_valid() {
                return Err(ProtocolError::Runaway(bytes.len()));
            }
            return Err(ProtocolError::Malformed("incomplete frame".into()));
        }
        if consumed != bytes.len() {
            return Err(ProtocolError::Malformed(format!(
                "{} trailing bytes after frame",
                bytes.len() - consumed
            )));
        }
        partial.into_frame()
    }

    /// Frame family
    pub fn family(&self) -> FrameFamily {
        self.family
    }

    /// Header bytes
    pub fn header(&self) -> &[u8] {
        &self.header
    }

    /// Data bytes following the header
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Checksum as carried on the wire
    pub fn checksum(&self) -> u16 {
        self.checksum
    }

    /// Encode the frame to wire bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.encoded_size());
        match self.family {
            FrameFamily::Controller | FrameFamily::Pump => {
                bytes.extend_from_slice(&PREAMBLE);
                bytes.extend_from_slice(&self.header);
                bytes.extend_from_slice(&self.data);
                let mut chk = [0u8; 2];
                BigEndian::write_u16(&mut chk, self.checksum);
                bytes.extend_from_slice(&chk);
            }
            FrameFamily::Chlorinator => {
                bytes.extend_from_slice(&self.header);
                bytes.extend_from_slice(&self.data);
                bytes.push(self.checksum as u8);
                bytes.extend_from_slice(&CHLOR_TRAILER);
            }
        }
        bytes
    }

    /// Get the total encoded size
    pub fn encoded_size(&self) -> usize {
        match self.family {
            FrameFamily::Chlorinator => self.header.len() + self.data.len() + 3,
            _ => PREAMBLE.len() + self.header.len() + self.data.len() + 2,
        }
    }

    /// Header plus data, the form callers hand to the outbound queue
    pub fn payload(&self) -> Vec<u8> {
        let mut payload = self.header.clone();
        payload.extend_from_slice(&self.data);
        payload
    }

    /// Checksum recomputed from header and data
    pub fn computed_checksum(&self) -> u16 {
        compute_checksum(self.family, &self.header, &self.data)
    }

    /// Whether the carried checksum matches the contents
    pub fn is_valid(&self) -> bool {
        self.checksum == self.computed_checksum()
    }

    /// Controller sub byte (controller/pump only)
    pub fn sub(&self) -> Option<u8> {
        self.family.is_controller_format().then(|| self.header[1])
    }

    /// Destination address
    pub fn dest(&self) -> u8 {
        self.header[2]
    }

    /// Source address (chlorinator frames carry none)
    pub fn source(&self) -> Option<u8> {
        self.family.is_controller_format().then(|| self.header[3])
    }

    /// Action byte
    pub fn action(&self) -> u8 {
        match self.family {
            FrameFamily::Chlorinator => self.header[3],
            _ => self.header[4],
        }
    }
}

/// Checksum of a frame's header and data for the given family
pub fn compute_checksum(family: FrameFamily, header: &[u8], data: &[u8]) -> u16 {
    let sum: u32 = header.iter().chain(data).map(|&b| b as u32).sum();
    match family {
        FrameFamily::Chlorinator => (sum % 256) as u16,
        _ => (sum & 0xFFFF) as u16,
    }
}

/// Encode payload bytes into a checksummed wire frame
///
/// The result is decoded again before being returned; a payload whose
/// encoding does not survive decoding is rejected.
pub fn encode(payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let frame = Frame::from_payload(payload)?;
    let bytes = frame.to_bytes();
    let decoded = Frame::from_bytes(&bytes)?;
    if decoded != frame {
        return Err(ProtocolError::Malformed(
            "encoded frame does not decode to the same contents".into(),
        ));
    }
    Ok(bytes)
}
