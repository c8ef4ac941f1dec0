//! Command Builder
//!
//! Builds outbound payloads (header + data, no checksum) for each family,
//! and converts the dash-separated packet strings used by operators, e.g.
//! `96-16-4-1-255` or `16-2-80-0`.
//!
//! A packet string starting `16-2` is taken as a chlorinator payload
//! verbatim. Anything else is `dest-source-action-length-data...` and gets
//! the controller header marker prepended: sub byte 0 when either address
//! is a pump, otherwise the controller's sub byte.

use super::frame::{FrameFamily, CHLOR_PREAMBLE, HEADER_MARKER, PUMP_ADDRESSES};
use super::ProtocolError;

/// Builder for outbound payloads
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    family: FrameFamily,
    header: Vec<u8>,
    data: Vec<u8>,
}

impl CommandBuilder {
    /// Controller-format payload; pump addressing selects the pump family
    pub fn controller(sub: u8, dest: u8, source: u8, action: u8) -> Self {
        Self {
            family: FrameFamily::from_addresses(dest, source),
            header: vec![HEADER_MARKER, sub, dest, source, action],
            data: Vec::new(),
        }
    }

    /// Pump payload; pumps always use sub byte 0
    pub fn pump(dest: u8, source: u8, action: u8) -> Self {
        Self::controller(0, dest, source, action)
    }

    /// Chlorinator payload
    pub fn chlorinator(dest: u8, action: u8) -> Self {
        Self {
            family: FrameFamily::Chlorinator,
            header: vec![CHLOR_PREAMBLE[0], CHLOR_PREAMBLE[1], dest, action],
            data: Vec::new(),
        }
    }

    /// Add a single data byte
    pub fn byte(mut self, b: u8) -> Self {
        self.data.push(b);
        self
    }

    /// Add raw data bytes
    pub fn bytes(mut self, data: &[u8]) -> Self {
        self.data.extend_from_slice(data);
        self
    }

    /// Family of the payload being built
    pub fn family(&self) -> FrameFamily {
        self.family
    }

    /// Build the payload, filling in the length byte for controller formats
    pub fn build(self) -> Result<Vec<u8>, ProtocolError> {
        let mut payload = self.header;
        if self.family.is_controller_format() {
            let len = u8::try_from(self.data.len())
                .map_err(|_| ProtocolError::PayloadTooLong(self.data.len()))?;
            payload.push(len);
        }
        payload.extend_from_slice(&self.data);
        Ok(payload)
    }
}

/// Parse a dash-separated packet string into a payload
pub fn parse_packet_str(packet: &str, controller_sub: u8) -> Result<Vec<u8>, ProtocolError> {
    let values = packet
        .trim()
        .split('-')
        .map(|part| {
            let part = part.trim();
            part.parse::<u8>().map_err(|_| {
                ProtocolError::InvalidPacketString(format!("'{}' is not a byte value", part))
            })
        })
        .collect::<Result<Vec<u8>, _>>()?;

    if values.len() < 2 {
        return Err(ProtocolError::InvalidPacketString(format!(
            "'{}' has fewer than two bytes",
            packet
        )));
    }

    if values.starts_with(&CHLOR_PREAMBLE) {
        return Ok(values);
    }

    let pump = PUMP_ADDRESSES.contains(&values[0]) || PUMP_ADDRESSES.contains(&values[1]);
    let sub = if pump { 0 } else { controller_sub };
    let mut payload = vec![HEADER_MARKER, sub];
    payload.extend(values);
    Ok(payload)
}

/// Format a payload or frame as a dash-separated string
pub fn format_packet_str(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| b.to_string())
        .collect::<Vec<_>>()
        .join("-")
}
