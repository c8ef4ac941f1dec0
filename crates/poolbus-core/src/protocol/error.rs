//! Protocol errors

use std::fmt;

use thiserror::Error;

/// Errors raised while framing, encoding, or decoding bus traffic
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Empty payload")]
    EmptyPayload,

    #[error("Unknown frame family for leading byte {0}")]
    UnknownFamily(u8),

    #[error("Length mismatch: header declares {declared} data bytes, payload carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("Payload too long: {0} data bytes")]
    PayloadTooLong(usize),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u16, actual: u16 },

    #[error("Chlorinator frame ran {0} bytes without a trailer")]
    Runaway(usize),

    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("Invalid packet string: {0}")]
    InvalidPacketString(String),
}

/// Why an outbound command was given up on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// Try budget exhausted without a matching response
    NoResponse,
    /// The same bytes were written too many times in a row
    Ejected,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::NoResponse => write!(f, "no response"),
            AbortReason::Ejected => write!(f, "ejected after repeated writes"),
        }
    }
}

/// Terminal failure of a queued command, delivered through its completion
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("Message aborted after {tries} attempt(s): {reason}")]
    Aborted { tries: u32, reason: AbortReason },

    #[error("Write failed after {tries} attempt(s): {message}")]
    WriteFailed { tries: u32, message: String },

    #[error("Command cancelled before completion")]
    Cancelled,
}
