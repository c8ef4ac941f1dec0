//! RS-485 Pool Bus Protocol
//!
//! Implements framing for the controller, pump, and chlorinator families
//! that share a single half-duplex bus.
//!
//! Encoding and validation live in [`frame`], inbound reassembly in
//! [`assembler`], and the shape of outbound commands and their expected
//! replies in [`commands`].

pub mod assembler;
pub mod command_builder;
pub mod commands;
mod error;
pub mod frame;

pub use assembler::{FrameAssembler, Frames, PartialFrame, RejectedFrame};
pub use command_builder::{format_packet_str, parse_packet_str, CommandBuilder};
pub use commands::{
    CommandDefaults, CommandOutcome, CommandRequest, Completion, ExpectedResponse,
    OutboundCommand, ResponsePredicate, ResponseSpec,
};
pub use error::{AbortReason, CommandError, ProtocolError};
pub use frame::{encode, Frame, FrameFamily};

/// Default baud rate of the bus
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Default timeout for responses in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 2000;

/// Default number of physical writes per command
pub const DEFAULT_TRIES: u32 = 3;

/// Default address this client uses as a frame source
pub const DEFAULT_APP_ADDRESS: u8 = 33;

/// Controller sub byte assumed until one is seen on the bus
pub const DEFAULT_CONTROLLER_SUB: u8 = 33;
