//! # PoolBus Core Library
//!
//! Link, framing and write arbitration for RS-485 pool equipment buses.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - Frame encoding and resynchronizing stream assembly for the controller,
//!   pump and chlorinator wire formats
//! - Serial, TCP bridge, and in-memory transports with reconnects
//! - A half-duplex write arbiter with retries, timeouts and collision backoff
//! - Response matching for queued commands
//! - JSON-lines packet capture and replay
//!
//! ## Example
//!
//! ```rust,ignore
//! use poolbus_core::prelude::*;
//!
//! let (engine, handle) = Engine::new(EngineConfig::from_file("poolbus.json")?)?;
//! let mut events = handle.subscribe();
//! engine.spawn();
//!
//! // Ask pump 96 for its status
//! handle.send_packet_str("96-16-7-0", ResponseSpec::Inferred).await;
//!
//! while let Ok(EngineEvent::FrameDecoded { frame, .. }) = events.recv().await {
//!     println!("{:?}", frame.payload());
//! }
//! ```

pub mod capture;
pub mod config;
pub mod diagnostics;
pub mod engine;
pub mod link;
pub mod protocol;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::capture::{read_capture, replay_capture, CapturedPacket, PacketCapture};
    pub use crate::config::{EngineConfig, TransportKind};
    pub use crate::diagnostics::{DiagnosticHook, VerbosityEscalation};
    pub use crate::engine::{
        CommandTicket, Counters, Engine, EngineEvent, EngineHandle, EnqueueResult, EnqueueStatus,
        Submission,
    };
    pub use crate::link::{LinkState, MockPeer};
    pub use crate::protocol::{
        encode, CommandBuilder, CommandError, CommandRequest, ExpectedResponse, Frame,
        FrameAssembler, FrameFamily, ResponseSpec,
    };
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
