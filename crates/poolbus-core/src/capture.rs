//! Packet capture and replay
//!
//! Captures are JSON lines, one object per frame or write:
//!
//! ```text
//! {"ts":"2024-06-01T12:00:00.125Z","dir":"in","family":"controller","valid":true,"pkt":[255,0,255,165,...]}
//! ```
//!
//! Replaying feeds the inbound packets back through a mock transport.

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::FrameFamily;

/// Errors reading a capture file
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Failed to read capture: {0}")]
    Io(#[from] io::Error),

    #[error("Bad capture record on line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Direction of a captured packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Read from the bus
    In,
    /// Written to the bus
    Out,
}

/// One captured packet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedPacket {
    /// When the packet was seen
    pub ts: DateTime<Utc>,
    /// Direction
    pub dir: Direction,
    /// Family, when the frame got far enough to have one
    pub family: Option<FrameFamily>,
    /// Whether the frame passed validation
    pub valid: bool,
    /// Packet bytes
    pub pkt: Vec<u8>,
}

/// Appends packets to a capture file
pub struct PacketCapture {
    writer: BufWriter<File>,
}

impl PacketCapture {
    /// Open (or create) a capture file for appending
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    /// Append one packet
    pub fn record(
        &mut self,
        dir: Direction,
        family: Option<FrameFamily>,
        valid: bool,
        pkt: &[u8],
    ) -> io::Result<()> {
        let record = CapturedPacket {
            ts: Utc::now(),
            dir,
            family,
            valid,
            pkt: pkt.to_vec(),
        };
        serde_json::to_writer(&mut self.writer, &record)?;
        writeln!(self.writer)?;
        self.writer.flush()
    }
}

/// Read every record of a capture file
pub fn read_capture<P: AsRef<Path>>(path: P) -> Result<Vec<CapturedPacket>, CaptureError> {
    let reader = BufReader::new(File::open(path)?);
    let mut packets = Vec::new();
    for (ndx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let packet = serde_json::from_str(&line).map_err(|source| CaptureError::Parse {
            line: ndx + 1,
            source,
        })?;
        packets.push(packet);
    }
    Ok(packets)
}

/// Inbound packet bytes of a capture, in order, ready to inject into a mock bus
pub fn replay_capture<P: AsRef<Path>>(path: P) -> Result<Vec<Vec<u8>>, CaptureError> {
    Ok(read_capture(path)?
        .into_iter()
        .filter(|packet| packet.dir == Direction::In)
        .map(|packet| packet.pkt)
        .collect())
}
