//! Inbound frame assembly
//!
//! Raw chunks from the link are queued as they arrive and merged into an
//! accumulator only when the assembler needs more bytes. Frames are pulled
//! out lazily through [`FrameAssembler::frames`]; dropping the iterator
//! early leaves the remaining bytes in place for the next call.

use std::collections::VecDeque;

use byteorder::{BigEndian, ByteOrder};
use tracing::{debug, trace};

use super::frame::{
    Frame, FrameFamily, CHLOR_HEADER_LEN, CHLOR_PREAMBLE, CHLOR_TRAILER, HEADER_LEN,
    HEADER_MARKER, MAX_CHLOR_DATA_LEN, MAX_DATA_LEN, PREAMBLE,
};
use super::ProtocolError;

/// Bytes the accumulator must hold before a new frame is attempted
pub const DEFAULT_MIN_FRAME_BYTES: usize = 10;

/// Garbage beyond this many bytes without any preamble is dropped
const GARBAGE_LIMIT: usize = 24;

/// Bytes kept after dropping garbage, enough to hold a split preamble
const GARBAGE_KEEP: usize = 5;

/// A frame that completed (or was abandoned) without passing validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedFrame {
    /// Why the frame was rejected
    pub error: ProtocolError,
    /// The bytes that made up the frame
    pub bytes: Vec<u8>,
}

/// A frame being assembled from the accumulator
#[derive(Debug, Clone)]
pub struct PartialFrame {
    family: Option<FrameFamily>,
    padding: Vec<u8>,
    preamble: Vec<u8>,
    header: Vec<u8>,
    data: Vec<u8>,
    term: Vec<u8>,
    complete: bool,
    valid: bool,
    collisions: u64,
}

impl Default for PartialFrame {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialFrame {
    /// Create an empty frame awaiting a preamble
    pub fn new() -> Self {
        Self {
            family: None,
            padding: Vec::new(),
            preamble: Vec::new(),
            header: Vec::new(),
            data: Vec::new(),
            term: Vec::new(),
            complete: false,
            valid: true,
            collisions: 0,
        }
    }

    /// Advance through `bytes`, returning how many leading bytes were consumed
    ///
    /// Can be called repeatedly with fresh accumulator contents until the
    /// frame is complete or invalid.
    pub fn read_packet(&mut self, bytes: &[u8]) -> usize {
        let mut ndx = 0;
        if self.header.is_empty() {
            ndx = self.read_header(bytes, ndx);
        }
        ndx = self.read_payload(bytes, ndx);
        self.read_checksum(bytes, ndx)
    }

    /// Whether the trailing checksum (and trailer) have been read
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// False once the frame has failed validation or run away
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Whether a header has been read and the frame is still being filled
    pub fn has_started(&self) -> bool {
        !self.header.is_empty() && !self.complete && self.valid
    }

    /// Whether noise bytes were skipped ahead of the preamble
    pub fn has_padding(&self) -> bool {
        !self.padding.is_empty()
    }

    /// Header-length collisions seen since the last call
    pub fn take_collisions(&mut self) -> u64 {
        std::mem::take(&mut self.collisions)
    }

    /// All bytes attributed to this frame, preamble through trailer
    pub fn raw_bytes(&self) -> Vec<u8> {
        let mut bytes = self.preamble.clone();
        bytes.extend_from_slice(&self.header);
        bytes.extend_from_slice(&self.data);
        bytes.extend_from_slice(&self.term);
        bytes
    }

    /// Convert into a validated frame
    pub fn into_frame(self) -> Result<Frame, ProtocolError> {
        let family = match self.family {
            Some(family) if self.complete => family,
            _ if !self.valid => {
                return Err(ProtocolError::Runaway(self.header.len() + self.data.len()))
            }
            _ => return Err(ProtocolError::Malformed("incomplete frame".into())),
        };
        let checksum = match family {
            FrameFamily::Chlorinator => self.term[0] as u16,
            _ => BigEndian::read_u16(&self.term[..2]),
        };
        let frame = Frame {
            family,
            header: self.header,
            data: self.data,
            checksum,
        };
        if frame.is_valid() {
            Ok(frame)
        } else {
            Err(ProtocolError::ChecksumMismatch {
                expected: frame.computed_checksum(),
                actual: checksum,
            })
        }
    }

    fn finish(self) -> Result<Frame, RejectedFrame> {
        let bytes = self.raw_bytes();
        self.into_frame()
            .map_err(|error| RejectedFrame { error, bytes })
    }

    fn read_header(&mut self, bytes: &[u8], mut ndx: usize) -> usize {
        let start = ndx;
        let mut found = None;
        while ndx < bytes.len() {
            if is_chlorinator_header(bytes, ndx) {
                found = Some(FrameFamily::Chlorinator);
                break;
            }
            if is_controller_header(bytes, ndx) {
                found = Some(FrameFamily::Controller);
                break;
            }
            self.padding.push(bytes[ndx]);
            ndx += 1;
        }

        let ndx_header = ndx;
        match found {
            Some(FrameFamily::Chlorinator) => {
                if bytes.len() - ndx < CHLOR_HEADER_LEN {
                    return ndx_header;
                }
                self.header.extend_from_slice(&bytes[ndx..ndx + CHLOR_HEADER_LEN]);
                self.family = Some(FrameFamily::Chlorinator);
                ndx + CHLOR_HEADER_LEN
            }
            Some(_) => {
                ndx += PREAMBLE.len();
                if bytes.len() - ndx < HEADER_LEN {
                    return ndx_header;
                }
                let header = &bytes[ndx..ndx + HEADER_LEN];
                let declared = header[5] as usize;
                if declared > MAX_DATA_LEN {
                    // Two transmitters talked over each other; resync one byte past this preamble
                    debug!(
                        target: "poolbus::rx",
                        declared,
                        "header declares oversize data, treating as collision"
                    );
                    self.padding.push(bytes[ndx_header]);
                    self.collisions += 1;
                    return ndx_header + 1;
                }
                self.preamble.extend_from_slice(&PREAMBLE);
                self.header.extend_from_slice(header);
                self.family = Some(FrameFamily::from_addresses(header[2], header[3]));
                ndx + HEADER_LEN
            }
            None => {
                self.padding.clear();
                if bytes.len() - start > GARBAGE_LIMIT {
                    trace!(
                        target: "poolbus::rx",
                        dropped = bytes.len() - GARBAGE_KEEP,
                        "no preamble found, dropping garbage"
                    );
                    bytes.len() - GARBAGE_KEEP
                } else {
                    start
                }
            }
        }
    }

    fn read_payload(&mut self, bytes: &[u8], mut ndx: usize) -> usize {
        if !self.valid || self.header.is_empty() {
            return ndx;
        }
        match self.family {
            Some(FrameFamily::Chlorinator) => {
                while ndx + 3 <= bytes.len() && !is_chlorinator_term(bytes, ndx) {
                    self.data.push(bytes[ndx]);
                    ndx += 1;
                    if self.data.len() > MAX_CHLOR_DATA_LEN {
                        debug!(target: "poolbus::rx", "chlorinator frame without trailer, abandoning");
                        self.valid = false;
                        break;
                    }
                }
            }
            Some(_) => {
                let need = (self.header[5] as usize).saturating_sub(self.data.len());
                let take = need.min(bytes.len() - ndx);
                self.data.extend_from_slice(&bytes[ndx..ndx + take]);
                ndx += take;
            }
            None => {}
        }
        ndx
    }

    fn read_checksum(&mut self, bytes: &[u8], ndx: usize) -> usize {
        if !self.valid || self.header.is_empty() || ndx >= bytes.len() {
            return ndx;
        }
        match self.family {
            Some(FrameFamily::Chlorinator) => {
                if ndx + 3 <= bytes.len() && is_chlorinator_term(bytes, ndx) {
                    self.term.extend_from_slice(&bytes[ndx..ndx + 3]);
                    self.complete = true;
                    return ndx + 3;
                }
            }
            Some(_) => {
                if self.data.len() >= self.header[5] as usize && ndx + 2 <= bytes.len() {
                    self.term.extend_from_slice(&bytes[ndx..ndx + 2]);
                    self.complete = true;
                    return ndx + 2;
                }
            }
            None => {}
        }
        ndx
    }
}

fn is_chlorinator_header(bytes: &[u8], ndx: usize) -> bool {
    bytes[ndx..].starts_with(&CHLOR_PREAMBLE)
}

fn is_controller_header(bytes: &[u8], ndx: usize) -> bool {
    let rest = &bytes[ndx..];
    rest.starts_with(&PREAMBLE) && rest.get(PREAMBLE.len()) == Some(&HEADER_MARKER)
}

/// Checksum byte at `ndx` followed by the trailer
fn is_chlorinator_term(bytes: &[u8], ndx: usize) -> bool {
    bytes.get(ndx + 1..ndx + 3) == Some(&CHLOR_TRAILER[..])
}

/// Reassembles frames from raw link chunks
#[derive(Debug)]
pub struct FrameAssembler {
    chunks: VecDeque<Vec<u8>>,
    buffer: Vec<u8>,
    current: PartialFrame,
    min_frame_bytes: usize,
    collisions: u64,
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_FRAME_BYTES)
    }
}

impl FrameAssembler {
    /// Create an assembler that waits for `min_frame_bytes` before starting a frame
    pub fn new(min_frame_bytes: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            buffer: Vec::new(),
            current: PartialFrame::new(),
            min_frame_bytes: min_frame_bytes.max(1),
            collisions: 0,
        }
    }

    /// Queue a raw chunk for ingestion
    pub fn feed(&mut self, chunk: &[u8]) {
        if !chunk.is_empty() {
            self.chunks.push_back(chunk.to_vec());
        }
    }

    /// Lazily assemble frames from everything fed so far
    pub fn frames(&mut self) -> Frames<'_> {
        Frames { assembler: self }
    }

    /// Raw chunks queued but not yet merged
    pub fn pending_chunks(&self) -> usize {
        self.chunks.len()
    }

    /// Merged bytes not yet consumed by a frame
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether a frame header has been read and its body is outstanding
    pub fn is_mid_frame(&self) -> bool {
        self.current.has_started()
    }

    /// Total header-length collisions observed
    pub fn collisions(&self) -> u64 {
        self.collisions
    }

    /// Drop all queued chunks, buffered bytes, and the frame in progress
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.buffer.clear();
        self.current = PartialFrame::new();
    }

    fn pull_chunk(&mut self) -> bool {
        match self.chunks.pop_front() {
            Some(chunk) => {
                self.buffer.extend_from_slice(&chunk);
                true
            }
            None => false,
        }
    }

    fn next_frame(&mut self) -> Option<Result<Frame, RejectedFrame>> {
        loop {
            if self.buffer.is_empty()
                || (!self.current.has_started() && self.buffer.len() < self.min_frame_bytes)
            {
                if !self.pull_chunk() {
                    return None;
                }
                continue;
            }

            let consumed = self.current.read_packet(&self.buffer);
            self.collisions += self.current.take_collisions();
            if consumed > 0 {
                self.buffer.drain(..consumed);
            }

            if self.current.is_complete() || !self.current.is_valid() {
                let finished = std::mem::take(&mut self.current);
                return Some(finished.finish());
            }

            if consumed == 0 && !self.pull_chunk() {
                return None;
            }
        }
    }
}

/// Iterator over frames completed by a [`FrameAssembler`]
pub struct Frames<'a> {
    assembler: &'a mut FrameAssembler,
}

impl Iterator for Frames<'_> {
    type Item = Result<Frame, RejectedFrame>;

    fn next(&mut self) -> Option<Self::Item> {
        self.assembler.next_frame()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::encode;

    fn controller_frame() -> Vec<u8> {
        encode(&[165, 33, 15, 16, 2, 3, 12, 30, 0]).unwrap()
    }

    #[test]
    fn test_single_frame() {
        let mut asm = FrameAssembler::default();
        asm.feed(&controller_frame());
        let frames: Vec<_> = asm.frames().collect();
        assert_eq!(frames.len(), 1);
        let frame = frames[0].as_ref().unwrap();
        assert_eq!(frame.family, FrameFamily::Controller);
        assert_eq!(frame.data, vec![12, 30, 0]);
        assert_eq!(asm.buffered_len(), 0);
    }

    #[test]
    fn test_frame_split_across_chunks() {
        let bytes = controller_frame();
        let mut asm = FrameAssembler::default();
        asm.feed(&bytes[..11]);
        assert_eq!(asm.frames().count(), 0);
        assert!(asm.is_mid_frame());
        asm.feed(&bytes[11..]);
        let frames: Vec<_> = asm.frames().collect();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_ok());
    }

    #[test]
    fn test_waits_for_minimum_bytes() {
        let mut asm = FrameAssembler::default();
        let chlor = encode(&[16, 2, 80, 0]).unwrap();
        asm.feed(&chlor);
        assert_eq!(asm.frames().count(), 0);
        // more traffic releases the first; the second waits in turn
        asm.feed(&chlor);
        assert_eq!(asm.frames().filter(|f| f.is_ok()).count(), 1);
        assert_eq!(asm.buffered_len(), chlor.len());
    }

    #[test]
    fn test_noise_before_preamble_is_skipped() {
        let mut bytes = vec![1, 2, 3, 255, 0];
        bytes.extend(controller_frame());
        let mut asm = FrameAssembler::default();
        asm.feed(&bytes);
        let frames: Vec<_> = asm.frames().collect();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_ok());
    }

    #[test]
    fn test_collision_rewinds_to_next_frame() {
        // a header declaring 200 data bytes, immediately followed by a good frame
        let mut bytes = vec![255, 0, 255, 165, 0, 16, 34, 2, 200];
        bytes.extend(controller_frame());
        let mut asm = FrameAssembler::default();
        asm.feed(&bytes);
        let frames: Vec<_> = asm.frames().collect();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_ref().unwrap().data, vec![12, 30, 0]);
        assert_eq!(asm.collisions(), 1);
    }

    #[test]
    fn test_bad_checksum_reported() {
        let mut bytes = controller_frame();
        let last = bytes.len() - 1;
        bytes[last] = bytes[last].wrapping_add(1);
        let mut asm = FrameAssembler::default();
        asm.feed(&bytes);
        let frames: Vec<_> = asm.frames().collect();
        assert_eq!(frames.len(), 1);
        let rejected = frames[0].as_ref().unwrap_err();
        assert!(matches!(rejected.error, ProtocolError::ChecksumMismatch { .. }));
        assert_eq!(rejected.bytes, bytes);
    }

    #[test]
    fn test_runaway_chlorinator_abandoned() {
        let mut bytes = vec![16, 2, 80, 17];
        bytes.extend(std::iter::repeat(7).take(30));
        let mut asm = FrameAssembler::default();
        asm.feed(&bytes);
        let first = asm.frames().next().unwrap();
        assert!(matches!(
            first,
            Err(RejectedFrame { error: ProtocolError::Runaway(_), .. })
        ));
    }

    #[test]
    fn test_garbage_without_preamble_is_trimmed() {
        let mut asm = FrameAssembler::default();
        asm.feed(&[9u8; 40]);
        assert_eq!(asm.frames().count(), 0);
        assert_eq!(asm.buffered_len(), GARBAGE_KEEP);
    }

    #[test]
    fn test_lazy_iteration_resumes() {
        let mut bytes = controller_frame();
        bytes.extend(controller_frame());
        let mut asm = FrameAssembler::default();
        asm.feed(&bytes);
        assert!(asm.frames().next().is_some());
        assert!(asm.frames().next().is_some());
        assert!(asm.frames().next().is_none());
    }
}
