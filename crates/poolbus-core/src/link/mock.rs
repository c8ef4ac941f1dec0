//! In-memory bus peer
//!
//! The far end of the mock transport. Tests and replays use it to put bytes
//! on the bus and to observe what the engine writes.

use std::io;

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use crate::protocol::{Frame, FrameAssembler};

const PIPE_CAPACITY: usize = 4096;

/// Far end of the in-memory transport
#[derive(Debug)]
pub struct MockPeer {
    stream: DuplexStream,
    assembler: FrameAssembler,
}

impl MockPeer {
    /// Create a connected pipe, returning the link's end and the peer
    pub fn pair() -> (DuplexStream, MockPeer) {
        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        let peer = MockPeer {
            stream: remote,
            assembler: FrameAssembler::new(1),
        };
        (local, peer)
    }

    /// Put raw bytes on the bus
    pub async fn inject(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await
    }

    /// Wait for the next frame the engine writes
    pub async fn next_frame(&mut self) -> io::Result<Frame> {
        let mut buf = [0u8; 256];
        loop {
            if let Some(frame) = self.assembler.frames().find_map(Result::ok) {
                return Ok(frame);
            }
            let n = self.stream.read(&mut buf).await?;
            if n == 0 {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "link closed"));
            }
            self.assembler.feed(&buf[..n]);
        }
    }
}
