//! Bus traffic counters

use serde::{Deserialize, Serialize};

/// Snapshot of traffic statistics since the engine started
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Counters {
    /// Raw bytes read from the link
    pub bytes_received: u64,
    /// Bytes handed to the link for writing
    pub bytes_sent: u64,
    /// Frames that passed checksum validation
    pub success: u64,
    /// Frames rejected by checksum or abandoned mid-frame
    pub failed: u64,
    /// Headers rewound because of an impossible data length
    pub collisions: u64,
    /// Commands given up on after exhausting their tries
    pub aborted: u64,
}

impl Counters {
    /// Total frames seen, good or bad
    pub fn frames(&self) -> u64 {
        self.success + self.failed
    }

    /// Clear everything back to zero
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
