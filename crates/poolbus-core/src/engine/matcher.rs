//! Response matching
//!
//! Every valid inbound frame is offered to the command holding the bus slot
//! and to the queued commands. A command whose response test accepts the
//! frame is removed and completed with it.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::arbiter::WriteArbiter;
use super::queue::OutboundQueue;
use crate::protocol::{Completion, Frame, OutboundCommand};

/// How many commands a single inbound frame may satisfy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    /// The awaiting command if it matches, otherwise the oldest matching queued one
    #[default]
    First,
    /// The awaiting command and every matching queued command
    All,
}

/// Commands satisfied by one inbound frame
#[derive(Debug, Default)]
pub struct MatchOutcome {
    /// Completions to deliver
    pub completions: Vec<Completion>,
    /// Actions to acknowledge on the bus
    pub acks: Vec<u8>,
}

impl MatchOutcome {
    /// Whether any command was satisfied
    pub fn is_empty(&self) -> bool {
        self.completions.is_empty()
    }
}

/// Correlates inbound frames with outstanding commands
#[derive(Debug, Clone, Copy, Default)]
pub struct ResponseMatcher {
    policy: DuplicatePolicy,
}

impl ResponseMatcher {
    /// Create a matcher with the given duplicate policy
    pub fn new(policy: DuplicatePolicy) -> Self {
        Self { policy }
    }

    /// Offer a valid frame to the awaiting slot and the queue
    pub fn try_match(
        &self,
        frame: &Frame,
        arbiter: &mut WriteArbiter,
        queue: &mut OutboundQueue,
    ) -> MatchOutcome {
        let mut satisfied: Vec<OutboundCommand> = Vec::new();

        let slot_matches = arbiter
            .awaiting()
            .is_some_and(|cmd| cmd.requires_response() && cmd.is_response(frame));
        if slot_matches {
            satisfied.extend(arbiter.take_awaiting());
        }

        match self.policy {
            DuplicatePolicy::First => {
                if satisfied.is_empty() {
                    satisfied.extend(queue.take_first(|cmd| cmd.is_response(frame)));
                }
            }
            DuplicatePolicy::All => {
                satisfied.extend(queue.take_all(|cmd| cmd.is_response(frame)));
            }
        }

        let mut outcome = MatchOutcome::default();
        for cmd in satisfied {
            debug!(
                target: "poolbus::rx",
                id = cmd.id(),
                tries = cmd.tries(),
                family = %frame.family,
                action = frame.action(),
                "response matched"
            );
            outcome.acks.extend(cmd.ack_action());
            outcome.completions.push(cmd.finish(Ok(Some(frame.clone()))));
        }
        outcome
    }
}
