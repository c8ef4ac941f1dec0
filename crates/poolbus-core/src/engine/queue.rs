//! Outbound command queue
//!
//! Commands are serialized on the way in and kept in submission order until
//! the write arbiter takes them.

use std::collections::VecDeque;
use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::protocol::{
    format_packet_str, CommandDefaults, CommandOutcome, CommandRequest, FrameFamily,
    OutboundCommand, ResponseSpec,
};

/// Controller actions that change state and can be confirmed with a `get`
pub const SET_ACTIONS: RangeInclusive<u8> = 131..=191;

/// Controller address that answers `get` requests
const CONTROLLER_ADDRESS: u8 = 16;

/// Outcome class of an enqueue attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnqueueStatus {
    /// Queued
    Ok,
    /// The command itself is malformed
    Error,
    /// The engine is not accepting writes
    Fail,
}

/// Immediate reply to an enqueue request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueResult {
    /// Outcome class
    pub status: EnqueueStatus,
    /// Human-readable detail
    pub text: String,
    /// Identifier of the queued command
    #[serde(skip)]
    pub id: Option<u64>,
}

impl EnqueueResult {
    /// A rejection that never reached the queue
    pub fn fail(text: impl Into<String>) -> Self {
        Self {
            status: EnqueueStatus::Fail,
            text: text.into(),
            id: None,
        }
    }

    /// Whether the command was queued
    pub fn is_ok(&self) -> bool {
        self.status == EnqueueStatus::Ok
    }
}

/// Companion `get` settings for controller `set` commands
#[derive(Debug, Clone, Copy)]
pub struct ConfirmSets {
    /// Controller sub byte for the companion header
    pub controller_sub: u8,
    /// Source address of the companion
    pub app_address: u8,
}

/// State the queue consults when accepting a command
#[derive(Debug, Clone, Copy)]
pub struct EnqueueContext {
    /// Whether the link can carry writes
    pub link_open: bool,
    /// Reject everything, for replay and testing
    pub suppress_write: bool,
    /// Defaults for unset tries and timeouts
    pub defaults: CommandDefaults,
    /// Enables companion `get` commands
    pub confirm_sets: Option<ConfirmSets>,
}

/// FIFO of serialized commands waiting for the bus
#[derive(Debug, Default)]
pub struct OutboundQueue {
    commands: VecDeque<OutboundCommand>,
    next_id: u64,
}

impl OutboundQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate, serialize, and append a command
    pub fn enqueue(
        &mut self,
        request: CommandRequest,
        ctx: &EnqueueContext,
        completion: Option<oneshot::Sender<CommandOutcome>>,
    ) -> EnqueueResult {
        let packet = format_packet_str(&request.payload);
        if !ctx.link_open {
            warn!(target: "poolbus::tx", packet = %packet, "packet not queued, link is not open");
            return EnqueueResult::fail(format!("Packet NOT queued, link not open: {}", packet));
        }
        if ctx.suppress_write {
            debug!(target: "poolbus::tx", packet = %packet, "packet not queued, writes suppressed");
            return EnqueueResult::fail(format!(
                "Packet NOT queued, writes suppressed: {}",
                packet
            ));
        }

        let id = self.allocate_id();
        let command = match OutboundCommand::encode(id, request, &ctx.defaults, completion) {
            Ok(command) => command,
            Err(e) => {
                warn!(target: "poolbus::tx", packet = %packet, error = %e, "malformed packet not queued");
                return EnqueueResult {
                    status: EnqueueStatus::Error,
                    text: format!("Packet NOT queued ({}): {}", e, packet),
                    id: None,
                };
            }
        };

        let family = command.frame().family;
        let companion = ctx.confirm_sets.and_then(|confirm| {
            let action = command.frame().action();
            (family == FrameFamily::Controller && SET_ACTIONS.contains(&action)).then(|| {
                vec![
                    165,
                    confirm.controller_sub,
                    CONTROLLER_ADDRESS,
                    confirm.app_address,
                    action + 64,
                    1,
                    0,
                ]
            })
        });

        debug!(target: "poolbus::tx", id, family = %family, packet = %packet, "packet queued");
        self.commands.push_back(command);

        if let Some(payload) = companion {
            let id = self.allocate_id();
            let request = CommandRequest::new(payload).expect(ResponseSpec::Inferred);
            match OutboundCommand::encode(id, request, &ctx.defaults, None) {
                Ok(get) => {
                    debug!(target: "poolbus::tx", id, "companion get queued");
                    self.commands.push_back(get);
                }
                Err(e) => warn!(target: "poolbus::tx", error = %e, "companion get not queued"),
            }
        }

        EnqueueResult {
            status: EnqueueStatus::Ok,
            text: format!("{} packet queued: {}", family, packet),
            id: Some(id),
        }
    }

    /// Oldest command
    pub fn peek_first(&self) -> Option<&OutboundCommand> {
        self.commands.front()
    }

    /// Remove the oldest command
    pub fn pop_first(&mut self) -> Option<OutboundCommand> {
        self.commands.pop_front()
    }

    /// Number of queued commands
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Iterate in submission order
    pub fn iter(&self) -> impl Iterator<Item = &OutboundCommand> {
        self.commands.iter()
    }

    /// Remove the oldest command satisfying `pred`
    pub fn take_first(
        &mut self,
        mut pred: impl FnMut(&OutboundCommand) -> bool,
    ) -> Option<OutboundCommand> {
        let ndx = self.commands.iter().position(|cmd| pred(cmd))?;
        self.commands.remove(ndx)
    }

    /// Remove every command satisfying `pred`, keeping the rest in order
    pub fn take_all(
        &mut self,
        mut pred: impl FnMut(&OutboundCommand) -> bool,
    ) -> Vec<OutboundCommand> {
        let mut taken = Vec::new();
        let mut ndx = 0;
        while ndx < self.commands.len() {
            if pred(&self.commands[ndx]) {
                if let Some(cmd) = self.commands.remove(ndx) {
                    taken.push(cmd);
                }
            } else {
                ndx += 1;
            }
        }
        taken
    }

    /// Empty the queue, returning its contents
    pub fn drain(&mut self) -> Vec<OutboundCommand> {
        self.commands.drain(..).collect()
    }

    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_ctx() -> EnqueueContext {
        EnqueueContext {
            link_open: true,
            suppress_write: false,
            defaults: CommandDefaults::default(),
            confirm_sets: None,
        }
    }

    #[test]
    fn test_enqueue_preserves_order() {
        let mut queue = OutboundQueue::new();
        let ctx = open_ctx();
        assert!(queue.enqueue(CommandRequest::new(vec![16, 2, 80, 0]), &ctx, None).is_ok());
        assert!(queue
            .enqueue(CommandRequest::new(vec![165, 0, 96, 16, 6, 1, 10]), &ctx, None)
            .is_ok());
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.peek_first().unwrap().frame().family, FrameFamily::Chlorinator);
        assert_eq!(
            queue.pop_first().unwrap().bytes(),
            &[16, 2, 80, 0, 98, 16, 3]
        );
        assert_eq!(queue.peek_first().unwrap().frame().family, FrameFamily::Pump);
    }

    #[test]
    fn test_enqueue_rejected_when_closed_or_suppressed() {
        let mut queue = OutboundQueue::new();
        let closed = EnqueueContext {
            link_open: false,
            ..open_ctx()
        };
        let result = queue.enqueue(CommandRequest::new(vec![16, 2, 80, 0]), &closed, None);
        assert_eq!(result.status, EnqueueStatus::Fail);

        let suppressed = EnqueueContext {
            suppress_write: true,
            ..open_ctx()
        };
        let result = queue.enqueue(CommandRequest::new(vec![16, 2, 80, 0]), &suppressed, None);
        assert_eq!(result.status, EnqueueStatus::Fail);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_malformed_command_is_error() {
        let mut queue = OutboundQueue::new();
        let result = queue.enqueue(CommandRequest::new(vec![165, 0, 96]), &open_ctx(), None);
        assert_eq!(result.status, EnqueueStatus::Error);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_companion_get_after_set() {
        let mut queue = OutboundQueue::new();
        let ctx = EnqueueContext {
            confirm_sets: Some(ConfirmSets {
                controller_sub: 24,
                app_address: 33,
            }),
            ..open_ctx()
        };
        queue.enqueue(
            CommandRequest::new(vec![165, 24, 16, 33, 134, 2, 1, 1]),
            &ctx,
            None,
        );
        assert_eq!(queue.len(), 2);
        let companion = queue.iter().nth(1).unwrap();
        assert_eq!(companion.frame().payload(), vec![165, 24, 16, 33, 198, 1, 0]);
        assert!(companion.requires_response());
    }

    #[test]
    fn test_take_all_keeps_survivor_order() {
        let mut queue = OutboundQueue::new();
        let ctx = open_ctx();
        for action in [0u8, 17, 0, 21] {
            queue.enqueue(CommandRequest::new(vec![16, 2, 80, action]), &ctx, None);
        }
        let taken = queue.take_all(|cmd| cmd.frame().action() == 0);
        assert_eq!(taken.len(), 2);
        let left: Vec<u8> = queue.iter().map(|cmd| cmd.frame().action()).collect();
        assert_eq!(left, vec![17, 21]);
    }
}
