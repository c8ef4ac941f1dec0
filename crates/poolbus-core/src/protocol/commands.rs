//! Outbound commands
//!
//! A [`CommandRequest`] is what callers submit; the queue turns it into an
//! [`OutboundCommand`] carrying the serialized frame, the try budget, and the
//! completion channel.

use std::fmt;
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::time::{Duration, Instant};

use super::frame::{self, Frame, FrameFamily};
use super::{CommandError, ProtocolError};

/// Caller-supplied response test
pub type ResponsePredicate = Arc<dyn Fn(&Frame, &OutboundCommand) -> bool + Send + Sync>;

/// Result delivered to the submitter of a command
///
/// `Ok(Some(frame))` carries the matching response, `Ok(None)` a
/// fire-and-forget command that was written.
pub type CommandOutcome = Result<Option<Frame>, CommandError>;

/// How the response to a command is recognized
#[derive(Clone, Default)]
pub enum ResponseSpec {
    /// Fire and forget; completes once written
    #[default]
    None,
    /// Infer the reply from the request's family, addresses, and action
    Inferred,
    /// Structured match on the reply's fields
    Expect(ExpectedResponse),
    /// Arbitrary caller test
    Predicate(ResponsePredicate),
}

impl fmt::Debug for ResponseSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseSpec::None => write!(f, "None"),
            ResponseSpec::Inferred => write!(f, "Inferred"),
            ResponseSpec::Expect(expected) => f.debug_tuple("Expect").field(expected).finish(),
            ResponseSpec::Predicate(_) => write!(f, "Predicate(..)"),
        }
    }
}

/// Structured description of an expected reply
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpectedResponse {
    /// Required family
    pub family: Option<FrameFamily>,
    /// Required action byte
    pub action: Option<u8>,
    /// Required destination address
    pub dest: Option<u8>,
    /// Leading data bytes the reply must carry
    pub payload_prefix: Vec<u8>,
    /// When set, an acknowledgement for this action is queued after the match
    pub ack: Option<u8>,
}

impl ExpectedResponse {
    /// Expect a reply with the given action
    pub fn action(action: u8) -> Self {
        Self {
            action: Some(action),
            ..Default::default()
        }
    }

    /// Restrict to a family
    pub fn family(mut self, family: FrameFamily) -> Self {
        self.family = Some(family);
        self
    }

    /// Restrict to a destination
    pub fn dest(mut self, dest: u8) -> Self {
        self.dest = Some(dest);
        self
    }

    /// Require the reply data to start with `prefix`
    pub fn payload_prefix(mut self, prefix: &[u8]) -> Self {
        self.payload_prefix = prefix.to_vec();
        self
    }

    /// Acknowledge the reply once matched
    pub fn with_ack(mut self, action: u8) -> Self {
        self.ack = Some(action);
        self
    }

    /// Check a frame against this description
    pub fn matches(&self, frame: &Frame) -> bool {
        self.family.map_or(true, |f| f == frame.family)
            && self.action.map_or(true, |a| a == frame.action())
            && self.dest.map_or(true, |d| d == frame.dest())
            && frame.data.starts_with(&self.payload_prefix)
    }
}

/// A command as submitted by a caller
#[derive(Debug, Clone)]
pub struct CommandRequest {
    /// Header and data bytes, without checksum
    pub payload: Vec<u8>,
    /// Total physical writes allowed; the family default when `None`
    pub tries: Option<u32>,
    /// Per-try response timeout; the family default when `None`
    pub timeout: Option<Duration>,
    /// How the reply is recognized
    pub response: ResponseSpec,
}

impl CommandRequest {
    /// Create a fire-and-forget request
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            tries: None,
            timeout: None,
            response: ResponseSpec::None,
        }
    }

    /// Set the try budget
    pub fn tries(mut self, tries: u32) -> Self {
        self.tries = Some(tries);
        self
    }

    /// Set the response timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Require a response
    pub fn expect(mut self, response: ResponseSpec) -> Self {
        self.response = response;
        self
    }
}

/// Defaults applied to requests that leave tries or timeout unset
#[derive(Debug, Clone, Copy)]
pub struct CommandDefaults {
    /// Total writes per command
    pub tries: u32,
    /// Controller response timeout
    pub controller_timeout: Duration,
    /// Pump response timeout
    pub pump_timeout: Duration,
    /// Chlorinator response timeout
    pub chlorinator_timeout: Duration,
}

impl Default for CommandDefaults {
    fn default() -> Self {
        let timeout = Duration::from_millis(super::DEFAULT_TIMEOUT_MS);
        Self {
            tries: super::DEFAULT_TRIES,
            controller_timeout: timeout,
            pump_timeout: timeout,
            chlorinator_timeout: timeout,
        }
    }
}

impl CommandDefaults {
    /// Response timeout for a family
    pub fn timeout_for(&self, family: FrameFamily) -> Duration {
        match family {
            FrameFamily::Controller => self.controller_timeout,
            FrameFamily::Pump => self.pump_timeout,
            FrameFamily::Chlorinator => self.chlorinator_timeout,
        }
    }
}

/// A queued command, owned by the queue until it reaches a terminal state
pub struct OutboundCommand {
    id: u64,
    frame: Frame,
    bytes: Vec<u8>,
    max_tries: u32,
    tries: u32,
    timeout: Duration,
    response: ResponseSpec,
    last_sent: Option<Instant>,
    completion: Option<oneshot::Sender<CommandOutcome>>,
}

impl fmt::Debug for OutboundCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundCommand")
            .field("id", &self.id)
            .field("bytes", &self.bytes)
            .field("tries", &self.tries)
            .field("max_tries", &self.max_tries)
            .field("response", &self.response)
            .finish()
    }
}

impl OutboundCommand {
    /// Serialize a request; the bytes are fixed from here on
    pub fn encode(
        id: u64,
        request: CommandRequest,
        defaults: &CommandDefaults,
        completion: Option<oneshot::Sender<CommandOutcome>>,
    ) -> Result<Self, ProtocolError> {
        let bytes = frame::encode(&request.payload)?;
        let frame = Frame::from_payload(&request.payload)?;
        let timeout = request
            .timeout
            .unwrap_or_else(|| defaults.timeout_for(frame.family));
        Ok(Self {
            id,
            max_tries: request.tries.unwrap_or(defaults.tries).max(1),
            tries: 0,
            timeout,
            response: request.response,
            last_sent: None,
            completion,
            frame,
            bytes,
        })
    }

    /// Queue-assigned identifier
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The frame as encoded
    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    /// Wire bytes
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Physical writes performed so far
    pub fn tries(&self) -> u32 {
        self.tries
    }

    /// Writes still allowed
    pub fn tries_remaining(&self) -> u32 {
        self.max_tries.saturating_sub(self.tries)
    }

    /// Whether a reply is awaited after writing
    pub fn requires_response(&self) -> bool {
        !matches!(self.response, ResponseSpec::None)
    }

    /// Acknowledgement to queue when this command's reply arrives
    pub fn ack_action(&self) -> Option<u8> {
        match &self.response {
            ResponseSpec::Expect(expected) => expected.ack,
            _ => None,
        }
    }

    /// Record a physical write
    pub fn mark_sent(&mut self, now: Instant) {
        self.tries += 1;
        self.last_sent = Some(now);
    }

    /// When the current try times out, if one is outstanding
    pub fn deadline(&self) -> Option<Instant> {
        self.last_sent.map(|sent| sent + self.timeout)
    }

    /// Whether the last write went unanswered for longer than the timeout
    pub fn timed_out(&self, now: Instant) -> bool {
        self.deadline().map_or(true, |deadline| now >= deadline)
    }

    /// Whether `frame` is the reply to this command
    pub fn is_response(&self, frame: &Frame) -> bool {
        match &self.response {
            ResponseSpec::None => false,
            ResponseSpec::Inferred => is_inferred_response(frame, &self.frame),
            ResponseSpec::Expect(expected) => expected.matches(frame),
            ResponseSpec::Predicate(predicate) => predicate(frame, self),
        }
    }

    /// Consume the command into a deliverable completion
    pub fn finish(mut self, outcome: CommandOutcome) -> Completion {
        Completion {
            id: self.id,
            sender: self.completion.take(),
            outcome,
        }
    }
}

/// A command result waiting to be delivered
///
/// Completions are collected while queue state is being changed and fired
/// once the change is finished, so a receiver never observes a half-updated
/// queue.
#[derive(Debug)]
pub struct Completion {
    /// Command identifier
    pub id: u64,
    sender: Option<oneshot::Sender<CommandOutcome>>,
    /// The outcome to deliver
    pub outcome: CommandOutcome,
}

impl Completion {
    /// Deliver to the submitter, if it is still listening
    pub fn fire(self) {
        if let Some(sender) = self.sender {
            let _ = sender.send(self.outcome);
        }
    }
}

/// Recognize a reply from the request alone
///
/// Pumps answer with the request's addresses swapped, echo the register of
/// a remote-control write, or send status for a status request. The
/// chlorinator answers fixed action pairs. Controllers acknowledge with
/// action 1, answer a `get` with the same action minus the request bit, and
/// answer configuration request 253 with 252.
pub fn is_inferred_response(reply: &Frame, request: &Frame) -> bool {
    if reply.family != request.family {
        return false;
    }
    match request.family {
        FrameFamily::Pump => {
            let swapped = reply.header.len() == request.header.len()
                && reply.header[..2] == request.header[..2]
                && reply.header[2] == request.header[3]
                && reply.header[3] == request.header[2]
                && reply.header[4..] == request.header[4..]
                && reply.data == request.data;
            if swapped {
                return true;
            }
            match (request.action(), reply.action()) {
                (1, 1) => {
                    request.data.len() >= 4
                        && reply.data.len() >= 2
                        && reply.data[..2] == request.data[2..4]
                }
                (7, 7) => true,
                _ => false,
            }
        }
        FrameFamily::Chlorinator => matches!(
            (request.action(), reply.action()),
            (0, 1) | (17, 18) | (21, 18) | (20, 3)
        ),
        FrameFamily::Controller => {
            if reply.action() == 1 && reply.data.first() == Some(&request.action()) {
                return true;
            }
            if reply.action() == request.action() & 63 {
                return match reply.action() {
                    10 | 11 | 17 => {
                        reply.data.first().is_some() && reply.data.first() == request.data.first()
                    }
                    _ => true,
                };
            }
            request.action() == 253 && reply.action() == 252
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(payload: &[u8]) -> Frame {
        Frame::from_payload(payload).unwrap()
    }

    #[test]
    fn test_encode_applies_defaults() {
        let defaults = CommandDefaults::default();
        let cmd = OutboundCommand::encode(1, CommandRequest::new(vec![16, 2, 80, 0]), &defaults, None)
            .unwrap();
        assert_eq!(cmd.bytes(), &[16, 2, 80, 0, 98, 16, 3]);
        assert_eq!(cmd.tries_remaining(), 3);
        assert!(!cmd.requires_response());
    }

    #[test]
    fn test_zero_tries_still_allows_one() {
        let defaults = CommandDefaults::default();
        let cmd = OutboundCommand::encode(
            1,
            CommandRequest::new(vec![16, 2, 80, 0]).tries(0),
            &defaults,
            None,
        )
        .unwrap();
        assert_eq!(cmd.tries_remaining(), 1);
    }

    #[test]
    fn test_pump_swapped_reply() {
        let request = frame(&[165, 0, 96, 16, 4, 1, 255]);
        let reply = frame(&[165, 0, 16, 96, 4, 1, 255]);
        assert!(is_inferred_response(&reply, &request));
        assert!(!is_inferred_response(&request, &frame(&[165, 0, 16, 97, 4, 1, 255])));
    }

    #[test]
    fn test_pump_register_echo() {
        let request = frame(&[165, 0, 96, 16, 1, 4, 3, 33, 0, 38]);
        let reply = frame(&[165, 0, 16, 96, 1, 2, 0, 38]);
        assert!(is_inferred_response(&reply, &request));
    }

    #[test]
    fn test_chlorinator_pairs() {
        let request = frame(&[16, 2, 80, 17, 20]);
        assert!(is_inferred_response(&frame(&[16, 2, 0, 18, 70, 0]), &request));
        assert!(!is_inferred_response(&frame(&[16, 2, 0, 3, 0]), &request));
    }

    #[test]
    fn test_controller_rules() {
        let set = frame(&[165, 33, 16, 34, 136, 4, 86, 100, 7, 0]);
        assert!(is_inferred_response(&frame(&[165, 33, 34, 16, 1, 1, 136]), &set));

        let get = frame(&[165, 33, 16, 34, 202, 1, 0]);
        assert!(is_inferred_response(&frame(&[165, 33, 15, 16, 10, 2, 0, 1]), &get));
        assert!(!is_inferred_response(&frame(&[165, 33, 15, 16, 10, 2, 1, 1]), &get));

        let config = frame(&[165, 33, 16, 34, 253, 1, 0]);
        assert!(is_inferred_response(&frame(&[165, 33, 15, 16, 252, 1, 0]), &config));
    }

    #[test]
    fn test_expected_response() {
        let expected = ExpectedResponse::action(18).family(FrameFamily::Chlorinator);
        assert!(expected.matches(&frame(&[16, 2, 0, 18, 70, 0])));
        assert!(!expected.matches(&frame(&[16, 2, 0, 3, 0])));

        let prefixed = ExpectedResponse::action(1).payload_prefix(&[136]);
        assert!(prefixed.matches(&frame(&[165, 33, 34, 16, 1, 1, 136])));
        assert!(!prefixed.matches(&frame(&[165, 33, 34, 16, 1, 1, 134])));
    }
}
