//! Write arbitration
//!
//! The bus is half-duplex and shared, so at most one command is on the wire
//! or awaiting its reply at any time. The arbiter owns that slot, decides
//! when the next write may happen, retries unanswered commands, and gives
//! up on them once their try budget is spent.

use tokio::time::{Duration, Instant};
use tracing::{debug, error, warn};

use super::queue::OutboundQueue;
use crate::protocol::{format_packet_str, AbortReason, CommandError, Completion, OutboundCommand};

/// Consecutive writes of the same bytes that trigger a warning
pub const WARN_ATTEMPT: u32 = 5;

/// Consecutive writes of the same bytes after which the packet is ejected
pub const EJECT_ATTEMPT: u32 = 10;

/// Default collision-avoidance deferral
pub const DEFAULT_BACKOFF_MS: u64 = 150;

/// Inbound frames expected between our own writes
const QUIET_FRAMES: u64 = 5;

/// Deferrals allowed before writing regardless
const MAX_SKIPS: u32 = 2;

/// Unparsed inbound bytes that indicate a frame is still arriving
const BUSY_RX_BYTES: usize = 50;

/// Inbound state the backoff heuristics look at
#[derive(Debug, Clone, Copy, Default)]
pub struct BusActivity {
    /// Frames decoded since the engine started
    pub frames_processed: u64,
    /// Raw chunks not yet merged into the accumulator
    pub pending_chunks: usize,
    /// Accumulated bytes not yet consumed
    pub unparsed_bytes: usize,
}

/// Collision-avoidance settings
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    /// Whether writes are ever deferred
    pub enabled: bool,
    /// How long a deferral lasts
    pub interval: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_millis(DEFAULT_BACKOFF_MS),
        }
    }
}

/// What the engine should do after an arbiter tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArbiterAction {
    /// Nothing to send
    Idle,
    /// A write is in flight
    Busy,
    /// A reply is awaited until the given deadline
    Waiting(Instant),
    /// The write was deferred until the given instant
    Defer(Instant),
    /// Write these bytes to the link
    Write(Vec<u8>),
    /// The awaiting command was given up on; tick again for the next one
    Aborted,
}

/// Result of an arbiter tick
#[derive(Debug)]
pub struct ArbiterStep {
    /// Next action for the engine
    pub action: ArbiterAction,
    /// Completions to deliver
    pub completions: Vec<Completion>,
    /// Bytes of a packet ejected by the repeated-write ladder
    pub ejected: Option<Vec<u8>>,
}

impl ArbiterStep {
    fn action(action: ArbiterAction) -> Self {
        Self {
            action,
            completions: Vec::new(),
            ejected: None,
        }
    }
}

enum Attempt {
    Quiet,
    Warn(u32),
    Eject(u32),
}

/// Counts consecutive writes of identical bytes
#[derive(Debug, Default)]
struct WriteAttempts {
    packet: Vec<u8>,
    count: u32,
}

impl WriteAttempts {
    fn record(&mut self, bytes: &[u8]) -> Attempt {
        if self.packet != bytes {
            self.packet = bytes.to_vec();
            self.count = 0;
        }
        self.count += 1;
        match self.count {
            n if n >= EJECT_ATTEMPT => Attempt::Eject(n),
            WARN_ATTEMPT => Attempt::Warn(WARN_ATTEMPT),
            _ => Attempt::Quiet,
        }
    }

    fn reset(&mut self) {
        self.packet.clear();
        self.count = 0;
    }
}

/// Serializes access to the bus
#[derive(Debug, Default)]
pub struct WriteArbiter {
    busy: bool,
    awaiting: Option<OutboundCommand>,
    skips: u32,
    frames_at_last_write: Option<u64>,
    attempts: WriteAttempts,
    backoff: BackoffPolicy,
}

impl WriteArbiter {
    /// Create an arbiter with the given backoff policy
    pub fn new(backoff: BackoffPolicy) -> Self {
        Self {
            backoff,
            ..Default::default()
        }
    }

    /// Whether a write is in flight
    pub fn is_busy(&self) -> bool {
        self.busy
    }

    /// The command occupying the bus slot
    pub fn awaiting(&self) -> Option<&OutboundCommand> {
        self.awaiting.as_ref()
    }

    /// Release the bus slot, typically because its reply arrived
    pub fn take_awaiting(&mut self) -> Option<OutboundCommand> {
        let cmd = self.awaiting.take();
        if cmd.is_some() {
            self.attempts.reset();
        }
        cmd
    }

    /// Drop all state, returning the command that held the slot
    pub fn clear(&mut self) -> Option<OutboundCommand> {
        self.busy = false;
        self.skips = 0;
        self.frames_at_last_write = None;
        self.take_awaiting()
    }

    /// Decide whether to send, retry, abort, or wait
    pub fn tick(
        &mut self,
        now: Instant,
        queue: &mut OutboundQueue,
        activity: BusActivity,
    ) -> ArbiterStep {
        if self.busy {
            return ArbiterStep::action(ArbiterAction::Busy);
        }

        if let Some(cmd) = &self.awaiting {
            if !cmd.timed_out(now) {
                if let Some(deadline) = cmd.deadline() {
                    return ArbiterStep::action(ArbiterAction::Waiting(deadline));
                }
            }
            if cmd.tries_remaining() == 0 {
                return self.abort_awaiting();
            }
            if self.should_defer(activity) {
                return ArbiterStep::action(ArbiterAction::Defer(now + self.backoff.interval));
            }
            return self.write_awaiting(now, activity);
        }

        if queue.is_empty() {
            self.skips = 0;
            return ArbiterStep::action(ArbiterAction::Idle);
        }
        if self.should_defer(activity) {
            return ArbiterStep::action(ArbiterAction::Defer(now + self.backoff.interval));
        }
        self.awaiting = queue.pop_first();
        self.write_awaiting(now, activity)
    }

    /// Record the outcome of the physical write started by the last tick
    pub fn complete_write(&mut self, result: Result<(), String>) -> Vec<Completion> {
        if !self.busy {
            return Vec::new();
        }
        self.busy = false;

        let Some(cmd) = self.awaiting.as_ref() else {
            return Vec::new();
        };
        match result {
            Ok(()) => {
                if cmd.requires_response() {
                    return Vec::new();
                }
                self.take_awaiting()
                    .map(|cmd| vec![cmd.finish(Ok(None))])
                    .unwrap_or_default()
            }
            Err(message) => {
                error!(
                    target: "poolbus::tx",
                    packet = %format_packet_str(cmd.bytes()),
                    error = %message,
                    "write failed"
                );
                if cmd.tries_remaining() > 0 {
                    return Vec::new();
                }
                self.take_awaiting()
                    .map(|cmd| {
                        let tries = cmd.tries();
                        vec![cmd.finish(Err(CommandError::WriteFailed { tries, message }))]
                    })
                    .unwrap_or_default()
            }
        }
    }

    fn abort_awaiting(&mut self) -> ArbiterStep {
        let mut step = ArbiterStep::action(ArbiterAction::Aborted);
        if let Some(cmd) = self.take_awaiting() {
            let tries = cmd.tries();
            warn!(
                target: "poolbus::tx",
                packet = %format_packet_str(cmd.bytes()),
                "Message aborted after {} attempt(s)",
                tries
            );
            step.completions.push(cmd.finish(Err(CommandError::Aborted {
                tries,
                reason: AbortReason::NoResponse,
            })));
        }
        step
    }

    fn write_awaiting(&mut self, now: Instant, activity: BusActivity) -> ArbiterStep {
        let Some(cmd) = self.awaiting.as_mut() else {
            return ArbiterStep::action(ArbiterAction::Idle);
        };

        match self.attempts.record(cmd.bytes()) {
            Attempt::Eject(n) => {
                error!(
                    target: "poolbus::tx",
                    packet = %format_packet_str(cmd.bytes()),
                    "packet written {} times without acknowledgement, ejecting",
                    n
                );
                let mut step = ArbiterStep::action(ArbiterAction::Aborted);
                if let Some(cmd) = self.take_awaiting() {
                    let tries = cmd.tries();
                    step.ejected = Some(cmd.bytes().to_vec());
                    step.completions.push(cmd.finish(Err(CommandError::Aborted {
                        tries,
                        reason: AbortReason::Ejected,
                    })));
                }
                return step;
            }
            Attempt::Warn(n) => warn!(
                target: "poolbus::tx",
                packet = %format_packet_str(cmd.bytes()),
                "packet written {} times without acknowledgement",
                n
            ),
            Attempt::Quiet => {}
        }

        cmd.mark_sent(now);
        self.busy = true;
        self.skips = 0;
        self.frames_at_last_write = Some(activity.frames_processed);
        debug!(
            target: "poolbus::tx",
            id = cmd.id(),
            attempt = cmd.tries(),
            packet = %format_packet_str(cmd.bytes()),
            "writing packet"
        );
        ArbiterStep::action(ArbiterAction::Write(cmd.bytes().to_vec()))
    }

    fn should_defer(&mut self, activity: BusActivity) -> bool {
        if !self.backoff.enabled {
            return false;
        }
        if self.skips >= MAX_SKIPS {
            self.skips = 0;
            return false;
        }
        let quiet = self
            .frames_at_last_write
            .is_some_and(|at| activity.frames_processed.saturating_sub(at) < QUIET_FRAMES);
        let receiving =
            activity.pending_chunks >= 2 || activity.unparsed_bytes > BUSY_RX_BYTES;
        if quiet || receiving {
            self.skips += 1;
            debug!(
                target: "poolbus::tx",
                skips = self.skips,
                quiet,
                receiving,
                "deferring write"
            );
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::queue::EnqueueContext;
    use crate::protocol::{CommandDefaults, CommandRequest, ResponseSpec};

    fn no_backoff() -> BackoffPolicy {
        BackoffPolicy {
            enabled: false,
            ..Default::default()
        }
    }

    fn ctx() -> EnqueueContext {
        EnqueueContext {
            link_open: true,
            suppress_write: false,
            defaults: CommandDefaults::default(),
            confirm_sets: None,
        }
    }

    fn queue_with(requests: Vec<CommandRequest>) -> OutboundQueue {
        let mut queue = OutboundQueue::new();
        for request in requests {
            assert!(queue.enqueue(request, &ctx(), None).is_ok());
        }
        queue
    }

    fn awaited(payload: Vec<u8>) -> CommandRequest {
        CommandRequest::new(payload).expect(ResponseSpec::Inferred)
    }

    #[test]
    fn test_single_command_in_flight() {
        let mut arbiter = WriteArbiter::new(no_backoff());
        let mut queue = queue_with(vec![
            awaited(vec![16, 2, 80, 0]),
            awaited(vec![16, 2, 80, 17, 20]),
        ]);
        let t0 = Instant::now();
        let step = arbiter.tick(t0, &mut queue, BusActivity::default());
        assert!(matches!(step.action, ArbiterAction::Write(_)));
        assert_eq!(
            arbiter.tick(t0, &mut queue, BusActivity::default()).action,
            ArbiterAction::Busy
        );
        assert!(arbiter.complete_write(Ok(())).is_empty());
        assert!(matches!(
            arbiter.tick(t0, &mut queue, BusActivity::default()).action,
            ArbiterAction::Waiting(_)
        ));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_retries_then_aborts() {
        let mut arbiter = WriteArbiter::new(no_backoff());
        let mut queue = queue_with(vec![awaited(vec![16, 2, 80, 0]).tries(3)]);
        let t0 = Instant::now();
        let activity = BusActivity::default();

        for offset in [0u64, 2000, 4000] {
            let now = t0 + Duration::from_millis(offset);
            let step = arbiter.tick(now, &mut queue, activity);
            assert!(matches!(step.action, ArbiterAction::Write(_)), "write at {}", offset);
            arbiter.complete_write(Ok(()));
            let before = now + Duration::from_millis(1999);
            assert!(matches!(
                arbiter.tick(before, &mut queue, activity).action,
                ArbiterAction::Waiting(_)
            ));
        }

        let step = arbiter.tick(t0 + Duration::from_millis(6000), &mut queue, activity);
        assert_eq!(step.action, ArbiterAction::Aborted);
        assert_eq!(step.completions.len(), 1);
        assert_eq!(
            step.completions[0].outcome,
            Err(CommandError::Aborted {
                tries: 3,
                reason: AbortReason::NoResponse
            })
        );
        assert!(arbiter.awaiting().is_none());
    }

    #[test]
    fn test_fire_and_forget_completes_on_write() {
        let mut arbiter = WriteArbiter::new(no_backoff());
        let mut queue = queue_with(vec![CommandRequest::new(vec![16, 2, 80, 0])]);
        arbiter.tick(Instant::now(), &mut queue, BusActivity::default());
        let completions = arbiter.complete_write(Ok(()));
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].outcome, Ok(None));
        assert!(arbiter.awaiting().is_none());
    }

    #[test]
    fn test_write_failure_on_last_try() {
        let mut arbiter = WriteArbiter::new(no_backoff());
        let mut queue = queue_with(vec![awaited(vec![16, 2, 80, 0]).tries(1)]);
        arbiter.tick(Instant::now(), &mut queue, BusActivity::default());
        let completions = arbiter.complete_write(Err("port gone".into()));
        assert_eq!(
            completions[0].outcome,
            Err(CommandError::WriteFailed {
                tries: 1,
                message: "port gone".into()
            })
        );
    }

    #[test]
    fn test_backoff_defers_twice_then_writes() {
        let mut arbiter = WriteArbiter::new(BackoffPolicy::default());
        let mut queue = queue_with(vec![
            CommandRequest::new(vec![16, 2, 80, 0]),
            CommandRequest::new(vec![16, 2, 80, 17, 20]),
        ]);
        let t0 = Instant::now();
        let activity = BusActivity::default();

        // nothing sent yet, so no reason to wait
        assert!(matches!(
            arbiter.tick(t0, &mut queue, activity).action,
            ArbiterAction::Write(_)
        ));
        arbiter.complete_write(Ok(()));

        assert!(matches!(
            arbiter.tick(t0, &mut queue, activity).action,
            ArbiterAction::Defer(_)
        ));
        assert!(matches!(
            arbiter.tick(t0, &mut queue, activity).action,
            ArbiterAction::Defer(_)
        ));
        assert!(matches!(
            arbiter.tick(t0, &mut queue, activity).action,
            ArbiterAction::Write(_)
        ));
    }

    #[test]
    fn test_backoff_clears_once_bus_has_talked() {
        let mut arbiter = WriteArbiter::new(BackoffPolicy::default());
        let mut queue = queue_with(vec![
            CommandRequest::new(vec![16, 2, 80, 0]),
            CommandRequest::new(vec![16, 2, 80, 17, 20]),
        ]);
        let t0 = Instant::now();
        arbiter.tick(t0, &mut queue, BusActivity::default());
        arbiter.complete_write(Ok(()));
        let busy_bus = BusActivity {
            frames_processed: 5,
            ..Default::default()
        };
        assert!(matches!(
            arbiter.tick(t0, &mut queue, busy_bus).action,
            ArbiterAction::Write(_)
        ));
    }

    #[test]
    fn test_repeated_writes_eject_packet() {
        let mut arbiter = WriteArbiter::new(no_backoff());
        let mut queue = queue_with(vec![awaited(vec![16, 2, 80, 0]).tries(50)]);
        let t0 = Instant::now();
        let activity = BusActivity::default();
        let mut writes = 0;
        for n in 0..20u64 {
            let step = arbiter.tick(t0 + Duration::from_secs(3 * n), &mut queue, activity);
            match step.action {
                ArbiterAction::Write(_) => {
                    writes += 1;
                    arbiter.complete_write(Ok(()));
                }
                ArbiterAction::Aborted => {
                    assert_eq!(step.ejected.as_deref(), Some(&[16, 2, 80, 0, 98, 16, 3][..]));
                    assert!(matches!(
                        step.completions[0].outcome,
                        Err(CommandError::Aborted {
                            reason: AbortReason::Ejected,
                            ..
                        })
                    ));
                    break;
                }
                other => panic!("unexpected action {:?}", other),
            }
        }
        assert_eq!(writes, EJECT_ATTEMPT - 1);
    }
}
