//! Bus engine
//!
//! A single task owns all protocol state: the frame assembler, the outbound
//! queue, the write arbiter, and the link. Callers talk to it through an
//! [`EngineHandle`]; results of queued commands come back on per-command
//! channels and bus activity is broadcast as [`EngineEvent`]s.
//!
//! ```rust,ignore
//! use poolbus_core::prelude::*;
//!
//! let (engine, handle) = Engine::new(EngineConfig::from_file("poolbus.json")?)?;
//! engine.spawn();
//!
//! let submission = handle
//!     .enqueue(CommandRequest::new(vec![165, 0, 96, 16, 4, 1, 255]).expect(ResponseSpec::Inferred))
//!     .await;
//! if let Some(ticket) = submission.ticket {
//!     let reply = ticket.outcome().await?;
//! }
//! ```

pub mod arbiter;
pub mod counters;
pub mod matcher;
pub mod queue;

use std::ops::ControlFlow;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

pub use arbiter::{ArbiterAction, BackoffPolicy, BusActivity, WriteArbiter};
pub use counters::Counters;
pub use matcher::{DuplicatePolicy, ResponseMatcher};
pub use queue::{EnqueueResult, EnqueueStatus, OutboundQueue};

use crate::capture::{Direction, PacketCapture};
use crate::config::{ConfigError, EngineConfig, TransportKind};
use crate::diagnostics::DiagnosticHook;
use crate::link::{Link, LinkEvent, LinkNotice, LinkState, MockPeer};
use crate::protocol::{
    format_packet_str, parse_packet_str, CommandError, CommandOutcome, CommandRequest,
    Completion, Frame, FrameAssembler, FrameFamily, ResponseSpec, DEFAULT_CONTROLLER_SUB,
};
use queue::{ConfirmSets, EnqueueContext};

/// Capacity of the event broadcast channel
const EVENT_CAPACITY: usize = 256;

/// Capacity of the request channel
const REQUEST_CAPACITY: usize = 64;

/// Broadcast address used by acknowledgements
const ACK_DEST: u8 = 15;

/// Bus activity published to subscribers
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A valid frame was decoded
    FrameDecoded {
        /// Frame family
        family: FrameFamily,
        /// The frame
        frame: Frame,
        /// Running count of valid frames
        counter: u64,
    },
    /// The link opened
    LinkOpen,
    /// The link closed
    LinkClosed,
    /// Counters changed
    CountersUpdated(Counters),
}

/// Reply to an enqueue request
#[derive(Debug)]
pub struct Submission {
    /// Immediate accept/reject result
    pub result: EnqueueResult,
    /// Completion of the command, present when it was queued
    pub ticket: Option<CommandTicket>,
}

/// Awaitable completion of a queued command
#[derive(Debug)]
pub struct CommandTicket {
    id: u64,
    receiver: oneshot::Receiver<CommandOutcome>,
}

impl CommandTicket {
    /// Queue-assigned identifier
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the command to finish
    pub async fn outcome(self) -> CommandOutcome {
        self.receiver.await.unwrap_or(Err(CommandError::Cancelled))
    }
}

enum Request {
    Enqueue {
        request: CommandRequest,
        reply: oneshot::Sender<Submission>,
    },
    EnqueuePacketStr {
        packet: String,
        response: ResponseSpec,
        reply: oneshot::Sender<Submission>,
    },
    Counters(oneshot::Sender<Counters>),
    LinkState(oneshot::Sender<LinkState>),
    Pause(oneshot::Sender<()>),
    Resume(oneshot::Sender<()>),
    Stop(oneshot::Sender<()>),
}

/// Cloneable handle for talking to a running engine
#[derive(Clone)]
pub struct EngineHandle {
    requests: mpsc::Sender<Request>,
    events: broadcast::Sender<EngineEvent>,
}

impl EngineHandle {
    /// Queue a command
    pub async fn enqueue(&self, request: CommandRequest) -> Submission {
        let (reply, rx) = oneshot::channel();
        self.submit(Request::Enqueue { request, reply }, rx).await
    }

    /// Queue a command given as a dash-separated packet string
    pub async fn send_packet_str(&self, packet: &str, response: ResponseSpec) -> Submission {
        let (reply, rx) = oneshot::channel();
        let request = Request::EnqueuePacketStr {
            packet: packet.to_string(),
            response,
            reply,
        };
        self.submit(request, rx).await
    }

    /// Snapshot of the traffic counters; zero once the engine has stopped
    pub async fn counters(&self) -> Counters {
        let (reply, rx) = oneshot::channel();
        if self.requests.send(Request::Counters(reply)).await.is_err() {
            return Counters::default();
        }
        rx.await.unwrap_or_default()
    }

    /// Current link state
    pub async fn link_state(&self) -> LinkState {
        let (reply, rx) = oneshot::channel();
        if self.requests.send(Request::LinkState(reply)).await.is_err() {
            return LinkState::Closed;
        }
        rx.await.unwrap_or(LinkState::Closed)
    }

    /// Clear buffers and ignore the bus until resumed
    pub async fn pause(&self) {
        let (reply, rx) = oneshot::channel();
        if self.requests.send(Request::Pause(reply)).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Clear buffers and resume processing
    pub async fn resume(&self) {
        let (reply, rx) = oneshot::channel();
        if self.requests.send(Request::Resume(reply)).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Tear the engine down; pending commands complete as cancelled
    pub async fn stop(&self) {
        let (reply, rx) = oneshot::channel();
        if self.requests.send(Request::Stop(reply)).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Receive bus events
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    async fn submit(&self, request: Request, rx: oneshot::Receiver<Submission>) -> Submission {
        let stopped = || Submission {
            result: EnqueueResult::fail("Packet NOT queued, engine stopped"),
            ticket: None,
        };
        if self.requests.send(request).await.is_err() {
            return stopped();
        }
        rx.await.unwrap_or_else(|_| stopped())
    }
}

/// The bus engine
pub struct Engine {
    config: EngineConfig,
    link: Link,
    link_events: mpsc::UnboundedReceiver<LinkEvent>,
    requests: mpsc::Receiver<Request>,
    events: broadcast::Sender<EngineEvent>,
    cancel: CancellationToken,
    assembler: FrameAssembler,
    queue: OutboundQueue,
    arbiter: WriteArbiter,
    matcher: ResponseMatcher,
    counters: Counters,
    frames_processed: u64,
    controller_sub: u8,
    paused: bool,
    wake_at: Option<Instant>,
    capture: Option<PacketCapture>,
    hook: Option<Arc<dyn DiagnosticHook>>,
    mock_peer: Option<MockPeer>,
    completions: Vec<Completion>,
}

impl Engine {
    /// Build an engine and its handle from a validated configuration
    ///
    /// For the mock transport the far end of the pipe is kept by the engine
    /// until taken with [`Engine::take_mock_peer`].
    pub fn new(config: EngineConfig) -> Result<(Self, EngineHandle), ConfigError> {
        config.validate()?;

        let (link_tx, link_events) = mpsc::unbounded_channel();
        let (mock_end, mock_peer) = if config.transport_kind() == TransportKind::Mock {
            let (local, peer) = MockPeer::pair();
            (Some(local), Some(peer))
        } else {
            (None, None)
        };
        let link = Link::new(&config, mock_end, link_tx)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        let capture = match &config.capture_path {
            Some(path) => Some(PacketCapture::open(path)?),
            None => None,
        };

        let (request_tx, requests) = mpsc::channel(REQUEST_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let handle = EngineHandle {
            requests: request_tx,
            events: events.clone(),
        };

        let engine = Self {
            assembler: FrameAssembler::new(config.min_frame_bytes),
            arbiter: WriteArbiter::new(config.backoff_policy()),
            matcher: ResponseMatcher::new(config.duplicate_responses),
            queue: OutboundQueue::new(),
            counters: Counters::default(),
            frames_processed: 0,
            controller_sub: DEFAULT_CONTROLLER_SUB,
            paused: false,
            wake_at: None,
            cancel: CancellationToken::new(),
            hook: None,
            completions: Vec::new(),
            link,
            link_events,
            requests,
            events,
            capture,
            mock_peer,
            config,
        };
        Ok((engine, handle))
    }

    /// Build a mock-transport engine, returning the bus peer as well
    pub fn with_mock(config: EngineConfig) -> Result<(Self, EngineHandle, MockPeer), ConfigError> {
        let config = EngineConfig {
            mock_port: true,
            ..config
        };
        let (mut engine, handle) = Self::new(config)?;
        let peer = engine
            .take_mock_peer()
            .ok_or_else(|| ConfigError::Invalid("mock peer unavailable".into()))?;
        Ok((engine, handle, peer))
    }

    /// Take the far end of the mock transport
    pub fn take_mock_peer(&mut self) -> Option<MockPeer> {
        self.mock_peer.take()
    }

    /// Install a diagnostics observer
    pub fn with_diagnostic_hook(mut self, hook: Arc<dyn DiagnosticHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Token that stops the engine when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run on a new task
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Run until stopped, cancelled, or every handle is dropped
    pub async fn run(mut self) {
        info!(
            target: "poolbus::engine",
            transport = ?self.config.transport_kind(),
            "engine starting"
        );
        self.link.open(Instant::now());

        let mut ticker = tokio::time::interval(self.config.process_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let wake_at = self.wake_at;
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                request = self.requests.recv() => match request {
                    Some(request) => {
                        if self.handle_request(request).is_break() {
                            return;
                        }
                    }
                    None => break,
                },
                Some(event) = self.link_events.recv() => self.handle_link_event(event),
                _ = ticker.tick() => self.on_tick(),
                _ = wait_until(wake_at) => {
                    self.wake_at = None;
                    self.on_tick();
                }
            }
            self.flush_completions();
        }
        self.shutdown();
    }

    fn handle_request(&mut self, request: Request) -> ControlFlow<()> {
        let now = Instant::now();
        match request {
            Request::Enqueue { request, reply } => {
                let submission = self.submit(request);
                let _ = reply.send(submission);
                self.pump(now);
            }
            Request::EnqueuePacketStr {
                packet,
                response,
                reply,
            } => {
                let submission = match parse_packet_str(&packet, self.controller_sub) {
                    Ok(payload) => self.submit(CommandRequest::new(payload).expect(response)),
                    Err(e) => {
                        warn!(target: "poolbus::tx", error = %e, "packet string rejected");
                        Submission {
                            result: EnqueueResult {
                                status: EnqueueStatus::Error,
                                text: e.to_string(),
                                id: None,
                            },
                            ticket: None,
                        }
                    }
                };
                let _ = reply.send(submission);
                self.pump(now);
            }
            Request::Counters(reply) => {
                let _ = reply.send(self.counters);
            }
            Request::LinkState(reply) => {
                let _ = reply.send(self.link.state());
            }
            Request::Pause(reply) => {
                self.clear_buffers();
                self.paused = true;
                info!(target: "poolbus::engine", "paused");
                let _ = reply.send(());
            }
            Request::Resume(reply) => {
                self.clear_buffers();
                self.paused = false;
                info!(target: "poolbus::engine", "resumed");
                let _ = reply.send(());
                self.pump(now);
            }
            Request::Stop(reply) => {
                self.shutdown();
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn submit(&mut self, request: CommandRequest) -> Submission {
        if self.paused {
            return Submission {
                result: EnqueueResult::fail("Packet NOT queued, engine paused"),
                ticket: None,
            };
        }
        let (sender, receiver) = oneshot::channel();
        let ctx = self.enqueue_context();
        let result = self.queue.enqueue(request, &ctx, Some(sender));
        let ticket = result.id.map(|id| CommandTicket { id, receiver });
        Submission { result, ticket }
    }

    fn enqueue_context(&self) -> EnqueueContext {
        EnqueueContext {
            link_open: self.link.is_open(),
            suppress_write: self.config.suppress_write,
            defaults: self.config.command_defaults(),
            confirm_sets: self.config.confirm_sets.then_some(ConfirmSets {
                controller_sub: self.controller_sub,
                app_address: self.config.app_address,
            }),
        }
    }

    fn handle_link_event(&mut self, event: LinkEvent) {
        let now = Instant::now();
        let notices = self.link.handle_event(event, now);
        self.apply_notices(notices);
        self.pump(now);
    }

    fn on_tick(&mut self) {
        let now = Instant::now();
        let notices = self.link.poll(now);
        self.apply_notices(notices);
        self.pump(now);
    }

    fn apply_notices(&mut self, notices: Vec<LinkNotice>) {
        for notice in notices {
            match notice {
                LinkNotice::Opened => self.emit(EngineEvent::LinkOpen),
                LinkNotice::Closed => {
                    if self.arbiter.is_busy() {
                        let completions = self.arbiter.complete_write(Err("link closed".into()));
                        self.record_completions(completions);
                    }
                    self.emit(EngineEvent::LinkClosed);
                }
                LinkNotice::Data(bytes) => self.ingest(&bytes),
                LinkNotice::Written(result) => {
                    let completions = self.arbiter.complete_write(result);
                    self.record_completions(completions);
                }
            }
        }
    }

    fn ingest(&mut self, bytes: &[u8]) {
        if self.paused {
            trace!(target: "poolbus::rx", len = bytes.len(), "paused, dropping bytes");
            return;
        }
        trace!(target: "poolbus::rx", bytes = ?bytes, "received");
        self.counters.bytes_received += bytes.len() as u64;
        self.assembler.feed(bytes);
    }

    fn pump(&mut self, now: Instant) {
        if self.paused {
            return;
        }
        // inbound draining empties the chunk queue, so count the backlog first
        let backlog = self.inbound_backlog();
        self.process_inbound();
        self.process_outbound(now, backlog);
    }

    /// Chunks fed but not merged, plus link events not yet handled
    fn inbound_backlog(&self) -> usize {
        self.assembler.pending_chunks() + self.link_events.len()
    }

    fn process_inbound(&mut self) {
        let results: Vec<_> = self.assembler.frames().collect();
        let collisions = self.assembler.collisions();
        let changed = !results.is_empty() || collisions != self.counters.collisions;
        self.counters.collisions = collisions;

        for result in results {
            match result {
                Ok(frame) => self.on_frame(frame),
                Err(rejected) => {
                    self.counters.failed += 1;
                    debug!(
                        target: "poolbus::rx",
                        error = %rejected.error,
                        packet = %format_packet_str(&rejected.bytes),
                        "discarding frame"
                    );
                    self.capture(Direction::In, None, false, &rejected.bytes);
                }
            }
        }

        if changed {
            self.emit(EngineEvent::CountersUpdated(self.counters));
        }
    }

    fn on_frame(&mut self, frame: Frame) {
        self.counters.success += 1;
        self.frames_processed += 1;

        if frame.family == FrameFamily::Controller {
            if let Some(sub) = frame.sub().filter(|&sub| sub != self.controller_sub) {
                debug!(target: "poolbus::rx", sub, "controller sub byte learned");
                self.controller_sub = sub;
            }
        }

        let bytes = frame.to_bytes();
        self.capture(Direction::In, Some(frame.family), true, &bytes);
        debug!(
            target: "poolbus::rx",
            family = %frame.family,
            action = frame.action(),
            packet = %format_packet_str(&bytes),
            "frame decoded"
        );

        let outcome = self
            .matcher
            .try_match(&frame, &mut self.arbiter, &mut self.queue);
        for action in outcome.acks {
            self.enqueue_ack(action);
        }
        self.record_completions(outcome.completions);

        self.emit(EngineEvent::FrameDecoded {
            family: frame.family,
            counter: self.frames_processed,
            frame,
        });
    }

    fn enqueue_ack(&mut self, action: u8) {
        let payload = vec![
            165,
            self.controller_sub,
            ACK_DEST,
            self.config.app_address,
            1,
            1,
            action,
        ];
        let ctx = self.enqueue_context();
        let result = self.queue.enqueue(CommandRequest::new(payload), &ctx, None);
        if !result.is_ok() {
            warn!(target: "poolbus::tx", text = %result.text, "acknowledgement not queued");
        }
    }

    fn process_outbound(&mut self, now: Instant, backlog: usize) {
        loop {
            let activity = BusActivity {
                frames_processed: self.frames_processed,
                pending_chunks: backlog,
                unparsed_bytes: if self.assembler.is_mid_frame() {
                    self.assembler.buffered_len()
                } else {
                    0
                },
            };
            let step = self.arbiter.tick(now, &mut self.queue, activity);
            self.record_completions(step.completions);
            if let (Some(packet), Some(hook)) = (&step.ejected, &self.hook) {
                hook.on_packet_ejected(packet);
            }

            match step.action {
                ArbiterAction::Idle | ArbiterAction::Busy => {
                    self.wake_at = None;
                    return;
                }
                ArbiterAction::Waiting(at) | ArbiterAction::Defer(at) => {
                    self.wake_at = Some(at);
                    return;
                }
                ArbiterAction::Aborted => continue,
                ArbiterAction::Write(bytes) => {
                    let family = Frame::from_bytes(&bytes).ok().map(|f| f.family);
                    self.capture(Direction::Out, family, true, &bytes);
                    self.counters.bytes_sent += bytes.len() as u64;
                    if let Err(e) = self.link.write(bytes) {
                        let completions = self.arbiter.complete_write(Err(e.to_string()));
                        self.record_completions(completions);
                        continue;
                    }
                    self.emit(EngineEvent::CountersUpdated(self.counters));
                    return;
                }
            }
        }
    }

    fn record_completions(&mut self, completions: Vec<Completion>) {
        for completion in completions {
            if matches!(
                completion.outcome,
                Err(CommandError::Aborted { .. } | CommandError::WriteFailed { .. })
            ) {
                self.counters.aborted += 1;
            }
            self.completions.push(completion);
        }
    }

    fn flush_completions(&mut self) {
        for completion in self.completions.drain(..) {
            completion.fire();
        }
    }

    fn clear_buffers(&mut self) {
        self.assembler.clear();
        self.wake_at = None;
        let mut pending = self.queue.drain();
        pending.extend(self.arbiter.clear());
        for cmd in pending {
            self.completions
                .push(cmd.finish(Err(CommandError::Cancelled)));
        }
    }

    fn shutdown(&mut self) {
        self.clear_buffers();
        if let Some(notice) = self.link.close() {
            self.apply_notices(vec![notice]);
        }
        self.flush_completions();
        self.counters.reset();
        self.frames_processed = 0;
        self.cancel.cancel();
        info!(target: "poolbus::engine", "engine stopped");
    }

    fn capture(&mut self, dir: Direction, family: Option<FrameFamily>, valid: bool, bytes: &[u8]) {
        let Some(capture) = self.capture.as_mut() else {
            return;
        };
        if let Err(e) = capture.record(dir, family, valid, bytes) {
            warn!(target: "poolbus::engine", error = %e, "packet capture failed, disabling");
            self.capture = None;
        }
    }

    fn emit(&self, event: EngineEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encode;

    async fn open_mock_engine() -> (Engine, MockPeer) {
        let (mut engine, _handle, peer) = Engine::with_mock(EngineConfig::mock()).unwrap();
        engine.link.open(Instant::now());
        while !engine.link.is_open() {
            let event = engine.link_events.recv().await.unwrap();
            engine.handle_link_event(event);
        }
        (engine, peer)
    }

    #[tokio::test]
    async fn test_write_deferred_while_chunks_queued() {
        let (mut engine, mut peer) = open_mock_engine().await;
        let reply = encode(&[165, 0, 16, 96, 7, 0]).unwrap();
        for chunk in reply.chunks(4) {
            engine.ingest(chunk);
        }
        assert_eq!(engine.inbound_backlog(), 3);

        let submission = engine.submit(CommandRequest::new(vec![165, 0, 96, 16, 7, 0]));
        assert!(submission.result.is_ok());

        let now = Instant::now();
        let interval = engine.config.backoff_policy().interval;
        engine.pump(now);
        assert_eq!(engine.frames_processed, 1);
        assert_eq!(engine.assembler.pending_chunks(), 0);
        assert!(!engine.arbiter.is_busy());
        assert_eq!(engine.wake_at, Some(now + interval));

        engine.pump(now + interval);
        assert!(engine.arbiter.is_busy());
        let written = peer.next_frame().await.unwrap();
        assert_eq!(written.payload(), vec![165, 0, 96, 16, 7, 0]);
    }

    #[tokio::test]
    async fn test_quiet_bus_writes_immediately() {
        let (mut engine, _peer) = open_mock_engine().await;
        engine.submit(CommandRequest::new(vec![165, 0, 96, 16, 7, 0]));
        engine.pump(Instant::now());
        assert!(engine.arbiter.is_busy());
        assert_eq!(engine.wake_at, None);
    }

    #[tokio::test]
    async fn test_stop_request_ends_loop() {
        let (mut engine, _peer) = open_mock_engine().await;
        let (reply, done) = oneshot::channel();
        assert!(engine.handle_request(Request::Stop(reply)).is_break());
        done.await.unwrap();
        assert!(engine.cancel.is_cancelled());
        assert!(!engine.link.is_open());

        let (reply, _rx) = oneshot::channel();
        assert!(engine.handle_request(Request::Counters(reply)).is_continue());
    }
}
