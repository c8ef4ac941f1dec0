//! Bus link
//!
//! Owns the transport session: opening it, pumping bytes in both
//! directions, and reconnecting after errors or prolonged silence.
//!
//! Each open attempt runs as its own task and reports back through
//! [`LinkEvent`]s tagged with a session number, so events from a torn-down
//! session are ignored.

pub mod mock;
pub mod serial;
pub mod transport;

use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use mock::MockPeer;
pub use serial::{list_ports, PortInfo};
pub use transport::{Channel, Endpoint};

use crate::config::{EngineConfig, PortSettings, TransportKind};

const READ_BUFFER_SIZE: usize = 1024;

/// Errors raised by the link and its transports
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Serial port error: {0}")]
    Serial(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Link is not open")]
    NotOpen,

    #[error("Link closed")]
    Closed,

    #[error("Link configuration error: {0}")]
    Config(String),
}

/// Connection state of the link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No session
    Closed,
    /// A session is being established
    Opening,
    /// Bytes are flowing
    Open,
}

/// Messages from a session task to the engine
#[derive(Debug)]
pub enum LinkEvent {
    /// The transport opened
    Connected {
        /// Session number
        session: u64,
    },
    /// Bytes arrived
    Data {
        /// Session number
        session: u64,
        /// Raw chunk as read
        bytes: Vec<u8>,
    },
    /// A requested write finished
    Written {
        /// Session number
        session: u64,
        /// Write outcome
        result: Result<(), String>,
    },
    /// The session failed and has ended
    Failed {
        /// Session number
        session: u64,
        /// Failure description
        error: String,
    },
}

/// State changes the engine reacts to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkNotice {
    /// The link became open
    Opened,
    /// The link went from open to closed
    Closed,
    /// Inbound bytes
    Data(Vec<u8>),
    /// Outcome of the last write
    Written(Result<(), String>),
}

/// Why a session is being opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenReason {
    Initial,
    Retry,
    Timeout,
}

enum Target {
    Serial { path: String, settings: PortSettings },
    Net(String),
    Mock(Option<tokio::io::DuplexStream>),
}

/// The engine's handle on the transport
pub struct Link {
    target: Target,
    kind: TransportKind,
    state: LinkState,
    session: u64,
    cancel: Option<CancellationToken>,
    writer: Option<mpsc::UnboundedSender<Vec<u8>>>,
    events: mpsc::UnboundedSender<LinkEvent>,
    inactivity_retry: Option<Duration>,
    last_activity: Instant,
    reopen_at: Option<Instant>,
    reason: OpenReason,
}

impl Link {
    /// Create a closed link for the configured transport
    ///
    /// `mock` is the engine's end of the in-memory pipe and is required for
    /// the mock transport.
    pub fn new(
        config: &EngineConfig,
        mock: Option<tokio::io::DuplexStream>,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Self, LinkError> {
        let kind = config.transport_kind();
        let target = match kind {
            TransportKind::Serial => Target::Serial {
                path: config.rs485_port.clone(),
                settings: config.port_settings.clone(),
            },
            TransportKind::Net => Target::Net(config.net_address()),
            TransportKind::Mock => match mock {
                Some(stream) => Target::Mock(Some(stream)),
                None => return Err(LinkError::Config("mock transport needs a pipe".into())),
            },
        };
        Ok(Self {
            target,
            kind,
            state: LinkState::Closed,
            session: 0,
            cancel: None,
            writer: None,
            events,
            inactivity_retry: config.inactivity_retry(),
            last_activity: Instant::now(),
            reopen_at: None,
            reason: OpenReason::Initial,
        })
    }

    /// Current state
    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Whether writes can be accepted
    pub fn is_open(&self) -> bool {
        self.state == LinkState::Open
    }

    /// Transport in use
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Start a session; a no-op unless closed
    pub fn open(&mut self, now: Instant) {
        self.open_with(now, OpenReason::Initial);
    }

    fn open_with(&mut self, now: Instant, reason: OpenReason) {
        if self.state != LinkState::Closed {
            return;
        }
        let endpoint = match &mut self.target {
            Target::Serial { path, settings } => Endpoint::Serial {
                path: path.clone(),
                settings: settings.clone(),
            },
            Target::Net(address) => Endpoint::Net(address.clone()),
            Target::Mock(stream) => match stream.take() {
                Some(stream) => Endpoint::Mock(stream),
                None => {
                    warn!(target: "poolbus::link", "mock port cannot be reopened");
                    return;
                }
            },
        };

        self.session += 1;
        self.state = LinkState::Opening;
        self.last_activity = now;
        self.reopen_at = None;
        self.reason = reason;

        let cancel = CancellationToken::new();
        let (writer, writes) = mpsc::unbounded_channel();
        self.cancel = Some(cancel.clone());
        self.writer = Some(writer);

        debug!(target: "poolbus::link", session = self.session, kind = ?self.kind, "opening link");
        tokio::spawn(run_session(
            self.session,
            endpoint,
            self.events.clone(),
            writes,
            cancel,
        ));
    }

    /// Tear down the session without scheduling a reconnect
    pub fn close(&mut self) -> Option<LinkNotice> {
        let was_open = self.state == LinkState::Open;
        self.teardown();
        self.reopen_at = None;
        was_open.then_some(LinkNotice::Closed)
    }

    /// Hand bytes to the session's writer
    pub fn write(&self, bytes: Vec<u8>) -> Result<(), LinkError> {
        if self.state != LinkState::Open {
            return Err(LinkError::NotOpen);
        }
        match &self.writer {
            Some(writer) => writer.send(bytes).map_err(|_| LinkError::Closed),
            None => Err(LinkError::NotOpen),
        }
    }

    /// Apply a session event
    pub fn handle_event(&mut self, event: LinkEvent, now: Instant) -> Vec<LinkNotice> {
        let mut notices = Vec::new();
        let session = match &event {
            LinkEvent::Connected { session }
            | LinkEvent::Data { session, .. }
            | LinkEvent::Written { session, .. }
            | LinkEvent::Failed { session, .. } => *session,
        };
        if session != self.session || self.state == LinkState::Closed {
            return notices;
        }

        match event {
            LinkEvent::Connected { .. } => {
                self.last_activity = now;
                match self.kind {
                    // a TCP bridge counts as open once the bus talks through it
                    TransportKind::Net => info!(
                        target: "poolbus::link",
                        "net connect connected, waiting for bus traffic"
                    ),
                    _ => self.mark_open(&mut notices),
                }
            }
            LinkEvent::Data { bytes, .. } => {
                self.last_activity = now;
                if self.state == LinkState::Opening {
                    self.mark_open(&mut notices);
                }
                notices.push(LinkNotice::Data(bytes));
            }
            LinkEvent::Written { result, .. } => {
                let failed = result.is_err();
                notices.push(LinkNotice::Written(result));
                if failed {
                    notices.extend(self.fail(now));
                }
            }
            LinkEvent::Failed { error, .. } => {
                error!(target: "poolbus::link", kind = ?self.kind, "Error with port: {}", error);
                notices.extend(self.fail(now));
            }
        }
        notices
    }

    /// Run reconnect and inactivity timers
    pub fn poll(&mut self, now: Instant) -> Vec<LinkNotice> {
        let mut notices = Vec::new();
        match self.state {
            LinkState::Closed => {
                if self.reopen_at.is_some_and(|at| now >= at) {
                    self.open_with(now, OpenReason::Retry);
                }
            }
            LinkState::Opening | LinkState::Open => {
                let Some(retry) = self.inactivity_retry else {
                    return notices;
                };
                if self.kind == TransportKind::Mock || now < self.last_activity + retry {
                    return notices;
                }
                if self.state == LinkState::Open {
                    error!(
                        target: "poolbus::link",
                        "connection lost, retrying every {} seconds",
                        retry.as_secs()
                    );
                    notices.push(LinkNotice::Closed);
                } else {
                    warn!(target: "poolbus::link", "link did not open, retrying");
                }
                self.teardown();
                self.open_with(now, OpenReason::Timeout);
            }
        }
        notices
    }

    fn mark_open(&mut self, notices: &mut Vec<LinkNotice>) {
        self.state = LinkState::Open;
        match self.reason {
            OpenReason::Retry | OpenReason::Timeout => {
                info!(target: "poolbus::link", "link recovering from lost connection")
            }
            OpenReason::Initial => info!(target: "poolbus::link", kind = ?self.kind, "link opened"),
        }
        notices.push(LinkNotice::Opened);
    }

    fn fail(&mut self, now: Instant) -> Option<LinkNotice> {
        let notice = self.close();
        if self.kind != TransportKind::Mock {
            self.reopen_at = self.inactivity_retry.map(|retry| now + retry);
            if let Some(retry) = self.inactivity_retry {
                warn!(target: "poolbus::link", "will retry in {} seconds", retry.as_secs());
            }
        }
        notice
    }

    fn teardown(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        self.writer = None;
        self.state = LinkState::Closed;
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.teardown();
    }
}

async fn run_session(
    session: u64,
    endpoint: Endpoint,
    events: mpsc::UnboundedSender<LinkEvent>,
    mut writes: mpsc::UnboundedReceiver<Vec<u8>>,
    cancel: CancellationToken,
) {
    let channel = tokio::select! {
        _ = cancel.cancelled() => return,
        opened = endpoint.open() => match opened {
            Ok(channel) => channel,
            Err(e) => {
                let _ = events.send(LinkEvent::Failed { session, error: e.to_string() });
                return;
            }
        },
    };
    let drain = channel.has_drain();
    debug!(target: "poolbus::link", session, kind = ?channel.kind(), drain, "channel connected");
    if events.send(LinkEvent::Connected { session }).is_err() {
        return;
    }

    let (mut reader, mut writer) = tokio::io::split(channel);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            read = reader.read(&mut buf) => {
                let event = match read {
                    Ok(0) => LinkEvent::Failed { session, error: "connection closed by peer".into() },
                    Ok(n) => LinkEvent::Data { session, bytes: buf[..n].to_vec() },
                    Err(e) => LinkEvent::Failed { session, error: e.to_string() },
                };
                let done = matches!(event, LinkEvent::Failed { .. });
                if events.send(event).is_err() || done {
                    break;
                }
            }
            Some(bytes) = writes.recv() => {
                let result = transport::write_packet(&mut writer, &bytes, drain)
                    .await
                    .map_err(|e| e.to_string());
                let failed = result.is_err();
                if events.send(LinkEvent::Written { session, result }).is_err() || failed {
                    break;
                }
            }
        }
    }
    debug!(target: "poolbus::link", session, "session ended");
}
