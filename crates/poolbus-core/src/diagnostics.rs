//! Diagnostics hooks
//!
//! A packet that keeps getting written without an answer usually means
//! something is wrong on the bus. [`VerbosityEscalation`] reacts by turning
//! logging up to `debug` for a while so the surrounding traffic is recorded.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::time::Duration;
use tracing::level_filters::LevelFilter;
use tracing::{info, warn};
use tracing_subscriber::{reload, EnvFilter, Registry};

use crate::protocol::format_packet_str;

/// Default length of an escalation window
pub const DEFAULT_ESCALATION_WINDOW: Duration = Duration::from_secs(120);

/// Observer for engine diagnostics
pub trait DiagnosticHook: Send + Sync {
    /// A packet was ejected after too many unanswered writes
    fn on_packet_ejected(&self, packet: &[u8]);
}

/// Raises the log filter to `debug` for a window after an ejection
pub struct VerbosityEscalation {
    handle: reload::Handle<EnvFilter, Registry>,
    window: Duration,
    active: Arc<AtomicBool>,
}

impl VerbosityEscalation {
    /// Wrap the reload handle of the installed filter
    pub fn new(handle: reload::Handle<EnvFilter, Registry>) -> Self {
        Self {
            handle,
            window: DEFAULT_ESCALATION_WINDOW,
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Set how long the escalation lasts
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Whether an escalation window is currently open
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

impl DiagnosticHook for VerbosityEscalation {
    fn on_packet_ejected(&self, packet: &[u8]) {
        if self.active.swap(true, Ordering::SeqCst) {
            return;
        }

        let current = self
            .handle
            .with_current(|filter| (filter.to_string(), filter.max_level_hint()));
        let previous = match current {
            Ok((_, Some(level))) if level >= LevelFilter::DEBUG => {
                self.active.store(false, Ordering::SeqCst);
                return;
            }
            Ok((previous, _)) => previous,
            Err(e) => {
                warn!(target: "poolbus::engine", error = %e, "cannot read log filter");
                self.active.store(false, Ordering::SeqCst);
                return;
            }
        };
        if let Err(e) = self.handle.reload(EnvFilter::new("debug")) {
            warn!(target: "poolbus::engine", error = %e, "cannot raise log level");
            self.active.store(false, Ordering::SeqCst);
            return;
        }
        warn!(
            target: "poolbus::engine",
            packet = %format_packet_str(packet),
            "packet ejected, logging at debug for {} seconds",
            self.window.as_secs()
        );

        let handle = self.handle.clone();
        let active = Arc::clone(&self.active);
        let window = self.window;
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            match EnvFilter::try_new(&previous) {
                Ok(filter) => {
                    if let Err(e) = handle.reload(filter) {
                        warn!(target: "poolbus::engine", error = %e, "cannot restore log level");
                    } else {
                        info!(target: "poolbus::engine", filter = %previous, "log level restored");
                    }
                }
                Err(e) => warn!(target: "poolbus::engine", error = %e, "cannot restore log level"),
            }
            active.store(false, Ordering::SeqCst);
        });
    }
}
