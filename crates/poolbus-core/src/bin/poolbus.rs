//! Bus sniffer and packet sender
//!
//! Opens the configured link, prints every decoded frame, and optionally
//! sends dash-separated packets once the link is up.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter};

use poolbus_core::capture::replay_capture;
use poolbus_core::link::list_ports;
use poolbus_core::prelude::*;
use poolbus_core::protocol::format_packet_str;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// JSON configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Log filter, e.g. `info` or `poolbus::rx=trace`; overrides `RUST_LOG`
    #[arg(long)]
    log_level: Option<String>,

    /// Packet to send once the link opens, e.g. `96-16-7-0` (repeatable)
    #[arg(long)]
    send: Vec<String>,

    /// Append every packet to this JSON-lines file
    #[arg(long)]
    capture: Option<PathBuf>,

    /// Replay the inbound packets of a capture file through the mock link
    #[arg(long)]
    replay: Option<PathBuf>,

    /// Use the in-memory mock link
    #[arg(long)]
    mock: bool,

    /// List serial ports and exit
    #[arg(long)]
    list_ports: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match &cli.log_level {
        Some(level) => EnvFilter::try_new(level)
            .with_context(|| format!("invalid log filter '{}'", level))?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    let (filter, reload_handle) = reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .init();

    if cli.list_ports {
        for port in list_ports() {
            println!(
                "{}\t{}",
                port.name,
                port.product.as_deref().unwrap_or("")
            );
        }
        return Ok(());
    }

    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if cli.mock || cli.replay.is_some() {
        config.mock_port = true;
    }
    if cli.replay.is_some() {
        config.suppress_write = true;
    }
    if cli.capture.is_some() {
        config.capture_path = cli.capture.clone();
    }

    let (mut engine, handle) = Engine::new(config)?;
    let mut peer = engine.take_mock_peer();
    let engine = engine.with_diagnostic_hook(Arc::new(VerbosityEscalation::new(reload_handle)));
    let mut events = handle.subscribe();
    let task = engine.spawn();

    let mut pending_sends = cli.send.clone();
    let mut replay = match &cli.replay {
        Some(path) => replay_capture(path)
            .with_context(|| format!("reading capture {}", path.display()))?,
        None => Vec::new(),
    };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, stopping");
                break;
            }
            event = events.recv() => match event {
                Ok(EngineEvent::LinkOpen) => {
                    for packet in pending_sends.drain(..) {
                        let submission = handle.send_packet_str(&packet, ResponseSpec::Inferred).await;
                        println!("{:?}: {}", submission.result.status, submission.result.text);
                    }
                    if let Some(peer) = peer.as_mut() {
                        for packet in replay.drain(..) {
                            peer.inject(&packet).await?;
                        }
                    }
                }
                Ok(EngineEvent::LinkClosed) => warn!("link closed"),
                Ok(EngineEvent::FrameDecoded { family, frame, counter }) => {
                    println!("#{:<6} {:<11} {}", counter, family, format_packet_str(&frame.payload()));
                }
                Ok(EngineEvent::CountersUpdated(_)) => {}
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "event receiver lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    }

    let counters = handle.counters().await;
    info!(
        received = counters.bytes_received,
        sent = counters.bytes_sent,
        success = counters.success,
        failed = counters.failed,
        collisions = counters.collisions,
        "final counters"
    );
    handle.stop().await;
    if let Err(e) = task.await {
        bail!("engine task failed: {}", e);
    }
    Ok(())
}
