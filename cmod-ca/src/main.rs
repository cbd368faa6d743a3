//! Comment Analyzer (cmod-ca) - Main entry point
//!
//! Runs the moderation pipeline headlessly: loads a comments file into an
//! in-memory document, classifies every comment through the remote service
//! and prints how each one ends up rendered.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cmod_ca::dom::MemoryDom;
use cmod_ca::identity::{stream_id_from_url, UNKNOWN_STREAM_ID};
use cmod_ca::{CommentModerator, HttpClassifier};
use cmod_common::config::{self, TomlConfig};
use cmod_common::events::{EventBus, ModerationEvent, DEFAULT_EVENT_CAPACITY};

const MODULE_NAME: &str = "cmod-ca";

/// Upper bound on events a single comment produces in one headless run
/// (queued, dispatched, discarded twice, applied or failed)
const EVENTS_PER_COMMENT: usize = 5;

/// Command-line arguments for cmod-ca
#[derive(Parser, Debug)]
#[command(name = "cmod-ca")]
#[command(about = "Comment analyzer: classifies a comment stream and renders the verdicts")]
#[command(version)]
struct Args {
    /// File with one comment per line
    #[arg(short, long, required_unless_present = "init_config")]
    comments: Option<PathBuf>,

    /// Stream identifier the comments belong to
    #[arg(long, conflicts_with = "url")]
    stream_id: Option<String>,

    /// Watch page URL to take the stream identifier from
    #[arg(long)]
    url: Option<String>,

    /// Classification service base URL (overrides CMOD_SERVER_URL and the config file)
    #[arg(long)]
    server_url: Option<String>,

    /// Configuration file (overrides CMOD_CONFIG)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write a default configuration file if none exists, then exit
    #[arg(long)]
    init_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = config::resolve_config_path(args.config.as_deref(), MODULE_NAME);
    if args.init_config {
        return init_config(config_path);
    }

    let toml_config = TomlConfig::load_or_default(config_path.as_deref())
        .context("Failed to load configuration")?;
    init_tracing(&toml_config)?;

    let server_url = config::resolve_server_url(args.server_url.as_deref(), &toml_config)
        .context("Failed to resolve classification server URL")?;
    let stream_id = args
        .stream_id
        .clone()
        .or_else(|| args.url.as_deref().map(stream_id_from_url))
        .or_else(|| toml_config.stream_id.clone())
        .unwrap_or_else(|| UNKNOWN_STREAM_ID.to_string());

    let comments_path = args
        .comments
        .clone()
        .context("--comments is required")?;
    let dom = load_comments(&comments_path, &toml_config)?;

    info!(
        "Starting cmod-ca: stream {}, {} comments, server {}",
        stream_id,
        dom.views().len(),
        server_url
    );

    let classifier = Arc::new(
        HttpClassifier::new(&server_url, toml_config.pipeline.request_timeout())
            .context("Failed to create classifier client")?,
    );
    let events = EventBus::new(event_capacity(dom.views().len()));
    let shutdown = CancellationToken::new();

    tokio::spawn(watch_events(events.subscribe(), shutdown.clone()));
    tokio::spawn(shutdown_on_ctrl_c(shutdown.clone()));

    let moderator = CommentModerator::new(dom, classifier, stream_id, &toml_config, events);
    let (_signal_tx, signal_rx) = mpsc::channel(64);
    let (_action_tx, action_rx) = mpsc::channel(16);
    let moderator = moderator.run(signal_rx, action_rx, shutdown).await;

    for view in moderator.dom().views() {
        let state = moderator
            .reconciler()
            .ledger()
            .get(view.id)
            .and_then(|r| r.state)
            .map(|s| format!("{:?}", s))
            .unwrap_or_else(|| "Skipped".to_string());
        println!("{}\t{}\t{}", state, view.original, view.visible);
    }

    let counts = moderator.registry().counts();
    info!(
        "Done: {} classified, {} failed, {} still pending",
        counts.classified,
        counts.error,
        counts.new + counts.queued + counts.in_flight
    );
    Ok(())
}

fn init_tracing(toml_config: &TomlConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&toml_config.logging.level))
        .context("Invalid logging level")?;

    let file_layer = match &toml_config.logging.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };
    let stderr_layer = file_layer
        .is_none()
        .then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .init();
    Ok(())
}

fn init_config(config_path: Option<PathBuf>) -> Result<()> {
    let path = config_path.context("No config file location available")?;
    if path.exists() {
        println!("Config file already exists: {}", path.display());
        return Ok(());
    }
    config::write_toml_config(&TomlConfig::default(), &path)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

/// One occurrence per non-blank line
fn load_comments(path: &Path, toml_config: &TomlConfig) -> Result<MemoryDom> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read comments from {}", path.display()))?;

    let dom = MemoryDom::new(toml_config.display.clone());
    for line in content.lines().filter(|l| !l.trim().is_empty()) {
        dom.add(line.trim());
    }
    Ok(dom)
}

/// Bus capacity that holds every event of a headless run, so the watcher
/// can never lag past the event that ends it
fn event_capacity(comments: usize) -> usize {
    comments
        .saturating_mul(EVENTS_PER_COMMENT)
        .saturating_add(16)
        .max(DEFAULT_EVENT_CAPACITY)
}

/// Log events as JSON lines and stop once there is nothing left to classify
async fn watch_events(mut rx: broadcast::Receiver<ModerationEvent>, shutdown: CancellationToken) {
    let mut first_scan = true;
    loop {
        match rx.recv().await {
            Ok(event) => {
                if let Ok(json) = serde_json::to_string(&event) {
                    debug!(event = event.event_type(), "{}", json);
                }
                match event {
                    ModerationEvent::QueueDrained { .. } => shutdown.cancel(),
                    ModerationEvent::ScanCompleted { enqueued, .. } if first_scan => {
                        first_scan = false;
                        if enqueued == 0 {
                            shutdown.cancel();
                        }
                    }
                    _ => {}
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Event watcher lagged, {} events skipped", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn shutdown_on_ctrl_c(shutdown: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Received Ctrl+C, shutting down");
        shutdown.cancel();
    }
}
