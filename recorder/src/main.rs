//! Door Capture Recorder – turns door sensor events into video clips.
//!
//! This binary:
//! 1. Reads configuration from `doorcap.conf`
//! 2. Subscribes to the door sensor topic on the MQTT broker
//! 3. Runs the event worker that debounces open/close signals into
//!    capture windows
//! 4. Encodes, uploads and announces a clip for every completed window

mod encode;
mod notify;
mod pipeline;
mod subscriber;
mod upload;
mod worker;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::info;

use doorcap_common::config::{self, Config};

use crate::pipeline::CapturePipeline;
use crate::worker::Clock;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // ── load config ──────────────────────────────────────────────────
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| Config::default_path().to_string());
    let config = config::load(&PathBuf::from(&config_path)).context("Config load failed")?;

    info!(
        "Door Capture Recorder starting (archive={}, pre={}s, open={}s, post={}s, delay={}s)",
        config.archive_dir.display(),
        config.timings.pre.as_secs(),
        config.timings.open.as_secs(),
        config.timings.post.as_secs(),
        config.timings.delay.as_secs(),
    );
    if config.recipients.is_empty() {
        tracing::warn!("RECIPIENTS is empty – clips will be uploaded but nobody is notified");
    }

    // ── ctrl-c ───────────────────────────────────────────────────────
    ctrlc::set_handler(move || {
        info!("Shutdown signal received");
        std::process::exit(0);
    })
    .context("Cannot set Ctrl-C handler")?;

    // ── capture pipeline ─────────────────────────────────────────────
    let capture_pipeline = Arc::new(CapturePipeline::from_config(&config));
    let (capture_tx, capture_rx) = mpsc::unbounded_channel();
    let captures = tokio::spawn(pipeline::serve(capture_rx, capture_pipeline));

    // ── event worker ─────────────────────────────────────────────────
    let (signals, worker) = worker::spawn(config.timings, Clock::new(), capture_tx);

    // ── door sensor feed (runs until the worker goes away) ───────────
    let result = subscriber::run(&config, signals).await;
    if let Err(e) = &result {
        tracing::error!("MQTT subscriber error: {e:#}");
    }

    let _ = worker.await;
    let _ = captures.await;

    info!("Door Capture Recorder stopped");
    result
}
