//! Capture pipeline: locate snapshots → encode → upload → notify.
//!
//! Every stage reports an explicit `Result`.  What happens after a failed
//! stage is decided by the configured [`FailurePolicy`]; with `continue`
//! the run carries on as far as it can (an upload failure leaves no URL,
//! so notifications are skipped).  A locator error always ends the run
//! since it means the archive layout is not what we expect.  Every run,
//! aborted or not, leaves a `capture.json` summary in its work directory.

use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use doorcap_common::archive::ImageLocator;
use doorcap_common::config::{Config, FailurePolicy};
use doorcap_common::event::CaptureWindow;

use crate::encode::FfmpegEncoder;
use crate::notify::ScriptNotifier;
use crate::upload::HttpUploader;

#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("Cannot run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} exited with {status}")]
    Exit { program: String, status: ExitStatus },

    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Upload failed: {0}")]
    Upload(String),
}

impl StageError {
    pub fn io(path: &Path) -> impl FnOnce(io::Error) -> StageError + '_ {
        move |source| StageError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Turns an ordered list of images into one video file.
pub trait VideoEncoder: Send + Sync {
    /// Encode `images` into `output`, using `work_dir` for scratch files.
    fn encode(&self, images: &[PathBuf], work_dir: &Path, output: &Path) -> Result<(), StageError>;
}

/// Publishes a video and returns its public URL.
pub trait VideoUploader: Send + Sync {
    fn upload(&self, video: &Path) -> Result<String, StageError>;
}

/// Tells one recipient where the video can be watched.
pub trait Notifier: Send + Sync {
    fn notify(&self, recipient: &str, url: &str) -> Result<(), StageError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Locate,
    Encode,
    Upload,
    Notify,
}

/// Outcome of one stage of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageReport {
    pub stage: Stage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StageReport {
    pub fn ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Summary of one pipeline run, also written as `capture.json`.
#[derive(Debug, Clone, Serialize)]
pub struct CaptureReport {
    pub window: CaptureWindow,
    pub frames: usize,
    pub video: Option<PathBuf>,
    pub url: Option<String>,
    pub stages: Vec<StageReport>,
    /// The run stopped early because of a failed stage.
    pub aborted: bool,
}

impl CaptureReport {
    fn new(window: CaptureWindow) -> Self {
        Self {
            window,
            frames: 0,
            video: None,
            url: None,
            stages: Vec::new(),
            aborted: false,
        }
    }

    /// Record a stage outcome; returns `true` if the run must stop.
    fn record(
        &mut self,
        stage: Stage,
        recipient: Option<&str>,
        outcome: Result<(), String>,
        policy: FailurePolicy,
    ) -> bool {
        let failed = outcome.is_err();
        self.stages.push(StageReport {
            stage,
            recipient: recipient.map(str::to_string),
            error: outcome.err(),
        });
        if failed && policy == FailurePolicy::Abort {
            self.aborted = true;
        }
        self.aborted
    }
}

/// Orchestrates the output side of a capture.
pub struct CapturePipeline {
    locator: ImageLocator,
    encoder: Box<dyn VideoEncoder>,
    uploader: Box<dyn VideoUploader>,
    notifier: Box<dyn Notifier>,
    recipients: Vec<String>,
    work_root: PathBuf,
    policy: FailurePolicy,
}

impl CapturePipeline {
    pub fn new(
        locator: ImageLocator,
        encoder: Box<dyn VideoEncoder>,
        uploader: Box<dyn VideoUploader>,
        notifier: Box<dyn Notifier>,
        recipients: Vec<String>,
        work_root: PathBuf,
        policy: FailurePolicy,
    ) -> Self {
        Self {
            locator,
            encoder,
            uploader,
            notifier,
            recipients,
            work_root,
            policy,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            ImageLocator::from_config(config),
            Box::new(FfmpegEncoder::from_config(config)),
            Box::new(HttpUploader::from_config(config)),
            Box::new(ScriptNotifier::from_config(config)),
            config.recipients.clone(),
            config.work_dir.clone(),
            config.on_stage_failure,
        )
    }

    /// Run every stage for `window`.  Blocks on subprocesses and network.
    pub fn run(&self, window: CaptureWindow) -> CaptureReport {
        let mut report = CaptureReport::new(window);
        let work_dir = self.work_root.join(format!(
            "doorcap_{}_{}",
            window.start.format("%Y%m%dT%H%M%S"),
            window.stop.format("%Y%m%dT%H%M%S")
        ));
        let prepared = std::fs::create_dir_all(&work_dir).map_err(StageError::io(&work_dir));

        // ── locate ───────────────────────────────────────────────────
        let images = match self.locator.locate(window.start, window.stop) {
            Ok(images) => images,
            Err(e) => {
                error!("Cannot locate pictures for {} → {}: {e}", window.start, window.stop);
                report.record(Stage::Locate, None, Err(e.to_string()), self.policy);
                report.aborted = true;
                return self.finish(report, &work_dir);
            }
        };
        info!("Collating {} frames", images.len());
        report.frames = images.len();
        report.record(Stage::Locate, None, Ok(()), self.policy);

        // ── encode ───────────────────────────────────────────────────
        let video = work_dir.join("output.mp4");
        let encoded = prepared.and_then(|()| self.encoder.encode(&images, &work_dir, &video));
        match &encoded {
            Ok(()) => info!("Encoded video {}", video.display()),
            Err(e) => error!("Encoding {} failed: {e}", video.display()),
        }
        report.video = Some(video.clone());
        let stop = report.record(Stage::Encode, None, encoded.map_err(|e| e.to_string()), self.policy);
        if stop {
            return self.finish(report, &work_dir);
        }

        // ── upload ───────────────────────────────────────────────────
        let url = match self.uploader.upload(&video) {
            Ok(url) => {
                info!("Uploaded video to {url}");
                report.record(Stage::Upload, None, Ok(()), self.policy);
                url
            }
            Err(e) => {
                error!("Uploading {} failed: {e}", video.display());
                report.record(Stage::Upload, None, Err(e.to_string()), self.policy);
                if !report.aborted && !self.recipients.is_empty() {
                    warn!("No public URL, skipping {} notification(s)", self.recipients.len());
                }
                return self.finish(report, &work_dir);
            }
        };
        report.url = Some(url.clone());

        // ── notify ───────────────────────────────────────────────────
        for recipient in &self.recipients {
            info!("Notifying {recipient}");
            let outcome = self.notifier.notify(recipient, &url);
            if let Err(e) = &outcome {
                error!("Notifying {recipient} failed: {e}");
            }
            let stop = report.record(
                Stage::Notify,
                Some(recipient),
                outcome.map_err(|e| e.to_string()),
                self.policy,
            );
            if stop {
                break;
            }
        }

        self.finish(report, &work_dir)
    }

    /// Write `capture.json` next to the video.
    fn finish(&self, report: CaptureReport, work_dir: &Path) -> CaptureReport {
        let path = work_dir.join("capture.json");
        let written = serde_json::to_string_pretty(&report)
            .map_err(anyhow::Error::from)
            .and_then(|json| std::fs::write(&path, json).map_err(anyhow::Error::from));
        if let Err(e) = written {
            warn!("Cannot write {}: {e}", path.display());
        }
        if report.aborted {
            warn!(
                "Capture {} → {} aborted after a failed stage",
                report.window.start, report.window.stop
            );
        }
        report
    }
}

/// Run the pipeline for every completed window until the channel closes.
///
/// Each run happens on the blocking pool, so a new door event is never
/// held up by a slow encode or upload.
pub async fn serve(mut windows: mpsc::UnboundedReceiver<CaptureWindow>, pipeline: Arc<CapturePipeline>) {
    let mut running = JoinSet::new();
    loop {
        tokio::select! {
            window = windows.recv() => match window {
                Some(window) => {
                    let pipeline = pipeline.clone();
                    running.spawn_blocking(move || pipeline.run(window));
                }
                None => break,
            },
            Some(done) = running.join_next(), if !running.is_empty() => reap(done),
        }
    }

    info!("Waiting for {} capture(s) in progress", running.len());
    while let Some(done) = running.join_next().await {
        reap(done);
    }
}

fn reap(done: Result<CaptureReport, tokio::task::JoinError>) {
    match done {
        Ok(report) => info!(
            "Capture {} → {} finished ({} frames, url={})",
            report.window.start,
            report.window.stop,
            report.frames,
            report.url.as_deref().unwrap_or("none")
        ),
        Err(e) => error!("Capture task failed: {e}"),
    }
}
