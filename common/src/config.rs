//! Configuration parsing – reads a `KEY=VALUE` file (`doorcap.conf`).
//!
//! The recorder service and the `doorcap-locate` tool load the same file;
//! each ignores the fields it does not need.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

/// Upper bound for any single timing constant.
const MAX_TIMING: Duration = Duration::from_secs(24 * 60 * 60);

/// What the capture pipeline does when one of its stages fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Log the failure and carry on with the next stage.
    Continue,
    /// Stop processing the current capture window.
    Abort,
}

impl FailurePolicy {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "continue" => Some(Self::Continue),
            "abort" => Some(Self::Abort),
            _ => None,
        }
    }
}

/// The four timing constants of a capture cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    /// Lead-in recorded before the door opened.
    pub pre: Duration,
    /// How long the door may stay open before the capture is cut.
    pub open: Duration,
    /// Trail recorded after the door closed.
    pub post: Duration,
    /// Grace period for the camera to finish writing frames.
    pub delay: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            pre: Duration::from_secs(10),
            open: Duration::from_secs(30),
            post: Duration::from_secs(10),
            delay: Duration::from_secs(2),
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    // ── broker ───────────────────────────────────────────────────────
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_client_id: String,
    /// Topic the door sensor publishes `OPEN` / `CLOSED` on.
    pub mqtt_topic: String,

    // ── snapshot archive ─────────────────────────────────────────────
    pub archive_dir: PathBuf,
    /// Extension of snapshot files, without the dot.
    pub image_ext: String,

    // ── event timing ─────────────────────────────────────────────────
    pub timings: Timings,

    // ── encoder ──────────────────────────────────────────────────────
    pub fps: u32,
    pub ffmpeg: PathBuf,
    pub video_codec: String,
    pub pixel_format: String,
    pub work_dir: PathBuf,

    // ── upload ───────────────────────────────────────────────────────
    pub upload_url: Option<String>,
    /// JSON pointer locating the video identifier in the upload response.
    pub upload_id_pointer: String,
    pub public_url_base: Option<String>,

    // ── notification ─────────────────────────────────────────────────
    pub notify_script: PathBuf,
    pub recipients: Vec<String>,

    pub on_stage_failure: FailurePolicy,
}

impl Config {
    /// Default config path.
    pub fn default_path() -> &'static str {
        "/etc/doorcap/doorcap.conf"
    }
}

/// Parse a `KEY=VALUE` configuration file.
///
/// Lines starting with `#` are comments.  Values may be optionally
/// double-quoted.  Unknown keys are silently ignored.
pub fn load(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read config: {}", path.display()))?;

    let config = from_str(&text)?;
    info!("Loaded config from {}", path.display());
    Ok(config)
}

/// Build a [`Config`] from the text of a configuration file.
pub fn from_str(text: &str) -> Result<Config> {
    let map = parse_conf(text);

    let get = |key: &str| -> Option<String> { map.get(key).cloned().filter(|v| !v.is_empty()) };
    let get_secs = |key: &str, default: Duration| -> Result<Duration> {
        let secs = match get(key) {
            Some(v) => v
                .parse::<u64>()
                .map(Duration::from_secs)
                .with_context(|| format!("{key} must be a whole number of seconds, got '{v}'"))?,
            None => default,
        };
        if secs > MAX_TIMING {
            anyhow::bail!("{key} must not exceed {} seconds", MAX_TIMING.as_secs());
        }
        Ok(secs)
    };

    let defaults = Timings::default();
    let timings = Timings {
        pre: get_secs("PRE_SECS", defaults.pre)?,
        open: get_secs("OPEN_SECS", defaults.open)?,
        post: get_secs("POST_SECS", defaults.post)?,
        delay: get_secs("DELAY_SECS", defaults.delay)?,
    };

    let mqtt_port = match get("MQTT_PORT") {
        Some(v) => v
            .parse()
            .with_context(|| format!("MQTT_PORT is not a port number: '{v}'"))?,
        None => 1883,
    };

    let fps = match get("FPS") {
        Some(v) => v
            .parse()
            .with_context(|| format!("FPS is not a frame rate: '{v}'"))?,
        None => 30,
    };

    let on_stage_failure = match get("ON_STAGE_FAILURE") {
        Some(v) => FailurePolicy::parse(&v)
            .with_context(|| format!("ON_STAGE_FAILURE must be 'continue' or 'abort', got '{v}'"))?,
        None => FailurePolicy::Continue,
    };

    let recipients: Vec<String> = get("RECIPIENTS")
        .map(|s| {
            s.split(',')
                .map(|r| r.trim().to_string())
                .filter(|r| !r.is_empty())
                .collect()
        })
        .unwrap_or_default();

    Ok(Config {
        mqtt_host: get("MQTT_HOST").unwrap_or_else(|| "localhost".into()),
        mqtt_port,
        mqtt_username: get("MQTT_USERNAME"),
        mqtt_password: get("MQTT_PASSWORD"),
        mqtt_client_id: get("MQTT_CLIENT_ID").unwrap_or_else(|| "doorcap-recorder".into()),
        mqtt_topic: get("MQTT_TOPIC").unwrap_or_else(|| "/frontdoor".into()),

        archive_dir: PathBuf::from(
            get("ARCHIVE_DIR").unwrap_or_else(|| "/tank/security/zoneminder/events/Entry".into()),
        ),
        image_ext: get("IMAGE_EXT")
            .map(|e| e.trim_start_matches('.').to_string())
            .unwrap_or_else(|| "jpg".into()),

        timings,

        fps,
        ffmpeg: PathBuf::from(get("FFMPEG").unwrap_or_else(|| "/usr/bin/ffmpeg".into())),
        video_codec: get("VIDEO_CODEC").unwrap_or_else(|| "libx264".into()),
        pixel_format: get("PIXEL_FORMAT").unwrap_or_else(|| "yuv420p".into()),
        work_dir: get("WORK_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir),

        upload_url: get("UPLOAD_URL"),
        upload_id_pointer: get("UPLOAD_ID_POINTER").unwrap_or_else(|| "/name".into()),
        public_url_base: get("PUBLIC_URL_BASE").map(|b| b.trim_end_matches('/').to_string()),

        notify_script: get("NOTIFY_SCRIPT")
            .map(PathBuf::from)
            .unwrap_or_else(default_notify_script),
        recipients,

        on_stage_failure,
    })
}

/// `notify` next to the running executable.
fn default_notify_script() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("notify")))
        .unwrap_or_else(|| PathBuf::from("notify"))
}

/// Parse `KEY=VALUE` lines into a map, stripping optional double-quotes.
fn parse_conf(text: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, val)) = line.split_once('=') {
            let key = key.trim();
            let val = val.trim().trim_matches('"');
            map.insert(key.to_string(), val.to_string());
        }
    }
    map
}

// ─── tests ───────────────────────────────────────────────────────────────
