//! Video upload – POSTs the encoded video to the configured service.
//!
//! The service answers with JSON; the video identifier is read at
//! `UPLOAD_ID_POINTER` and appended to `PUBLIC_URL_BASE` to form the
//! public URL.  Without a base the identifier is used as the URL as is.

use std::path::Path;
use std::time::Duration;

use tracing::info;

use doorcap_common::config::Config;

use crate::pipeline::{StageError, VideoUploader};

/// User-Agent sent with uploads.
const USER_AGENT: &str = "doorcap-recorder/0.1";

pub struct HttpUploader {
    url: Option<String>,
    id_pointer: String,
    public_base: Option<String>,
}

impl HttpUploader {
    pub fn from_config(config: &Config) -> Self {
        Self {
            url: config.upload_url.clone(),
            id_pointer: config.upload_id_pointer.clone(),
            public_base: config.public_url_base.clone(),
        }
    }

    fn public_url(&self, id: &str) -> String {
        match &self.public_base {
            Some(base) => format!("{base}/{id}"),
            None => id.to_string(),
        }
    }
}

/// Identifier at `pointer`, accepting strings and numbers.
fn extract_id(body: &serde_json::Value, pointer: &str) -> Option<String> {
    match body.pointer(pointer)? {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl VideoUploader for HttpUploader {
    fn upload(&self, video: &Path) -> Result<String, StageError> {
        let url = self
            .url
            .as_deref()
            .ok_or_else(|| StageError::Upload("UPLOAD_URL is not configured".into()))?;

        let bytes = std::fs::read(video).map_err(StageError::io(video))?;
        info!("Uploading {} ({} bytes) to {url}", video.display(), bytes.len());

        // Built per call: this runs on the blocking pool, never inside the
        // async runtime.
        let client = reqwest::blocking::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| StageError::Upload(format!("Cannot build HTTP client: {e}")))?;

        let resp = client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "video/mp4")
            .body(bytes)
            .send()
            .map_err(|e| StageError::Upload(format!("POST {url}: {e}")))?;

        if !resp.status().is_success() {
            return Err(StageError::Upload(format!(
                "POST {url} returned {}",
                resp.status()
            )));
        }

        let body: serde_json::Value = resp
            .json()
            .map_err(|e| StageError::Upload(format!("Cannot parse upload response: {e}")))?;
        let id = extract_id(&body, &self.id_pointer).ok_or_else(|| {
            StageError::Upload(format!("No identifier at {} in upload response", self.id_pointer))
        })?;

        let public = self.public_url(&id);
        info!("Uploaded {} to {public}", video.display());
        Ok(public)
    }
}
