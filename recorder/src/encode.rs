//! Video encoding – runs `ffmpeg` over the located snapshots.
//!
//! ffmpeg wants a numbered input sequence, so each snapshot is exposed as
//! a symlink `000000.jpg`, `000001.jpg`, … in a scratch `frames/`
//! directory, whatever its original name was.

use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::{debug, info, warn};

use doorcap_common::config::Config;

use crate::pipeline::{StageError, VideoEncoder};

pub struct FfmpegEncoder {
    program: PathBuf,
    fps: u32,
    codec: String,
    pixel_format: String,
    extension: String,
}

impl FfmpegEncoder {
    pub fn from_config(config: &Config) -> Self {
        Self {
            program: config.ffmpeg.clone(),
            fps: config.fps,
            codec: config.video_codec.clone(),
            pixel_format: config.pixel_format.clone(),
            extension: config.image_ext.clone(),
        }
    }

    fn frame_pattern(&self, frames_dir: &Path) -> PathBuf {
        frames_dir.join(format!("%06d.{}", self.extension))
    }

    fn command(&self, frames_dir: &Path, output: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(["-hide_banner", "-loglevel", "error", "-nostdin", "-y"]);
        cmd.arg("-framerate").arg(self.fps.to_string());
        cmd.arg("-i").arg(self.frame_pattern(frames_dir));
        cmd.args(["-c:v", self.codec.as_str(), "-pix_fmt", self.pixel_format.as_str()]);
        cmd.arg(output);
        cmd.stdin(Stdio::null());
        cmd
    }
}

impl VideoEncoder for FfmpegEncoder {
    fn encode(&self, images: &[PathBuf], work_dir: &Path, output: &Path) -> Result<(), StageError> {
        let frames_dir = work_dir.join("frames");
        link_frames(images, &frames_dir, &self.extension)?;

        let mut cmd = self.command(&frames_dir, output);
        info!("Calling {cmd:?}");
        let result = cmd.output();

        if let Err(e) = std::fs::remove_dir_all(&frames_dir) {
            warn!("Cannot remove {}: {e}", frames_dir.display());
        }

        let program = self.program.display().to_string();
        let out = result.map_err(|source| StageError::Spawn {
            program: program.clone(),
            source,
        })?;
        for line in String::from_utf8_lossy(&out.stderr).lines() {
            if !line.is_empty() {
                warn!("[ffmpeg] {line}");
            }
        }
        info!("Converted with {}", out.status);

        if out.status.success() {
            Ok(())
        } else {
            Err(StageError::Exit {
                program,
                status: out.status,
            })
        }
    }
}

/// Expose `images` as a zero-padded numbered sequence inside `frames_dir`.
fn link_frames(images: &[PathBuf], frames_dir: &Path, extension: &str) -> Result<(), StageError> {
    if frames_dir.exists() {
        std::fs::remove_dir_all(frames_dir).map_err(StageError::io(frames_dir))?;
    }
    std::fs::create_dir_all(frames_dir).map_err(StageError::io(frames_dir))?;

    for (i, image) in images.iter().enumerate() {
        let link = frames_dir.join(format!("{i:06}.{extension}"));
        symlink(image, &link).map_err(StageError::io(&link))?;
    }
    debug!("Linked {} frame(s) into {}", images.len(), frames_dir.display());
    Ok(())
}
