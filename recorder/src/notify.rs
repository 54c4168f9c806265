//! Recipient notification – runs the notify script once per recipient
//! as `<script> <recipient> <url>`.

use std::path::PathBuf;
use std::process::{Command, Stdio};

use tracing::debug;

use doorcap_common::config::Config;

use crate::pipeline::{Notifier, StageError};

pub struct ScriptNotifier {
    script: PathBuf,
}

impl ScriptNotifier {
    pub fn from_config(config: &Config) -> Self {
        Self {
            script: config.notify_script.clone(),
        }
    }
}

impl Notifier for ScriptNotifier {
    fn notify(&self, recipient: &str, url: &str) -> Result<(), StageError> {
        let program = self.script.display().to_string();
        debug!("Running {program} {recipient} {url}");

        let status = Command::new(&self.script)
            .arg(recipient)
            .arg(url)
            .stdin(Stdio::null())
            .status()
            .map_err(|source| StageError::Spawn {
                program: program.clone(),
                source,
            })?;

        if status.success() {
            Ok(())
        } else {
            Err(StageError::Exit { program, status })
        }
    }
}
