//! Application settings loaded from JSON
//!
//! Settings live in `~/.config/accent/settings.json` unless a path is given on
//! the command line. A missing file means defaults; settings are never written
//! back.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::audio::CaptureOptions;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse settings {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// What a full stop does with the capture device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopPolicy {
    /// Release the stream; the next start acquires a fresh one.
    #[default]
    ReleaseDevice,
    /// Keep the stream open and restart the encoder on the next start.
    KeepDevice,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// 0 = no diagnostics, 1 = info, 2 = debug
    pub debug_level: u8,
    /// Seconds skipped forward before playback starts
    pub play_delay_secs: f64,
    /// Start listening when the window gains focus
    pub listen_on_focus: bool,
    /// Resume recording after a clip plays to its end
    pub resume_after_playback: bool,
    pub acquire_on_launch: bool,
    pub stop_policy: StopPolicy,
    pub flush_timeout_ms: u64,
    pub diagnostics_capacity: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            debug_level: 0,
            play_delay_secs: 0.3,
            listen_on_focus: true,
            resume_after_playback: true,
            acquire_on_launch: false,
            stop_policy: StopPolicy::ReleaseDevice,
            flush_timeout_ms: 5000,
            diagnostics_capacity: 500,
        }
    }
}

impl Settings {
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("accent")
            .join("settings.json")
    }

    /// Load settings from `path`. Keys missing from the file take defaults.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let contents = fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Like [`Settings::load`], but a missing file yields defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, SettingsError> {
        if !path.exists() {
            debug!(target: "accent::settings", "{} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load(path)
    }

    pub fn capture_options(&self) -> CaptureOptions {
        CaptureOptions {
            stop_policy: self.stop_policy,
            flush_timeout: Duration::from_millis(self.flush_timeout_ms),
        }
    }
}
