use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// MIME type reported before the capture device has delivered any data.
pub const UNKNOWN_FORMAT: &str = "unknown";

/// Base MIME type for raw little-endian `f32` mono samples.
pub const PCM_MIME: &str = "audio/pcm";

/// Recording state machine.
///
/// ```text
/// UnInitialized → Stopped ⇄ Recording ⇄ Paused
///                    ↑__________________|   (stop)
/// any ───────────────────────────→ UnInitialized   (device inactive)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CaptureState {
    #[default]
    UnInitialized,
    Stopped,
    Recording,
    Paused,
}

impl CaptureState {
    /// Recording or paused: the encoder holds data for the current timeline.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Recording | Self::Paused)
    }
}

impl fmt::Display for CaptureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::UnInitialized => "UnInitialized",
            Self::Stopped => "Stopped",
            Self::Recording => "Recording",
            Self::Paused => "Paused",
        };
        f.write_str(name)
    }
}

/// Playback state machine: `UnInitialized → Ready ⇄ Playing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PlaybackState {
    #[default]
    UnInitialized,
    Ready,
    Playing,
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::UnInitialized => "UnInitialized",
            Self::Ready => "Ready",
            Self::Playing => "Playing",
        };
        f.write_str(name)
    }
}

/// An immutable audio buffer handed from capture to playback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Clip {
    data: Arc<[u8]>,
    mime_type: String,
}

impl Clip {
    pub fn new(data: impl Into<Arc<[u8]>>, mime_type: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            mime_type: mime_type.into(),
        }
    }

    /// Concatenate fragments in delivery order.
    pub fn concat<'a>(parts: impl IntoIterator<Item = &'a [u8]>, mime_type: &str) -> Self {
        let mut data = Vec::new();
        for part in parts {
            data.extend_from_slice(part);
        }
        Self::new(data, mime_type)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Full MIME type including parameters, e.g. `audio/webm;codecs=opus`.
    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    /// MIME type without parameters, e.g. `audio/webm`.
    pub fn base_mime_type(&self) -> &str {
        self.mime_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
    }

    /// Sample rate of a raw PCM clip, `None` for encoded formats.
    pub fn pcm_sample_rate(&self) -> Option<u32> {
        if self.base_mime_type() != PCM_MIME {
            return None;
        }
        self.mime_type
            .split(';')
            .skip(1)
            .filter_map(|param| param.trim().strip_prefix("rate="))
            .find_map(|rate| rate.parse().ok())
    }

    /// Decode a raw PCM clip into samples.
    pub fn pcm_samples(&self) -> Option<Vec<f32>> {
        self.pcm_sample_rate()?;
        Some(
            self.data
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect(),
        )
    }

    /// Duration in seconds, when it can be derived from the format.
    pub fn duration_secs(&self) -> Option<f64> {
        let rate = self.pcm_sample_rate()?;
        if rate == 0 {
            return None;
        }
        Some((self.data.len() / 4) as f64 / rate as f64)
    }
}

/// MIME type for raw PCM at `sample_rate`.
pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("{};rate={}", PCM_MIME, sample_rate)
}

/// Encode samples as little-endian `f32` bytes.
pub fn encode_pcm(samples: &[f32]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}
