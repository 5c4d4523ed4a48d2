//! Writing captured clips to disk
//!
//! Raw PCM clips become 32-bit float mono WAV files via hound. Clips in an
//! encoded container are written byte for byte with a matching extension.

use hound::{WavSpec, WavWriter};
use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::models::{pcm_mime_type, Clip};

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("wav error: {0}")]
    Wav(#[from] hound::Error),

    #[error("clip is empty")]
    Empty,
}

/// Clip exporter rooted at a recordings directory
pub struct ClipExporter {
    export_dir: PathBuf,
}

impl ClipExporter {
    /// Exports to `~/.local/share/accent/recordings` by default
    pub fn new() -> Self {
        let export_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("accent")
            .join("recordings");

        Self { export_dir }
    }

    pub fn with_export_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.export_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn export_dir(&self) -> &Path {
        &self.export_dir
    }

    /// Generate a unique file name for a clip of the given MIME type
    pub fn generate_filename(&self, mime_type: &str) -> PathBuf {
        let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        let uuid = uuid::Uuid::new_v4().to_string()[..8].to_string();
        self.export_dir.join(format!(
            "memo_{}_{}.{}",
            timestamp,
            uuid,
            extension_for(mime_type)
        ))
    }

    /// Save `clip`, returning the path written
    pub fn save(&self, clip: &Clip, filename: Option<&Path>) -> Result<PathBuf, ExportError> {
        if clip.is_empty() {
            return Err(ExportError::Empty);
        }
        fs::create_dir_all(&self.export_dir)?;

        let path = match filename {
            Some(p) => p.to_path_buf(),
            None => self.generate_filename(clip.mime_type()),
        };

        match (clip.pcm_sample_rate(), clip.pcm_samples()) {
            (Some(sample_rate), Some(samples)) => {
                let spec = WavSpec {
                    channels: 1,
                    sample_rate,
                    bits_per_sample: 32,
                    sample_format: hound::SampleFormat::Float,
                };
                let writer = BufWriter::new(File::create(&path)?);
                let mut wav_writer = WavWriter::new(writer, spec)?;
                for sample in samples {
                    wav_writer.write_sample(sample)?;
                }
                wav_writer.finalize()?;
            }
            _ => fs::write(&path, clip.data())?,
        }

        log::info!(target: "accent::export", "saved {} bytes to {}", clip.len(), path.display());
        Ok(path)
    }

    /// Load a WAV file as a raw PCM clip. Only the first channel is kept.
    pub fn load(path: impl AsRef<Path>) -> Result<Clip, ExportError> {
        let reader = hound::WavReader::open(path.as_ref())?;
        let spec = reader.spec();
        let channels = spec.channels.max(1) as usize;

        let samples: Result<Vec<f32>, _> = match spec.sample_format {
            hound::SampleFormat::Float => reader.into_samples::<f32>().step_by(channels).collect(),
            hound::SampleFormat::Int => {
                let max_value = (1i64 << (spec.bits_per_sample - 1)) as f32;
                reader
                    .into_samples::<i32>()
                    .step_by(channels)
                    .map(|s| s.map(|v| v as f32 / max_value))
                    .collect()
            }
        };

        let bytes: Vec<u8> = samples?.iter().flat_map(|s| s.to_le_bytes()).collect();
        Ok(Clip::new(bytes, pcm_mime_type(spec.sample_rate)))
    }

    /// Exported files, newest first
    pub fn list(&self) -> Result<Vec<PathBuf>, ExportError> {
        if !self.export_dir.exists() {
            return Ok(Vec::new());
        }

        let mut exported: Vec<PathBuf> = fs::read_dir(&self.export_dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .collect();

        exported.sort_by(|a, b| {
            let a_time = a.metadata().and_then(|m| m.modified()).ok();
            let b_time = b.metadata().and_then(|m| m.modified()).ok();
            b_time.cmp(&a_time)
        });

        Ok(exported)
    }
}

impl Default for ClipExporter {
    fn default() -> Self {
        Self::new()
    }
}

fn extension_for(mime_type: &str) -> &'static str {
    let base = mime_type.split(';').next().unwrap_or_default().trim();
    match base {
        "audio/pcm" | "audio/wav" | "audio/x-wav" => "wav",
        "audio/webm" => "webm",
        "audio/ogg" => "ogg",
        "audio/mp4" => "m4a",
        "audio/mpeg" => "mp3",
        _ => "bin",
    }
}
