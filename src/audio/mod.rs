//! Capture and playback coordination
//!
//! This module provides:
//! - The recording state machine with its pause-spanning timeline
//! - The playback state machine and its completion signal
//! - Clip export to WAV or raw container files

mod capture;
mod export;
mod playback;
mod timeline;

pub use capture::{CaptureCoordinator, CaptureOptions};
pub use export::{ClipExporter, ExportError};
pub use playback::{Completion, PlaybackCoordinator, PlaybackOutcome};
pub use timeline::Timeline;
