//! Accent - capture/playback coordination for a voice memo recorder
//!
//! Two cooperating state machines sit at the core:
//!
//! - [`CaptureCoordinator`] owns a microphone session, acquires it lazily,
//!   re-acquires it when it goes inactive, and keeps one continuous timeline
//!   across pause/resume cycles.
//! - [`PlaybackCoordinator`] owns an output session and reports when a clip
//!   has finished playing.
//!
//! Every transition is debounced by an [`AsyncLock`], so overlapping triggers
//! (a button press racing a focus change) collapse into a single call. The
//! [`Orchestrator`] connects the two: it pulls the recording so far out of
//! capture and plays it back from the start of the latest recording run.
//!
//! Devices are abstracted behind the traits in [`device`]; an in-process mock
//! is always available and a PipeWire backend is behind the `pipewire`
//! feature.

pub mod audio;
pub mod cli;
pub mod console;
pub mod device;
pub mod diagnostics;
pub mod error;
pub mod focus;
pub mod lock;
pub mod metrics;
pub mod models;
pub mod orchestrator;
pub mod settings;

pub use audio::{
    CaptureCoordinator, CaptureOptions, ClipExporter, Completion, PlaybackCoordinator,
    PlaybackOutcome,
};
pub use error::{AcquisitionError, CoordinatorError, DeviceError};
pub use focus::{FocusEvent, FocusMonitor, FocusSignal};
pub use lock::AsyncLock;
pub use metrics::{MetricsSnapshot, SessionMetrics};
pub use models::{CaptureState, Clip, PlaybackState};
pub use orchestrator::{Command, Orchestrator};
pub use settings::{Settings, StopPolicy};
