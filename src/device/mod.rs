//! Device session contract.
//!
//! The coordinators never touch audio hardware directly. A capture backend
//! implements [`CaptureDevice`] (acquisition) and [`CaptureHandle`] (the live
//! stream plus encoder); an output backend implements [`OutputDevice`] and
//! [`OutputHandle`]. Devices report asynchronous happenings through the event
//! sender they receive at acquisition time.
//!
//! Releasing a handle must drop its event sender before returning, so no
//! callback outlives the stream it belongs to.

use std::fmt;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{AcquisitionError, DeviceError};
use crate::models::Clip;

pub mod mock;
#[cfg(feature = "pipewire")]
pub mod pipewire;

/// One fragment of encoded audio delivered between flush requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub data: Vec<u8>,
    pub mime_type: String,
}

/// Events emitted by a capture device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// Buffered data, delivered in answer to `request_data` or on stop.
    DataReady(Chunk),
    /// Non-fatal device error.
    Error(String),
    /// The stream vanished; the handle is unusable.
    BecameInactive,
    /// Informational lifecycle notification (`start`, `pause`, `resume`, `stop`).
    Lifecycle(&'static str),
}

pub type DeviceEventSender = mpsc::UnboundedSender<DeviceEvent>;
pub type DeviceEventReceiver = mpsc::UnboundedReceiver<DeviceEvent>;

/// Encoder condition as reported by the device itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderCondition {
    Inactive,
    Recording,
    Paused,
}

impl fmt::Display for RecorderCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Inactive => "inactive",
            Self::Recording => "recording",
            Self::Paused => "paused",
        };
        f.write_str(name)
    }
}

/// Source of capture device sessions (a microphone).
#[async_trait]
pub trait CaptureDevice: Send + Sync {
    /// Open the stream and its encoder. May wait on a user permission prompt.
    async fn acquire(
        &self,
        events: DeviceEventSender,
    ) -> Result<Box<dyn CaptureHandle>, AcquisitionError>;
}

/// A live capture stream plus encoder.
///
/// Primitives return once the device accepted the instruction; callers verify
/// the outcome through [`CaptureHandle::condition`].
pub trait CaptureHandle: Send {
    fn start(&mut self) -> Result<(), DeviceError>;

    fn pause(&mut self) -> Result<(), DeviceError>;

    fn resume(&mut self) -> Result<(), DeviceError>;

    /// Stop encoding; buffered data is delivered as a final `DataReady`.
    fn stop(&mut self) -> Result<(), DeviceError>;

    /// Flush buffered data as a `DataReady` event.
    fn request_data(&mut self) -> Result<(), DeviceError>;

    fn condition(&self) -> RecorderCondition;

    /// Whether the underlying stream is still live.
    fn is_active(&self) -> bool;

    /// Stop the stream's tracks and drop the event sender.
    fn release(&mut self);
}

/// Lifecycle events emitted by an output device.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    LoadStart,
    DurationChange(f64),
    LoadedMetadata,
    LoadedData,
    Progress,
    CanPlay,
    CanPlayThrough,
    Play,
    Playing,
    Waiting,
    Stalled,
    Suspend,
    Seeking,
    Seeked,
    TimeUpdate(f64),
    RateChange,
    VolumeChange,
    Pause,
    Emptied,
    Abort,
    Ended,
    Error(String),
}

impl MediaEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::LoadStart => "loadstart",
            Self::DurationChange(_) => "durationchange",
            Self::LoadedMetadata => "loadedmetadata",
            Self::LoadedData => "loadeddata",
            Self::Progress => "progress",
            Self::CanPlay => "canplay",
            Self::CanPlayThrough => "canplaythrough",
            Self::Play => "play",
            Self::Playing => "playing",
            Self::Waiting => "waiting",
            Self::Stalled => "stalled",
            Self::Suspend => "suspend",
            Self::Seeking => "seeking",
            Self::Seeked => "seeked",
            Self::TimeUpdate(_) => "timeupdate",
            Self::RateChange => "ratechange",
            Self::VolumeChange => "volumechange",
            Self::Pause => "pause",
            Self::Emptied => "emptied",
            Self::Abort => "abort",
            Self::Ended => "ended",
            Self::Error(_) => "error",
        }
    }
}

/// Identifies one [`OutputHandle::load`]. Assigned by the caller.
pub type SourceId = u64;

/// A media event tagged with the source it belongs to.
///
/// Events not tied to a particular source (an element error before any load,
/// for instance) carry the id of the most recently loaded source, or `0`.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceEvent {
    pub source: SourceId,
    pub event: MediaEvent,
}

pub type MediaEventSender = mpsc::UnboundedSender<SourceEvent>;
pub type MediaEventReceiver = mpsc::UnboundedReceiver<SourceEvent>;

/// Source of output device sessions (a speaker / audio element).
#[async_trait]
pub trait OutputDevice: Send + Sync {
    async fn acquire(
        &self,
        events: MediaEventSender,
    ) -> Result<Box<dyn OutputHandle>, AcquisitionError>;
}

/// A live output element. Reused across plays.
pub trait OutputHandle: Send {
    /// Replace the current source with `clip`. Every event emitted from here
    /// until the next `load` must carry `source`.
    fn load(&mut self, source: SourceId, clip: &Clip) -> Result<(), DeviceError>;

    /// Move the playback cursor, in seconds.
    fn seek(&mut self, position_secs: f64) -> Result<(), DeviceError>;

    fn play(&mut self) -> Result<(), DeviceError>;

    fn pause(&mut self) -> Result<(), DeviceError>;

    /// Stop output and drop the event sender.
    fn release(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names() {
        assert_eq!(MediaEvent::CanPlayThrough.name(), "canplaythrough");
        assert_eq!(MediaEvent::TimeUpdate(1.5).name(), "timeupdate");
        assert_eq!(MediaEvent::Error("decode".into()).name(), "error");
        assert_eq!(RecorderCondition::Paused.to_string(), "paused");
    }
}
