//! In-process devices for tests and hardware-free runs.
//!
//! [`MockMicrophone`] synthesizes a quiet 440 Hz tone as raw PCM chunks sized by
//! how long it has been recording since the previous flush. [`MockSpeaker`]
//! "plays" a clip by emitting the usual media events, and either ends on its
//! own after the clip's duration ([`MockSpeaker::realtime`]) or when told to
//! ([`MockSpeaker::finish`]).
//!
//! Both are cheap to clone; clones share the same controls, so a test can
//! keep one copy while the coordinator owns another.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::{
    CaptureDevice, CaptureHandle, Chunk, DeviceEvent, DeviceEventSender, MediaEvent,
    MediaEventSender, OutputDevice, OutputHandle, RecorderCondition, SourceEvent, SourceId,
};
use crate::error::{AcquisitionError, DeviceError};
use crate::models::{encode_pcm, pcm_mime_type, Clip};

const TONE_HZ: f64 = 440.0;
const TONE_AMPLITUDE: f64 = 0.2;

#[derive(Clone)]
pub struct MockMicrophone {
    shared: Arc<Mutex<MicShared>>,
}

struct MicShared {
    sample_rate: u32,
    acquire_delay: Duration,
    failures: VecDeque<AcquisitionError>,
    acquisitions: u32,
    releases: u32,
    stalled: bool,
    silent: bool,
    refuse_flushes: bool,
    current: Option<StreamLink>,
}

/// Link to the newest stream so tests can inject faults into it.
struct StreamLink {
    active: Arc<AtomicBool>,
    events: DeviceEventSender,
}

impl MockMicrophone {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(MicShared {
                sample_rate: 16000,
                acquire_delay: Duration::ZERO,
                failures: VecDeque::new(),
                acquisitions: 0,
                releases: 0,
                stalled: false,
                silent: false,
                refuse_flushes: false,
                current: None,
            })),
        }
    }

    pub fn with_sample_rate(self, rate: u32) -> Self {
        self.shared.lock().sample_rate = rate;
        self
    }

    /// Simulate a permission prompt that takes `delay` to answer.
    pub fn with_acquire_delay(self, delay: Duration) -> Self {
        self.shared.lock().acquire_delay = delay;
        self
    }

    /// Make the next acquisition fail with `error`. Failures queue up.
    pub fn fail_next_acquire(&self, error: AcquisitionError) {
        self.shared.lock().failures.push_back(error);
    }

    /// When stalled, the recorder accepts instructions but never changes condition.
    pub fn set_stalled(&self, stalled: bool) {
        self.shared.lock().stalled = stalled;
    }

    /// When refusing, flush requests are rejected outright.
    pub fn set_refuse_flushes(&self, refuse: bool) {
        self.shared.lock().refuse_flushes = refuse;
    }

    /// When silent, flush requests produce no data event.
    pub fn set_silent(&self, silent: bool) {
        self.shared.lock().silent = silent;
    }

    /// Mark the current stream inactive without telling anyone.
    pub fn deactivate(&self) {
        if let Some(link) = &self.shared.lock().current {
            link.active.store(false, Ordering::SeqCst);
        }
    }

    /// Mark the current stream inactive and emit `BecameInactive`.
    pub fn disconnect(&self) {
        if let Some(link) = &self.shared.lock().current {
            link.active.store(false, Ordering::SeqCst);
            let _ = link.events.send(DeviceEvent::BecameInactive);
        }
    }

    /// Emit a non-fatal error event on the current stream.
    pub fn emit_error(&self, message: &str) {
        if let Some(link) = &self.shared.lock().current {
            let _ = link.events.send(DeviceEvent::Error(message.to_string()));
        }
    }

    pub fn acquisitions(&self) -> u32 {
        self.shared.lock().acquisitions
    }

    pub fn releases(&self) -> u32 {
        self.shared.lock().releases
    }
}

impl Default for MockMicrophone {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CaptureDevice for MockMicrophone {
    async fn acquire(
        &self,
        events: DeviceEventSender,
    ) -> Result<Box<dyn CaptureHandle>, AcquisitionError> {
        let delay = self.shared.lock().acquire_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut shared = self.shared.lock();
        if let Some(error) = shared.failures.pop_front() {
            debug!(target: "accent::device::mock", "acquire: failing with {}", error);
            return Err(error);
        }
        shared.acquisitions += 1;

        let active = Arc::new(AtomicBool::new(true));
        shared.current = Some(StreamLink {
            active: Arc::clone(&active),
            events: events.clone(),
        });

        Ok(Box::new(MockRecorder {
            shared: Arc::clone(&self.shared),
            events: Some(events),
            active,
            condition: RecorderCondition::Inactive,
            buffered: Duration::ZERO,
            run_started: None,
            sample_rate: shared.sample_rate,
            samples_emitted: 0,
        }))
    }
}

struct MockRecorder {
    shared: Arc<Mutex<MicShared>>,
    events: Option<DeviceEventSender>,
    active: Arc<AtomicBool>,
    condition: RecorderCondition,
    /// Recorded but not yet flushed, excluding the running span.
    buffered: Duration,
    run_started: Option<Instant>,
    sample_rate: u32,
    samples_emitted: u64,
}

impl MockRecorder {
    fn check_live(&self) -> Result<bool, DeviceError> {
        if !self.active.load(Ordering::SeqCst) || self.events.is_none() {
            return Err(DeviceError::Inactive);
        }
        Ok(!self.shared.lock().stalled)
    }

    fn emit(&self, event: DeviceEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    fn close_span(&mut self) {
        if let Some(started) = self.run_started.take() {
            self.buffered += Instant::now().saturating_duration_since(started);
        }
    }

    fn flush(&mut self) {
        if self.shared.lock().silent {
            return;
        }
        let recording = self.run_started.is_some();
        self.close_span();
        if recording {
            self.run_started = Some(Instant::now());
        }

        let count = (self.buffered.as_secs_f64() * self.sample_rate as f64).round() as u64;
        self.buffered = Duration::ZERO;

        let rate = self.sample_rate as f64;
        let samples: Vec<f32> = (self.samples_emitted..self.samples_emitted + count)
            .map(|n| {
                let t = n as f64 / rate;
                ((2.0 * std::f64::consts::PI * TONE_HZ * t).sin() * TONE_AMPLITUDE) as f32
            })
            .collect();
        self.samples_emitted += count;

        self.emit(DeviceEvent::DataReady(Chunk {
            data: encode_pcm(&samples),
            mime_type: pcm_mime_type(self.sample_rate),
        }));
    }
}

impl CaptureHandle for MockRecorder {
    fn start(&mut self) -> Result<(), DeviceError> {
        if !self.check_live()? {
            return Ok(());
        }
        if self.condition != RecorderCondition::Inactive {
            return Err(DeviceError::Rejected(format!(
                "cannot start while {}",
                self.condition
            )));
        }
        self.condition = RecorderCondition::Recording;
        self.buffered = Duration::ZERO;
        self.run_started = Some(Instant::now());
        self.emit(DeviceEvent::Lifecycle("start"));
        Ok(())
    }

    fn pause(&mut self) -> Result<(), DeviceError> {
        if !self.check_live()? {
            return Ok(());
        }
        match self.condition {
            RecorderCondition::Recording => self.close_span(),
            // Priming a dormant encoder: it starts out paused.
            RecorderCondition::Inactive => self.buffered = Duration::ZERO,
            RecorderCondition::Paused => return Ok(()),
        }
        self.condition = RecorderCondition::Paused;
        self.emit(DeviceEvent::Lifecycle("pause"));
        Ok(())
    }

    fn resume(&mut self) -> Result<(), DeviceError> {
        if !self.check_live()? {
            return Ok(());
        }
        if self.condition != RecorderCondition::Paused {
            return Err(DeviceError::Rejected(format!(
                "cannot resume while {}",
                self.condition
            )));
        }
        self.condition = RecorderCondition::Recording;
        self.run_started = Some(Instant::now());
        self.emit(DeviceEvent::Lifecycle("resume"));
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DeviceError> {
        if !self.check_live()? {
            return Ok(());
        }
        if self.condition == RecorderCondition::Inactive {
            return Ok(());
        }
        self.flush();
        self.run_started = None;
        self.condition = RecorderCondition::Inactive;
        self.emit(DeviceEvent::Lifecycle("stop"));
        Ok(())
    }

    fn request_data(&mut self) -> Result<(), DeviceError> {
        self.check_live()?;
        if self.condition == RecorderCondition::Inactive {
            return Err(DeviceError::Rejected("recorder is inactive".into()));
        }
        if self.shared.lock().refuse_flushes {
            return Err(DeviceError::Rejected("flush refused".into()));
        }
        self.flush();
        Ok(())
    }

    fn condition(&self) -> RecorderCondition {
        self.condition
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn release(&mut self) {
        self.active.store(false, Ordering::SeqCst);
        self.events = None;
        self.condition = RecorderCondition::Inactive;
        self.run_started = None;

        let mut shared = self.shared.lock();
        shared.releases += 1;
        let is_current = shared
            .current
            .as_ref()
            .is_some_and(|link| Arc::ptr_eq(&link.active, &self.active));
        if is_current {
            shared.current = None;
        }
    }
}

#[derive(Clone)]
pub struct MockSpeaker {
    shared: Arc<Mutex<SpeakerShared>>,
}

struct SpeakerShared {
    auto_end: bool,
    failures: VecDeque<AcquisitionError>,
    acquisitions: u32,
    releases: u32,
    loads: u32,
    last_seek: Option<f64>,
    playing: bool,
    /// Bumped on every load/play/pause so a stale end timer can tell it lost.
    generation: u64,
    duration: Option<f64>,
    position: f64,
    source: SourceId,
    events: Option<MediaEventSender>,
}

impl MockSpeaker {
    /// A speaker that only ends when [`MockSpeaker::finish`] is called.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(SpeakerShared {
                auto_end: false,
                failures: VecDeque::new(),
                acquisitions: 0,
                releases: 0,
                loads: 0,
                last_seek: None,
                playing: false,
                generation: 0,
                duration: None,
                position: 0.0,
                source: 0,
                events: None,
            })),
        }
    }

    /// A speaker that ends each clip after its remaining duration.
    pub fn realtime() -> Self {
        let speaker = Self::new();
        speaker.shared.lock().auto_end = true;
        speaker
    }

    pub fn fail_next_acquire(&self, error: AcquisitionError) {
        self.shared.lock().failures.push_back(error);
    }

    /// End the current clip now. Returns `false` when nothing was playing.
    pub fn finish(&self) -> bool {
        let mut shared = self.shared.lock();
        if !shared.playing {
            return false;
        }
        shared.playing = false;
        shared.generation += 1;
        send_all(&shared, [MediaEvent::Ended]);
        true
    }

    /// Emit an arbitrary media event for the current source.
    pub fn emit(&self, event: MediaEvent) {
        send_all(&self.shared.lock(), [event]);
    }

    pub fn acquisitions(&self) -> u32 {
        self.shared.lock().acquisitions
    }

    pub fn releases(&self) -> u32 {
        self.shared.lock().releases
    }

    pub fn loads(&self) -> u32 {
        self.shared.lock().loads
    }

    pub fn last_seek(&self) -> Option<f64> {
        self.shared.lock().last_seek
    }

    pub fn is_playing(&self) -> bool {
        self.shared.lock().playing
    }
}

impl Default for MockSpeaker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OutputDevice for MockSpeaker {
    async fn acquire(
        &self,
        events: MediaEventSender,
    ) -> Result<Box<dyn OutputHandle>, AcquisitionError> {
        let mut shared = self.shared.lock();
        if let Some(error) = shared.failures.pop_front() {
            return Err(error);
        }
        shared.acquisitions += 1;
        shared.events = Some(events);
        Ok(Box::new(MockOutput {
            shared: Arc::clone(&self.shared),
            released: false,
        }))
    }
}

struct MockOutput {
    shared: Arc<Mutex<SpeakerShared>>,
    released: bool,
}

impl MockOutput {
    fn live(&self) -> Result<parking_lot::MutexGuard<'_, SpeakerShared>, DeviceError> {
        if self.released {
            return Err(DeviceError::Inactive);
        }
        Ok(self.shared.lock())
    }
}

fn send_all(shared: &SpeakerShared, events: impl IntoIterator<Item = MediaEvent>) {
    if let Some(sender) = &shared.events {
        for event in events {
            let _ = sender.send(SourceEvent {
                source: shared.source,
                event,
            });
        }
    }
}

impl OutputHandle for MockOutput {
    fn load(&mut self, source: SourceId, clip: &Clip) -> Result<(), DeviceError> {
        let mut shared = self.live()?;
        shared.loads += 1;
        shared.source = source;
        shared.playing = false;
        shared.generation += 1;
        shared.position = 0.0;
        shared.duration = clip.duration_secs();

        let mut events = vec![MediaEvent::Emptied, MediaEvent::LoadStart];
        if let Some(duration) = shared.duration {
            events.push(MediaEvent::DurationChange(duration));
        }
        events.extend([
            MediaEvent::LoadedMetadata,
            MediaEvent::LoadedData,
            MediaEvent::CanPlay,
            MediaEvent::CanPlayThrough,
        ]);
        send_all(&shared, events);
        Ok(())
    }

    fn seek(&mut self, position_secs: f64) -> Result<(), DeviceError> {
        let mut shared = self.live()?;
        shared.last_seek = Some(position_secs);
        shared.position = position_secs;
        send_all(
            &shared,
            [
                MediaEvent::Seeking,
                MediaEvent::TimeUpdate(position_secs),
                MediaEvent::Seeked,
            ],
        );
        Ok(())
    }

    fn play(&mut self) -> Result<(), DeviceError> {
        let mut shared = self.live()?;
        shared.playing = true;
        shared.generation += 1;
        send_all(&shared, [MediaEvent::Play, MediaEvent::Playing]);

        if shared.auto_end {
            let remaining = (shared.duration.unwrap_or(0.0) - shared.position).max(0.0);
            let generation = shared.generation;
            let speaker = Arc::clone(&self.shared);
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(async move {
                        tokio::time::sleep(Duration::from_secs_f64(remaining)).await;
                        let mut shared = speaker.lock();
                        if shared.playing && shared.generation == generation {
                            shared.playing = false;
                            send_all(&shared, [MediaEvent::Ended]);
                        }
                    });
                }
                Err(_) => debug!(target: "accent::device::mock", "play: no runtime, clip will not end"),
            }
        }
        Ok(())
    }

    fn pause(&mut self) -> Result<(), DeviceError> {
        let mut shared = self.live()?;
        if shared.playing {
            shared.playing = false;
            shared.generation += 1;
            send_all(&shared, [MediaEvent::Pause]);
        }
        Ok(())
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let mut shared = self.shared.lock();
        shared.playing = false;
        shared.generation += 1;
        shared.events = None;
        shared.releases += 1;
    }
}
