//! Playback state machine: `UnInitialized → Ready ⇄ Playing`.
//!
//! The output device is acquired once by [`PlaybackCoordinator::setup_audio`]
//! and reused for every clip. A listener task consumes the device's media
//! events; an `ended` event returns the coordinator to `Ready` and resolves the
//! [`Completion`] handed out by [`PlaybackCoordinator::play`].

use std::sync::Arc;

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::device::{
    MediaEvent, MediaEventReceiver, OutputDevice, OutputHandle, SourceEvent, SourceId,
};
use crate::error::{CoordinatorError, DeviceError};
use crate::models::{Clip, PlaybackState};

const TARGET: &str = "accent::playback";
const STATE_CHANNEL_CAPACITY: usize = 64;

/// How a clip's playback came to an end.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackOutcome {
    /// The device played the clip to the end.
    Ended,
    Cancelled,
    /// Another clip was started in its place.
    Replaced,
    /// The device reported an error mid-clip.
    Failed(String),
}

/// Resolves once the clip passed to `play` stops playing, for whatever reason.
#[derive(Debug)]
pub struct Completion {
    rx: oneshot::Receiver<PlaybackOutcome>,
}

impl Completion {
    pub async fn wait(self) -> PlaybackOutcome {
        // The sender only disappears without a value on shutdown.
        self.rx.await.unwrap_or(PlaybackOutcome::Cancelled)
    }
}

struct Inner {
    state: PlaybackState,
    handle: Option<Box<dyn OutputHandle>>,
    completion: Option<oneshot::Sender<PlaybackOutcome>>,
    /// Source of the clip handed out last. Events for any other source are
    /// leftovers of a replaced clip.
    source: SourceId,
}

struct Shared {
    inner: Mutex<Inner>,
    state_tx: broadcast::Sender<PlaybackState>,
}

impl Shared {
    fn set_state(&self, inner: &mut Inner, state: PlaybackState) {
        if inner.state == state {
            return;
        }
        debug!(target: TARGET, "state {} -> {}", inner.state, state);
        inner.state = state;
        let _ = self.state_tx.send(state);
    }

    fn finish(&self, inner: &mut Inner, outcome: PlaybackOutcome) {
        if let Some(completion) = inner.completion.take() {
            let _ = completion.send(outcome);
        }
        if inner.state == PlaybackState::Playing {
            self.set_state(inner, PlaybackState::Ready);
        }
    }

    fn on_event(&self, SourceEvent { source, event }: SourceEvent) {
        let mut inner = self.inner.lock();
        let current = source == inner.source && inner.state == PlaybackState::Playing;
        match event {
            MediaEvent::Ended if current => {
                info!(target: TARGET, "clip ended");
                self.finish(&mut inner, PlaybackOutcome::Ended);
            }
            MediaEvent::Error(message) => {
                warn!(target: TARGET, "output device error: {}", message);
                if current {
                    self.finish(&mut inner, PlaybackOutcome::Failed(message));
                }
            }
            _ => {}
        }
    }
}

async fn listen(shared: Arc<Shared>, mut events: MediaEventReceiver) {
    while let Some(tagged) = events.recv().await {
        let (source, event) = (tagged.source, &tagged.event);
        match event {
            MediaEvent::DurationChange(secs) | MediaEvent::TimeUpdate(secs) => {
                debug!(target: TARGET, "media event #{}: {} ({:.2}s)", source, event.name(), secs)
            }
            _ => debug!(target: TARGET, "media event #{}: {}", source, event.name()),
        }
        shared.on_event(tagged);
    }
    debug!(target: TARGET, "media event stream closed");
}

pub struct PlaybackCoordinator {
    device: Arc<dyn OutputDevice>,
    shared: Arc<Shared>,
    setup: tokio::sync::Mutex<()>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl PlaybackCoordinator {
    pub fn new(device: Arc<dyn OutputDevice>) -> Self {
        let (state_tx, _) = broadcast::channel(STATE_CHANNEL_CAPACITY);
        Self {
            device,
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: PlaybackState::UnInitialized,
                    handle: None,
                    completion: None,
                    source: 0,
                }),
                state_tx,
            }),
            setup: tokio::sync::Mutex::new(()),
            listener: Mutex::new(None),
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.shared.inner.lock().state
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlaybackState> {
        self.shared.state_tx.subscribe()
    }

    /// Acquire the output device and start listening to it. Idempotent.
    pub async fn setup_audio(&self) -> Result<(), CoordinatorError> {
        let _setup = self.setup.lock().await;
        let state = self.state();
        if state != PlaybackState::UnInitialized {
            debug!(target: TARGET, "setup_audio: already {}", state);
            return Ok(());
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let handle = self.device.acquire(events_tx).await.map_err(|err| {
            error!(target: TARGET, "setup_audio: failed to acquire output device: {}", err);
            err
        })?;

        let listener = tokio::spawn(listen(Arc::clone(&self.shared), events_rx));
        if let Some(previous) = self.listener.lock().replace(listener) {
            previous.abort();
        }

        let mut inner = self.shared.inner.lock();
        inner.handle = Some(handle);
        self.shared.set_state(&mut inner, PlaybackState::Ready);
        info!(target: TARGET, "setup_audio: output device ready");
        Ok(())
    }

    /// Play `clip` from `offset_secs` (clamped to zero).
    ///
    /// Replaces the clip already playing, if any; its completion resolves
    /// [`PlaybackOutcome::Replaced`]. If the device refuses the new clip while
    /// another was playing, the old one is stopped and resolves `Failed`.
    pub fn play(&self, clip: &Clip, offset_secs: f64) -> Result<Completion, CoordinatorError> {
        let mut inner = self.shared.inner.lock();
        let state = inner.state;
        if state == PlaybackState::UnInitialized {
            return Err(CoordinatorError::invalid_state("play", state));
        }
        let offset = offset_secs.max(0.0);

        let source = inner.source + 1;
        let Some(handle) = inner.handle.as_deref_mut() else {
            return Err(CoordinatorError::DeviceInactive);
        };
        if state == PlaybackState::Playing {
            if let Err(err) = handle.pause() {
                debug!(target: TARGET, "play: pausing previous clip: {}", err);
            }
        }
        let started = begin(handle, source, clip, offset);
        inner.source = source;
        if let Err(err) = started {
            warn!(target: TARGET, "play: {}", err);
            let reason = err.to_string();
            self.shared.finish(&mut inner, PlaybackOutcome::Failed(reason.clone()));
            return Err(match err {
                DeviceError::Inactive => CoordinatorError::DeviceInactive,
                DeviceError::Rejected(_) => {
                    CoordinatorError::transition_failed("play", PlaybackState::Playing, reason)
                }
            });
        }
        let (tx, rx) = oneshot::channel();
        if let Some(previous) = inner.completion.replace(tx) {
            let _ = previous.send(PlaybackOutcome::Replaced);
        }
        self.shared.set_state(&mut inner, PlaybackState::Playing);
        info!(
            target: TARGET,
            "play: source #{}, {} bytes of {} from {:.2}s",
            source,
            clip.len(),
            clip.mime_type(),
            offset
        );
        Ok(Completion { rx })
    }

    /// Stop whatever is playing. Always succeeds.
    pub fn cancel(&self) {
        let mut inner = self.shared.inner.lock();
        if let Some(handle) = inner.handle.as_deref_mut() {
            if let Err(err) = handle.pause() {
                debug!(target: TARGET, "cancel: {}", err);
            }
        }
        if inner.state == PlaybackState::Playing {
            debug!(target: TARGET, "cancel: playback cancelled");
        }
        self.shared.finish(&mut inner, PlaybackOutcome::Cancelled);
    }

    /// Release the output device and stop listening to it.
    pub fn shutdown(&self) {
        if let Some(listener) = self.listener.lock().take() {
            listener.abort();
        }
        let mut inner = self.shared.inner.lock();
        if let Some(mut handle) = inner.handle.take() {
            handle.release();
            debug!(target: TARGET, "shutdown: released output device");
        }
        if let Some(completion) = inner.completion.take() {
            let _ = completion.send(PlaybackOutcome::Cancelled);
        }
        self.shared.set_state(&mut inner, PlaybackState::UnInitialized);
    }
}

impl Drop for PlaybackCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn begin(
    handle: &mut dyn OutputHandle,
    source: SourceId,
    clip: &Clip,
    offset: f64,
) -> Result<(), DeviceError> {
    handle.load(source, clip)?;
    handle.seek(offset)?;
    handle.play()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::MockSpeaker;
    use crate::device::MediaEventSender;
    use crate::error::AcquisitionError;
    use crate::models::{encode_pcm, pcm_mime_type};
    use async_trait::async_trait;

    fn clip(secs: f64) -> Clip {
        let samples = vec![0.1f32; (secs * 1000.0) as usize];
        Clip::new(encode_pcm(&samples), pcm_mime_type(1000))
    }

    async fn ready(speaker: &MockSpeaker) -> PlaybackCoordinator {
        let playback = PlaybackCoordinator::new(Arc::new(speaker.clone()));
        playback.setup_audio().await.unwrap();
        playback
    }

    async fn settle() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    /// Output element that reports nothing on its own; the test sends every
    /// event by hand.
    #[derive(Clone, Default)]
    struct BareSpeaker {
        link: Arc<Mutex<Option<(MediaEventSender, SourceId)>>>,
    }

    impl BareSpeaker {
        fn source(&self) -> SourceId {
            self.link.lock().as_ref().map_or(0, |(_, source)| *source)
        }

        fn send_for(&self, source: SourceId, event: MediaEvent) {
            if let Some((events, _)) = self.link.lock().as_ref() {
                events.send(SourceEvent { source, event }).unwrap();
            }
        }

        fn send(&self, event: MediaEvent) {
            self.send_for(self.source(), event);
        }
    }

    struct BareOutput {
        link: Arc<Mutex<Option<(MediaEventSender, SourceId)>>>,
    }

    #[async_trait]
    impl OutputDevice for BareSpeaker {
        async fn acquire(
            &self,
            events: MediaEventSender,
        ) -> Result<Box<dyn OutputHandle>, AcquisitionError> {
            *self.link.lock() = Some((events, 0));
            Ok(Box::new(BareOutput {
                link: Arc::clone(&self.link),
            }))
        }
    }

    impl OutputHandle for BareOutput {
        fn load(&mut self, source: SourceId, _clip: &Clip) -> Result<(), DeviceError> {
            if let Some(link) = self.link.lock().as_mut() {
                link.1 = source;
            }
            Ok(())
        }

        fn seek(&mut self, _position_secs: f64) -> Result<(), DeviceError> {
            Ok(())
        }

        fn play(&mut self) -> Result<(), DeviceError> {
            Ok(())
        }

        fn pause(&mut self) -> Result<(), DeviceError> {
            Ok(())
        }

        fn release(&mut self) {
            *self.link.lock() = None;
        }
    }

    #[tokio::test]
    async fn test_play_requires_setup() {
        let playback = PlaybackCoordinator::new(Arc::new(MockSpeaker::new()));
        let err = playback.play(&clip(1.0), 0.0).unwrap_err();
        assert_eq!(
            err,
            CoordinatorError::invalid_state("play", PlaybackState::UnInitialized)
        );
        playback.cancel();
        assert_eq!(playback.state(), PlaybackState::UnInitialized);
    }

    #[tokio::test]
    async fn test_setup_is_idempotent() {
        let speaker = MockSpeaker::new();
        let playback = PlaybackCoordinator::new(Arc::new(speaker.clone()));

        let (a, b) = tokio::join!(playback.setup_audio(), playback.setup_audio());
        a.unwrap();
        b.unwrap();
        playback.setup_audio().await.unwrap();
        assert_eq!(speaker.acquisitions(), 1);
        assert_eq!(playback.state(), PlaybackState::Ready);
    }

    #[tokio::test]
    async fn test_setup_failure_stays_uninitialized() {
        let speaker = MockSpeaker::new();
        speaker.fail_next_acquire(AcquisitionError::NoDevice);
        let playback = PlaybackCoordinator::new(Arc::new(speaker.clone()));

        assert!(playback.setup_audio().await.unwrap_err().is_acquisition());
        assert_eq!(playback.state(), PlaybackState::UnInitialized);
        playback.setup_audio().await.unwrap();
        assert_eq!(playback.state(), PlaybackState::Ready);
    }

    #[tokio::test]
    async fn test_ended_returns_to_ready_once() {
        let speaker = MockSpeaker::new();
        let playback = ready(&speaker).await;
        let mut states = playback.subscribe();

        let completion = playback.play(&clip(3.0), 2.0).unwrap();
        assert_eq!(speaker.last_seek(), Some(2.0));
        settle().await;
        assert!(speaker.finish());

        assert_eq!(completion.wait().await, PlaybackOutcome::Ended);
        assert_eq!(states.recv().await.unwrap(), PlaybackState::Playing);
        assert_eq!(states.recv().await.unwrap(), PlaybackState::Ready);

        playback.cancel();
        assert_eq!(playback.state(), PlaybackState::Ready);
        assert!(states.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_negative_offset_is_clamped() {
        let speaker = MockSpeaker::new();
        let playback = ready(&speaker).await;
        playback.play(&clip(1.0), -0.7).unwrap();
        assert_eq!(speaker.last_seek(), Some(0.0));
    }

    #[tokio::test]
    async fn test_play_while_playing_replaces() {
        let speaker = MockSpeaker::new();
        let playback = ready(&speaker).await;

        let first = playback.play(&clip(1.0), 0.0).unwrap();
        let second = playback.play(&clip(1.0), 0.5).unwrap();
        assert_eq!(first.wait().await, PlaybackOutcome::Replaced);
        assert_eq!(playback.state(), PlaybackState::Playing);
        assert_eq!(speaker.loads(), 2);

        playback.cancel();
        assert_eq!(second.wait().await, PlaybackOutcome::Cancelled);
        assert_eq!(playback.state(), PlaybackState::Ready);
        assert!(!speaker.is_playing());
    }

    #[tokio::test]
    async fn test_stale_end_does_not_stop_next_clip() {
        let speaker = MockSpeaker::new();
        let playback = ready(&speaker).await;

        let first = playback.play(&clip(1.0), 0.0).unwrap();
        settle().await;
        assert!(speaker.finish());
        let _second = playback.play(&clip(1.0), 0.0).unwrap();

        assert_eq!(first.wait().await, PlaybackOutcome::Replaced);
        settle().await;
        assert_eq!(playback.state(), PlaybackState::Playing);
    }

    #[tokio::test]
    async fn test_device_error_fails_clip() {
        let speaker = MockSpeaker::new();
        let playback = ready(&speaker).await;

        let completion = playback.play(&clip(1.0), 0.0).unwrap();
        settle().await;
        speaker.emit(MediaEvent::Error("decode".into()));
        assert_eq!(
            completion.wait().await,
            PlaybackOutcome::Failed("decode".into())
        );
        assert_eq!(playback.state(), PlaybackState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_realtime_clip_ends_on_its_own() {
        let speaker = MockSpeaker::realtime();
        let playback = ready(&speaker).await;

        let completion = playback.play(&clip(2.0), 1.5).unwrap();
        assert_eq!(completion.wait().await, PlaybackOutcome::Ended);
        assert_eq!(playback.state(), PlaybackState::Ready);
    }

    #[tokio::test]
    async fn test_shutdown_releases_device() {
        let speaker = MockSpeaker::new();
        let playback = ready(&speaker).await;
        let completion = playback.play(&clip(1.0), 0.0).unwrap();

        playback.shutdown();
        assert_eq!(completion.wait().await, PlaybackOutcome::Cancelled);
        assert_eq!(playback.state(), PlaybackState::UnInitialized);
        assert_eq!(speaker.releases(), 1);
    }

    #[tokio::test]
    async fn test_ended_alone_finishes_clip() {
        let speaker = BareSpeaker::default();
        let playback = PlaybackCoordinator::new(Arc::new(speaker.clone()));
        playback.setup_audio().await.unwrap();
        let mut states = playback.subscribe();

        let completion = playback.play(&clip(3.0), 2.0).unwrap();
        speaker.send(MediaEvent::Ended);

        assert_eq!(completion.wait().await, PlaybackOutcome::Ended);
        assert_eq!(playback.state(), PlaybackState::Ready);
        assert_eq!(states.recv().await.unwrap(), PlaybackState::Playing);
        assert_eq!(states.recv().await.unwrap(), PlaybackState::Ready);

        speaker.send(MediaEvent::Ended);
        settle().await;
        assert!(states.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_end_of_replaced_source_is_ignored() {
        let speaker = BareSpeaker::default();
        let playback = PlaybackCoordinator::new(Arc::new(speaker.clone()));
        playback.setup_audio().await.unwrap();

        let first = playback.play(&clip(1.0), 0.0).unwrap();
        let replaced = speaker.source();
        let second = playback.play(&clip(1.0), 0.0).unwrap();
        assert_ne!(speaker.source(), replaced);

        speaker.send_for(replaced, MediaEvent::Ended);
        settle().await;
        assert_eq!(playback.state(), PlaybackState::Playing);
        assert_eq!(first.wait().await, PlaybackOutcome::Replaced);

        speaker.send(MediaEvent::Ended);
        assert_eq!(second.wait().await, PlaybackOutcome::Ended);
        assert_eq!(playback.state(), PlaybackState::Ready);
    }
}
