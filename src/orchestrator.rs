//! Wiring between user commands, focus changes and the two coordinators.
//!
//! The coordinators never call each other. The orchestrator pulls a clip out
//! of capture, pauses it, and hands the clip to playback; when the clip plays
//! to its end it resumes capture so the user can keep talking.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::audio::{CaptureCoordinator, PlaybackCoordinator, PlaybackOutcome};
use crate::error::CoordinatorError;
use crate::focus::FocusEvent;
use crate::models::{CaptureState, Clip};
use crate::settings::Settings;

const TARGET: &str = "accent::orchestrator";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Record,
    /// Play back what was said since the last interruption.
    ///
    /// While recording, or paused mid-recording, this takes the audio held
    /// by capture and leaves capture paused. Once capture is stopped it
    /// replays the clip played last.
    Play,
    Pause,
    Stop,
    Restart,
    /// Stop playback only.
    Cancel,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Record => "record",
            Self::Play => "play",
            Self::Pause => "pause",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Cancel => "cancel",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
struct Replay {
    clip: Clip,
    offset: f64,
}

pub struct Orchestrator {
    capture: Arc<CaptureCoordinator>,
    playback: Arc<PlaybackCoordinator>,
    settings: Settings,
    focused: Arc<AtomicBool>,
    replay: Mutex<Option<Replay>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(
        capture: Arc<CaptureCoordinator>,
        playback: Arc<PlaybackCoordinator>,
        settings: Settings,
    ) -> Self {
        Self {
            capture,
            playback,
            settings,
            focused: Arc::new(AtomicBool::new(false)),
            replay: Mutex::new(None),
            watcher: Mutex::new(None),
        }
    }

    pub fn capture(&self) -> &Arc<CaptureCoordinator> {
        &self.capture
    }

    pub fn playback(&self) -> &Arc<PlaybackCoordinator> {
        &self.playback
    }

    pub fn is_focused(&self) -> bool {
        self.focused.load(Ordering::SeqCst)
    }

    /// The clip most recently handed to playback.
    pub fn last_clip(&self) -> Option<Clip> {
        self.replay.lock().as_ref().map(|replay| replay.clip.clone())
    }

    /// Make `clip` the one `Play` replays when nothing is being recorded.
    pub fn set_last_clip(&self, clip: Clip) {
        *self.replay.lock() = Some(Replay { clip, offset: 0.0 });
    }

    /// Prepare the output device, and the capture device too when configured.
    pub async fn launch(&self) -> Result<(), CoordinatorError> {
        self.playback.setup_audio().await?;
        if self.settings.acquire_on_launch {
            self.capture.initialize().await?;
        }
        Ok(())
    }

    pub async fn handle_command(&self, command: Command) -> Result<(), CoordinatorError> {
        debug!(target: TARGET, "command: {}", command);
        let result = match command {
            Command::Record => {
                self.playback.cancel();
                self.capture.start().await
            }
            Command::Play => self.play().await,
            Command::Pause => self.capture.pause().await,
            Command::Stop => {
                self.playback.cancel();
                self.capture.stop().await
            }
            Command::Restart => self.capture.restart().await,
            Command::Cancel => {
                self.playback.cancel();
                Ok(())
            }
        };
        if let Err(err) = &result {
            warn!(target: TARGET, "{}: {}", command, err);
        }
        result
    }

    pub async fn handle_focus(&self, event: FocusEvent) -> Result<(), CoordinatorError> {
        debug!(target: TARGET, "focus: {:?}", event);
        let result = match event {
            FocusEvent::GainedFocus => {
                self.focused.store(true, Ordering::SeqCst);
                if self.settings.listen_on_focus {
                    self.capture.start().await
                } else {
                    Ok(())
                }
            }
            FocusEvent::LostFocus => {
                self.focused.store(false, Ordering::SeqCst);
                self.playback.cancel();
                self.capture.stop().await
            }
        };
        if let Err(err) = &result {
            warn!(target: TARGET, "focus {:?}: {}", event, err);
        }
        result
    }

    pub async fn shutdown(&self) {
        if let Some(watcher) = self.watcher.lock().take() {
            watcher.abort();
        }
        self.playback.shutdown();
        self.capture.shutdown().await;
        info!(target: TARGET, "shut down");
    }

    async fn play(&self) -> Result<(), CoordinatorError> {
        let state = self.capture.state();
        let replay = match state {
            CaptureState::Recording | CaptureState::Paused => {
                // Resuming moves the run offset, so take it first.
                let offset = self.capture.run_offset() + self.settings.play_delay_secs;
                if state == CaptureState::Paused {
                    self.capture.start().await?;
                }
                let clip = self.capture.get_data().await?;
                self.capture.pause().await?;
                let replay = Replay { clip, offset };
                *self.replay.lock() = Some(replay.clone());
                replay
            }
            CaptureState::Stopped | CaptureState::UnInitialized => {
                let last = self.replay.lock().clone();
                match last {
                    Some(replay) => replay,
                    None => return Err(CoordinatorError::invalid_state("play", state)),
                }
            }
        };

        self.playback.cancel();
        self.start_playback(replay)
    }

    fn start_playback(&self, replay: Replay) -> Result<(), CoordinatorError> {
        let completion = self.playback.play(&replay.clip, replay.offset)?;

        let capture = Arc::clone(&self.capture);
        let focused = Arc::clone(&self.focused);
        let resume = self.settings.resume_after_playback;
        let watcher = tokio::spawn(async move {
            let outcome = completion.wait().await;
            debug!(target: TARGET, "playback finished: {:?}", outcome);
            if outcome == PlaybackOutcome::Ended && resume && focused.load(Ordering::SeqCst) {
                if let Err(err) = capture.start().await {
                    warn!(target: TARGET, "resume after playback: {}", err);
                }
            }
        });
        // The previous clip was cancelled or replaced; its watcher exits on its own.
        *self.watcher.lock() = Some(watcher);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::audio::CaptureOptions;
    use crate::device::mock::{MockMicrophone, MockSpeaker};
    use crate::metrics::SessionMetrics;
    use crate::models::PlaybackState;

    struct Rig {
        mic: MockMicrophone,
        speaker: MockSpeaker,
        orchestrator: Orchestrator,
    }

    async fn rig(settings: Settings) -> Rig {
        let mic = MockMicrophone::new();
        let speaker = MockSpeaker::new();
        let capture = CaptureCoordinator::new(
            Arc::new(mic.clone()),
            CaptureOptions::default(),
            Arc::new(SessionMetrics::new()),
        );
        let playback = PlaybackCoordinator::new(Arc::new(speaker.clone()));
        let orchestrator = Orchestrator::new(Arc::new(capture), Arc::new(playback), settings);
        orchestrator.launch().await.unwrap();
        Rig {
            mic,
            speaker,
            orchestrator,
        }
    }

    async fn wait_for(capture: &CaptureCoordinator, state: CaptureState) {
        let mut states = capture.subscribe();
        tokio::time::timeout(Duration::from_secs(1), async {
            while capture.state() != state {
                let _ = states.recv().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_focus_starts_and_blur_stops() {
        let rig = rig(Settings::default()).await;
        let capture = rig.orchestrator.capture();

        rig.orchestrator
            .handle_focus(FocusEvent::GainedFocus)
            .await
            .unwrap();
        assert_eq!(capture.state(), CaptureState::Recording);

        rig.orchestrator
            .handle_focus(FocusEvent::LostFocus)
            .await
            .unwrap();
        assert_eq!(capture.state(), CaptureState::Stopped);
        assert_eq!(rig.mic.releases(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_focus_ignored_when_not_listening() {
        let settings = Settings {
            listen_on_focus: false,
            ..Settings::default()
        };
        let rig = rig(settings).await;
        rig.orchestrator
            .handle_focus(FocusEvent::GainedFocus)
            .await
            .unwrap();
        assert_eq!(rig.orchestrator.capture().state(), CaptureState::UnInitialized);
        assert!(rig.orchestrator.is_focused());
    }

    #[tokio::test(start_paused = true)]
    async fn test_play_pauses_capture_and_resumes_after_end() {
        let rig = rig(Settings::default()).await;
        let capture = rig.orchestrator.capture();

        rig.orchestrator
            .handle_focus(FocusEvent::GainedFocus)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        rig.orchestrator.handle_command(Command::Play).await.unwrap();

        assert_eq!(capture.state(), CaptureState::Paused);
        assert_eq!(rig.orchestrator.playback().state(), PlaybackState::Playing);
        assert_eq!(rig.speaker.last_seek(), Some(0.3));
        let clip = rig.orchestrator.last_clip().unwrap();
        assert_eq!(clip.duration_secs(), Some(1.0));

        tokio::task::yield_now().await;
        assert!(rig.speaker.finish());
        wait_for(capture, CaptureState::Recording).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_play_starts_from_latest_run() {
        let rig = rig(Settings::default()).await;

        rig.orchestrator.handle_command(Command::Record).await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        rig.orchestrator.handle_command(Command::Play).await.unwrap();

        rig.orchestrator.handle_command(Command::Record).await.unwrap();
        assert_eq!(rig.orchestrator.playback().state(), PlaybackState::Ready);
        tokio::time::sleep(Duration::from_secs(1)).await;
        rig.orchestrator.handle_command(Command::Play).await.unwrap();

        let seek = rig.speaker.last_seek().unwrap();
        assert!((seek - 2.3).abs() < 1e-6);
        let clip = rig.orchestrator.last_clip().unwrap();
        assert_eq!(clip.duration_secs(), Some(3.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_resume_without_focus() {
        let rig = rig(Settings::default()).await;
        let capture = rig.orchestrator.capture();

        rig.orchestrator.handle_command(Command::Record).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        rig.orchestrator.handle_command(Command::Play).await.unwrap();

        tokio::task::yield_now().await;
        assert!(rig.speaker.finish());
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
        assert_eq!(capture.state(), CaptureState::Paused);
        assert_eq!(rig.orchestrator.playback().state(), PlaybackState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_play_without_clip_is_rejected() {
        let rig = rig(Settings::default()).await;
        let err = rig
            .orchestrator
            .handle_command(Command::Play)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            CoordinatorError::invalid_state("play", CaptureState::UnInitialized)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_after_stop() {
        let rig = rig(Settings::default()).await;

        rig.orchestrator.handle_command(Command::Record).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        rig.orchestrator.handle_command(Command::Play).await.unwrap();
        rig.orchestrator.handle_command(Command::Stop).await.unwrap();
        assert_eq!(rig.orchestrator.playback().state(), PlaybackState::Ready);

        rig.orchestrator.handle_command(Command::Play).await.unwrap();
        assert_eq!(rig.speaker.loads(), 2);
        assert_eq!(rig.orchestrator.capture().state(), CaptureState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_play_while_paused_takes_fresh_audio() {
        let settings = Settings {
            play_delay_secs: 0.0,
            ..Settings::default()
        };
        let rig = rig(settings).await;
        let capture = rig.orchestrator.capture();

        rig.orchestrator.handle_command(Command::Record).await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        rig.orchestrator.handle_command(Command::Pause).await.unwrap();
        rig.orchestrator.handle_command(Command::Record).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        rig.orchestrator.handle_command(Command::Pause).await.unwrap();

        rig.orchestrator.handle_command(Command::Play).await.unwrap();
        assert_eq!(capture.state(), CaptureState::Paused);
        assert_eq!(rig.orchestrator.playback().state(), PlaybackState::Playing);
        assert_eq!(rig.speaker.last_seek(), Some(2.0));
        let clip = rig.orchestrator.last_clip().unwrap();
        assert_eq!(clip.duration_secs(), Some(3.0));
    }
}
