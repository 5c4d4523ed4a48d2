//! End-to-end scenarios for the capture and playback coordinators.
//!
//! All tests run on a paused clock, so timeline assertions are exact and
//! device delays cost nothing.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use accent::device::mock::{MockMicrophone, MockSpeaker};
use accent::device::{CaptureDevice, CaptureHandle, DeviceEventSender, RecorderCondition};
use accent::{
    AcquisitionError, CaptureCoordinator, CaptureOptions, CaptureState, Command, CoordinatorError,
    DeviceError, Orchestrator, PlaybackCoordinator, PlaybackOutcome, PlaybackState,
    SessionMetrics, Settings,
};
use async_trait::async_trait;
use tokio::sync::broadcast;

fn capture_with(mic: &MockMicrophone) -> (Arc<CaptureCoordinator>, Arc<SessionMetrics>) {
    let metrics = Arc::new(SessionMetrics::new());
    let capture = CaptureCoordinator::new(
        Arc::new(mic.clone()),
        CaptureOptions::default(),
        Arc::clone(&metrics),
    );
    (Arc::new(capture), metrics)
}

fn drain<T: Clone>(rx: &mut broadcast::Receiver<T>) -> Vec<T> {
    let mut seen = Vec::new();
    while let Ok(value) = rx.try_recv() {
        seen.push(value);
    }
    seen
}

/// A device whose stream is dead on arrival.
struct DeadOnArrival {
    acquisitions: AtomicU32,
}

struct DeadHandle;

impl CaptureHandle for DeadHandle {
    fn start(&mut self) -> Result<(), DeviceError> {
        Err(DeviceError::Inactive)
    }

    fn pause(&mut self) -> Result<(), DeviceError> {
        Err(DeviceError::Inactive)
    }

    fn resume(&mut self) -> Result<(), DeviceError> {
        Err(DeviceError::Inactive)
    }

    fn stop(&mut self) -> Result<(), DeviceError> {
        Err(DeviceError::Inactive)
    }

    fn request_data(&mut self) -> Result<(), DeviceError> {
        Err(DeviceError::Inactive)
    }

    fn condition(&self) -> RecorderCondition {
        RecorderCondition::Inactive
    }

    fn is_active(&self) -> bool {
        false
    }

    fn release(&mut self) {}
}

#[async_trait]
impl CaptureDevice for DeadOnArrival {
    async fn acquire(
        &self,
        _events: DeviceEventSender,
    ) -> Result<Box<dyn CaptureHandle>, AcquisitionError> {
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(DeadHandle))
    }
}

#[tokio::test(start_paused = true)]
async fn test_inactive_stream_after_acquisition_is_an_acquisition_error() {
    let device = Arc::new(DeadOnArrival {
        acquisitions: AtomicU32::new(0),
    });
    let metrics = Arc::new(SessionMetrics::new());
    let capture = CaptureCoordinator::new(
        device.clone(),
        CaptureOptions::default(),
        Arc::clone(&metrics),
    );

    let err = capture.start().await.unwrap_err();
    assert_eq!(
        err,
        CoordinatorError::Acquisition(AcquisitionError::StreamInactive)
    );
    assert_eq!(capture.state(), CaptureState::UnInitialized);

    assert!(capture.start().await.is_err());
    assert_eq!(device.acquisitions.load(Ordering::SeqCst), 2);
    assert_eq!(metrics.snapshot().acquisition_failures, 2);
    assert_eq!(metrics.snapshot().devices_acquired, 0);
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_start_during_acquisition_runs_once() {
    let mic = MockMicrophone::new().with_acquire_delay(Duration::from_secs(2));
    let (capture, _) = capture_with(&mic);

    let (first, second) = tokio::join!(capture.start(), capture.start());
    first.unwrap();
    second.unwrap();

    assert_eq!(mic.acquisitions(), 1);
    assert_eq!(capture.state(), CaptureState::Recording);
}

#[tokio::test(start_paused = true)]
async fn test_stop_waits_for_inflight_start() {
    let mic = MockMicrophone::new().with_acquire_delay(Duration::from_secs(2));
    let (capture, _) = capture_with(&mic);
    let mut states = capture.subscribe();

    let stopper = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        capture.stop().await
    };
    let (started, stopped) = tokio::join!(capture.start(), stopper);
    started.unwrap();
    stopped.unwrap();

    assert_eq!(capture.state(), CaptureState::Stopped);
    assert_eq!(
        drain(&mut states),
        vec![
            CaptureState::Stopped,
            CaptureState::Recording,
            CaptureState::Stopped
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_silently_dead_device_is_replaced_on_next_start() {
    let mic = MockMicrophone::new();
    let (capture, metrics) = capture_with(&mic);

    capture.initialize().await.unwrap();
    assert_eq!(capture.state(), CaptureState::Stopped);
    mic.deactivate();

    capture.start().await.unwrap();
    assert_eq!(capture.state(), CaptureState::Recording);
    assert_eq!(mic.acquisitions(), 2);

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.devices_acquired, 2);
    assert_eq!(snapshot.device_failures, 1);
}

#[tokio::test(start_paused = true)]
async fn test_pause_resume_timeline() {
    let mic = MockMicrophone::new();
    let (capture, _) = capture_with(&mic);

    capture.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    capture.pause().await.unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;
    capture.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    capture.pause().await.unwrap();

    assert!((capture.current_time() - 0.8).abs() < 1e-6);

    capture.stop().await.unwrap();
    assert_eq!(capture.current_time(), 0.0);
    assert_eq!(capture.run_offset(), 0.0);
}

#[tokio::test(start_paused = true)]
async fn test_restart_from_paused_ends_paused_on_fresh_timeline() {
    let mic = MockMicrophone::new();
    let (capture, _) = capture_with(&mic);

    capture.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    capture.pause().await.unwrap();

    capture.restart().await.unwrap();
    assert_eq!(capture.state(), CaptureState::Paused);
    assert!(capture.current_time() < 1e-6);
    assert_eq!(mic.acquisitions(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_restart_reports_first_failure() {
    let mic = MockMicrophone::new();
    let (capture, _) = capture_with(&mic);
    capture.start().await.unwrap();

    mic.fail_next_acquire(AcquisitionError::DeviceBusy);
    let err = capture.restart().await.unwrap_err();
    assert_eq!(err, CoordinatorError::Acquisition(AcquisitionError::DeviceBusy));
    assert_eq!(capture.state(), CaptureState::Stopped);

    capture.restart().await.unwrap();
    assert_eq!(capture.state(), CaptureState::Recording);
}

#[tokio::test(start_paused = true)]
async fn test_state_only_moves_along_edges() {
    use CaptureState::*;

    fn allowed(from: CaptureState, to: CaptureState) -> bool {
        matches!(
            (from, to),
            (UnInitialized, Stopped)
                | (Stopped, Recording)
                | (Stopped, Paused)
                | (Recording, Paused)
                | (Paused, Recording)
                | (Recording, Stopped)
                | (Paused, Stopped)
                | (_, UnInitialized)
        )
    }

    let mic = MockMicrophone::new();
    let (capture, _) = capture_with(&mic);
    let mut states = capture.subscribe();

    // Fixed pseudo-random walk over the operations, with the odd device failure
    let mut seed: u32 = 0x2545_f491;
    let mut previous = capture.state();
    let mut last_time = 0.0;
    for step in 0..200 {
        seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        let stopping = match (seed >> 16) % 7 {
            0 | 1 => {
                let _ = capture.start().await;
                false
            }
            2 | 3 => {
                let _ = capture.pause().await;
                false
            }
            4 => {
                let _ = capture.stop().await;
                true
            }
            5 => {
                let _ = capture.get_data().await;
                false
            }
            _ => {
                if step % 25 == 0 {
                    mic.deactivate();
                }
                let _ = capture.restart().await;
                true
            }
        };
        tokio::time::sleep(Duration::from_millis(u64::from(seed % 400))).await;

        for next in drain(&mut states) {
            assert!(allowed(previous, next), "{:?} -> {:?}", previous, next);
            previous = next;
        }
        assert_eq!(previous, capture.state());

        let now = capture.current_time();
        if !stopping && previous != UnInitialized {
            assert!(now + 1e-9 >= last_time, "time went back at step {}", step);
        }
        last_time = now;
    }
}

#[tokio::test(start_paused = true)]
async fn test_play_back_since_last_interruption() {
    let mic = MockMicrophone::new();
    let speaker = MockSpeaker::realtime();
    let (capture, _) = capture_with(&mic);
    let playback = Arc::new(PlaybackCoordinator::new(Arc::new(speaker.clone())));
    let settings = Settings {
        play_delay_secs: 0.0,
        ..Settings::default()
    };
    let orchestrator = Orchestrator::new(Arc::clone(&capture), Arc::clone(&playback), settings);
    orchestrator.launch().await.unwrap();

    orchestrator.handle_command(Command::Record).await.unwrap();
    tokio::time::sleep(Duration::from_secs(4)).await;
    orchestrator.handle_command(Command::Play).await.unwrap();
    assert_eq!(speaker.last_seek(), Some(0.0));

    // Let the 4 second clip play out
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(playback.state(), PlaybackState::Ready);

    orchestrator.handle_command(Command::Record).await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    orchestrator.handle_command(Command::Play).await.unwrap();

    assert_eq!(speaker.last_seek(), Some(4.0));
    assert_eq!(
        orchestrator.last_clip().unwrap().duration_secs(),
        Some(6.0)
    );
    assert_eq!(capture.state(), CaptureState::Paused);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_after_end_is_harmless() {
    let speaker = MockSpeaker::new();
    let playback = PlaybackCoordinator::new(Arc::new(speaker.clone()));
    playback.setup_audio().await.unwrap();
    let mut states = playback.subscribe();

    let mic = MockMicrophone::new();
    let (capture, _) = capture_with(&mic);
    capture.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;
    let clip = capture.get_data().await.unwrap();

    let completion = playback.play(&clip, 2.0).unwrap();
    tokio::task::yield_now().await;
    assert!(speaker.finish());
    assert_eq!(completion.wait().await, PlaybackOutcome::Ended);

    playback.cancel();
    playback.cancel();
    assert_eq!(playback.state(), PlaybackState::Ready);
    assert_eq!(
        drain(&mut states),
        vec![PlaybackState::Playing, PlaybackState::Ready]
    );
}
