//! Recording state machine.
//!
//! [`CaptureCoordinator`] owns at most one capture device session and moves it
//! through `UnInitialized → Stopped ⇄ Recording ⇄ Paused`. Every transition is
//! debounced by its own [`AsyncLock`] and serialized on an async mutex over the
//! session, so a `stop()` that arrives while `start()` is waiting on device
//! acquisition runs after it and sees the acquired device.
//!
//! The device is acquired lazily and re-acquired whenever it turns out to be
//! inactive. Data arrives as chunks over the device's event channel; chunks
//! are retained until the next full stop so [`CaptureCoordinator::get_data`]
//! always returns everything recorded on the current timeline.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::Instant;

use super::timeline::Timeline;
use crate::device::{
    CaptureDevice, CaptureHandle, Chunk, DeviceEvent, DeviceEventReceiver, RecorderCondition,
};
use crate::error::{AcquisitionError, CoordinatorError, DeviceError};
use crate::lock::AsyncLock;
use crate::metrics::SessionMetrics;
use crate::models::{CaptureState, Clip, UNKNOWN_FORMAT};
use crate::settings::StopPolicy;

const TARGET: &str = "accent::capture";
const STATE_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureOptions {
    pub stop_policy: StopPolicy,
    /// Upper bound on how long `get_data` waits for its flush to be answered.
    pub flush_timeout: Duration,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            stop_policy: StopPolicy::default(),
            flush_timeout: Duration::from_secs(5),
        }
    }
}

/// Device-facing half of the session. Only touched with the session mutex held.
#[derive(Default)]
struct Session {
    handle: Option<Box<dyn CaptureHandle>>,
    events: Option<DeviceEventReceiver>,
    chunks: Vec<Chunk>,
    pending_flushes: u32,
}

/// Observable half of the session, readable without waiting on an operation.
#[derive(Default)]
struct Status {
    state: CaptureState,
    timeline: Timeline,
    encoding_format: Option<String>,
}

pub struct CaptureCoordinator {
    device: Arc<dyn CaptureDevice>,
    options: CaptureOptions,
    metrics: Arc<SessionMetrics>,
    session: Mutex<Session>,
    status: parking_lot::Mutex<Status>,
    state_tx: broadcast::Sender<CaptureState>,
    start_lock: AsyncLock,
    pause_lock: AsyncLock,
    stop_lock: AsyncLock,
    restart_lock: AsyncLock,
    initialize_lock: AsyncLock,
}

impl CaptureCoordinator {
    pub fn new(
        device: Arc<dyn CaptureDevice>,
        options: CaptureOptions,
        metrics: Arc<SessionMetrics>,
    ) -> Self {
        let (state_tx, _) = broadcast::channel(STATE_CHANNEL_CAPACITY);
        Self {
            device,
            options,
            metrics,
            session: Mutex::new(Session::default()),
            status: parking_lot::Mutex::new(Status::default()),
            state_tx,
            start_lock: AsyncLock::new("start"),
            pause_lock: AsyncLock::new("pause"),
            stop_lock: AsyncLock::new("stop"),
            restart_lock: AsyncLock::new("restart"),
            initialize_lock: AsyncLock::new("initialize"),
        }
    }

    pub fn state(&self) -> CaptureState {
        self.status.lock().state
    }

    /// Every state transition, in order.
    pub fn subscribe(&self) -> broadcast::Receiver<CaptureState> {
        self.state_tx.subscribe()
    }

    /// Seconds recorded on the current timeline, including the running span.
    pub fn current_time(&self) -> f64 {
        self.status.lock().timeline.current_time(Instant::now())
    }

    /// Seconds recorded before the current (or most recent) run began.
    pub fn run_offset(&self) -> f64 {
        self.status.lock().timeline.run_offset()
    }

    /// Encoding format learned from the device, or `unknown` before any data.
    pub fn mime_type(&self) -> String {
        self.status
            .lock()
            .encoding_format
            .clone()
            .unwrap_or_else(|| UNKNOWN_FORMAT.to_string())
    }

    /// Acquire the device ahead of the first `start()`.
    pub async fn initialize(&self) -> Result<(), CoordinatorError> {
        self.initialize_lock
            .invoke(|| async {
                let mut session = self.session.lock().await;
                self.ensure_device(&mut session, "initialize").await
            })
            .await
            .unwrap_or(Ok(()))
    }

    pub async fn start(&self) -> Result<(), CoordinatorError> {
        self.start_lock
            .invoke(|| self.start_locked())
            .await
            .unwrap_or(Ok(()))
    }

    pub async fn pause(&self) -> Result<(), CoordinatorError> {
        self.pause_lock
            .invoke(|| self.pause_locked())
            .await
            .unwrap_or(Ok(()))
    }

    pub async fn stop(&self) -> Result<(), CoordinatorError> {
        self.stop_lock
            .invoke(|| self.stop_locked())
            .await
            .unwrap_or(Ok(()))
    }

    /// Stop, start again, and pause again if the recorder was paused.
    ///
    /// Each step goes through its own guarded operation; the first failure is
    /// returned and the remaining steps are skipped.
    pub async fn restart(&self) -> Result<(), CoordinatorError> {
        self.restart_lock
            .invoke(|| async {
                let prior = {
                    let _session = self.session.lock().await;
                    self.state()
                };
                debug!(target: TARGET, "restart: from {}", prior);
                match prior {
                    CaptureState::UnInitialized | CaptureState::Stopped => self.start().await,
                    CaptureState::Recording => {
                        self.stop().await?;
                        self.start().await
                    }
                    CaptureState::Paused => {
                        self.stop().await?;
                        self.start().await?;
                        self.pause().await
                    }
                }
            })
            .await
            .unwrap_or(Ok(()))
    }

    /// Flush the encoder and return everything recorded on this timeline.
    ///
    /// Only valid while recording. The returned clip includes the data
    /// answering this call's own flush.
    pub async fn get_data(&self) -> Result<Clip, CoordinatorError> {
        let mut session = self.session.lock().await;
        let state = self.state();
        if state != CaptureState::Recording {
            return Err(CoordinatorError::invalid_state("get_data", state));
        }
        if !Self::device_alive(&session) {
            self.invalidate(&mut session, "get_data");
            return Err(CoordinatorError::DeviceInactive);
        }
        self.drain_events(&mut session, "get_data")?;

        self.run_primitive(&mut session, "get_data", RecorderCondition::Recording, |h| {
            h.request_data()
        })?;
        session.pending_flushes += 1;
        self.metrics.flush_requested();

        let timeout = self.options.flush_timeout;
        match tokio::time::timeout(timeout, self.await_flushes(&mut session)).await {
            Ok(result) => result?,
            Err(_) => {
                session.pending_flushes = 0;
                warn!(target: TARGET, "get_data: no data within {:?}", timeout);
                return Err(CoordinatorError::transition_failed(
                    "get_data",
                    "data",
                    format!("nothing after {:?}", timeout),
                ));
            }
        }

        let clip = Clip::concat(
            session.chunks.iter().map(|chunk| chunk.data.as_slice()),
            &self.mime_type(),
        );
        debug!(
            target: TARGET,
            "get_data: {} bytes from {} chunks",
            clip.len(),
            session.chunks.len()
        );
        Ok(clip)
    }

    /// Release the device and return to `UnInitialized`.
    pub async fn shutdown(&self) {
        let mut session = self.session.lock().await;
        if self.state().is_active() {
            if let Some(handle) = session.handle.as_deref_mut() {
                if let Err(err) = handle.stop() {
                    debug!(target: TARGET, "shutdown: {}", err);
                }
            }
        }
        self.teardown(&mut session, "shutdown");
        session.chunks.clear();
        session.pending_flushes = 0;

        let mut status = self.status.lock();
        status.timeline.reset();
        self.set_state(&mut status, CaptureState::UnInitialized);
    }

    async fn start_locked(&self) -> Result<(), CoordinatorError> {
        let mut session = self.session.lock().await;
        self.ensure_device(&mut session, "start").await?;

        let state = self.state();
        match state {
            CaptureState::Stopped => {
                self.begin_timeline(&mut session, "start")?;
                self.run_primitive(&mut session, "start", RecorderCondition::Recording, |h| {
                    h.start()
                })?;
            }
            CaptureState::Paused => {
                self.run_primitive(&mut session, "start", RecorderCondition::Recording, |h| {
                    h.resume()
                })?;
            }
            CaptureState::Recording | CaptureState::UnInitialized => {}
        }
        self.verify(&mut session, "start", RecorderCondition::Recording)?;

        let mut status = self.status.lock();
        status.timeline.begin_run(Instant::now());
        if self.set_state(&mut status, CaptureState::Recording) {
            info!(target: TARGET, "start: recording from {}", state);
        }
        Ok(())
    }

    async fn pause_locked(&self) -> Result<(), CoordinatorError> {
        let mut session = self.session.lock().await;
        self.ensure_device(&mut session, "pause").await?;

        match self.state() {
            CaptureState::Paused => return Ok(()),
            CaptureState::Recording => {
                self.run_primitive(&mut session, "pause", RecorderCondition::Paused, |h| {
                    h.pause()
                })?;
                // The device is paused at this point; a refused flush leaves
                // its data buffered for the next one.
                match self.run_primitive(&mut session, "pause", RecorderCondition::Paused, |h| {
                    h.request_data()
                }) {
                    Ok(()) => {
                        session.pending_flushes += 1;
                        self.metrics.flush_requested();
                    }
                    Err(CoordinatorError::TransitionFailed { actual, .. }) => {
                        debug!(target: TARGET, "pause: flush skipped: {}", actual);
                    }
                    Err(err) => return Err(err),
                }
            }
            CaptureState::Stopped | CaptureState::UnInitialized => {
                // Prime the dormant encoder so the next start resumes it.
                self.begin_timeline(&mut session, "pause")?;
                self.run_primitive(&mut session, "pause", RecorderCondition::Paused, |h| {
                    h.pause()
                })?;
            }
        }
        self.verify(&mut session, "pause", RecorderCondition::Paused)?;

        let mut status = self.status.lock();
        status.timeline.end_run(Instant::now());
        self.set_state(&mut status, CaptureState::Paused);
        Ok(())
    }

    async fn stop_locked(&self) -> Result<(), CoordinatorError> {
        let mut session = self.session.lock().await;
        let state = self.state();
        if !state.is_active() {
            debug!(target: TARGET, "stop: nothing to stop while {}", state);
            return Ok(());
        }
        if !Self::device_alive(&session) {
            self.invalidate(&mut session, "stop");
            return Ok(());
        }

        let stopped = self
            .run_primitive(&mut session, "stop", RecorderCondition::Inactive, |h| h.stop())
            .and_then(|()| self.verify(&mut session, "stop", RecorderCondition::Inactive))
            .and_then(|()| self.drain_events(&mut session, "stop"));
        match stopped {
            Ok(()) => {}
            // The session was reset on the way; there is nothing left to stop.
            Err(CoordinatorError::DeviceInactive) => return Ok(()),
            Err(err) => return Err(err),
        }

        session.chunks.clear();
        session.pending_flushes = 0;
        if self.options.stop_policy == StopPolicy::ReleaseDevice {
            self.teardown(&mut session, "stop");
        }

        let mut status = self.status.lock();
        status.timeline.reset();
        self.set_state(&mut status, CaptureState::Stopped);
        info!(target: TARGET, "stop: stopped from {}", state);
        Ok(())
    }

    fn device_alive(session: &Session) -> bool {
        session.handle.as_ref().is_some_and(|h| h.is_active())
    }

    /// Make sure a live device is attached, re-acquiring a stale one.
    async fn ensure_device(
        &self,
        session: &mut Session,
        operation: &'static str,
    ) -> Result<(), CoordinatorError> {
        if session.handle.is_some() {
            let drained = self.drain_events(session, operation);
            if drained.is_ok() && Self::device_alive(session) {
                return Ok(());
            }
            if session.handle.is_some() {
                self.invalidate(session, operation);
            }
            info!(target: TARGET, "{}: device inactive, re-acquiring", operation);
        }
        self.acquire(session, operation).await
    }

    async fn acquire(
        &self,
        session: &mut Session,
        operation: &'static str,
    ) -> Result<(), CoordinatorError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut handle = match self.device.acquire(events_tx).await {
            Ok(handle) => handle,
            Err(err) => {
                self.metrics.acquisition_failed();
                error!(target: TARGET, "{}: failed to acquire capture device: {}", operation, err);
                return Err(err.into());
            }
        };
        if !handle.is_active() {
            handle.release();
            self.metrics.acquisition_failed();
            error!(target: TARGET, "{}: capture stream inactive after acquisition", operation);
            return Err(AcquisitionError::StreamInactive.into());
        }

        let count = self.metrics.device_acquired();
        info!(target: TARGET, "{}: acquired capture device (#{})", operation, count);
        session.handle = Some(handle);
        session.events = Some(events_rx);
        session.chunks.clear();
        session.pending_flushes = 0;

        let mut status = self.status.lock();
        if status.state == CaptureState::UnInitialized {
            status.timeline.reset();
            self.set_state(&mut status, CaptureState::Stopped);
        }
        Ok(())
    }

    /// Start a new timeline from `Stopped`: discard anything the previous
    /// timeline left in the event queue.
    fn begin_timeline(
        &self,
        session: &mut Session,
        operation: &'static str,
    ) -> Result<(), CoordinatorError> {
        self.drain_events(session, operation)?;
        session.chunks.clear();
        session.pending_flushes = 0;
        Ok(())
    }

    fn run_primitive(
        &self,
        session: &mut Session,
        operation: &'static str,
        expected: RecorderCondition,
        primitive: impl FnOnce(&mut dyn CaptureHandle) -> Result<(), DeviceError>,
    ) -> Result<(), CoordinatorError> {
        let Some(handle) = session.handle.as_deref_mut() else {
            return Err(CoordinatorError::DeviceInactive);
        };
        match primitive(handle) {
            Ok(()) => Ok(()),
            Err(DeviceError::Inactive) => {
                self.invalidate(session, operation);
                Err(CoordinatorError::DeviceInactive)
            }
            Err(DeviceError::Rejected(reason)) => {
                warn!(target: TARGET, "{}: device rejected instruction: {}", operation, reason);
                Err(CoordinatorError::transition_failed(operation, expected, reason))
            }
        }
    }

    /// Check that the device reached `expected` after a primitive.
    fn verify(
        &self,
        session: &mut Session,
        operation: &'static str,
        expected: RecorderCondition,
    ) -> Result<(), CoordinatorError> {
        if !Self::device_alive(session) {
            self.invalidate(session, operation);
            return Err(CoordinatorError::DeviceInactive);
        }
        let actual = match session.handle.as_deref() {
            Some(handle) => handle.condition(),
            None => return Err(CoordinatorError::DeviceInactive),
        };
        if actual != expected {
            warn!(
                target: TARGET,
                "{}: device reports {} instead of {}", operation, actual, expected
            );
            return Err(CoordinatorError::transition_failed(operation, expected, actual));
        }
        Ok(())
    }

    /// Apply every event already queued by the device.
    fn drain_events(
        &self,
        session: &mut Session,
        operation: &'static str,
    ) -> Result<(), CoordinatorError> {
        loop {
            let Some(events) = session.events.as_mut() else {
                return Ok(());
            };
            let next = events.try_recv();
            match next {
                Ok(event) => self.apply_event(session, operation, event)?,
                Err(TryRecvError::Empty) => return Ok(()),
                Err(TryRecvError::Disconnected) => {
                    self.invalidate(session, operation);
                    return Err(CoordinatorError::DeviceInactive);
                }
            }
        }
    }

    async fn await_flushes(&self, session: &mut Session) -> Result<(), CoordinatorError> {
        while session.pending_flushes > 0 {
            let Some(events) = session.events.as_mut() else {
                return Err(CoordinatorError::DeviceInactive);
            };
            let next = events.recv().await;
            match next {
                Some(event) => self.apply_event(session, "get_data", event)?,
                None => {
                    self.invalidate(session, "get_data");
                    return Err(CoordinatorError::DeviceInactive);
                }
            }
        }
        Ok(())
    }

    fn apply_event(
        &self,
        session: &mut Session,
        operation: &'static str,
        event: DeviceEvent,
    ) -> Result<(), CoordinatorError> {
        match event {
            DeviceEvent::DataReady(chunk) => {
                session.pending_flushes = session.pending_flushes.saturating_sub(1);
                self.metrics.chunk_received();
                {
                    let mut status = self.status.lock();
                    if status.encoding_format.as_deref() != Some(chunk.mime_type.as_str()) {
                        debug!(target: TARGET, "{}: encoding format {}", operation, chunk.mime_type);
                        status.encoding_format = Some(chunk.mime_type.clone());
                    }
                }
                if !chunk.data.is_empty() {
                    session.chunks.push(chunk);
                }
                Ok(())
            }
            DeviceEvent::Error(message) => {
                warn!(target: TARGET, "{}: device error: {}", operation, message);
                Ok(())
            }
            DeviceEvent::BecameInactive => {
                self.invalidate(session, operation);
                Err(CoordinatorError::DeviceInactive)
            }
            DeviceEvent::Lifecycle(name) => {
                debug!(target: TARGET, "{}: device {}", operation, name);
                Ok(())
            }
        }
    }

    /// Drop a dead device and everything recorded with it.
    fn invalidate(&self, session: &mut Session, operation: &'static str) {
        warn!(target: TARGET, "{}: capture device inactive, resetting session", operation);
        self.metrics.device_failed();
        if let Some(mut handle) = session.handle.take() {
            handle.release();
        }
        if let Some(mut events) = session.events.take() {
            events.close();
        }
        session.chunks.clear();
        session.pending_flushes = 0;

        let mut status = self.status.lock();
        status.timeline.reset();
        status.encoding_format = None;
        self.set_state(&mut status, CaptureState::UnInitialized);
    }

    /// Release a healthy device.
    fn teardown(&self, session: &mut Session, operation: &'static str) {
        if let Some(mut handle) = session.handle.take() {
            handle.release();
            self.metrics.device_released();
            debug!(target: TARGET, "{}: released capture device", operation);
        }
        if let Some(mut events) = session.events.take() {
            events.close();
        }
    }

    /// Returns whether the state changed. Notifies while `status` is held.
    fn set_state(&self, status: &mut Status, state: CaptureState) -> bool {
        if status.state == state {
            return false;
        }
        debug!(target: TARGET, "state {} -> {}", status.state, state);
        status.state = state;
        let _ = self.state_tx.send(state);
        true
    }
}

impl Drop for CaptureCoordinator {
    fn drop(&mut self) {
        if let Some(handle) = self.session.get_mut().handle.as_deref_mut() {
            handle.release();
        }
    }
}
