//! PipeWire microphone and speaker
//!
//! Each live stream runs its own PipeWire main loop on a dedicated thread.
//! The capture stream records mono `f32` samples into a buffer that is handed
//! out as one raw PCM chunk per flush. The output stream plays a loaded PCM
//! clip from the seek position and reports `ended` when it runs out.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use async_trait::async_trait;
use log::{debug, warn};
use parking_lot::Mutex;
use pipewire as pw;
use pw::spa;
use pw::spa::param::format::{MediaSubtype, MediaType};
use pw::spa::param::format_utils;
use pw::spa::pod::Pod;
use tokio::sync::oneshot;

use super::{
    CaptureDevice, CaptureHandle, Chunk, DeviceEvent, DeviceEventSender, MediaEvent,
    MediaEventSender, OutputDevice, OutputHandle, RecorderCondition, SourceEvent, SourceId,
};
use crate::error::{AcquisitionError, DeviceError};
use crate::models::{encode_pcm, pcm_mime_type, Clip};

const APP_NAME: &str = "Accent Voice Memo";
const TARGET: &str = "accent::device::pipewire";

enum LoopCommand {
    Stop,
}

/// A running main loop and the channel that stops it.
struct LoopThread {
    sender: pw::channel::Sender<LoopCommand>,
    handle: JoinHandle<()>,
}

impl LoopThread {
    fn stop(self) {
        let _ = self.sender.send(LoopCommand::Stop);
        let _ = self.handle.join();
    }
}

/// Serialize an F32LE mono format pod at `rate`
fn format_pod(rate: u32) -> Result<Vec<u8>, String> {
    let mut audio_info = spa::param::audio::AudioInfoRaw::new();
    audio_info.set_format(spa::param::audio::AudioFormat::F32LE);
    audio_info.set_rate(rate);
    audio_info.set_channels(1);

    let obj = spa::pod::Object {
        type_: spa::utils::SpaTypes::ObjectParamFormat.as_raw(),
        id: spa::param::ParamType::EnumFormat.as_raw(),
        properties: audio_info.into(),
    };

    Ok(spa::pod::serialize::PodSerializer::serialize(
        std::io::Cursor::new(Vec::new()),
        &spa::pod::Value::Object(obj),
    )
    .map_err(|e| format!("Failed to serialize audio format: {:?}", e))?
    .0
    .into_inner())
}

fn parse_format(format: &mut spa::param::audio::AudioInfoRaw, id: u32, param: Option<&Pod>) {
    let Some(param) = param else { return };
    if id != spa::param::ParamType::Format.as_raw() {
        return;
    }
    let Ok((media_type, media_subtype)) = format_utils::parse_format(param) else {
        return;
    };
    if media_type != MediaType::Audio || media_subtype != MediaSubtype::Raw {
        return;
    }
    if let Err(e) = format.parse(param) {
        warn!(target: TARGET, "unparseable audio format: {:?}", e);
    }
}

struct CaptureShared {
    condition: RecorderCondition,
    active: bool,
    released: bool,
    samples: Vec<f32>,
    sample_rate: u32,
}

/// Default PipeWire source
pub struct PipewireMicrophone {
    sample_rate: u32,
}

impl PipewireMicrophone {
    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate }
    }
}

impl Default for PipewireMicrophone {
    fn default() -> Self {
        Self::new(16000)
    }
}

#[async_trait]
impl CaptureDevice for PipewireMicrophone {
    async fn acquire(
        &self,
        events: DeviceEventSender,
    ) -> Result<Box<dyn CaptureHandle>, AcquisitionError> {
        let shared = Arc::new(Mutex::new(CaptureShared {
            condition: RecorderCondition::Inactive,
            active: true,
            released: false,
            samples: Vec::new(),
            sample_rate: self.sample_rate,
        }));

        let (sender, receiver) = pw::channel::channel::<LoopCommand>();
        let (ready_tx, ready_rx) = oneshot::channel();
        let thread_shared = Arc::clone(&shared);
        let thread_events = events.clone();
        let rate = self.sample_rate;

        let handle = thread::spawn(move || {
            let mut ready = Some(ready_tx);
            let result = run_capture_loop(&thread_shared, &thread_events, receiver, rate, &mut ready);
            if let (Err(e), Some(ready)) = (&result, ready.take()) {
                let _ = ready.send(Err(e.clone()));
            }
            let mut shared = thread_shared.lock();
            shared.active = false;
            if let Err(e) = result {
                warn!(target: TARGET, "capture loop: {}", e);
                let _ = thread_events.send(DeviceEvent::Error(e));
            }
            if !shared.released {
                let _ = thread_events.send(DeviceEvent::BecameInactive);
            }
        });

        let thread = LoopThread { sender, handle };
        match ready_rx.await {
            Ok(Ok(())) => Ok(Box::new(PipewireRecorder {
                shared,
                events: Some(events),
                thread: Some(thread),
            })),
            Ok(Err(message)) => {
                thread.stop();
                Err(AcquisitionError::Backend(message))
            }
            Err(_) => {
                thread.stop();
                Err(AcquisitionError::NoDevice)
            }
        }
    }
}

fn run_capture_loop(
    shared: &Arc<Mutex<CaptureShared>>,
    events: &DeviceEventSender,
    receiver: pw::channel::Receiver<LoopCommand>,
    rate: u32,
    ready: &mut Option<oneshot::Sender<Result<(), String>>>,
) -> Result<(), String> {
    pw::init();

    let mainloop = pw::main_loop::MainLoopRc::new(None)
        .map_err(|e| format!("Failed to create PipeWire main loop: {}", e))?;
    let context = pw::context::ContextRc::new(&mainloop, None)
        .map_err(|e| format!("Failed to create PipeWire context: {}", e))?;
    let core = context
        .connect_rc(None)
        .map_err(|e| format!("Failed to connect to PipeWire: {}", e))?;

    let props = pw::properties::properties! {
        *pw::keys::MEDIA_TYPE => "Audio",
        *pw::keys::MEDIA_CATEGORY => "Capture",
        *pw::keys::MEDIA_ROLE => "Communication",
        *pw::keys::APP_NAME => APP_NAME,
    };
    let stream = pw::stream::StreamBox::new(&core, "accent-capture", props)
        .map_err(|e| format!("Failed to create PipeWire stream: {}", e))?;

    let mainloop_weak = mainloop.downgrade();
    let _receiver = receiver.attach(mainloop.loop_(), move |cmd| match cmd {
        LoopCommand::Stop => {
            if let Some(mainloop) = mainloop_weak.upgrade() {
                mainloop.quit();
            }
        }
    });

    struct UserData {
        format: spa::param::audio::AudioInfoRaw,
        shared: Arc<Mutex<CaptureShared>>,
        events: DeviceEventSender,
    }

    let user_data = UserData {
        format: Default::default(),
        shared: Arc::clone(shared),
        events: events.clone(),
    };

    let _listener = stream
        .add_local_listener_with_user_data(user_data)
        .state_changed(|_, user_data, _old, new| {
            if let pw::stream::StreamState::Error(message) = new {
                let _ = user_data.events.send(DeviceEvent::Error(message));
            }
        })
        .param_changed(|_, user_data, id, param| parse_format(&mut user_data.format, id, param))
        .process(|stream, user_data| {
            let Some(mut buffer) = stream.dequeue_buffer() else {
                return;
            };
            let datas = buffer.datas_mut();
            if datas.is_empty() {
                return;
            }

            let data = &mut datas[0];
            let n_channels = user_data.format.channels().max(1);
            let n_samples = data.chunk().size() / (std::mem::size_of::<f32>() as u32);

            let mut shared = user_data.shared.lock();
            if shared.condition != RecorderCondition::Recording {
                return;
            }
            if user_data.format.rate() > 0 {
                shared.sample_rate = user_data.format.rate();
            }
            if let Some(raw_samples) = data.data() {
                // Keep the first channel only
                for i in (0..n_samples).step_by(n_channels as usize) {
                    let start = i as usize * std::mem::size_of::<f32>();
                    let end = start + std::mem::size_of::<f32>();
                    if end <= raw_samples.len() {
                        shared.samples.push(f32::from_le_bytes(
                            raw_samples[start..end].try_into().unwrap_or([0; 4]),
                        ));
                    }
                }
            }
        })
        .register()
        .map_err(|e| format!("Failed to register stream listener: {}", e))?;

    let values = format_pod(rate)?;
    let pod = Pod::from_bytes(&values).ok_or("Failed to build format pod")?;
    let mut params = [pod];

    stream
        .connect(
            spa::utils::Direction::Input,
            None,
            pw::stream::StreamFlags::AUTOCONNECT
                | pw::stream::StreamFlags::MAP_BUFFERS
                | pw::stream::StreamFlags::RT_PROCESS,
            &mut params,
        )
        .map_err(|e| format!("Failed to connect stream: {}", e))?;

    if let Some(ready) = ready.take() {
        let _ = ready.send(Ok(()));
    }
    debug!(target: TARGET, "capture stream connected");
    mainloop.run();
    Ok(())
}

struct PipewireRecorder {
    shared: Arc<Mutex<CaptureShared>>,
    events: Option<DeviceEventSender>,
    thread: Option<LoopThread>,
}

impl PipewireRecorder {
    fn live(&self) -> Result<parking_lot::MutexGuard<'_, CaptureShared>, DeviceError> {
        let shared = self.shared.lock();
        if !shared.active || self.events.is_none() {
            return Err(DeviceError::Inactive);
        }
        Ok(shared)
    }

    fn flush(&self, shared: &mut CaptureShared) {
        let samples = std::mem::take(&mut shared.samples);
        if let Some(events) = &self.events {
            let _ = events.send(DeviceEvent::DataReady(Chunk {
                data: encode_pcm(&samples),
                mime_type: pcm_mime_type(shared.sample_rate),
            }));
        }
    }

    fn lifecycle(&self, name: &'static str) {
        if let Some(events) = &self.events {
            let _ = events.send(DeviceEvent::Lifecycle(name));
        }
    }
}

impl CaptureHandle for PipewireRecorder {
    fn start(&mut self) -> Result<(), DeviceError> {
        {
            let mut shared = self.live()?;
            if shared.condition != RecorderCondition::Inactive {
                return Err(DeviceError::Rejected(format!("cannot start while {}", shared.condition)));
            }
            shared.samples.clear();
            shared.condition = RecorderCondition::Recording;
        }
        self.lifecycle("start");
        Ok(())
    }

    fn pause(&mut self) -> Result<(), DeviceError> {
        {
            let mut shared = self.live()?;
            if shared.condition == RecorderCondition::Paused {
                return Ok(());
            }
            shared.condition = RecorderCondition::Paused;
        }
        self.lifecycle("pause");
        Ok(())
    }

    fn resume(&mut self) -> Result<(), DeviceError> {
        {
            let mut shared = self.live()?;
            if shared.condition != RecorderCondition::Paused {
                return Err(DeviceError::Rejected(format!("cannot resume while {}", shared.condition)));
            }
            shared.condition = RecorderCondition::Recording;
        }
        self.lifecycle("resume");
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DeviceError> {
        {
            let mut shared = self.live()?;
            if shared.condition == RecorderCondition::Inactive {
                return Ok(());
            }
            self.flush(&mut shared);
            shared.condition = RecorderCondition::Inactive;
        }
        self.lifecycle("stop");
        Ok(())
    }

    fn request_data(&mut self) -> Result<(), DeviceError> {
        let mut shared = self.live()?;
        if shared.condition == RecorderCondition::Inactive {
            return Err(DeviceError::Rejected("recorder is inactive".into()));
        }
        self.flush(&mut shared);
        Ok(())
    }

    fn condition(&self) -> RecorderCondition {
        self.shared.lock().condition
    }

    fn is_active(&self) -> bool {
        self.shared.lock().active
    }

    fn release(&mut self) {
        {
            let mut shared = self.shared.lock();
            shared.released = true;
            shared.condition = RecorderCondition::Inactive;
        }
        self.events = None;
        if let Some(thread) = self.thread.take() {
            thread.stop();
        }
    }
}

impl Drop for PipewireRecorder {
    fn drop(&mut self) {
        self.release();
    }
}

struct OutputShared {
    samples: Arc<[f32]>,
    sample_rate: u32,
    position: usize,
    source: SourceId,
}

/// Default PipeWire sink
#[derive(Default)]
pub struct PipewireSpeaker;

#[async_trait]
impl OutputDevice for PipewireSpeaker {
    async fn acquire(
        &self,
        events: MediaEventSender,
    ) -> Result<Box<dyn OutputHandle>, AcquisitionError> {
        Ok(Box::new(PipewireOutput {
            shared: Arc::new(Mutex::new(OutputShared {
                samples: Arc::from(Vec::new()),
                sample_rate: 16000,
                position: 0,
                source: 0,
            })),
            events: Some(events),
            thread: None,
        }))
    }
}

struct PipewireOutput {
    shared: Arc<Mutex<OutputShared>>,
    events: Option<MediaEventSender>,
    thread: Option<LoopThread>,
}

impl PipewireOutput {
    fn emit(&self, events: impl IntoIterator<Item = MediaEvent>) -> Result<(), DeviceError> {
        let sender = self.events.as_ref().ok_or(DeviceError::Inactive)?;
        let source = self.shared.lock().source;
        for event in events {
            let _ = sender.send(SourceEvent { source, event });
        }
        Ok(())
    }

    fn halt(&mut self) -> bool {
        match self.thread.take() {
            Some(thread) => {
                thread.stop();
                true
            }
            None => false,
        }
    }
}

impl OutputHandle for PipewireOutput {
    fn load(&mut self, source: SourceId, clip: &Clip) -> Result<(), DeviceError> {
        let (Some(sample_rate), Some(samples)) = (clip.pcm_sample_rate(), clip.pcm_samples())
        else {
            return Err(DeviceError::Rejected(format!(
                "cannot decode {}",
                clip.mime_type()
            )));
        };
        self.halt();
        {
            let mut shared = self.shared.lock();
            shared.samples = Arc::from(samples);
            shared.sample_rate = sample_rate;
            shared.position = 0;
            shared.source = source;
        }
        let mut events = vec![MediaEvent::Emptied, MediaEvent::LoadStart];
        if let Some(duration) = clip.duration_secs() {
            events.push(MediaEvent::DurationChange(duration));
        }
        events.extend([
            MediaEvent::LoadedMetadata,
            MediaEvent::LoadedData,
            MediaEvent::CanPlayThrough,
        ]);
        self.emit(events)
    }

    fn seek(&mut self, position_secs: f64) -> Result<(), DeviceError> {
        {
            let mut shared = self.shared.lock();
            let frame = (position_secs * shared.sample_rate as f64) as usize;
            shared.position = frame.min(shared.samples.len());
        }
        self.emit([
            MediaEvent::Seeking,
            MediaEvent::TimeUpdate(position_secs),
            MediaEvent::Seeked,
        ])
    }

    fn play(&mut self) -> Result<(), DeviceError> {
        let events = self.events.clone().ok_or(DeviceError::Inactive)?;
        self.halt();

        let (sender, receiver) = pw::channel::channel::<LoopCommand>();
        let shared = Arc::clone(&self.shared);
        let source = shared.lock().source;
        let handle = thread::spawn(move || {
            if let Err(e) = run_playback_loop(shared, events.clone(), source, receiver) {
                warn!(target: TARGET, "playback loop: {}", e);
                let _ = events.send(SourceEvent {
                    source,
                    event: MediaEvent::Error(e),
                });
            }
        });
        self.thread = Some(LoopThread { sender, handle });
        self.emit([MediaEvent::Play, MediaEvent::Playing])
    }

    fn pause(&mut self) -> Result<(), DeviceError> {
        if self.halt() {
            self.emit([MediaEvent::Pause])?;
        }
        Ok(())
    }

    fn release(&mut self) {
        self.halt();
        self.events = None;
    }
}

impl Drop for PipewireOutput {
    fn drop(&mut self) {
        self.release();
    }
}

fn run_playback_loop(
    shared: Arc<Mutex<OutputShared>>,
    events: MediaEventSender,
    source: SourceId,
    receiver: pw::channel::Receiver<LoopCommand>,
) -> Result<(), String> {
    pw::init();

    let mainloop = pw::main_loop::MainLoopRc::new(None)
        .map_err(|e| format!("Failed to create PipeWire main loop: {}", e))?;
    let context = pw::context::ContextRc::new(&mainloop, None)
        .map_err(|e| format!("Failed to create PipeWire context: {}", e))?;
    let core = context
        .connect_rc(None)
        .map_err(|e| format!("Failed to connect to PipeWire: {}", e))?;

    let mainloop_weak = mainloop.downgrade();
    let _receiver = receiver.attach(mainloop.loop_(), move |cmd| match cmd {
        LoopCommand::Stop => {
            if let Some(mainloop) = mainloop_weak.upgrade() {
                mainloop.quit();
            }
        }
    });

    struct UserData {
        format: spa::param::audio::AudioInfoRaw,
        shared: Arc<Mutex<OutputShared>>,
        events: MediaEventSender,
        source: SourceId,
        mainloop_weak: pw::main_loop::MainLoopWeak,
        ended: bool,
    }

    let rate = shared.lock().sample_rate;
    let user_data = UserData {
        format: Default::default(),
        shared,
        events,
        source,
        mainloop_weak: mainloop.downgrade(),
        ended: false,
    };

    let props = pw::properties::properties! {
        *pw::keys::MEDIA_TYPE => "Audio",
        *pw::keys::MEDIA_CATEGORY => "Playback",
        *pw::keys::MEDIA_ROLE => "Communication",
        *pw::keys::APP_NAME => APP_NAME,
    };
    let stream = pw::stream::StreamBox::new(&core, "accent-playback", props)
        .map_err(|e| format!("Failed to create PipeWire stream: {}", e))?;

    let _listener = stream
        .add_local_listener_with_user_data(user_data)
        .param_changed(|_, user_data, id, param| parse_format(&mut user_data.format, id, param))
        .process(|stream, user_data| {
            let Some(mut buffer) = stream.dequeue_buffer() else {
                return;
            };
            let datas = buffer.datas_mut();
            if datas.is_empty() {
                return;
            }

            let data = &mut datas[0];
            let n_channels = user_data.format.channels().max(1) as usize;
            let stride = std::mem::size_of::<f32>() * n_channels;
            let Some(slice) = data.data() else {
                return;
            };
            let n_frames = slice.len() / stride;

            let (frames, position, rate) = {
                let mut shared = user_data.shared.lock();
                let start = shared.position.min(shared.samples.len());
                let end = (start + n_frames).min(shared.samples.len());
                shared.position = end;
                (shared.samples[start..end].to_vec(), end, shared.sample_rate)
            };

            if frames.is_empty() {
                if !user_data.ended {
                    user_data.ended = true;
                    let _ = user_data.events.send(SourceEvent {
                        source: user_data.source,
                        event: MediaEvent::Ended,
                    });
                    if let Some(mainloop) = user_data.mainloop_weak.upgrade() {
                        mainloop.quit();
                    }
                }
                return;
            }

            for (i, &sample) in frames.iter().enumerate() {
                let bytes = sample.to_le_bytes();
                for channel in 0..n_channels {
                    let offset = i * stride + channel * 4;
                    slice[offset..offset + 4].copy_from_slice(&bytes);
                }
            }
            let written = frames.len() * stride;
            slice[written..].fill(0);

            let chunk = data.chunk_mut();
            *chunk.offset_mut() = 0;
            *chunk.stride_mut() = stride as i32;
            *chunk.size_mut() = written as u32;

            if rate > 0 {
                let _ = user_data.events.send(SourceEvent {
                    source: user_data.source,
                    event: MediaEvent::TimeUpdate(position as f64 / rate as f64),
                });
            }
        })
        .register()
        .map_err(|e| format!("Failed to register stream listener: {}", e))?;

    let values = format_pod(rate)?;
    let pod = Pod::from_bytes(&values).ok_or("Failed to build format pod")?;
    let mut params = [pod];

    stream
        .connect(
            spa::utils::Direction::Output,
            None,
            pw::stream::StreamFlags::AUTOCONNECT
                | pw::stream::StreamFlags::MAP_BUFFERS
                | pw::stream::StreamFlags::RT_PROCESS,
            &mut params,
        )
        .map_err(|e| format!("Failed to connect stream: {}", e))?;

    mainloop.run();
    Ok(())
}
