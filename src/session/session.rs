use std::future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Sleep;
use tracing::{debug, error, info, warn};

use super::bitrate::{BitrateAdapter, BitrateConfig, BitrateDecision};
use super::config::{SessionConfig, VideoSettings};
use super::events::{EventBus, EventSink, EventType, SessionEvent, Subscription};
use super::fanout::{FpsMeter, SinkGate};
use super::retry::{RetryDecision, RetryTracker};
use super::state::{SessionState, Sink, StreamingToggle};
use super::stats::{SessionSnapshot, StreamStatistics};
use crate::error::{SessionError, SessionResult};
use crate::media::{
    CaptureSource, Devices, EncodedFrame, Encoder, EncoderParams, LensFacing, PreviewInfo,
    Publisher, PublisherEvent, Recorder, RecordingSummary,
};

type Reply<T> = oneshot::Sender<SessionResult<T>>;

/// Requests marshalled into the session actor
enum Command {
    SurfaceCreated(Reply<()>),
    SurfaceDestroyed(Reply<()>),
    StartPreview {
        camera_name: String,
        reply: Reply<PreviewInfo>,
    },
    StartRecording {
        path: PathBuf,
        reply: Reply<()>,
    },
    StartStreaming {
        url: String,
        bitrate: Option<u32>,
        reply: Reply<StreamingToggle>,
    },
    StartRecordingAndStreaming {
        path: PathBuf,
        url: String,
        bitrate: Option<u32>,
        reply: Reply<()>,
    },
    Pause {
        sink: Sink,
        reply: Reply<()>,
    },
    Resume {
        sink: Sink,
        reply: Reply<()>,
    },
    StopStreaming(Reply<()>),
    StopRecording(Reply<Option<RecordingSummary>>),
    StopAll(Reply<()>),
    SwitchCamera {
        camera_name: String,
        reply: Reply<()>,
    },
    SwitchAudio {
        enabled: bool,
        reply: Reply<()>,
    },
    SwitchFlashlight {
        enabled: bool,
        reply: Reply<()>,
    },
    TakePicture {
        path: PathBuf,
        reply: Reply<()>,
    },
    SetVideoSettings {
        settings: VideoSettings,
        reply: Reply<()>,
    },
    SetAudioSettings {
        bitrate: u32,
        reply: Reply<()>,
    },
    HasAudio(Reply<bool>),
    Statistics(Reply<StreamStatistics>),
    Snapshot(Reply<SessionSnapshot>),
    Subscribe(Reply<Subscription>),
    Dispose(Reply<()>),
}

/// What woke the actor up
enum Wakeup {
    Frame(Option<EncodedFrame>),
    Publisher(Option<PublisherEvent>),
    Command(Option<Command>),
    Reconnect,
}

/// Owns one capture → encode → {publish, record} session
///
/// Runs as a single task; every public operation goes through a
/// [`SessionHandle`]. Encoder frames, publisher events, commands and the
/// reconnect timer are multiplexed in one loop, so no state is shared.
pub struct SessionController {
    id: u64,
    config: SessionConfig,
    state: SessionState,

    capture: Box<dyn CaptureSource>,
    encoder: Box<dyn Encoder>,
    publisher: Box<dyn Publisher>,
    recorder: Box<dyn Recorder>,

    commands: mpsc::Receiver<Command>,
    frames: Option<mpsc::Receiver<EncodedFrame>>,
    publisher_events: Option<mpsc::UnboundedReceiver<PublisherEvent>>,

    surface_ready: bool,
    pending_preview: Option<(String, Reply<PreviewInfo>)>,
    preview: Option<PreviewInfo>,

    encoder_running: bool,
    /// Video bitrate the running encoder was prepared with
    prepared_bitrate: u32,

    publish_gate: SinkGate,
    record_gate: SinkGate,
    stream_url: Option<String>,
    connected: bool,
    reconnecting: bool,
    reconnect: Option<Pin<Box<Sleep>>>,
    retry: RetryTracker,
    bitrate: BitrateAdapter,
    fps: FpsMeter,

    events: EventBus,
    /// Set on dispose; nothing is emitted afterwards
    silenced: bool,
}

impl SessionController {
    /// Spawn the actor for a new session and return its handle
    pub fn spawn(id: u64, config: SessionConfig, devices: Devices, events: EventBus) -> SessionHandle {
        let (command_tx, command_rx) = mpsc::channel(32);
        let controller = Self::new(id, config, devices, events, command_rx);
        tokio::spawn(controller.run());
        SessionHandle {
            id,
            commands: command_tx,
        }
    }

    fn new(
        id: u64,
        config: SessionConfig,
        devices: Devices,
        events: EventBus,
        commands: mpsc::Receiver<Command>,
    ) -> Self {
        let Devices {
            capture,
            encoder,
            mut publisher,
            recorder,
        } = devices;

        let publisher_events = publisher.subscribe();
        let bitrate = BitrateAdapter::new(BitrateConfig {
            max_bitrate: config.capture.video_bitrate,
            audio_bitrate: config.encoder.audio_bitrate,
            key_frame_interval_secs: config.encoder.key_frame_interval_secs,
            ..config.bitrate.clone()
        });

        Self {
            id,
            state: SessionState::Idle,
            capture,
            encoder,
            publisher,
            recorder,
            commands,
            frames: None,
            publisher_events: Some(publisher_events),
            surface_ready: false,
            pending_preview: None,
            preview: None,
            encoder_running: false,
            prepared_bitrate: config.capture.video_bitrate,
            publish_gate: SinkGate::new(Sink::Publisher),
            record_gate: SinkGate::new(Sink::Recorder),
            stream_url: None,
            connected: false,
            reconnecting: false,
            reconnect: None,
            retry: RetryTracker::new(config.retry.clone()),
            bitrate,
            fps: FpsMeter::new(),
            events,
            silenced: false,
            config,
        }
    }

    async fn run(mut self) {
        info!(
            "Session {} started (camera {}, {:?})",
            self.id, self.config.capture.camera_name, self.config.capture.resolution
        );

        loop {
            let wakeup = tokio::select! {
                biased;
                frame = next_frame(&mut self.frames) => Wakeup::Frame(frame),
                event = next_publisher_event(&mut self.publisher_events) => Wakeup::Publisher(event),
                command = self.commands.recv() => Wakeup::Command(command),
                () = reconnect_due(&mut self.reconnect) => Wakeup::Reconnect,
            };

            match wakeup {
                Wakeup::Frame(Some(frame)) => self.on_frame(frame).await,
                Wakeup::Frame(None) => self.on_encoder_lost().await,
                Wakeup::Publisher(Some(event)) => self.on_publisher_event(event).await,
                Wakeup::Publisher(None) => {
                    debug!("Session {}: publisher event channel closed", self.id);
                    self.publisher_events = None;
                }
                Wakeup::Command(Some(command)) => self.on_command(command).await,
                Wakeup::Command(None) => {
                    // Every handle dropped
                    self.dispose().await;
                }
                Wakeup::Reconnect => self.on_reconnect_due().await,
            }

            if self.state == SessionState::Disposed {
                break;
            }
        }

        info!("Session {} stopped", self.id);
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::SurfaceCreated(reply) => {
                self.surface_created().await;
                let _ = reply.send(Ok(()));
            }
            Command::SurfaceDestroyed(reply) => {
                self.surface_destroyed().await;
                let _ = reply.send(Ok(()));
            }
            Command::StartPreview { camera_name, reply } => {
                self.start_preview(camera_name, reply).await;
            }
            Command::StartRecording { path, reply } => {
                let _ = reply.send(self.start_recording(&path).await);
            }
            Command::StartStreaming { url, bitrate, reply } => {
                let _ = reply.send(self.start_streaming(&url, bitrate).await);
            }
            Command::StartRecordingAndStreaming {
                path,
                url,
                bitrate,
                reply,
            } => {
                let _ = reply.send(self.start_recording_and_streaming(&path, &url, bitrate).await);
            }
            Command::Pause { sink, reply } => {
                let _ = reply.send(self.pause(sink));
            }
            Command::Resume { sink, reply } => {
                let _ = reply.send(self.resume(sink));
            }
            Command::StopStreaming(reply) => {
                let result = self.ensure_not_disposed();
                if result.is_ok() {
                    self.stop_streaming().await;
                }
                let _ = reply.send(result);
            }
            Command::StopRecording(reply) => {
                let result = match self.ensure_not_disposed() {
                    Ok(()) => self.stop_recording().await,
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Command::StopAll(reply) => {
                let result = self.ensure_not_disposed();
                if result.is_ok() {
                    self.stop_all().await;
                }
                let _ = reply.send(result);
            }
            Command::SwitchCamera { camera_name, reply } => {
                let _ = reply.send(self.switch_camera(camera_name).await);
            }
            Command::SwitchAudio { enabled, reply } => {
                let _ = reply.send(self.switch_audio(enabled));
            }
            Command::SwitchFlashlight { enabled, reply } => {
                let _ = reply.send(self.switch_flashlight(enabled));
            }
            Command::TakePicture { path, reply } => {
                let _ = reply.send(self.take_picture(&path).await);
            }
            Command::SetVideoSettings { settings, reply } => {
                let _ = reply.send(self.set_video_settings(settings));
            }
            Command::SetAudioSettings { bitrate, reply } => {
                let _ = reply.send(self.set_audio_settings(bitrate));
            }
            Command::HasAudio(reply) => {
                let _ = reply.send(
                    self.ensure_not_disposed()
                        .map(|()| !self.capture.is_audio_muted()),
                );
            }
            Command::Statistics(reply) => {
                let _ = reply.send(self.ensure_not_disposed().map(|()| self.statistics()));
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(Ok(self.snapshot()));
            }
            Command::Subscribe(reply) => {
                let _ = reply.send(self.ensure_not_disposed().map(|()| self.events.subscribe()));
            }
            Command::Dispose(reply) => {
                self.dispose().await;
                let _ = reply.send(Ok(()));
            }
        }
    }

    // ------------------------------------------------------------------------
    // Guards
    // ------------------------------------------------------------------------

    fn ensure_not_disposed(&self) -> SessionResult<()> {
        if self.state == SessionState::Disposed {
            return Err(SessionError::Disposed);
        }
        Ok(())
    }

    /// Rejects everything but stops, queries and dispose in terminal states
    fn ensure_operable(&self) -> SessionResult<()> {
        match self.state {
            SessionState::Disposed => Err(SessionError::Disposed),
            SessionState::Error => Err(SessionError::InvalidState(self.state.to_string())),
            _ => Ok(()),
        }
    }

    fn ensure_camera(&self) -> SessionResult<()> {
        if self.preview.is_none() {
            return Err(SessionError::InvalidState(self.state.to_string()));
        }
        Ok(())
    }

    async fn ensure_new_file(path: &Path) -> SessionResult<()> {
        if path.as_os_str().is_empty() {
            return Err(SessionError::MissingPath);
        }
        match tokio::fs::try_exists(path).await {
            Ok(false) => Ok(()),
            Ok(true) => Err(SessionError::FileExists(path.to_path_buf())),
            Err(e) => Err(SessionError::Io(e.to_string())),
        }
    }

    // ------------------------------------------------------------------------
    // Preview and surface
    // ------------------------------------------------------------------------

    async fn surface_created(&mut self) {
        debug!("Session {}: surface ready", self.id);
        self.surface_ready = true;

        if let Some((camera_name, reply)) = self.pending_preview.take() {
            info!("Session {}: running deferred preview of camera {}", self.id, camera_name);
            let _ = reply.send(self.attach_camera(camera_name).await);
        }
    }

    async fn surface_destroyed(&mut self) {
        info!("Session {}: surface destroyed", self.id);
        self.surface_ready = false;
        if self.state == SessionState::Disposed {
            return;
        }

        self.stop_all().await;
        if self.preview.take().is_some() {
            if let Err(e) = self.capture.detach().await {
                warn!("Session {}: failed to detach camera: {:#}", self.id, e);
            }
        }
        if !self.state.is_terminal() {
            self.state = SessionState::Idle;
        }
    }

    async fn start_preview(&mut self, camera_name: String, reply: Reply<PreviewInfo>) {
        if let Err(e) = self.ensure_operable() {
            let _ = reply.send(Err(e));
            return;
        }
        if !matches!(
            self.state,
            SessionState::Idle | SessionState::PreviewReady | SessionState::Stopped
        ) {
            let _ = reply.send(Err(SessionError::InvalidState(self.state.to_string())));
            return;
        }

        if !self.surface_ready {
            debug!("Session {}: surface not ready, deferring preview", self.id);
            if let Some((_, superseded)) = self.pending_preview.replace((camera_name, reply)) {
                let _ = superseded.send(Err(SessionError::InvalidState(
                    "preview superseded".to_string(),
                )));
            }
            return;
        }

        let _ = reply.send(self.attach_camera(camera_name).await);
    }

    async fn attach_camera(&mut self, camera_name: String) -> SessionResult<PreviewInfo> {
        let (width, height) = self.config.capture.resolution.size();
        let info = self
            .capture
            .attach(&camera_name, width, height)
            .await
            .map_err(|e| SessionError::DeviceUnavailable(format!("{:#}", e)))?;

        info!(
            "Session {}: preview of camera {} at {}x{}",
            self.id, camera_name, info.width, info.height
        );

        self.config.capture.camera_name = camera_name;
        self.preview = Some(info);
        self.state = SessionState::PreviewReady;
        Ok(info)
    }

    // ------------------------------------------------------------------------
    // Encoder lifecycle
    // ------------------------------------------------------------------------

    /// Prepare and start the encoder unless it already runs
    async fn ensure_encoder(&mut self, bitrate: Option<u32>) -> SessionResult<()> {
        if self.encoder_running {
            if let Some(bitrate) = bitrate {
                debug!(
                    "Session {}: encoder already running at {} bps, ignoring {} bps",
                    self.id, self.prepared_bitrate, bitrate
                );
            }
            return Ok(());
        }

        let (width, height) = self.config.capture.resolution.size();
        let video_bitrate = bitrate.unwrap_or(self.config.capture.video_bitrate);
        let params = EncoderParams {
            width,
            height,
            fps: self.config.encoder.fps,
            video_bitrate,
            audio_bitrate: self.config.encoder.audio_bitrate,
            audio_enabled: self.config.capture.enable_audio,
            key_frame_interval_secs: self.config.encoder.key_frame_interval_secs,
        };

        self.encoder
            .prepare(params)
            .await
            .map_err(SessionError::device)?;
        let frames = self.encoder.start().await.map_err(SessionError::device)?;

        info!(
            "Session {}: {} encoder started at {}x{}, {} bps",
            self.id,
            self.encoder.name(),
            width,
            height,
            video_bitrate
        );

        self.frames = Some(frames);
        self.encoder_running = true;
        self.prepared_bitrate = video_bitrate;
        self.bitrate.set_audio_bitrate(self.config.encoder.audio_bitrate);
        self.bitrate.set_ceiling(video_bitrate);
        self.fps.reset();
        Ok(())
    }

    async fn stop_encoder(&mut self) {
        self.frames = None;
        if !self.encoder_running {
            return;
        }
        if let Err(e) = self.encoder.stop().await {
            warn!("Session {}: failed to stop encoder: {:#}", self.id, e);
        }
        self.encoder_running = false;
        self.fps.reset();
        info!("Session {}: encoder stopped", self.id);
    }

    /// Stop the encoder once no sink is attached
    async fn release_encoder(&mut self) {
        if !self.publish_gate.is_attached() && !self.record_gate.is_attached() {
            self.stop_encoder().await;
        }
    }

    /// Restore the prepared bitrate and key-frame interval on the encoder
    fn apply_bitrate_reset(&mut self) {
        self.bitrate.reset();
        if !self.encoder_running {
            return;
        }
        let Some(params) = self.encoder.params() else {
            return;
        };
        if params.video_bitrate != self.bitrate.current() {
            self.encoder.set_video_bitrate(self.bitrate.current());
        }
        if (params.key_frame_interval_secs - self.bitrate.key_frame_interval()).abs() > f32::EPSILON {
            self.encoder
                .set_key_frame_interval(self.bitrate.key_frame_interval());
        }
    }

    fn settle_state(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.state = match (self.publish_gate.is_attached(), self.record_gate.is_attached()) {
            (true, _) if self.reconnecting => SessionState::Reconnecting,
            (true, true) => SessionState::StreamingAndRecording,
            (true, false) => SessionState::Streaming,
            (false, true) => SessionState::Recording,
            (false, false) if self.state.is_active() => SessionState::Stopped,
            (false, false) => self.state,
        };
    }

    // ------------------------------------------------------------------------
    // Recording
    // ------------------------------------------------------------------------

    async fn start_recording(&mut self, path: &Path) -> SessionResult<()> {
        self.ensure_operable()?;
        if path.as_os_str().is_empty() {
            return Err(SessionError::MissingPath);
        }
        if self.record_gate.is_attached() {
            return Err(SessionError::AlreadyActive(Sink::Recorder));
        }
        self.ensure_camera()?;
        Self::ensure_new_file(path).await?;

        self.ensure_encoder(None).await?;

        if let Err(e) = self.recorder.start(path).await {
            self.release_encoder().await;
            return Err(SessionError::Io(format!("{:#}", e)));
        }

        self.record_gate.attach();
        self.settle_state();
        info!("Session {}: recording to {}", self.id, path.display());
        Ok(())
    }

    async fn stop_recording(&mut self) -> SessionResult<Option<RecordingSummary>> {
        if !self.record_gate.is_attached() {
            return Ok(None);
        }

        self.record_gate.detach();
        let result = self.recorder.stop().await;
        self.release_encoder().await;
        self.settle_state();

        match result {
            Ok(summary) => Ok(Some(summary)),
            Err(e) => {
                error!("Session {}: failed to finish recording: {:#}", self.id, e);
                Err(SessionError::Io(format!("{:#}", e)))
            }
        }
    }

    // ------------------------------------------------------------------------
    // Streaming
    // ------------------------------------------------------------------------

    async fn start_streaming(&mut self, url: &str, bitrate: Option<u32>) -> SessionResult<StreamingToggle> {
        self.ensure_operable()?;
        if url.is_empty() {
            return Err(SessionError::MissingUrl);
        }
        if self.publish_gate.is_attached() {
            info!("Session {}: streaming toggled off", self.id);
            self.stop_streaming().await;
            return Ok(StreamingToggle::Stopped);
        }
        self.ensure_camera()?;

        self.ensure_encoder(bitrate).await?;

        self.stream_url = Some(url.to_string());
        self.connected = false;
        self.reconnecting = false;
        self.retry.reset();
        self.bitrate.set_ceiling(self.prepared_bitrate);
        self.apply_bitrate_reset();
        self.publish_gate.attach();

        info!("Session {}: publishing to {}", self.id, url);

        if let Err(e) = self.publisher.connect(url).await {
            self.publish_gate.detach();
            self.stream_url = None;
            self.release_encoder().await;
            return Err(SessionError::device(e));
        }

        self.settle_state();
        Ok(StreamingToggle::Started)
    }

    async fn stop_streaming(&mut self) {
        if !self.publish_gate.is_attached() {
            return;
        }

        self.reconnect = None;
        self.reconnecting = false;
        self.connected = false;
        self.stream_url = None;
        self.retry.reset();
        self.publish_gate.detach();

        if let Err(e) = self.publisher.close().await {
            warn!("Session {}: failed to close publisher: {:#}", self.id, e);
        }
        self.discard_publisher_events();

        if self.record_gate.is_attached() {
            // The recorder keeps the encoder; give it back its prepared settings
            self.apply_bitrate_reset();
        }
        self.release_encoder().await;
        self.settle_state();
        info!("Session {}: publishing stopped", self.id);
    }

    /// Drop events the publisher reported about a connection we closed
    fn discard_publisher_events(&mut self) {
        if let Some(events) = self.publisher_events.as_mut() {
            while events.try_recv().is_ok() {}
        }
    }

    async fn start_recording_and_streaming(
        &mut self,
        path: &Path,
        url: &str,
        bitrate: Option<u32>,
    ) -> SessionResult<()> {
        self.ensure_operable()?;
        if path.as_os_str().is_empty() {
            return Err(SessionError::MissingPath);
        }
        if url.is_empty() {
            return Err(SessionError::MissingUrl);
        }
        if self.record_gate.is_attached() {
            return Err(SessionError::AlreadyActive(Sink::Recorder));
        }
        if self.publish_gate.is_attached() {
            return Err(SessionError::AlreadyActive(Sink::Publisher));
        }
        self.ensure_camera()?;
        Self::ensure_new_file(path).await?;

        self.ensure_encoder(bitrate).await?;
        self.start_recording(path).await?;

        if let Err(e) = self.start_streaming(url, bitrate).await {
            warn!("Session {}: streaming failed, rolling back recording", self.id);
            if let Err(rollback) = self.stop_recording().await {
                warn!("Session {}: rollback failed: {}", self.id, rollback);
            }
            return Err(e);
        }
        Ok(())
    }

    async fn stop_all(&mut self) {
        self.stop_streaming().await;
        if let Err(e) = self.stop_recording().await {
            warn!("Session {}: {}", self.id, e);
        }
        self.stop_encoder().await;
        self.settle_state();
    }

    fn gate(&mut self, sink: Sink) -> &mut SinkGate {
        match sink {
            Sink::Publisher => &mut self.publish_gate,
            Sink::Recorder => &mut self.record_gate,
        }
    }

    fn pause(&mut self, sink: Sink) -> SessionResult<()> {
        self.ensure_operable()?;
        self.gate(sink).pause()?;
        info!("Session {}: {} paused", self.id, sink);
        Ok(())
    }

    fn resume(&mut self, sink: Sink) -> SessionResult<()> {
        self.ensure_operable()?;
        self.gate(sink).resume()?;
        info!("Session {}: {} resumed", self.id, sink);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Device reconfiguration
    // ------------------------------------------------------------------------

    async fn switch_camera(&mut self, camera_name: String) -> SessionResult<()> {
        self.ensure_operable()?;
        self.capture
            .switch_camera(&camera_name)
            .await
            .map_err(|e| SessionError::DeviceUnavailable(format!("{:#}", e)))?;
        info!("Session {}: switched to camera {}", self.id, camera_name);
        self.config.capture.camera_name = camera_name;
        Ok(())
    }

    fn switch_audio(&mut self, enabled: bool) -> SessionResult<()> {
        self.ensure_operable()?;
        self.capture
            .set_audio_enabled(enabled)
            .map_err(SessionError::device)?;
        self.config.capture.enable_audio = enabled;
        Ok(())
    }

    fn switch_flashlight(&mut self, enabled: bool) -> SessionResult<()> {
        self.ensure_operable()?;
        let camera = self
            .preview
            .and_then(|_| self.capture.active_camera())
            .ok_or_else(|| SessionError::DeviceUnavailable("No camera attached".to_string()))?;
        if camera.lens_facing != LensFacing::Back {
            return Err(SessionError::InvalidFacing);
        }
        self.capture.set_torch(enabled).map_err(SessionError::device)
    }

    fn set_video_settings(&mut self, settings: VideoSettings) -> SessionResult<()> {
        self.ensure_operable()?;

        if let Some(fps) = settings.fps {
            self.config.encoder.fps = fps;
        }
        if let Some(seconds) = settings.key_frame_interval_secs {
            self.config.encoder.key_frame_interval_secs = seconds;
            self.bitrate.set_key_frame_interval(seconds);
        }
        if let Some(bitrate) = settings.bitrate {
            self.config.capture.video_bitrate = bitrate;
            if self.encoder_running {
                self.prepared_bitrate = bitrate;
                self.bitrate.set_ceiling(bitrate);
            }
        }

        info!("Session {}: video settings {:?}", self.id, settings);

        if self.encoder_running
            && (settings.bitrate.is_some() || settings.key_frame_interval_secs.is_some())
        {
            self.apply_bitrate_reset();
        }
        Ok(())
    }

    /// Audio bitrate of the next encoder preparation
    fn set_audio_settings(&mut self, bitrate: u32) -> SessionResult<()> {
        self.ensure_operable()?;
        self.config.encoder.audio_bitrate = bitrate;
        if !self.encoder_running {
            self.bitrate.set_audio_bitrate(bitrate);
        }
        Ok(())
    }

    async fn take_picture(&mut self, path: &Path) -> SessionResult<()> {
        self.ensure_operable()?;
        Self::ensure_new_file(path).await?;
        self.ensure_camera()?;
        self.capture
            .take_picture(path)
            .await
            .map_err(|e| SessionError::Io(format!("{:#}", e)))
    }

    // ------------------------------------------------------------------------
    // Reporting
    // ------------------------------------------------------------------------

    fn statistics(&self) -> StreamStatistics {
        let stats = self.publisher.stats();
        let (width, height) = match (self.encoder_running, self.encoder.params()) {
            (true, Some(params)) => (params.width, params.height),
            _ => self
                .preview
                .map(|p| (p.width, p.height))
                .unwrap_or_default(),
        };

        StreamStatistics {
            cache_size: stats.cache_size,
            sent_audio_frames: stats.sent_audio_frames,
            sent_video_frames: stats.sent_video_frames,
            dropped_audio_frames: stats.dropped_audio_frames,
            dropped_video_frames: stats.dropped_video_frames,
            is_audio_muted: self.capture.is_audio_muted(),
            bitrate: if self.encoder_running {
                self.bitrate.current()
            } else {
                0
            },
            width,
            height,
            fps: self.fps.fps(),
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            is_streaming: self.publish_gate.is_attached(),
            is_recording: self.record_gate.is_attached(),
            streaming_paused: self.publish_gate.is_paused(),
            recording_paused: self.record_gate.is_paused(),
            encoder_running: self.encoder_running,
            retry_count: self.retry.count(),
            current_video_bitrate: if self.encoder_running {
                self.bitrate.current()
            } else {
                0
            },
            capture: self.config.capture.clone(),
        }
    }

    fn emit(&self, event: SessionEvent) {
        if self.silenced {
            return;
        }
        self.events.send(&event);
    }

    async fn dispose(&mut self) {
        if self.state == SessionState::Disposed {
            return;
        }
        info!("Session {}: disposing", self.id);

        self.reconnect = None;
        self.silenced = true;
        self.pending_preview = None;
        self.stop_all().await;

        if self.preview.take().is_some() {
            if let Err(e) = self.capture.detach().await {
                warn!("Session {}: failed to detach camera: {:#}", self.id, e);
            }
        }
        self.state = SessionState::Disposed;
    }

    // ------------------------------------------------------------------------
    // Frame fan-out
    // ------------------------------------------------------------------------

    async fn on_frame(&mut self, frame: EncodedFrame) {
        if !self.encoder_running {
            return;
        }
        self.fps.record(&frame);

        if self.publish_gate.accepts() {
            self.publisher.send(&frame);
        }

        if self.record_gate.accepts() {
            if let Err(e) = self.recorder.write(&frame).await {
                error!("Session {}: recording failed: {:#}", self.id, e);
                self.emit(SessionEvent::new(EventType::Error, format!("{:#}", e)));
                self.record_gate.detach();
                if let Err(e) = self.recorder.stop().await {
                    warn!("Session {}: failed to close recording: {:#}", self.id, e);
                }
                self.release_encoder().await;
                self.settle_state();
            }
        }
    }

    /// The encoder's frame stream ended while it was supposed to run
    async fn on_encoder_lost(&mut self) {
        self.frames = None;
        if !self.encoder_running {
            return;
        }
        error!("Session {}: encoder stream ended unexpectedly", self.id);
        self.emit(SessionEvent::new(
            EventType::Error,
            "Encoder stopped unexpectedly",
        ));

        self.stop_all().await;
        self.state = SessionState::Error;
    }

    // ------------------------------------------------------------------------
    // Publisher events and reconnect
    // ------------------------------------------------------------------------

    async fn on_publisher_event(&mut self, event: PublisherEvent) {
        let streaming = self.publish_gate.is_attached();

        match event {
            PublisherEvent::ConnectionStarted { url } => {
                if streaming {
                    debug!("Session {}: connecting to {}", self.id, url);
                    self.emit(SessionEvent::new(EventType::Wait, "connection wait"));
                }
            }
            PublisherEvent::ConnectionSuccess => {
                if !streaming {
                    return;
                }
                info!("Session {}: connected", self.id);
                self.connected = true;
                self.reconnecting = false;
                self.reconnect = None;
                self.retry.reset();
                self.apply_bitrate_reset();
                self.settle_state();
                self.emit(SessionEvent::new(EventType::Success, "connection success"));
            }
            PublisherEvent::ConnectionFailed { reason } => {
                if streaming {
                    self.on_connection_failed(reason).await;
                }
            }
            PublisherEvent::Disconnected => {
                if !streaming {
                    return;
                }
                warn!("Session {}: disconnected by server", self.id);
                self.emit(SessionEvent::bare(EventType::CameraClosing));
                self.stop_streaming().await;
            }
            PublisherEvent::AuthError => {
                if !streaming {
                    return;
                }
                error!("Session {}: authentication failed", self.id);
                self.emit(SessionEvent::new(EventType::Error, "Auth error"));
                self.stop_streaming().await;
            }
            PublisherEvent::AuthSuccess => {
                debug!("Session {}: authenticated", self.id);
            }
            PublisherEvent::NewBitrate { bitrate, congested } => {
                if !streaming || !self.encoder_running {
                    return;
                }
                match self.bitrate.adapt(bitrate, congested) {
                    BitrateDecision::Hold => {}
                    BitrateDecision::SetBitrate(video_bitrate) => {
                        self.encoder.set_video_bitrate(video_bitrate);
                    }
                    BitrateDecision::SetKeyFrameInterval(seconds) => {
                        self.encoder.set_key_frame_interval(seconds);
                    }
                }
            }
        }
    }

    async fn on_connection_failed(&mut self, reason: String) {
        self.connected = false;
        if self.reconnect.is_some() {
            debug!("Session {}: reconnect already pending, ignoring: {}", self.id, reason);
            return;
        }

        match self.retry.on_failure() {
            RetryDecision::Retry { attempt, delay } => {
                warn!(
                    "Session {}: connection failed ({}), retry {}/{} in {:?}",
                    self.id,
                    reason,
                    attempt,
                    self.retry.policy().max_retries,
                    delay
                );
                self.reconnecting = true;
                self.settle_state();
                self.emit(SessionEvent::new(EventType::RtmpRetry, reason));
                self.reconnect = Some(Box::pin(tokio::time::sleep(delay)));
            }
            RetryDecision::GiveUp { attempts } => {
                error!(
                    "Session {}: connection failed ({}), giving up after {} retries",
                    self.id, reason, attempts
                );
                self.emit(SessionEvent::new(EventType::RtmpStopped, "Failed retry"));
                self.stop_streaming().await;
            }
        }
    }

    async fn on_reconnect_due(&mut self) {
        self.reconnect = None;
        if !self.publish_gate.is_attached() {
            return;
        }
        let Some(url) = self.stream_url.clone() else {
            return;
        };

        info!(
            "Session {}: reconnect attempt {} to {}",
            self.id,
            self.retry.count(),
            url
        );
        self.apply_bitrate_reset();

        if let Err(e) = self.publisher.connect(&url).await {
            self.on_connection_failed(format!("{:#}", e)).await;
        }
    }
}

async fn next_frame(frames: &mut Option<mpsc::Receiver<EncodedFrame>>) -> Option<EncodedFrame> {
    match frames {
        Some(frames) => frames.recv().await,
        None => future::pending().await,
    }
}

async fn next_publisher_event(
    events: &mut Option<mpsc::UnboundedReceiver<PublisherEvent>>,
) -> Option<PublisherEvent> {
    match events {
        Some(events) => events.recv().await,
        None => future::pending().await,
    }
}

async fn reconnect_due(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => future::pending().await,
    }
}

/// Cloneable handle onto a running session
///
/// Every call is answered by the session actor. Once the session is disposed
/// calls fail with [`SessionError::Disposed`]; `dispose` itself stays Ok.
#[derive(Clone)]
pub struct SessionHandle {
    id: u64,
    commands: mpsc::Sender<Command>,
}

impl SessionHandle {
    /// Texture id of the session
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the session actor has exited
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> SessionResult<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(command(reply_tx))
            .await
            .map_err(|_| SessionError::Disposed)?;
        reply_rx.await.map_err(|_| SessionError::Disposed)?
    }

    pub async fn surface_created(&self) -> SessionResult<()> {
        self.request(Command::SurfaceCreated).await
    }

    pub async fn surface_destroyed(&self) -> SessionResult<()> {
        self.request(Command::SurfaceDestroyed).await
    }

    /// Attach a camera; waits for the surface when it is not ready yet
    pub async fn start_preview(&self, camera_name: impl Into<String>) -> SessionResult<PreviewInfo> {
        let camera_name = camera_name.into();
        self.request(|reply| Command::StartPreview { camera_name, reply })
            .await
    }

    pub async fn start_recording(&self, path: impl Into<PathBuf>) -> SessionResult<()> {
        let path = path.into();
        self.request(|reply| Command::StartRecording { path, reply })
            .await
    }

    /// Start publishing, or stop when already publishing
    pub async fn start_streaming(
        &self,
        url: impl Into<String>,
        bitrate: Option<u32>,
    ) -> SessionResult<StreamingToggle> {
        let url = url.into();
        self.request(|reply| Command::StartStreaming { url, bitrate, reply })
            .await
    }

    pub async fn start_recording_and_streaming(
        &self,
        path: impl Into<PathBuf>,
        url: impl Into<String>,
        bitrate: Option<u32>,
    ) -> SessionResult<()> {
        let path = path.into();
        let url = url.into();
        self.request(|reply| Command::StartRecordingAndStreaming {
            path,
            url,
            bitrate,
            reply,
        })
        .await
    }

    pub async fn pause(&self, sink: Sink) -> SessionResult<()> {
        self.request(|reply| Command::Pause { sink, reply }).await
    }

    pub async fn resume(&self, sink: Sink) -> SessionResult<()> {
        self.request(|reply| Command::Resume { sink, reply }).await
    }

    pub async fn stop_streaming(&self) -> SessionResult<()> {
        self.request(Command::StopStreaming).await
    }

    /// Stop recording; returns what was written, `None` when not recording
    pub async fn stop_recording(&self) -> SessionResult<Option<RecordingSummary>> {
        self.request(Command::StopRecording).await
    }

    pub async fn stop_all(&self) -> SessionResult<()> {
        self.request(Command::StopAll).await
    }

    pub async fn switch_camera(&self, camera_name: impl Into<String>) -> SessionResult<()> {
        let camera_name = camera_name.into();
        self.request(|reply| Command::SwitchCamera { camera_name, reply })
            .await
    }

    pub async fn switch_audio(&self, enabled: bool) -> SessionResult<()> {
        self.request(|reply| Command::SwitchAudio { enabled, reply })
            .await
    }

    pub async fn switch_flashlight(&self, enabled: bool) -> SessionResult<()> {
        self.request(|reply| Command::SwitchFlashlight { enabled, reply })
            .await
    }

    pub async fn take_picture(&self, path: impl Into<PathBuf>) -> SessionResult<()> {
        let path = path.into();
        self.request(|reply| Command::TakePicture { path, reply })
            .await
    }

    /// Change bitrate, key-frame interval or frame rate
    pub async fn set_video_settings(&self, settings: VideoSettings) -> SessionResult<()> {
        self.request(|reply| Command::SetVideoSettings { settings, reply })
            .await
    }

    pub async fn set_audio_settings(&self, bitrate: u32) -> SessionResult<()> {
        self.request(|reply| Command::SetAudioSettings { bitrate, reply })
            .await
    }

    /// Whether the microphone track is live (not muted)
    pub async fn has_audio(&self) -> SessionResult<bool> {
        self.request(Command::HasAudio).await
    }

    pub async fn statistics(&self) -> SessionResult<StreamStatistics> {
        self.request(Command::Statistics).await
    }

    pub async fn snapshot(&self) -> SessionResult<SessionSnapshot> {
        self.request(Command::Snapshot).await
    }

    /// Receive this session's events from now on
    pub async fn subscribe(&self) -> SessionResult<Subscription> {
        self.request(Command::Subscribe).await
    }

    pub async fn dispose(&self) -> SessionResult<()> {
        match self.request(Command::Dispose).await {
            Err(SessionError::Disposed) => Ok(()),
            other => other,
        }
    }
}
