//! Loopback devices
//!
//! In-process stand-ins for the native camera, codec and RTMP stacks. The
//! control server runs them in paced mode (synthetic frames at the prepared
//! frame rate); tests drive them by hand through the probe handles, which
//! share state with the device they were created with.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use super::backend::{
    CameraDescription, CaptureSource, DeviceFactory, Devices, EncodedFrame, Encoder,
    EncoderParams, LensFacing, PreviewInfo, Publisher, PublisherEvent, PublisherStats,
    TrackKind,
};
use super::recorder::FileRecorder;

/// Rear camera "0" and front camera "1", as most phones report them
pub fn default_cameras() -> Vec<CameraDescription> {
    vec![
        CameraDescription {
            name: "0".to_string(),
            lens_facing: LensFacing::Back,
            sensor_orientation: 90,
        },
        CameraDescription {
            name: "1".to_string(),
            lens_facing: LensFacing::Front,
            sensor_orientation: 270,
        },
    ]
}

// ============================================================================
// Capture
// ============================================================================

#[derive(Debug)]
struct CaptureState {
    cameras: Vec<CameraDescription>,
    unavailable: HashSet<String>,
    active: Option<String>,
    attached: bool,
    muted: bool,
    torch: bool,
}

pub struct LoopbackCapture {
    state: Arc<Mutex<CaptureState>>,
}

/// Test handle onto a [`LoopbackCapture`]
#[derive(Clone)]
pub struct CaptureProbe {
    state: Arc<Mutex<CaptureState>>,
}

impl LoopbackCapture {
    pub fn new(cameras: Vec<CameraDescription>) -> (Self, CaptureProbe) {
        let state = Arc::new(Mutex::new(CaptureState {
            cameras,
            unavailable: HashSet::new(),
            active: None,
            attached: false,
            muted: false,
            torch: false,
        }));
        (
            Self {
                state: Arc::clone(&state),
            },
            CaptureProbe { state },
        )
    }

    fn open(state: &mut CaptureState, camera_name: &str) -> Result<CameraDescription> {
        let camera = state
            .cameras
            .iter()
            .find(|c| c.name == camera_name)
            .cloned()
            .with_context(|| format!("No camera named {}", camera_name))?;
        if state.unavailable.contains(camera_name) {
            bail!("Camera {} is in use by another client", camera_name);
        }
        Ok(camera)
    }
}

#[async_trait]
impl CaptureSource for LoopbackCapture {
    fn cameras(&self) -> Vec<CameraDescription> {
        self.state.lock().cameras.clone()
    }

    fn active_camera(&self) -> Option<CameraDescription> {
        let state = self.state.lock();
        let active = state.active.as_ref()?;
        state.cameras.iter().find(|c| &c.name == active).cloned()
    }

    async fn attach(&mut self, camera_name: &str, width: u32, height: u32) -> Result<PreviewInfo> {
        let mut state = self.state.lock();
        let camera = Self::open(&mut state, camera_name)?;
        state.active = Some(camera.name.clone());
        state.attached = true;
        state.torch = false;

        info!("Loopback camera {} attached at {}x{}", camera.name, width, height);

        Ok(PreviewInfo {
            width,
            height,
            quarter_turns: camera.sensor_orientation / 90,
        })
    }

    async fn detach(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        state.attached = false;
        state.torch = false;
        Ok(())
    }

    async fn switch_camera(&mut self, camera_name: &str) -> Result<()> {
        let mut state = self.state.lock();
        let camera = Self::open(&mut state, camera_name)?;
        state.active = Some(camera.name);
        state.torch = false;
        Ok(())
    }

    fn set_audio_enabled(&mut self, enabled: bool) -> Result<()> {
        self.state.lock().muted = !enabled;
        Ok(())
    }

    fn is_audio_muted(&self) -> bool {
        self.state.lock().muted
    }

    fn set_torch(&mut self, enabled: bool) -> Result<()> {
        let mut state = self.state.lock();
        if !state.attached {
            bail!("No camera attached");
        }
        state.torch = enabled;
        Ok(())
    }

    async fn take_picture(&mut self, path: &Path) -> Result<()> {
        let attached = self.state.lock().attached;
        if !attached {
            bail!("No camera attached");
        }
        // Empty JPEG: start-of-image followed by end-of-image
        tokio::fs::write(path, [0xFF, 0xD8, 0xFF, 0xD9])
            .await
            .with_context(|| format!("Failed saving image to {:?}", path))?;
        Ok(())
    }

    fn name(&self) -> &str {
        "loopback"
    }
}

impl CaptureProbe {
    /// Make `open`/`switch` of this camera fail
    pub fn set_unavailable(&self, camera_name: &str) {
        self.state.lock().unavailable.insert(camera_name.to_string());
    }

    pub fn is_attached(&self) -> bool {
        self.state.lock().attached
    }

    pub fn active_camera(&self) -> Option<String> {
        self.state.lock().active.clone()
    }

    pub fn torch(&self) -> bool {
        self.state.lock().torch
    }

    pub fn is_muted(&self) -> bool {
        self.state.lock().muted
    }
}

// ============================================================================
// Encoder
// ============================================================================

#[derive(Default)]
struct EncoderState {
    params: Option<EncoderParams>,
    frame_tx: Option<mpsc::Sender<EncodedFrame>>,
    running: bool,
    started_at: Option<Instant>,
    video_sequence: u64,
    audio_sequence: u64,
    prepare_count: usize,
    start_count: usize,
    bitrate_changes: Vec<u32>,
    key_frame_interval_changes: Vec<f32>,
}

impl EncoderState {
    fn next_frame(&mut self, kind: TrackKind, key_frame: bool) -> Option<(mpsc::Sender<EncodedFrame>, EncodedFrame)> {
        let frame_tx = self.frame_tx.clone()?;
        let params = self.params.as_ref()?;
        let fps = params.fps.max(1);
        let size = match kind {
            TrackKind::Video => (params.video_bitrate / 8 / fps).clamp(16, 64 * 1024),
            TrackKind::Audio => (params.audio_bitrate / 8 / 50).max(16),
        };
        let timestamp_us = self
            .started_at
            .map(|t| t.elapsed().as_micros() as u64)
            .unwrap_or_default();
        let sequence = match kind {
            TrackKind::Video => {
                self.video_sequence += 1;
                self.video_sequence - 1
            }
            TrackKind::Audio => {
                self.audio_sequence += 1;
                self.audio_sequence - 1
            }
        };

        Some((
            frame_tx,
            EncodedFrame {
                kind,
                data: vec![0u8; size as usize],
                timestamp_us,
                key_frame: kind == TrackKind::Video && key_frame,
                sequence,
            },
        ))
    }
}

pub struct LoopbackEncoder {
    state: Arc<Mutex<EncoderState>>,
    paced: bool,
    pacer: Option<JoinHandle<()>>,
}

/// Test handle onto a [`LoopbackEncoder`]
#[derive(Clone)]
pub struct EncoderProbe {
    state: Arc<Mutex<EncoderState>>,
}

impl LoopbackEncoder {
    /// Encoder that only emits frames pushed through its probe
    pub fn manual() -> (Self, EncoderProbe) {
        Self::build(false)
    }

    /// Encoder that emits synthetic frames at the prepared frame rate
    pub fn paced() -> (Self, EncoderProbe) {
        Self::build(true)
    }

    fn build(paced: bool) -> (Self, EncoderProbe) {
        let state = Arc::new(Mutex::new(EncoderState::default()));
        (
            Self {
                state: Arc::clone(&state),
                paced,
                pacer: None,
            },
            EncoderProbe { state },
        )
    }

    fn spawn_pacer(&self, params: &EncoderParams) -> JoinHandle<()> {
        let state = Arc::clone(&self.state);
        let fps = params.fps.max(1);
        let key_every = ((params.key_frame_interval_secs * fps as f32) as u64).max(1);
        let audio = params.audio_enabled;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1) / fps);
            let mut tick = 0u64;
            loop {
                ticker.tick().await;
                let mut frames = Vec::with_capacity(2);
                {
                    let mut state = state.lock();
                    if !state.running {
                        break;
                    }
                    frames.extend(state.next_frame(TrackKind::Video, tick % key_every == 0));
                    if audio {
                        frames.extend(state.next_frame(TrackKind::Audio, false));
                    }
                }
                for (frame_tx, frame) in frames {
                    if frame_tx.send(frame).await.is_err() {
                        return;
                    }
                }
                tick += 1;
            }
        })
    }
}

#[async_trait]
impl Encoder for LoopbackEncoder {
    async fn prepare(&mut self, params: EncoderParams) -> Result<()> {
        let mut state = self.state.lock();
        if state.running {
            bail!("Encoder is running");
        }
        if params.width == 0 || params.height == 0 {
            bail!("Invalid resolution {}x{}", params.width, params.height);
        }
        debug!(
            "Loopback encoder prepared: {}x{} @ {} bps",
            params.width, params.height, params.video_bitrate
        );
        state.params = Some(params);
        state.prepare_count += 1;
        Ok(())
    }

    async fn start(&mut self) -> Result<mpsc::Receiver<EncodedFrame>> {
        let (params, frame_rx) = {
            let mut state = self.state.lock();
            let params = state.params.clone().context("Encoder not prepared")?;
            let (frame_tx, frame_rx) = mpsc::channel(64);
            state.frame_tx = Some(frame_tx);
            state.running = true;
            state.started_at = Some(Instant::now());
            state.video_sequence = 0;
            state.audio_sequence = 0;
            state.start_count += 1;
            (params, frame_rx)
        };

        if self.paced {
            self.pacer = Some(self.spawn_pacer(&params));
        }
        Ok(frame_rx)
    }

    async fn stop(&mut self) -> Result<()> {
        {
            let mut state = self.state.lock();
            state.running = false;
            state.frame_tx = None;
        }
        if let Some(pacer) = self.pacer.take() {
            pacer.abort();
        }
        Ok(())
    }

    fn set_video_bitrate(&mut self, bitrate: u32) {
        let mut state = self.state.lock();
        if let Some(params) = state.params.as_mut() {
            params.video_bitrate = bitrate;
        }
        state.bitrate_changes.push(bitrate);
    }

    fn set_key_frame_interval(&mut self, seconds: f32) {
        let mut state = self.state.lock();
        if let Some(params) = state.params.as_mut() {
            params.key_frame_interval_secs = seconds;
        }
        state.key_frame_interval_changes.push(seconds);
    }

    fn is_running(&self) -> bool {
        self.state.lock().running
    }

    fn params(&self) -> Option<EncoderParams> {
        self.state.lock().params.clone()
    }

    fn name(&self) -> &str {
        "loopback"
    }
}

impl Drop for LoopbackEncoder {
    fn drop(&mut self) {
        if let Some(pacer) = self.pacer.take() {
            pacer.abort();
        }
    }
}

impl EncoderProbe {
    /// Emit one video frame; false when the encoder is not running
    pub async fn push_video(&self, key_frame: bool) -> bool {
        self.push(TrackKind::Video, key_frame).await
    }

    /// Emit one audio frame; false when the encoder is not running
    pub async fn push_audio(&self) -> bool {
        self.push(TrackKind::Audio, false).await
    }

    async fn push(&self, kind: TrackKind, key_frame: bool) -> bool {
        let next = {
            let mut state = self.state.lock();
            if !state.running {
                return false;
            }
            state.next_frame(kind, key_frame)
        };
        match next {
            Some((frame_tx, frame)) => frame_tx.send(frame).await.is_ok(),
            None => false,
        }
    }

    /// Close the frame channel as a crashed codec would
    pub fn fail(&self) {
        self.state.lock().frame_tx = None;
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    pub fn params(&self) -> Option<EncoderParams> {
        self.state.lock().params.clone()
    }

    pub fn prepare_count(&self) -> usize {
        self.state.lock().prepare_count
    }

    pub fn start_count(&self) -> usize {
        self.state.lock().start_count
    }

    /// Every bitrate pushed on the fly, oldest first
    pub fn bitrate_changes(&self) -> Vec<u32> {
        self.state.lock().bitrate_changes.clone()
    }

    pub fn key_frame_interval_changes(&self) -> Vec<f32> {
        self.state.lock().key_frame_interval_changes.clone()
    }
}

// ============================================================================
// Publisher
// ============================================================================

/// How the loopback server answers a connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    Accept,
    Reject(String),
    AuthFailure,
}

struct PublisherState {
    script: VecDeque<ConnectOutcome>,
    fallback: ConnectOutcome,
    connect_urls: Vec<String>,
    connected: bool,
    /// Kind and sequence of every frame sent; `None` keeps no history
    received: Option<Vec<(TrackKind, u64)>>,
    stats: PublisherStats,
    events: Option<mpsc::UnboundedSender<PublisherEvent>>,
}

impl PublisherState {
    fn emit(&self, event: PublisherEvent) -> bool {
        match &self.events {
            Some(events) => events.send(event).is_ok(),
            None => false,
        }
    }
}

pub struct LoopbackPublisher {
    state: Arc<Mutex<PublisherState>>,
}

/// Test handle onto a [`LoopbackPublisher`]
#[derive(Clone)]
pub struct PublisherProbe {
    state: Arc<Mutex<PublisherState>>,
}

impl LoopbackPublisher {
    /// Publisher whose server accepts every connection; only counts frames
    pub fn new() -> (Self, PublisherProbe) {
        Self::build(false)
    }

    /// Like [`LoopbackPublisher::new`], also remembering every frame sent
    /// for [`PublisherProbe::video_sequences`]
    pub fn recording() -> (Self, PublisherProbe) {
        Self::build(true)
    }

    fn build(record: bool) -> (Self, PublisherProbe) {
        let state = Arc::new(Mutex::new(PublisherState {
            script: VecDeque::new(),
            fallback: ConnectOutcome::Accept,
            connect_urls: Vec::new(),
            connected: false,
            received: record.then(Vec::new),
            stats: PublisherStats::default(),
            events: None,
        }));
        (
            Self {
                state: Arc::clone(&state),
            },
            PublisherProbe { state },
        )
    }
}

#[async_trait]
impl Publisher for LoopbackPublisher {
    fn subscribe(&mut self) -> mpsc::UnboundedReceiver<PublisherEvent> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.state.lock().events = Some(events_tx);
        events_rx
    }

    async fn connect(&mut self, url: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.connect_urls.push(url.to_string());
        state.connected = false;
        state.emit(PublisherEvent::ConnectionStarted {
            url: url.to_string(),
        });

        let scripted = state.script.pop_front();
        let outcome = scripted.unwrap_or_else(|| state.fallback.clone());
        match outcome {
            ConnectOutcome::Accept => {
                state.connected = true;
                state.emit(PublisherEvent::ConnectionSuccess);
            }
            ConnectOutcome::Reject(reason) => {
                state.emit(PublisherEvent::ConnectionFailed { reason });
            }
            ConnectOutcome::AuthFailure => {
                state.emit(PublisherEvent::AuthError);
            }
        }
        Ok(())
    }

    fn send(&mut self, frame: &EncodedFrame) {
        let mut state = self.state.lock();
        if state.connected {
            if let Some(received) = state.received.as_mut() {
                received.push((frame.kind, frame.sequence));
            }
            match frame.kind {
                TrackKind::Video => state.stats.sent_video_frames += 1,
                TrackKind::Audio => state.stats.sent_audio_frames += 1,
            }
        } else {
            match frame.kind {
                TrackKind::Video => state.stats.dropped_video_frames += 1,
                TrackKind::Audio => state.stats.dropped_audio_frames += 1,
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        if state.connected {
            state.connected = false;
            state.emit(PublisherEvent::Disconnected);
        }
        Ok(())
    }

    fn stats(&self) -> PublisherStats {
        self.state.lock().stats
    }

    fn name(&self) -> &str {
        "loopback"
    }
}

impl PublisherProbe {
    /// Reject the next `count` connects with `reason`
    pub fn fail_next(&self, count: usize, reason: &str) {
        let mut state = self.state.lock();
        for _ in 0..count {
            state
                .script
                .push_back(ConnectOutcome::Reject(reason.to_string()));
        }
    }

    /// Queue the outcome of the next unscripted connect
    pub fn push_outcome(&self, outcome: ConnectOutcome) {
        self.state.lock().script.push_back(outcome);
    }

    /// Answer every unscripted connect with `outcome`
    pub fn set_fallback(&self, outcome: ConnectOutcome) {
        self.state.lock().fallback = outcome;
    }

    /// Inject an event as if the transport reported it
    pub fn emit(&self, event: PublisherEvent) -> bool {
        self.state.lock().emit(event)
    }

    /// Drop the connection from the server side
    pub fn drop_connection(&self, reason: &str) -> bool {
        let mut state = self.state.lock();
        state.connected = false;
        state.emit(PublisherEvent::ConnectionFailed {
            reason: reason.to_string(),
        })
    }

    /// URLs of every connect, oldest first
    pub fn connect_attempts(&self) -> Vec<String> {
        self.state.lock().connect_urls.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    /// Sequence numbers of the video frames written to the network
    ///
    /// Empty unless the publisher was built with [`LoopbackPublisher::recording`].
    pub fn video_sequences(&self) -> Vec<u64> {
        self.sequences(TrackKind::Video)
    }

    pub fn audio_sequences(&self) -> Vec<u64> {
        self.sequences(TrackKind::Audio)
    }

    fn sequences(&self, kind: TrackKind) -> Vec<u64> {
        self.state
            .lock()
            .received
            .iter()
            .flatten()
            .filter(|(k, _)| *k == kind)
            .map(|(_, seq)| *seq)
            .collect()
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Probes onto one loopback device set
#[derive(Clone)]
pub struct LoopbackProbes {
    pub capture: CaptureProbe,
    pub encoder: EncoderProbe,
    pub publisher: PublisherProbe,
}

/// Build a manually driven device set with the default cameras
pub fn loopback_devices() -> (Devices, LoopbackProbes) {
    build_devices(default_cameras(), false)
}

fn build_devices(cameras: Vec<CameraDescription>, paced: bool) -> (Devices, LoopbackProbes) {
    let (capture, capture_probe) = LoopbackCapture::new(cameras);
    let (encoder, encoder_probe) = if paced {
        LoopbackEncoder::paced()
    } else {
        LoopbackEncoder::manual()
    };
    // Paced devices run for the life of the server; keep no per-frame history
    let (publisher, publisher_probe) = if paced {
        LoopbackPublisher::new()
    } else {
        LoopbackPublisher::recording()
    };

    (
        Devices {
            capture: Box::new(capture),
            encoder: Box::new(encoder),
            publisher: Box::new(publisher),
            recorder: Box::new(FileRecorder::new()),
        },
        LoopbackProbes {
            capture: capture_probe,
            encoder: encoder_probe,
            publisher: publisher_probe,
        },
    )
}

/// Creates loopback device sets for the session registry
///
/// Manual factories keep the probes of every device set they create so tests
/// can reach them; paced factories keep none.
pub struct LoopbackFactory {
    cameras: Vec<CameraDescription>,
    paced: bool,
    probes: Mutex<Vec<LoopbackProbes>>,
}

impl LoopbackFactory {
    /// Factory whose encoders generate frames on their own
    pub fn paced() -> Self {
        Self {
            cameras: default_cameras(),
            paced: true,
            probes: Mutex::new(Vec::new()),
        }
    }

    /// Factory whose encoders only emit frames pushed through probes
    pub fn manual() -> Self {
        Self {
            cameras: default_cameras(),
            paced: false,
            probes: Mutex::new(Vec::new()),
        }
    }

    /// Probes of every device set created so far, oldest first; always
    /// empty for a paced factory
    pub fn probes(&self) -> Vec<LoopbackProbes> {
        self.probes.lock().clone()
    }
}

impl DeviceFactory for LoopbackFactory {
    fn cameras(&self) -> Vec<CameraDescription> {
        self.cameras.clone()
    }

    fn create(&self) -> Result<Devices> {
        let (devices, probes) = build_devices(self.cameras.clone(), self.paced);
        if !self.paced {
            self.probes.lock().push(probes);
        }
        Ok(devices)
    }
}
