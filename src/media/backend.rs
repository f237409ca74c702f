use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

/// Elementary stream a frame belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Video,
    Audio,
}

/// Compressed frame emitted by an encoder (H.264 NAL units or AAC)
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    /// Which elementary stream this frame belongs to
    pub kind: TrackKind,
    /// Encoded payload
    pub data: Vec<u8>,
    /// Presentation timestamp in microseconds since the encoder started
    pub timestamp_us: u64,
    /// True for IDR video frames
    pub key_frame: bool,
    /// Per-track sequence number assigned by the encoder, starting at 0
    pub sequence: u64,
}

/// Which way a camera lens faces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LensFacing {
    Front,
    Back,
    External,
}

/// A camera reported by the capture source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraDescription {
    pub name: String,
    pub lens_facing: LensFacing,
    /// Clockwise rotation of the sensor in degrees (0, 90, 180, 270)
    pub sensor_orientation: u32,
}

/// Capture resolution requested by the application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResolutionPreset {
    /// 352x288
    Low,
    /// 640x480
    Medium,
    /// 1280x720
    #[default]
    High,
    /// 1920x1080
    VeryHigh,
    /// 3840x2160
    UltraHigh,
    /// Largest the device offers, 1920x1080 when unknown
    Max,
}

impl ResolutionPreset {
    /// Landscape frame size (width, height) for this preset
    pub fn size(self) -> (u32, u32) {
        match self {
            ResolutionPreset::Low => (352, 288),
            ResolutionPreset::Medium => (640, 480),
            ResolutionPreset::High => (1280, 720),
            ResolutionPreset::VeryHigh => (1920, 1080),
            ResolutionPreset::UltraHigh => (3840, 2160),
            ResolutionPreset::Max => (1920, 1080),
        }
    }
}

/// Preview geometry returned when the camera is attached to the surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewInfo {
    pub width: u32,
    pub height: u32,
    /// Clockwise rotation of the preview in quarter turns
    pub quarter_turns: u32,
}

/// Parameters used to prepare the encoder
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderParams {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Video bitrate in bits per second
    pub video_bitrate: u32,
    /// Audio bitrate in bits per second
    pub audio_bitrate: u32,
    /// Whether the microphone track is encoded
    pub audio_enabled: bool,
    /// Maximum distance between key frames
    pub key_frame_interval_secs: f32,
}

/// Connection lifecycle and congestion reports from a publisher
#[derive(Debug, Clone, PartialEq)]
pub enum PublisherEvent {
    ConnectionStarted { url: String },
    ConnectionSuccess,
    ConnectionFailed { reason: String },
    Disconnected,
    AuthError,
    AuthSuccess,
    /// Throughput sample in bits per second, with the transport's congestion flag
    NewBitrate { bitrate: u64, congested: bool },
}

/// Transport counters kept by a publisher
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublisherStats {
    /// Frames queued but not yet written to the network
    pub cache_size: usize,
    pub sent_audio_frames: u64,
    pub sent_video_frames: u64,
    pub dropped_audio_frames: u64,
    pub dropped_video_frames: u64,
}

/// What a recorder wrote between start and stop
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordingSummary {
    pub path: PathBuf,
    pub video_frames: u64,
    pub audio_frames: u64,
    pub bytes_written: u64,
}

/// Camera and microphone devices
///
/// Implementations:
/// - Native camera stacks behind the platform surface
/// - Loopback: in-process devices for the control server and tests
#[async_trait]
pub trait CaptureSource: Send + Sync {
    /// Cameras available on this device
    fn cameras(&self) -> Vec<CameraDescription>;

    /// Camera currently attached, if any
    fn active_camera(&self) -> Option<CameraDescription>;

    /// Open a camera and attach it to the rendering surface
    async fn attach(&mut self, camera_name: &str, width: u32, height: u32) -> Result<PreviewInfo>;

    /// Release the camera
    async fn detach(&mut self) -> Result<()>;

    /// Switch to another camera without touching the encoder
    async fn switch_camera(&mut self, camera_name: &str) -> Result<()>;

    /// Mute or unmute the microphone
    fn set_audio_enabled(&mut self, enabled: bool) -> Result<()>;

    fn is_audio_muted(&self) -> bool;

    /// Turn the torch of the active camera on or off
    fn set_torch(&mut self, enabled: bool) -> Result<()>;

    /// Write a still image of the current preview to `path`
    async fn take_picture(&mut self, path: &Path) -> Result<()>;

    /// Backend name for logging
    fn name(&self) -> &str;
}

/// Video/audio encoder fed by the capture source
#[async_trait]
pub trait Encoder: Send + Sync {
    /// Configure the codecs; must be called before `start`
    async fn prepare(&mut self, params: EncoderParams) -> Result<()>;

    /// Start encoding
    ///
    /// Returns a channel receiver that will receive encoded frames of both
    /// tracks in capture order. The channel closes when the encoder stops.
    async fn start(&mut self) -> Result<mpsc::Receiver<EncodedFrame>>;

    /// Stop encoding and release the codecs
    async fn stop(&mut self) -> Result<()>;

    /// Change the video bitrate while running
    fn set_video_bitrate(&mut self, bitrate: u32);

    /// Change the maximum key-frame interval while running
    fn set_key_frame_interval(&mut self, seconds: f32);

    fn is_running(&self) -> bool;

    /// Parameters from the last `prepare`, with on-the-fly changes applied
    fn params(&self) -> Option<EncoderParams>;

    fn name(&self) -> &str;
}

/// Outbound live transport (RTMP)
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Register for connection and congestion events
    ///
    /// Called once by the session controller before the first `connect`.
    fn subscribe(&mut self) -> mpsc::UnboundedReceiver<PublisherEvent>;

    /// Begin connecting; the outcome is reported as a `PublisherEvent`
    async fn connect(&mut self, url: &str) -> Result<()>;

    /// Queue an encoded frame for transmission
    fn send(&mut self, frame: &EncodedFrame);

    /// Close the connection
    async fn close(&mut self) -> Result<()>;

    fn stats(&self) -> PublisherStats;

    fn name(&self) -> &str;
}

/// Writer of encoded frames to a local file
#[async_trait]
pub trait Recorder: Send + Sync {
    /// Create the output file and start accepting frames
    async fn start(&mut self, path: &Path) -> Result<()>;

    /// Queue a frame for writing, waiting while the writer is behind
    async fn write(&mut self, frame: &EncodedFrame) -> Result<()>;

    /// Flush and close the file
    async fn stop(&mut self) -> Result<RecordingSummary>;

    fn name(&self) -> &str;
}

/// Collaborators owned by one session
pub struct Devices {
    pub capture: Box<dyn CaptureSource>,
    pub encoder: Box<dyn Encoder>,
    pub publisher: Box<dyn Publisher>,
    pub recorder: Box<dyn Recorder>,
}

/// Builds the collaborator set for each new session
///
/// The variant (native stack, loopback) is chosen when the registry is
/// composed, never per call.
pub trait DeviceFactory: Send + Sync {
    /// Cameras that sessions created by this factory can open
    fn cameras(&self) -> Vec<CameraDescription>;

    /// Fresh, exclusively owned devices for one session
    fn create(&self) -> Result<Devices>;
}
