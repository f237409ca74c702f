use serde::{Deserialize, Serialize};

use super::bitrate::BitrateConfig;
use super::retry::RetryPolicy;
use crate::media::ResolutionPreset;

/// Camera and encoding choices made when the session is created
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureConfig {
    /// Camera to open (e.g., "0")
    pub camera_name: String,

    pub resolution: ResolutionPreset,

    /// Whether the microphone track is captured and encoded
    pub enable_audio: bool,

    /// Target video bitrate in bps, used when a stream is started without one
    /// Default: 1.2 Mbps
    pub video_bitrate: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            camera_name: "0".to_string(),
            resolution: ResolutionPreset::default(),
            enable_audio: true,
            video_bitrate: 1200 * 1000,
        }
    }
}

/// Configuration for one session controller
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub capture: CaptureConfig,

    /// Reconnect policy of the publish path
    pub retry: RetryPolicy,

    /// Bitrate adaptation; the ceiling is replaced by each stream's bitrate
    pub bitrate: BitrateConfig,

    pub encoder: EncoderDefaults,
}

/// Encoder settings not chosen by the application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderDefaults {
    /// Default: 30
    pub fps: u32,

    /// Default: 2 seconds
    pub key_frame_interval_secs: f32,

    /// Default: 128 kbps
    pub audio_bitrate: u32,
}

impl Default for EncoderDefaults {
    fn default() -> Self {
        Self {
            fps: 30,
            key_frame_interval_secs: 2.0,
            audio_bitrate: 128 * 1000,
        }
    }
}

/// Encoder changes requested while the session runs; `None` keeps a value
///
/// Bitrate and key-frame interval reach a running encoder immediately. The
/// frame rate is used the next time the encoder is prepared.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoSettings {
    /// New video bitrate ceiling in bps
    pub bitrate: Option<u32>,
    pub key_frame_interval_secs: Option<f32>,
    pub fps: Option<u32>,
}
