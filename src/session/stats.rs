use serde::{Deserialize, Serialize};

use super::config::CaptureConfig;
use super::state::SessionState;

/// Transport and encoder counters reported to the application
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStatistics {
    /// Frames queued by the publisher but not yet sent
    pub cache_size: usize,

    pub sent_audio_frames: u64,
    pub sent_video_frames: u64,
    pub dropped_audio_frames: u64,
    pub dropped_video_frames: u64,

    pub is_audio_muted: bool,

    /// Current video bitrate in bits per second (0 when the encoder is idle)
    pub bitrate: u32,

    pub width: u32,
    pub height: u32,

    /// Video frames per second measured over the last full second
    pub fps: u32,
}

/// Point-in-time view of a session's controller state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub is_streaming: bool,
    pub is_recording: bool,
    pub streaming_paused: bool,
    pub recording_paused: bool,
    pub encoder_running: bool,
    pub retry_count: u32,
    pub current_video_bitrate: u32,
    pub capture: CaptureConfig,
}
