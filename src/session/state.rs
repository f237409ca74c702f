//! Session state machine
//!
//! Defines the lifecycle states of a session and the sinks fed by its encoder.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    /// No camera attached
    #[default]
    Idle,
    /// Camera attached to the surface, encoder idle
    PreviewReady,
    /// Publishing only
    Streaming,
    /// Recording only
    Recording,
    /// Publishing and recording from one encoder
    StreamingAndRecording,
    /// Publish path waiting for or running a reconnect attempt
    Reconnecting,
    /// Every sink detached after having been active
    Stopped,
    /// Unrecoverable device or codec failure
    Error,
    /// Explicitly disposed
    Disposed,
}

impl SessionState {
    /// States that accept no further operations
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Error | SessionState::Disposed)
    }

    /// States with at least one sink attached to the encoder
    pub fn is_active(self) -> bool {
        matches!(
            self,
            SessionState::Streaming
                | SessionState::Recording
                | SessionState::StreamingAndRecording
                | SessionState::Reconnecting
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "Idle",
            SessionState::PreviewReady => "PreviewReady",
            SessionState::Streaming => "Streaming",
            SessionState::Recording => "Recording",
            SessionState::StreamingAndRecording => "StreamingAndRecording",
            SessionState::Reconnecting => "Reconnecting",
            SessionState::Stopped => "Stopped",
            SessionState::Error => "Error",
            SessionState::Disposed => "Disposed",
        };
        f.write_str(name)
    }
}

/// Consumer of the encoded stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sink {
    Publisher,
    Recorder,
}

impl fmt::Display for Sink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sink::Publisher => write!(f, "Streaming"),
            Sink::Recorder => write!(f, "Recording"),
        }
    }
}

/// Result of the streaming toggle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamingToggle {
    Started,
    Stopped,
}
