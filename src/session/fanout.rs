//! Per-sink gating of the encoded stream and frame-rate measurement

use std::collections::VecDeque;

use crate::error::{SessionError, SessionResult};
use crate::media::{EncodedFrame, TrackKind};

use super::state::Sink;

/// Attach and pause flags of one consumer of the encoded stream
#[derive(Debug, Clone, Copy)]
pub struct SinkGate {
    sink: Sink,
    attached: bool,
    paused: bool,
}

impl SinkGate {
    pub fn new(sink: Sink) -> Self {
        Self {
            sink,
            attached: false,
            paused: false,
        }
    }

    pub fn attach(&mut self) {
        self.attached = true;
        self.paused = false;
    }

    pub fn detach(&mut self) {
        self.attached = false;
        self.paused = false;
    }

    /// Stop delivering frames; the sink stays attached
    pub fn pause(&mut self) -> SessionResult<()> {
        if !self.attached {
            return Err(SessionError::NotActive(self.sink));
        }
        self.paused = true;
        Ok(())
    }

    pub fn resume(&mut self) -> SessionResult<()> {
        if !self.attached {
            return Err(SessionError::NotActive(self.sink));
        }
        self.paused = false;
        Ok(())
    }

    /// Whether the next frame should be written to this sink
    pub fn accepts(&self) -> bool {
        self.attached && !self.paused
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }
}

/// Video frames per second over a sliding one-second window
#[derive(Debug, Default)]
pub struct FpsMeter {
    window: VecDeque<u64>,
}

const WINDOW_US: u64 = 1_000_000;

impl FpsMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, frame: &EncodedFrame) {
        if frame.kind != TrackKind::Video {
            return;
        }
        // Encoder restarted: timestamps went backwards
        if self.window.back().is_some_and(|&last| frame.timestamp_us < last) {
            self.window.clear();
        }
        self.window.push_back(frame.timestamp_us);
        while let Some(&oldest) = self.window.front() {
            if frame.timestamp_us - oldest < WINDOW_US {
                break;
            }
            self.window.pop_front();
        }
    }

    pub fn fps(&self) -> u32 {
        self.window.len() as u32
    }

    pub fn reset(&mut self) {
        self.window.clear();
    }
}
