//! Adaptive video bitrate
//!
//! Adjusts the encoder's video bitrate from the publisher's throughput
//! samples:
//! - Congested with a measurable throughput: drop straight to what the link
//!   carries minus the audio track, never below the floor
//! - Congested with nothing getting through: keep the bitrate, shorten the
//!   key-frame interval after repeated stalls
//! - Healthy for a run of samples: step up by a tenth of the ceiling
//!
//! The ceiling is the bitrate the stream was prepared with.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Adaptation parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BitrateConfig {
    /// Ceiling in bps; replaced by the prepared stream bitrate
    pub max_bitrate: u32,
    /// Lowest bitrate ever requested, in bps
    pub min_bitrate: u32,
    /// Fixed audio bitrate, subtracted from measured throughput
    pub audio_bitrate: u32,
    /// Consecutive healthy samples before stepping up
    pub healthy_samples: u32,
    /// Consecutive stalled samples before each key-frame interval reduction
    pub stall_samples: u32,
    /// Key-frame interval the encoder is prepared with, in seconds
    pub key_frame_interval_secs: f32,
}

impl Default for BitrateConfig {
    fn default() -> Self {
        Self {
            max_bitrate: 1200 * 1000,
            min_bitrate: 300 * 1024,
            audio_bitrate: 128 * 1000,
            healthy_samples: 15,
            stall_samples: 3,
            key_frame_interval_secs: 2.0,
        }
    }
}

/// Change to push to the encoder
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BitrateDecision {
    Hold,
    SetBitrate(u32),
    SetKeyFrameInterval(f32),
}

/// Bitrate adaptation state for one stream
#[derive(Debug, Clone)]
pub struct BitrateAdapter {
    config: BitrateConfig,
    current: u32,
    healthy: u32,
    stalled: u32,
    key_frame_interval_secs: f32,
}

impl BitrateAdapter {
    pub fn new(config: BitrateConfig) -> Self {
        let mut adapter = Self {
            current: 0,
            healthy: 0,
            stalled: 0,
            key_frame_interval_secs: config.key_frame_interval_secs,
            config,
        };
        adapter.config.max_bitrate = adapter.config.max_bitrate.max(1);
        adapter.current = adapter.config.max_bitrate;
        adapter
    }

    pub fn current(&self) -> u32 {
        self.current
    }

    pub fn max_bitrate(&self) -> u32 {
        self.config.max_bitrate
    }

    /// Effective lower bound; never above the ceiling
    pub fn min_bitrate(&self) -> u32 {
        self.config.min_bitrate.min(self.config.max_bitrate)
    }

    pub fn key_frame_interval(&self) -> f32 {
        self.key_frame_interval_secs
    }

    pub fn healthy_count(&self) -> u32 {
        self.healthy
    }

    pub fn stalled_count(&self) -> u32 {
        self.stalled
    }

    /// Lowest bitrate a congestion drop may request
    fn floor(&self) -> u32 {
        (self.config.max_bitrate / 10).max(self.min_bitrate())
    }

    fn increment(&self) -> u32 {
        (self.config.max_bitrate / 10).max(1)
    }

    /// Use a new ceiling (the stream was prepared with `max_bitrate`)
    pub fn set_ceiling(&mut self, max_bitrate: u32) {
        self.config.max_bitrate = max_bitrate.max(1);
        self.reset();
    }

    /// Key-frame interval to return to once the link recovers
    pub fn set_key_frame_interval(&mut self, seconds: f32) {
        self.config.key_frame_interval_secs = seconds;
        self.key_frame_interval_secs = seconds;
        self.stalled = 0;
    }

    /// Audio bitrate of the prepared stream
    pub fn set_audio_bitrate(&mut self, audio_bitrate: u32) {
        self.config.audio_bitrate = audio_bitrate;
    }

    /// Back to the ceiling with clean counters
    pub fn reset(&mut self) {
        self.current = self.config.max_bitrate;
        self.healthy = 0;
        self.stalled = 0;
        self.key_frame_interval_secs = self.config.key_frame_interval_secs;
    }

    /// Feed one throughput sample
    pub fn adapt(&mut self, measured_bps: u64, congested: bool) -> BitrateDecision {
        if !congested {
            self.stalled = 0;
            self.healthy += 1;
            if self.healthy < self.config.healthy_samples {
                return BitrateDecision::Hold;
            }
            self.healthy = 0;

            let next = self
                .current
                .saturating_add(self.increment())
                .min(self.config.max_bitrate);
            return self.change_to(next, measured_bps);
        }

        self.healthy = 0;

        if measured_bps > 0 {
            self.stalled = 0;
            let available = measured_bps
                .saturating_sub(self.config.audio_bitrate as u64)
                .min(u32::MAX as u64) as u32;
            let next = available.clamp(self.floor(), self.config.max_bitrate);
            return self.change_to(next, measured_bps);
        }

        self.stalled += 1;
        let run = self.config.stall_samples.max(1);
        let target = if self.stalled == run {
            1.0
        } else if self.stalled == run * 2 {
            0.5
        } else {
            return BitrateDecision::Hold;
        };

        if target >= self.key_frame_interval_secs {
            return BitrateDecision::Hold;
        }

        info!(
            "Connection stalled for {} samples, key-frame interval {:.1}s -> {:.1}s",
            self.stalled, self.key_frame_interval_secs, target
        );
        self.key_frame_interval_secs = target;
        BitrateDecision::SetKeyFrameInterval(target)
    }

    fn change_to(&mut self, next: u32, measured_bps: u64) -> BitrateDecision {
        if next == self.current {
            return BitrateDecision::Hold;
        }
        debug!(
            "Video bitrate {} -> {} bps (measured {} bps)",
            self.current, next, measured_bps
        );
        self.current = next;
        BitrateDecision::SetBitrate(next)
    }
}
