use anyhow::Result;
use serde::Deserialize;
use std::path::PathBuf;

use crate::session::{
    BackoffPolicy, BitrateConfig, CaptureConfig, EncoderDefaults, RetryPolicy, SessionConfig,
};

/// Prefix of environment overrides, e.g. `RTMP_STREAM_SERVICE__HTTP__PORT=9000`
pub const ENV_PREFIX: &str = "RTMP_STREAM";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub service: ServiceConfig,
    pub stream: StreamConfig,
    pub recording: RecordingConfig,
    pub events: EventsConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    pub http: HttpConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "rtmp-stream".to_string(),
            http: HttpConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8787,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

/// Encoding, reconnect and bitrate adaptation settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub max_retries: u32,
    pub backoff: BackoffKind,
    /// Wait before each reconnect with fixed backoff
    pub retry_delay_ms: u64,
    /// Exponential backoff waits `backoff_base^attempt` seconds
    pub backoff_base: f64,
    pub max_backoff_ms: u64,

    pub video_bitrate: u32,
    pub min_video_bitrate: u32,
    pub audio_bitrate: u32,
    pub fps: u32,
    pub key_frame_interval_secs: f32,

    /// Healthy samples before the bitrate steps up
    pub healthy_samples: u32,
    /// Stalled samples before each key-frame interval reduction
    pub stall_samples: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        let bitrate = BitrateConfig::default();
        let encoder = EncoderDefaults::default();
        Self {
            max_retries: RetryPolicy::default().max_retries,
            backoff: BackoffKind::Fixed,
            retry_delay_ms: 5000,
            backoff_base: 2.0,
            max_backoff_ms: 30_000,
            video_bitrate: CaptureConfig::default().video_bitrate,
            min_video_bitrate: bitrate.min_bitrate,
            audio_bitrate: encoder.audio_bitrate,
            fps: encoder.fps,
            key_frame_interval_secs: encoder.key_frame_interval_secs,
            healthy_samples: bitrate.healthy_samples,
            stall_samples: bitrate.stall_samples,
        }
    }
}

impl StreamConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        let backoff = match self.backoff {
            BackoffKind::Fixed => BackoffPolicy::Fixed {
                delay_ms: self.retry_delay_ms,
            },
            BackoffKind::Exponential => BackoffPolicy::Exponential {
                base: self.backoff_base,
                max_delay_ms: self.max_backoff_ms,
            },
        };
        RetryPolicy {
            max_retries: self.max_retries,
            backoff,
        }
    }

    /// Session configuration for a camera chosen by the application
    pub fn session_config(&self, mut capture: CaptureConfig) -> SessionConfig {
        if capture.video_bitrate == 0 {
            capture.video_bitrate = self.video_bitrate;
        }
        SessionConfig {
            bitrate: BitrateConfig {
                max_bitrate: capture.video_bitrate,
                min_bitrate: self.min_video_bitrate,
                audio_bitrate: self.audio_bitrate,
                healthy_samples: self.healthy_samples,
                stall_samples: self.stall_samples,
                key_frame_interval_secs: self.key_frame_interval_secs,
            },
            capture,
            retry: self.retry_policy(),
            encoder: EncoderDefaults {
                fps: self.fps,
                key_frame_interval_secs: self.key_frame_interval_secs,
                audio_bitrate: self.audio_bitrate,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// Where relative recording and picture paths are resolved; `~` allowed
    pub output_dir: String,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            output_dir: "~/Movies/rtmp-stream".to_string(),
        }
    }
}

impl RecordingConfig {
    pub fn output_dir(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.output_dir).into_owned())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Relay session events to this NATS server when set
    pub nats_url: Option<String>,
}

impl Config {
    /// Load `path` (extension optional, may be missing) plus environment overrides
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Parse a TOML document without consulting the environment
    pub fn from_toml(toml: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}
