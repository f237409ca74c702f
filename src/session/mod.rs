//! Streaming/recording session management
//!
//! This module provides the `SessionController` actor that manages:
//! - Camera attachment and device switches on the capture source
//! - Encoder lifecycle shared by the recorder and the publisher
//! - Fan-out of encoded frames to attached, unpaused sinks
//! - Reconnect with backoff when the publish connection fails
//! - Bitrate adaptation from publisher congestion reports
//! - Event notifications and statistics

mod bitrate;
mod config;
mod events;
mod fanout;
mod retry;
mod session;
mod state;
mod stats;

pub use bitrate::{BitrateAdapter, BitrateConfig, BitrateDecision};
pub use config::{CaptureConfig, EncoderDefaults, SessionConfig, VideoSettings};
pub use events::{EventBus, EventSink, EventType, SessionEvent, Subscription};
pub use fanout::{FpsMeter, SinkGate};
pub use retry::{BackoffPolicy, RetryDecision, RetryPolicy, RetryTracker};
pub use session::{SessionController, SessionHandle};
pub use state::{SessionState, Sink, StreamingToggle};
pub use stats::{SessionSnapshot, StreamStatistics};
