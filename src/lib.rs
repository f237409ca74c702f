pub mod config;
pub mod error;
pub mod http;
pub mod media;
pub mod methods;
pub mod nats;
pub mod registry;
pub mod session;

pub use config::Config;
pub use error::{ErrorResponse, SessionError, SessionResult};
pub use http::{create_router, AppState};
pub use media::{
    CaptureSource, DeviceFactory, Devices, EncodedFrame, Encoder, FileRecorder, LoopbackFactory,
    Publisher, PublisherEvent, Recorder, ResolutionPreset,
};
pub use methods::{MethodCall, MethodCallHandler};
pub use nats::{NatsClient, NatsEventSink};
pub use registry::SessionRegistry;
pub use session::{
    CaptureConfig, EventBus, EventSink, EventType, SessionConfig, SessionController, SessionEvent,
    SessionHandle, SessionSnapshot, SessionState, Sink, StreamStatistics, StreamingToggle,
    Subscription, VideoSettings,
};
