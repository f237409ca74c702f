//! Capture, codec and transport collaborators
//!
//! The session controller only sees the traits in `backend`. `loopback`
//! provides in-process implementations; `recorder` writes encoded frames to
//! disk.

pub mod backend;
pub mod loopback;
pub mod recorder;

pub use backend::{
    CameraDescription, CaptureSource, DeviceFactory, Devices, EncodedFrame, Encoder,
    EncoderParams, LensFacing, PreviewInfo, Publisher, PublisherEvent, PublisherStats,
    Recorder, RecordingSummary, ResolutionPreset, TrackKind,
};
pub use loopback::{
    default_cameras, loopback_devices, CaptureProbe, ConnectOutcome, EncoderProbe,
    LoopbackCapture, LoopbackEncoder, LoopbackFactory, LoopbackProbes, LoopbackPublisher,
    PublisherProbe,
};
pub use recorder::{read_dump, FileRecorder};
