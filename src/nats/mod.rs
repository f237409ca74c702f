//! Optional relay of session events to NATS

pub mod client;
pub mod messages;

pub use client::{NatsClient, NatsEventSink};
pub use messages::SessionEventMessage;
