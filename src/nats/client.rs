use anyhow::{Context, Result};
use async_nats::Client;
use std::future::Future;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::messages::SessionEventMessage;
use crate::session::{EventSink, SessionEvent};

/// Subject prefix for relayed session events
pub const EVENT_SUBJECT_PREFIX: &str = "rtmp.events";

#[derive(Clone)]
pub struct NatsClient {
    client: Client,
}

impl NatsClient {
    /// Connect to NATS server
    pub async fn connect(url: &str) -> Result<Self> {
        info!("Connecting to NATS at {}", url);

        let client = async_nats::connect(url)
            .await
            .context("Failed to connect to NATS")?;

        info!("Connected to NATS successfully");

        Ok(Self { client })
    }

    pub fn event_subject(texture_id: u64) -> String {
        format!("{}.{}", EVENT_SUBJECT_PREFIX, texture_id)
    }

    /// Publish one session event to `rtmp.events.<textureId>`
    pub async fn publish_event(&self, texture_id: u64, event: &SessionEvent) -> Result<()> {
        let subject = Self::event_subject(texture_id);
        let message = SessionEventMessage::new(texture_id, event);
        let payload = serde_json::to_vec(&message)?;

        self.client
            .publish(subject.clone(), payload.into())
            .await
            .context("Failed to publish session event")?;

        debug!("Published {:?} to {}", event.event_type, subject);

        Ok(())
    }

    /// Relay for the events of one session
    pub fn event_sink(&self, texture_id: u64) -> NatsEventSink {
        let client = self.clone();
        NatsEventSink::from_fn(move |event| {
            let client = client.clone();
            async move { client.publish_event(texture_id, &event).await }
        })
    }
}

/// Forwards a session's events to NATS without blocking the session
///
/// One task publishes the events in the order they were sent; it ends once
/// the sink is dropped and its queue is drained.
pub struct NatsEventSink {
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl NatsEventSink {
    /// Sink that hands every event, in order, to `publish`
    pub fn from_fn<F, Fut>(mut publish: F) -> Self
    where
        F: FnMut(SessionEvent) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<SessionEvent>();

        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                if let Err(e) = publish(event).await {
                    warn!("Failed to relay session event: {:#}", e);
                }
            }
        });

        Self { events: events_tx }
    }
}

impl EventSink for NatsEventSink {
    fn send(&self, event: &SessionEvent) {
        if self.events.send(event.clone()).is_err() {
            warn!("Session event relay stopped, dropping {:?}", event.event_type);
        }
    }
}
