//! Session notifications
//!
//! Every asynchronous outcome (transport failure, retry, reconnect) is
//! reported as a [`SessionEvent`]. Events go to in-process subscribers over a
//! broadcast channel and to any number of relays (e.g. NATS).

use chrono::{DateTime, Utc};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Kind of notification, as seen by the application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Error,
    CameraClosing,
    RtmpStopped,
    RtmpRetry,
    Success,
    Wait,
}

/// One notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEvent {
    pub event_type: EventType,
    #[serde(rename = "errorDescription", skip_serializing_if = "Option::is_none", default)]
    pub description: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl SessionEvent {
    pub fn new(event_type: EventType, description: impl Into<String>) -> Self {
        Self {
            event_type,
            description: Some(description.into()),
            timestamp: Utc::now(),
        }
    }

    pub fn bare(event_type: EventType) -> Self {
        Self {
            event_type,
            description: None,
            timestamp: Utc::now(),
        }
    }
}

/// One-way notification channel to the application
pub trait EventSink: Send + Sync {
    fn send(&self, event: &SessionEvent);
}

/// Fans session events out to subscribers and relays
pub struct EventBus {
    sender: broadcast::Sender<SessionEvent>,
    relays: Vec<Arc<dyn EventSink>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(64)
    }

    /// Bus whose subscribers may fall `capacity` events behind before lagging
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            relays: Vec::new(),
        }
    }

    /// Also forward every event to `relay`
    pub fn with_relay(mut self, relay: Arc<dyn EventSink>) -> Self {
        self.relays.push(relay);
        self
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: Some(self.sender.subscribe()),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for EventBus {
    fn send(&self, event: &SessionEvent) {
        debug!(
            "Session event {:?}: {}",
            event.event_type,
            event.description.as_deref().unwrap_or("")
        );
        // No subscribers is fine
        let _ = self.sender.send(event.clone());
        for relay in &self.relays {
            relay.send(event);
        }
    }
}

/// Receiving end of a session's events
///
/// Ends when the session is disposed or the subscription is cancelled.
pub struct Subscription {
    receiver: Option<broadcast::Receiver<SessionEvent>>,
}

impl Subscription {
    /// Next event, or `None` once the subscription has ended
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        let receiver = self.receiver.as_mut()?;
        loop {
            match receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Event subscriber lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.receiver = None;
                    return None;
                }
            }
        }
    }

    /// Next already-delivered event, without waiting
    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        let receiver = self.receiver.as_mut()?;
        loop {
            match receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!("Event subscriber lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Closed) => {
                    self.receiver = None;
                    return None;
                }
            }
        }
    }

    /// Stop receiving; later `recv` calls return `None`
    pub fn cancel(&mut self) {
        self.receiver = None;
    }

    pub fn is_cancelled(&self) -> bool {
        self.receiver.is_none()
    }

    pub fn into_stream(self) -> impl Stream<Item = SessionEvent> + Send {
        stream::unfold(self, |mut subscription| async move {
            let event = subscription.recv().await?;
            Some((event, subscription))
        })
    }
}
