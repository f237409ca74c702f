use serde::{Deserialize, Serialize};

use crate::session::{EventType, SessionEvent};

/// Session event relayed over NATS
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionEventMessage {
    pub texture_id: u64,
    pub event_type: EventType,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error_description: Option<String>,
    pub timestamp: String, // RFC3339 timestamp
}

impl SessionEventMessage {
    pub fn new(texture_id: u64, event: &SessionEvent) -> Self {
        Self {
            texture_id,
            event_type: event.event_type,
            error_description: event.description.clone(),
            timestamp: event.timestamp.to_rfc3339(),
        }
    }
}
