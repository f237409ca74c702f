use anyhow::Result;
use chrono::TimeZone;
use parking_lot::Mutex;
use rtmp_stream::nats::{NatsClient, NatsEventSink, SessionEventMessage};
use rtmp_stream::session::{EventSink, EventType, SessionEvent};
use std::sync::Arc;
use std::time::Duration;

fn event(event_type: EventType, description: Option<&str>) -> SessionEvent {
    SessionEvent {
        event_type,
        description: description.map(str::to_string),
        timestamp: chrono::Utc.with_ymd_and_hms(2025, 10, 27, 14, 30, 0).unwrap(),
    }
}

#[test]
fn test_session_event_message_serialization() {
    let msg = SessionEventMessage::new(7, &event(EventType::RtmpRetry, Some("Connection refused")));

    let json = serde_json::to_string(&msg).unwrap();
    assert!(json.contains("\"texture_id\":7"));
    assert!(json.contains("\"event_type\":\"rtmp_retry\""));
    assert!(json.contains("\"error_description\":\"Connection refused\""));
    assert!(json.contains("2025-10-27T14:30:00"));

    let deserialized: SessionEventMessage = serde_json::from_str(&json).unwrap();
    assert_eq!(deserialized.texture_id, 7);
    assert_eq!(deserialized.event_type, EventType::RtmpRetry);
    assert_eq!(deserialized.error_description.as_deref(), Some("Connection refused"));
}

#[test]
fn test_session_event_message_without_description() {
    let msg = SessionEventMessage::new(1, &event(EventType::CameraClosing, None));

    let json = serde_json::to_string(&msg).unwrap();
    assert!(json.contains("\"event_type\":\"camera_closing\""));
    assert!(!json.contains("error_description"));

    let deserialized: SessionEventMessage = serde_json::from_str(&json).unwrap();
    assert!(deserialized.error_description.is_none());
}

#[test]
fn test_event_subject_per_session() {
    assert_eq!(NatsClient::event_subject(3), "rtmp.events.3");
}

#[tokio::test]
async fn test_event_relay_keeps_emission_order() -> Result<()> {
    let relayed = Arc::new(Mutex::new(Vec::new()));
    let sink = {
        let relayed = Arc::clone(&relayed);
        NatsEventSink::from_fn(move |event: SessionEvent| {
            let relayed = Arc::clone(&relayed);
            async move {
                // Earlier events take longer to publish
                let delay = match event.event_type {
                    EventType::Wait => 30,
                    EventType::RtmpRetry => 10,
                    _ => 0,
                };
                tokio::time::sleep(Duration::from_millis(delay)).await;
                relayed.lock().push(event.event_type);
                Ok(())
            }
        })
    };

    sink.send(&SessionEvent::new(EventType::Wait, "connection wait"));
    for _ in 0..3 {
        sink.send(&SessionEvent::new(EventType::RtmpRetry, "Connection refused"));
    }
    sink.send(&SessionEvent::new(EventType::RtmpStopped, "Failed retry"));

    tokio::time::timeout(Duration::from_secs(5), async {
        while relayed.lock().len() < 5 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await?;

    assert_eq!(
        *relayed.lock(),
        vec![
            EventType::Wait,
            EventType::RtmpRetry,
            EventType::RtmpRetry,
            EventType::RtmpRetry,
            EventType::RtmpStopped,
        ]
    );

    Ok(())
}
