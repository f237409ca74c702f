// Integration tests for the session controller
//
// These drive a session over loopback devices: frames are pushed through the
// encoder probe and connection outcomes are scripted on the publisher probe.

use anyhow::Result;
use rtmp_stream::media::{loopback_devices, read_dump, ConnectOutcome, LoopbackProbes, PublisherEvent};
use rtmp_stream::session::{
    BackoffPolicy, EventBus, EventType, RetryPolicy, SessionConfig, SessionController,
    SessionEvent, SessionHandle, SessionState, Sink, StreamingToggle, Subscription, VideoSettings,
};
use rtmp_stream::SessionError;
use std::time::Duration;
use tempfile::TempDir;

const URL: &str = "rtmp://live.example.com/app/stream-key";

fn spawn_session(config: SessionConfig) -> (SessionHandle, LoopbackProbes) {
    let (devices, probes) = loopback_devices();
    let handle = SessionController::spawn(1, config, devices, EventBus::new());
    (handle, probes)
}

async fn previewing(config: SessionConfig) -> Result<(SessionHandle, LoopbackProbes)> {
    let (session, probes) = spawn_session(config);
    session.surface_created().await?;
    session.start_preview("0").await?;
    Ok((session, probes))
}

fn with_retries(max_retries: u32, delay_ms: u64) -> SessionConfig {
    SessionConfig {
        retry: RetryPolicy {
            max_retries,
            backoff: BackoffPolicy::Fixed { delay_ms },
        },
        ..Default::default()
    }
}

/// Receive events up to and including the first one of type `last`
async fn events_until(subscription: &mut Subscription, last: EventType) -> Result<Vec<SessionEvent>> {
    let collect = async {
        let mut events = Vec::new();
        while let Some(event) = subscription.recv().await {
            let done = event.event_type == last;
            events.push(event);
            if done {
                break;
            }
        }
        events
    };
    Ok(tokio::time::timeout(Duration::from_secs(600), collect).await?)
}

fn count(events: &[SessionEvent], event_type: EventType) -> usize {
    events.iter().filter(|e| e.event_type == event_type).count()
}

#[tokio::test]
async fn test_encoder_runs_only_while_a_sink_is_attached() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let (session, probes) = previewing(SessionConfig::default()).await?;

    async fn check(session: &SessionHandle, probes: &LoopbackProbes) -> Result<()> {
        let snapshot = session.snapshot().await?;
        assert_eq!(
            snapshot.encoder_running,
            snapshot.is_streaming || snapshot.is_recording,
            "encoder running must follow attached sinks: {:?}",
            snapshot
        );
        assert_eq!(probes.encoder.is_running(), snapshot.encoder_running);
        Ok(())
    }

    check(&session, &probes).await?;

    session.start_recording(temp_dir.path().join("a.dump")).await?;
    check(&session, &probes).await?;

    session.start_streaming(URL, None).await?;
    check(&session, &probes).await?;

    session.stop_recording().await?;
    check(&session, &probes).await?;

    session.start_recording(temp_dir.path().join("b.dump")).await?;
    check(&session, &probes).await?;

    session.stop_streaming().await?;
    check(&session, &probes).await?;

    session.stop_recording().await?;
    check(&session, &probes).await?;

    session.start_streaming(URL, None).await?;
    check(&session, &probes).await?;

    session.stop_all().await?;
    check(&session, &probes).await?;

    session
        .start_recording_and_streaming(temp_dir.path().join("c.dump"), URL, None)
        .await?;
    check(&session, &probes).await?;

    session.stop_streaming().await?;
    check(&session, &probes).await?;

    session.stop_recording().await?;
    check(&session, &probes).await?;

    assert_eq!(session.snapshot().await?.state, SessionState::Stopped);

    // No-ops when nothing is attached
    session.stop_streaming().await?;
    assert_eq!(session.stop_recording().await?, None);
    check(&session, &probes).await?;

    Ok(())
}

#[tokio::test]
async fn test_streaming_joins_running_recording_encoder() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let (session, probes) = previewing(SessionConfig::default()).await?;

    session.start_recording(temp_dir.path().join("rec.dump")).await?;
    assert_eq!(probes.encoder.prepare_count(), 1);

    // Override is ignored: the encoder already runs for the recording
    session.start_streaming(URL, Some(2_500_000)).await?;
    assert_eq!(probes.encoder.prepare_count(), 1);
    assert_eq!(probes.encoder.start_count(), 1);
    assert_eq!(
        session.snapshot().await?.state,
        SessionState::StreamingAndRecording
    );

    let params = probes.encoder.params().unwrap();
    assert_eq!(params.video_bitrate, 1_200_000);

    Ok(())
}

#[tokio::test]
async fn test_streaming_toggle_resets_bitrate() -> Result<()> {
    let (session, probes) = previewing(SessionConfig::default()).await?;

    assert_eq!(session.start_streaming(URL, None).await?, StreamingToggle::Started);
    let snapshot = session.snapshot().await?;
    assert_eq!(snapshot.state, SessionState::Streaming);
    assert_eq!(snapshot.current_video_bitrate, 1_200_000);

    probes.publisher.emit(PublisherEvent::NewBitrate {
        bitrate: 500_000,
        congested: true,
    });
    assert_eq!(session.snapshot().await?.current_video_bitrate, 372_000);
    assert_eq!(probes.encoder.bitrate_changes(), vec![372_000]);

    assert_eq!(session.start_streaming(URL, None).await?, StreamingToggle::Stopped);
    let snapshot = session.snapshot().await?;
    assert_eq!(snapshot.state, SessionState::Stopped);
    assert!(!snapshot.is_streaming);
    assert!(!probes.encoder.is_running());

    assert_eq!(session.start_streaming(URL, None).await?, StreamingToggle::Started);
    let snapshot = session.snapshot().await?;
    assert_eq!(snapshot.current_video_bitrate, 1_200_000);
    assert_eq!(snapshot.retry_count, 0);
    assert_eq!(probes.encoder.params().unwrap().video_bitrate, 1_200_000);
    assert_eq!(probes.publisher.connect_attempts().len(), 2);

    Ok(())
}

#[tokio::test]
async fn test_streaming_bitrate_override_sets_ceiling() -> Result<()> {
    let (session, probes) = previewing(SessionConfig::default()).await?;

    session.start_streaming(URL, Some(2_000_000)).await?;
    assert_eq!(probes.encoder.params().unwrap().video_bitrate, 2_000_000);

    // max(500k - 128k, 2M / 10)
    probes.publisher.emit(PublisherEvent::NewBitrate {
        bitrate: 500_000,
        congested: true,
    });
    assert_eq!(session.snapshot().await?.current_video_bitrate, 372_000);

    for _ in 0..15 {
        probes.publisher.emit(PublisherEvent::NewBitrate {
            bitrate: 400_000,
            congested: false,
        });
    }
    assert_eq!(session.snapshot().await?.current_video_bitrate, 572_000);
    assert_eq!(probes.encoder.bitrate_changes(), vec![372_000, 572_000]);

    Ok(())
}

#[tokio::test]
async fn test_stalled_connection_shortens_key_frame_interval() -> Result<()> {
    let (session, probes) = previewing(SessionConfig::default()).await?;
    session.start_streaming(URL, None).await?;

    for _ in 0..6 {
        probes.publisher.emit(PublisherEvent::NewBitrate {
            bitrate: 0,
            congested: true,
        });
    }
    session.snapshot().await?;

    assert_eq!(probes.encoder.key_frame_interval_changes(), vec![1.0, 0.5]);
    assert!(probes.encoder.bitrate_changes().is_empty());

    Ok(())
}

#[tokio::test]
async fn test_video_settings_reach_running_encoder() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let (session, probes) = previewing(SessionConfig::default()).await?;
    session.start_streaming(URL, None).await?;

    session
        .set_video_settings(VideoSettings {
            bitrate: Some(800_000),
            key_frame_interval_secs: Some(1.0),
            fps: Some(15),
        })
        .await?;
    assert_eq!(probes.encoder.bitrate_changes(), vec![800_000]);
    assert_eq!(probes.encoder.key_frame_interval_changes(), vec![1.0]);
    assert_eq!(probes.encoder.params().unwrap().fps, 30);

    let snapshot = session.snapshot().await?;
    assert_eq!(snapshot.current_video_bitrate, 800_000);
    assert_eq!(snapshot.capture.video_bitrate, 800_000);

    // The new bitrate is the ceiling
    for _ in 0..15 {
        probes.publisher.emit(PublisherEvent::NewBitrate {
            bitrate: 2_000_000,
            congested: false,
        });
    }
    assert_eq!(session.snapshot().await?.current_video_bitrate, 800_000);

    // Frame rate and the rest apply when the encoder is prepared again
    session.stop_streaming().await?;
    session.start_recording(temp_dir.path().join("after.dump")).await?;
    let params = probes.encoder.params().unwrap();
    assert_eq!(params.video_bitrate, 800_000);
    assert_eq!(params.key_frame_interval_secs, 1.0);
    assert_eq!(params.fps, 15);
    assert_eq!(probes.encoder.prepare_count(), 2);

    Ok(())
}

#[tokio::test]
async fn test_audio_settings_and_mute() -> Result<()> {
    let (session, probes) = previewing(SessionConfig::default()).await?;
    assert!(session.has_audio().await?);

    session.switch_audio(false).await?;
    assert!(!session.has_audio().await?);

    session.set_audio_settings(64_000).await?;
    session.start_streaming(URL, None).await?;
    assert_eq!(probes.encoder.params().unwrap().audio_bitrate, 64_000);

    // 500k measured minus the 64k audio track
    probes.publisher.emit(PublisherEvent::NewBitrate {
        bitrate: 500_000,
        congested: true,
    });
    assert_eq!(session.snapshot().await?.current_video_bitrate, 436_000);

    Ok(())
}

#[tokio::test]
async fn test_missing_arguments_and_existing_file() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let existing = temp_dir.path().join("existing.dump");
    std::fs::write(&existing, b"keep me")?;

    let (session, probes) = previewing(SessionConfig::default()).await?;
    let before = session.snapshot().await?;

    assert_eq!(
        session.start_recording(&existing).await,
        Err(SessionError::FileExists(existing.clone()))
    );
    assert_eq!(session.start_streaming("", None).await, Err(SessionError::MissingUrl));
    assert_eq!(session.start_recording("").await, Err(SessionError::MissingPath));
    assert_eq!(
        session
            .start_recording_and_streaming(temp_dir.path().join("new.dump"), "", None)
            .await,
        Err(SessionError::MissingUrl)
    );
    assert_eq!(
        session
            .start_recording_and_streaming(&existing, URL, None)
            .await,
        Err(SessionError::FileExists(existing.clone()))
    );

    assert_eq!(session.snapshot().await?, before);
    assert_eq!(probes.encoder.prepare_count(), 0);
    assert!(probes.publisher.connect_attempts().is_empty());
    assert!(!temp_dir.path().join("new.dump").exists());
    assert_eq!(std::fs::read(&existing)?, b"keep me");

    Ok(())
}

#[tokio::test]
async fn test_recorder_attached_mid_stream_keeps_publish_gapless() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let path = temp_dir.path().join("mid-stream.dump");
    let (session, probes) = previewing(SessionConfig::default()).await?;

    session.start_streaming(URL, None).await?;
    for i in 0..5 {
        assert!(probes.encoder.push_video(i == 0).await);
        assert!(probes.encoder.push_audio().await);
    }

    session.start_recording(&path).await?;
    for _ in 0..5 {
        probes.encoder.push_video(false).await;
        probes.encoder.push_audio().await;
    }

    let summary = session.stop_recording().await?.unwrap();
    assert_eq!(summary.video_frames, 5);
    assert_eq!(summary.audio_frames, 5);

    for _ in 0..5 {
        probes.encoder.push_video(false).await;
    }
    session.snapshot().await?;

    assert_eq!(probes.publisher.video_sequences(), (0..15).collect::<Vec<u64>>());
    assert_eq!(probes.publisher.audio_sequences(), (0..10).collect::<Vec<u64>>());
    assert_eq!(probes.encoder.start_count(), 1);

    let recorded: Vec<u64> = read_dump(&path)
        .await?
        .iter()
        .filter(|f| f.kind == rtmp_stream::media::TrackKind::Video)
        .map(|f| f.sequence)
        .collect();
    assert_eq!(recorded, (5..10).collect::<Vec<u64>>());

    Ok(())
}

#[tokio::test]
async fn test_record_then_stream_then_stop_streaming() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let path = temp_dir.path().join("session.dump");
    let (session, probes) = previewing(SessionConfig::default()).await?;

    session.start_recording(&path).await?;
    assert_eq!(session.snapshot().await?.state, SessionState::Recording);

    session.start_streaming(URL, None).await?;
    assert_eq!(
        session.snapshot().await?.state,
        SessionState::StreamingAndRecording
    );

    session.stop_streaming().await?;
    let snapshot = session.snapshot().await?;
    assert_eq!(snapshot.state, SessionState::Recording);
    assert!(snapshot.encoder_running);
    assert!(probes.encoder.is_running());
    assert_eq!(probes.encoder.prepare_count(), 1);

    probes.encoder.push_video(true).await;
    let summary = session.stop_recording().await?.unwrap();
    assert_eq!(summary.video_frames, 1);

    let snapshot = session.snapshot().await?;
    assert_eq!(snapshot.state, SessionState::Stopped);
    assert!(!probes.encoder.is_running());

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_retry_exhaustion_emits_one_stop() -> Result<()> {
    let (session, probes) = previewing(with_retries(3, 10)).await?;
    probes
        .publisher
        .set_fallback(ConnectOutcome::Reject("Connection refused".to_string()));

    let mut subscription = session.subscribe().await?;
    session.start_streaming(URL, None).await?;

    let events = events_until(&mut subscription, EventType::RtmpStopped).await?;
    assert_eq!(count(&events, EventType::RtmpRetry), 3);
    assert_eq!(count(&events, EventType::RtmpStopped), 1);
    assert!(events
        .iter()
        .filter(|e| e.event_type == EventType::RtmpRetry)
        .all(|e| e.description.as_deref() == Some("Connection refused")));

    // Nothing else happens afterwards
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(probes.publisher.connect_attempts().len(), 4);
    assert!(subscription.try_recv().is_none());

    let snapshot = session.snapshot().await?;
    assert_eq!(snapshot.state, SessionState::Stopped);
    assert!(!snapshot.is_streaming);
    assert!(!snapshot.encoder_running);
    assert_eq!(snapshot.retry_count, 0);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_four_failures_then_reconnect() -> Result<()> {
    let (session, probes) = previewing(SessionConfig::default()).await?;
    probes.publisher.fail_next(4, "Connection timed out");

    let mut subscription = session.subscribe().await?;
    let started = tokio::time::Instant::now();
    session.start_streaming(URL, None).await?;

    let events = events_until(&mut subscription, EventType::Success).await?;
    assert_eq!(count(&events, EventType::RtmpRetry), 4);
    assert_eq!(count(&events, EventType::RtmpStopped), 0);
    assert_eq!(count(&events, EventType::Wait), 5);

    // Fixed 5s backoff before each of the 4 reconnects
    assert!(started.elapsed() >= Duration::from_secs(20));

    let snapshot = session.snapshot().await?;
    assert_eq!(snapshot.state, SessionState::Streaming);
    assert_eq!(snapshot.retry_count, 0);
    assert!(probes.publisher.is_connected());
    assert_eq!(probes.publisher.connect_attempts(), vec![URL.to_string(); 5]);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_reconnecting_state_and_bitrate_restore() -> Result<()> {
    let (session, probes) = previewing(with_retries(10, 1000)).await?;
    session.start_streaming(URL, None).await?;

    probes.publisher.emit(PublisherEvent::NewBitrate {
        bitrate: 500_000,
        congested: true,
    });
    assert_eq!(session.snapshot().await?.current_video_bitrate, 372_000);

    probes.publisher.fail_next(1, "Broken pipe");
    probes.publisher.drop_connection("Broken pipe");

    let snapshot = session.snapshot().await?;
    assert_eq!(snapshot.state, SessionState::Reconnecting);
    assert_eq!(snapshot.retry_count, 1);

    // A second failure report while a reconnect is pending is ignored
    probes.publisher.drop_connection("Broken pipe");
    assert_eq!(session.snapshot().await?.retry_count, 1);

    let mut subscription = session.subscribe().await?;
    events_until(&mut subscription, EventType::Success).await?;

    let snapshot = session.snapshot().await?;
    assert_eq!(snapshot.state, SessionState::Streaming);
    assert_eq!(snapshot.retry_count, 0);
    assert_eq!(snapshot.current_video_bitrate, 1_200_000);
    assert_eq!(probes.encoder.bitrate_changes(), vec![372_000, 1_200_000]);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_retry_exhaustion_keeps_recording() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let (session, probes) = previewing(with_retries(1, 10)).await?;
    probes
        .publisher
        .set_fallback(ConnectOutcome::Reject("Connection refused".to_string()));

    let mut subscription = session.subscribe().await?;
    session
        .start_recording_and_streaming(temp_dir.path().join("keep.dump"), URL, None)
        .await?;

    events_until(&mut subscription, EventType::RtmpStopped).await?;

    let snapshot = session.snapshot().await?;
    assert_eq!(snapshot.state, SessionState::Recording);
    assert!(snapshot.is_recording);
    assert!(!snapshot.is_streaming);
    assert!(probes.encoder.is_running());

    Ok(())
}

#[tokio::test]
async fn test_auth_error_and_disconnect_skip_retry() -> Result<()> {
    let (session, probes) = previewing(SessionConfig::default()).await?;
    let mut subscription = session.subscribe().await?;

    probes.publisher.push_outcome(ConnectOutcome::AuthFailure);
    session.start_streaming(URL, None).await?;

    let events = events_until(&mut subscription, EventType::Error).await?;
    assert_eq!(events.last().unwrap().description.as_deref(), Some("Auth error"));
    assert_eq!(count(&events, EventType::RtmpRetry), 0);

    let snapshot = session.snapshot().await?;
    assert!(!snapshot.is_streaming);
    assert_eq!(probes.publisher.connect_attempts().len(), 1);

    session.start_streaming(URL, None).await?;
    events_until(&mut subscription, EventType::Success).await?;

    probes.publisher.emit(PublisherEvent::Disconnected);
    let events = events_until(&mut subscription, EventType::CameraClosing).await?;
    assert_eq!(count(&events, EventType::RtmpRetry), 0);

    let snapshot = session.snapshot().await?;
    assert!(!snapshot.is_streaming);
    assert_eq!(snapshot.state, SessionState::Stopped);
    assert_eq!(probes.publisher.connect_attempts().len(), 2);

    Ok(())
}

#[tokio::test]
async fn test_stopping_emits_no_events() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let (session, _probes) = previewing(SessionConfig::default()).await?;
    let mut subscription = session.subscribe().await?;

    session
        .start_recording_and_streaming(temp_dir.path().join("quiet.dump"), URL, None)
        .await?;
    events_until(&mut subscription, EventType::Success).await?;

    session.stop_streaming().await?;
    session.stop_recording().await?;
    session.stop_all().await?;
    session.snapshot().await?;

    assert!(subscription.try_recv().is_none());

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_dispose_cancels_pending_reconnect() -> Result<()> {
    let (session, probes) = previewing(SessionConfig::default()).await?;
    probes
        .publisher
        .set_fallback(ConnectOutcome::Reject("Connection refused".to_string()));

    let mut subscription = session.subscribe().await?;
    session.start_streaming(URL, None).await?;
    events_until(&mut subscription, EventType::RtmpRetry).await?;

    session.dispose().await?;
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(probes.publisher.connect_attempts().len(), 1);
    assert!(!probes.encoder.is_running());
    assert!(!probes.capture.is_attached());

    // Subscription ends without further events
    let rest = tokio::time::timeout(Duration::from_secs(1), subscription.recv()).await?;
    assert!(rest.is_none());

    assert_eq!(session.snapshot().await, Err(SessionError::Disposed));
    assert_eq!(session.start_streaming(URL, None).await, Err(SessionError::Disposed));
    session.dispose().await?;

    Ok(())
}

#[tokio::test]
async fn test_pause_and_resume() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let (session, probes) = previewing(SessionConfig::default()).await?;

    assert_eq!(
        session.pause(Sink::Publisher).await,
        Err(SessionError::NotActive(Sink::Publisher))
    );
    assert_eq!(
        session.resume(Sink::Recorder).await,
        Err(SessionError::NotActive(Sink::Recorder))
    );

    let path = temp_dir.path().join("paused.dump");
    session.start_recording_and_streaming(&path, URL, None).await?;

    session.pause(Sink::Publisher).await?;
    for _ in 0..3 {
        probes.encoder.push_video(false).await;
    }
    let snapshot = session.snapshot().await?;
    assert!(snapshot.streaming_paused);
    assert!(snapshot.is_streaming);
    assert!(probes.publisher.video_sequences().is_empty());

    session.resume(Sink::Publisher).await?;
    session.pause(Sink::Recorder).await?;
    for _ in 0..2 {
        probes.encoder.push_video(false).await;
    }
    session.snapshot().await?;
    assert_eq!(probes.publisher.video_sequences(), vec![3, 4]);

    session.resume(Sink::Recorder).await?;
    probes.encoder.push_video(false).await;

    let summary = session.stop_recording().await?.unwrap();
    assert_eq!(summary.video_frames, 4);
    assert_eq!(probes.encoder.start_count(), 1);

    Ok(())
}

#[tokio::test]
async fn test_flashlight_requires_rear_camera() -> Result<()> {
    let (session, probes) = spawn_session(SessionConfig::default());
    session.surface_created().await?;

    assert!(matches!(
        session.switch_flashlight(true).await,
        Err(SessionError::DeviceUnavailable(_))
    ));

    session.start_preview("1").await?;
    assert_eq!(
        session.switch_flashlight(true).await,
        Err(SessionError::InvalidFacing)
    );

    session.switch_camera("0").await?;
    session.switch_flashlight(true).await?;
    assert!(probes.capture.torch());
    assert_eq!(probes.capture.active_camera().as_deref(), Some("0"));

    Ok(())
}

#[tokio::test]
async fn test_switch_devices_leave_encoder_alone() -> Result<()> {
    let (session, probes) = previewing(SessionConfig::default()).await?;
    session.start_streaming(URL, None).await?;

    session.switch_camera("1").await?;
    session.switch_audio(false).await?;

    probes.capture.set_unavailable("0");
    assert!(matches!(
        session.switch_camera("0").await,
        Err(SessionError::DeviceUnavailable(_))
    ));

    let snapshot = session.snapshot().await?;
    assert_eq!(snapshot.capture.camera_name, "1");
    assert!(!snapshot.capture.enable_audio);
    assert!(probes.capture.is_muted());
    assert_eq!(probes.encoder.prepare_count(), 1);
    assert_eq!(probes.encoder.start_count(), 1);

    let stats = session.statistics().await?;
    assert!(stats.is_audio_muted);

    Ok(())
}

#[tokio::test]
async fn test_deferred_preview_runs_when_surface_is_ready() -> Result<()> {
    let (session, probes) = spawn_session(SessionConfig::default());

    let pending = {
        let session = session.clone();
        tokio::spawn(async move { session.start_preview("0").await })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!pending.is_finished());
    assert_eq!(session.snapshot().await?.state, SessionState::Idle);
    assert!(!probes.capture.is_attached());

    session.surface_created().await?;
    let preview = pending.await??;
    assert_eq!((preview.width, preview.height), (1280, 720));
    assert_eq!(preview.quarter_turns, 1);

    assert_eq!(session.snapshot().await?.state, SessionState::PreviewReady);
    assert!(probes.capture.is_attached());

    Ok(())
}

#[tokio::test]
async fn test_surface_destroyed_stops_everything() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let (session, probes) = previewing(SessionConfig::default()).await?;
    session
        .start_recording_and_streaming(temp_dir.path().join("gone.dump"), URL, None)
        .await?;

    session.surface_destroyed().await?;

    let snapshot = session.snapshot().await?;
    assert_eq!(snapshot.state, SessionState::Idle);
    assert!(!snapshot.encoder_running);
    assert!(!probes.capture.is_attached());
    assert!(matches!(
        session.start_recording(temp_dir.path().join("later.dump")).await,
        Err(SessionError::InvalidState(_))
    ));

    Ok(())
}

#[tokio::test]
async fn test_encoder_failure_enters_error_state() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let (session, probes) = previewing(SessionConfig::default()).await?;
    let mut subscription = session.subscribe().await?;

    session.start_recording(temp_dir.path().join("crash.dump")).await?;
    probes.encoder.fail();

    let events = events_until(&mut subscription, EventType::Error).await?;
    assert_eq!(count(&events, EventType::Error), 1);

    let snapshot = session.snapshot().await?;
    assert_eq!(snapshot.state, SessionState::Error);
    assert!(!snapshot.is_recording);
    assert!(!snapshot.encoder_running);

    assert!(matches!(
        session.start_streaming(URL, None).await,
        Err(SessionError::InvalidState(_))
    ));

    // Nothing is attached any more, so every stop is a no-op
    session.stop_streaming().await?;
    assert_eq!(session.stop_recording().await?, None);
    session.stop_all().await?;
    assert_eq!(session.snapshot().await?.state, SessionState::Error);

    session.dispose().await?;

    Ok(())
}

#[tokio::test]
async fn test_take_picture() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let path = temp_dir.path().join("still.jpg");
    let (session, _probes) = previewing(SessionConfig::default()).await?;

    session.take_picture(&path).await?;
    assert!(path.exists());

    assert_eq!(
        session.take_picture(&path).await,
        Err(SessionError::FileExists(path.clone()))
    );

    Ok(())
}

#[tokio::test]
async fn test_statistics_track_publisher_and_encoder() -> Result<()> {
    let (session, probes) = previewing(SessionConfig::default()).await?;

    let idle = session.statistics().await?;
    assert_eq!(idle.bitrate, 0);
    assert_eq!(idle.fps, 0);

    session.start_streaming(URL, None).await?;
    for _ in 0..3 {
        probes.encoder.push_video(false).await;
    }
    for _ in 0..2 {
        probes.encoder.push_audio().await;
    }

    let stats = session.statistics().await?;
    assert_eq!(stats.sent_video_frames, 3);
    assert_eq!(stats.sent_audio_frames, 2);
    assert_eq!(stats.bitrate, 1_200_000);
    assert_eq!((stats.width, stats.height), (1280, 720));
    assert_eq!(stats.fps, 3);
    assert!(!stats.is_audio_muted);

    Ok(())
}
