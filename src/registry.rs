//! Sessions keyed by texture id
//!
//! The registry composes each new session from the configured
//! [`DeviceFactory`], defaults and event relay, and owns the handles until
//! the session is disposed.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::SessionResult;
use crate::media::{CameraDescription, DeviceFactory};
use crate::nats::NatsClient;
use crate::session::{CaptureConfig, EventBus, SessionConfig, SessionController, SessionHandle};

pub struct SessionRegistry {
    factory: Arc<dyn DeviceFactory>,
    defaults: SessionConfig,
    relay: Option<NatsClient>,
    next_id: AtomicU64,
    sessions: RwLock<HashMap<u64, SessionHandle>>,
    latest: RwLock<Option<u64>>,
}

impl SessionRegistry {
    /// Registry whose sessions use `defaults` for everything the application
    /// does not choose
    pub fn new(factory: Arc<dyn DeviceFactory>, defaults: SessionConfig) -> Self {
        Self {
            factory,
            defaults,
            relay: None,
            next_id: AtomicU64::new(1),
            sessions: RwLock::new(HashMap::new()),
            latest: RwLock::new(None),
        }
    }

    /// Also relay every session's events to NATS
    pub fn with_relay(mut self, relay: NatsClient) -> Self {
        self.relay = Some(relay);
        self
    }

    /// Cameras the device factory can open
    pub fn cameras(&self) -> Vec<CameraDescription> {
        self.factory.cameras()
    }

    /// Spawn a session for `capture`; its surface is not ready yet
    pub async fn create(&self, capture: CaptureConfig) -> Result<SessionHandle> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let devices = self
            .factory
            .create()
            .context("Failed to create session devices")?;

        let mut capture = capture;
        if capture.video_bitrate == 0 {
            capture.video_bitrate = self.defaults.capture.video_bitrate;
        }
        let config = SessionConfig {
            capture,
            ..self.defaults.clone()
        };

        let mut events = EventBus::new();
        if let Some(relay) = &self.relay {
            events = events.with_relay(Arc::new(relay.event_sink(id)));
        }

        let handle = SessionController::spawn(id, config, devices, events);

        self.sessions.write().await.insert(id, handle.clone());
        *self.latest.write().await = Some(id);

        info!("Created session {}", id);
        Ok(handle)
    }

    pub async fn get(&self, id: u64) -> Option<SessionHandle> {
        self.sessions.read().await.get(&id).cloned()
    }

    /// Most recently created session that is still registered
    pub async fn latest(&self) -> Option<SessionHandle> {
        let id = (*self.latest.read().await)?;
        self.get(id).await
    }

    /// Dispose and forget a session; false when the id is unknown
    pub async fn dispose(&self, id: u64) -> SessionResult<bool> {
        let handle = self.sessions.write().await.remove(&id);
        {
            let mut latest = self.latest.write().await;
            if *latest == Some(id) {
                *latest = None;
            }
        }

        match handle {
            Some(handle) => {
                handle.dispose().await?;
                info!("Disposed session {}", id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn dispose_all(&self) {
        let handles: Vec<SessionHandle> = self.sessions.write().await.drain().map(|(_, h)| h).collect();
        *self.latest.write().await = None;

        for handle in handles {
            if let Err(e) = handle.dispose().await {
                warn!("Failed to dispose session {}: {}", handle.id(), e);
            }
        }
    }
}
