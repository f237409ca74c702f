//! Method-call surface
//!
//! Dispatches `{method, arguments}` calls from the embedding application to
//! the session registry and answers with a JSON value or an
//! [`ErrorResponse`]. Session methods address a session with the
//! `textureId` argument and fall back to the most recently initialized one.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::ErrorResponse;
use crate::media::ResolutionPreset;
use crate::registry::SessionRegistry;
use crate::session::{CaptureConfig, SessionHandle, Sink, VideoSettings};

/// One call from the application
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodCall {
    pub method: String,
    #[serde(default)]
    pub arguments: Value,
}

impl MethodCall {
    pub fn new(method: impl Into<String>, arguments: Value) -> Self {
        Self {
            method: method.into(),
            arguments,
        }
    }
}

pub struct MethodCallHandler {
    registry: Arc<SessionRegistry>,
    /// Base for relative recording and picture paths
    output_dir: Option<PathBuf>,
}

impl MethodCallHandler {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            output_dir: None,
        }
    }

    pub fn with_output_dir(mut self, output_dir: PathBuf) -> Self {
        self.output_dir = Some(output_dir);
        self
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub async fn handle(&self, call: MethodCall) -> Result<Value, ErrorResponse> {
        debug!("Method call {}", call.method);
        let args = Arguments(&call.arguments);

        let result = match call.method.as_str() {
            "availableCameras" => Ok(json!(self.registry.cameras())),
            "initialize" => self.initialize(&args).await,
            "takePicture" => {
                let session = self.session(&args).await?;
                session.take_picture(self.path(&args, "path")).await?;
                Ok(Value::Null)
            }
            "startVideoRecording" => {
                let session = self.session(&args).await?;
                session.start_recording(self.path(&args, "filePath")).await?;
                Ok(Value::Null)
            }
            "startVideoStreaming" => {
                let session = self.session(&args).await?;
                let toggle = session
                    .start_streaming(args.str("url"), args.u32("bitrate")?)
                    .await?;
                Ok(json!({ "status": toggle }))
            }
            "startVideoRecordingAndStreaming" => {
                let session = self.session(&args).await?;
                session
                    .start_recording_and_streaming(
                        self.path(&args, "filePath"),
                        args.str("url"),
                        args.u32("bitrate")?,
                    )
                    .await?;
                Ok(Value::Null)
            }
            "pauseVideoStreaming" => self.pause(&args, Sink::Publisher).await,
            "resumeVideoStreaming" => self.resume(&args, Sink::Publisher).await,
            "pauseVideoRecording" => self.pause(&args, Sink::Recorder).await,
            "resumeVideoRecording" => self.resume(&args, Sink::Recorder).await,
            "stopRecording" => {
                let session = self.session(&args).await?;
                session.stop_recording().await?;
                Ok(Value::Null)
            }
            "stopStreaming" => {
                let session = self.session(&args).await?;
                session.stop_streaming().await?;
                Ok(Value::Null)
            }
            "stopRecordingOrStreaming" => {
                let session = self.session(&args).await?;
                session.stop_all().await?;
                Ok(Value::Null)
            }
            "switchCamera" => {
                let session = self.session(&args).await?;
                session.switch_camera(args.str("cameraName")).await?;
                Ok(Value::Null)
            }
            "switchAudio" => {
                let session = self.session(&args).await?;
                session.switch_audio(args.bool("enable")?).await?;
                Ok(Value::Null)
            }
            "switchFlashLight" | "switchFlashlight" => {
                let session = self.session(&args).await?;
                session.switch_flashlight(args.bool("enable")?).await?;
                Ok(Value::Null)
            }
            "setVideoSettings" => {
                let session = self.session(&args).await?;
                let settings = VideoSettings {
                    bitrate: args.u32("bitrate")?,
                    key_frame_interval_secs: args.f32("frameInterval")?,
                    fps: None,
                };
                session.set_video_settings(settings).await?;
                Ok(Value::Null)
            }
            "setFrameRate" => {
                let session = self.session(&args).await?;
                let settings = VideoSettings {
                    fps: Some(args.required_u32("frameRate")?),
                    ..Default::default()
                };
                session.set_video_settings(settings).await?;
                Ok(Value::Null)
            }
            "setAudioSettings" => {
                let session = self.session(&args).await?;
                session
                    .set_audio_settings(args.required_u32("bitrate")?)
                    .await?;
                Ok(Value::Null)
            }
            "getHasAudio" => {
                let session = self.session(&args).await?;
                Ok(Value::Bool(session.has_audio().await?))
            }
            "setHasAudio" => {
                let session = self.session(&args).await?;
                session.switch_audio(args.bool("isEnable")?).await?;
                Ok(Value::Null)
            }
            "getStreamStatistics" => {
                let session = self.session(&args).await?;
                let stats = session.statistics().await?;
                Ok(json!(stats))
            }
            "dispose" => self.dispose(&args).await,
            other => Err(ErrorResponse::new(
                "notImplemented",
                format!("Unknown method {}", other),
            )),
        };

        if let Err(e) = &result {
            warn!("{} failed: {} ({})", call.method, e.message, e.code);
        }
        result
    }

    async fn initialize(&self, args: &Arguments<'_>) -> Result<Value, ErrorResponse> {
        let camera_name = args.str("cameraName");
        if camera_name.is_empty() {
            return Err(ErrorResponse::new("invalidArgument", "Must specify a cameraName."));
        }
        let resolution = match args.0.get("resolutionPreset") {
            None | Some(Value::Null) => ResolutionPreset::default(),
            Some(preset) => serde_json::from_value(preset.clone()).map_err(|_| {
                ErrorResponse::new(
                    "invalidArgument",
                    format!("Unknown resolution preset {}", preset),
                )
            })?,
        };
        let enable_audio = match args.0.get("enableAudio") {
            None | Some(Value::Null) => true,
            Some(_) => args.bool("enableAudio")?,
        };

        let capture = CaptureConfig {
            camera_name: camera_name.to_string(),
            resolution,
            enable_audio,
            video_bitrate: 0,
        };

        let session = self
            .registry
            .create(capture)
            .await
            .map_err(|e| ErrorResponse::new("deviceError", format!("{:#}", e)))?;

        // No native surface to wait for; it is ready as soon as the session is
        let preview = match session.surface_created().await {
            Ok(()) => session.start_preview(camera_name).await,
            Err(e) => Err(e),
        };

        match preview {
            Ok(preview) => Ok(json!({
                "textureId": session.id(),
                "previewWidth": preview.width,
                "previewHeight": preview.height,
                "previewQuarterTurns": preview.quarter_turns,
            })),
            Err(e) => {
                let _ = self.registry.dispose(session.id()).await;
                Err(e.into())
            }
        }
    }

    async fn pause(&self, args: &Arguments<'_>, sink: Sink) -> Result<Value, ErrorResponse> {
        let session = self.session(args).await?;
        session.pause(sink).await?;
        Ok(Value::Null)
    }

    async fn resume(&self, args: &Arguments<'_>, sink: Sink) -> Result<Value, ErrorResponse> {
        let session = self.session(args).await?;
        session.resume(sink).await?;
        Ok(Value::Null)
    }

    async fn dispose(&self, args: &Arguments<'_>) -> Result<Value, ErrorResponse> {
        // Disposing an unknown or already disposed session is not an error
        let Ok(session) = self.session(args).await else {
            return Ok(Value::Null);
        };
        self.registry.dispose(session.id()).await?;
        Ok(Value::Null)
    }

    async fn session(&self, args: &Arguments<'_>) -> Result<SessionHandle, ErrorResponse> {
        let session = match args.0.get("textureId").and_then(Value::as_u64) {
            Some(id) => self.registry.get(id).await.ok_or_else(|| {
                ErrorResponse::new("noSession", format!("No camera with texture id {}", id))
            })?,
            None => self.registry.latest().await.ok_or_else(|| {
                ErrorResponse::new("noSession", "No camera has been initialized")
            })?,
        };
        Ok(session)
    }

    /// Path argument, `~`-expanded and resolved against the output directory
    fn path(&self, args: &Arguments<'_>, key: &str) -> PathBuf {
        let raw = args.str(key);
        if raw.is_empty() {
            return PathBuf::new();
        }
        let path = PathBuf::from(shellexpand::tilde(raw).into_owned());
        match &self.output_dir {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path,
        }
    }
}

/// Typed access to call arguments
struct Arguments<'a>(&'a Value);

impl<'a> Arguments<'a> {
    /// String argument; empty when absent
    fn str(&self, key: &str) -> &'a str {
        self.0.get(key).and_then(Value::as_str).unwrap_or_default()
    }

    fn bool(&self, key: &str) -> Result<bool, ErrorResponse> {
        self.0.get(key).and_then(Value::as_bool).ok_or_else(|| {
            ErrorResponse::new("invalidArgument", format!("Must specify a boolean {}.", key))
        })
    }

    /// Optional positive integer argument
    fn u32(&self, key: &str) -> Result<Option<u32>, ErrorResponse> {
        match self.0.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => value
                .as_u64()
                .and_then(|v| u32::try_from(v).ok())
                .filter(|v| *v > 0)
                .map(Some)
                .ok_or_else(|| {
                    ErrorResponse::new("invalidArgument", format!("{} must be a positive integer", key))
                }),
        }
    }

    fn required_u32(&self, key: &str) -> Result<u32, ErrorResponse> {
        self.u32(key)?.ok_or_else(|| {
            ErrorResponse::new("invalidArgument", format!("Must specify a {}.", key))
        })
    }

    /// Optional positive number argument
    fn f32(&self, key: &str) -> Result<Option<f32>, ErrorResponse> {
        match self.0.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => value
                .as_f64()
                .filter(|v| v.is_finite() && *v > 0.0)
                .map(|v| Some(v as f32))
                .ok_or_else(|| {
                    ErrorResponse::new("invalidArgument", format!("{} must be a positive number", key))
                }),
        }
    }
}
