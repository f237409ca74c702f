use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::backend::{EncodedFrame, Recorder, RecordingSummary, TrackKind};

/// File signature of an elementary stream dump
const DUMP_MAGIC: &[u8; 8] = b"RTMPSDMP";

const FLAG_KEY_FRAME: u8 = 0x01;

/// Records encoded frames to disk on a dedicated writer task
///
/// The file is a length-prefixed dump of the elementary streams: an 8-byte
/// signature followed by one record per frame
/// (`kind u8, flags u8, sequence u64, timestamp_us u64, len u32, payload`,
/// integers big-endian). Muxing into a playable container is left to the
/// native recorder this stands in for.
///
/// `write` waits while the writer queue is full, so no frame is ever dropped.
pub struct FileRecorder {
    buffer_frames: usize,
    frame_tx: Option<mpsc::Sender<EncodedFrame>>,
    writer: Option<JoinHandle<Result<RecordingSummary>>>,
}

impl FileRecorder {
    pub fn new() -> Self {
        Self::with_buffer(256)
    }

    /// Recorder whose writer queue holds at most `buffer_frames` frames
    pub fn with_buffer(buffer_frames: usize) -> Self {
        Self {
            buffer_frames: buffer_frames.max(1),
            frame_tx: None,
            writer: None,
        }
    }
}

impl Default for FileRecorder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Recorder for FileRecorder {
    async fn start(&mut self, path: &Path) -> Result<()> {
        if self.frame_tx.is_some() {
            bail!("Recorder already writing");
        }

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create output directory")?;
        }

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await
            .with_context(|| format!("Failed to create recording file: {:?}", path))?;

        let (frame_tx, frame_rx) = mpsc::channel(self.buffer_frames);
        let path = path.to_path_buf();

        info!("Recording to {}", path.display());

        self.writer = Some(tokio::spawn(write_frames(file, path, frame_rx)));
        self.frame_tx = Some(frame_tx);

        Ok(())
    }

    async fn write(&mut self, frame: &EncodedFrame) -> Result<()> {
        let Some(frame_tx) = &self.frame_tx else {
            bail!("Recorder not started");
        };

        if frame_tx.capacity() == 0 {
            debug!("Writer queue full, waiting to write {:?} frame {}", frame.kind, frame.sequence);
        }
        frame_tx
            .send(frame.clone())
            .await
            .map_err(|_| anyhow!("Recording writer stopped"))
    }

    async fn stop(&mut self) -> Result<RecordingSummary> {
        // Closing the channel lets the writer drain and finish the file
        self.frame_tx.take();

        let Some(writer) = self.writer.take() else {
            bail!("Recorder not started");
        };

        let summary = writer.await.context("Recording writer panicked")??;

        info!(
            "Recording complete: {} ({} video, {} audio frames, {} bytes)",
            summary.path.display(),
            summary.video_frames,
            summary.audio_frames,
            summary.bytes_written
        );

        Ok(summary)
    }

    fn name(&self) -> &str {
        "file"
    }
}

async fn write_frames(
    file: File,
    path: PathBuf,
    mut frame_rx: mpsc::Receiver<EncodedFrame>,
) -> Result<RecordingSummary> {
    let mut out = BufWriter::new(file);
    let mut summary = RecordingSummary {
        path,
        ..Default::default()
    };

    out.write_all(DUMP_MAGIC).await?;
    summary.bytes_written += DUMP_MAGIC.len() as u64;

    while let Some(frame) = frame_rx.recv().await {
        let kind = match frame.kind {
            TrackKind::Video => 0u8,
            TrackKind::Audio => 1u8,
        };
        let flags = if frame.key_frame { FLAG_KEY_FRAME } else { 0 };

        out.write_u8(kind).await?;
        out.write_u8(flags).await?;
        out.write_u64(frame.sequence).await?;
        out.write_u64(frame.timestamp_us).await?;
        out.write_u32(frame.data.len() as u32).await?;
        out.write_all(&frame.data).await?;

        summary.bytes_written += 22 + frame.data.len() as u64;
        match frame.kind {
            TrackKind::Video => summary.video_frames += 1,
            TrackKind::Audio => summary.audio_frames += 1,
        }
    }

    out.flush()
        .await
        .context("Failed to flush recording file")?;

    Ok(summary)
}

/// Read back every frame of a dump written by [`FileRecorder`]
pub async fn read_dump(path: impl AsRef<Path>) -> Result<Vec<EncodedFrame>> {
    let path = path.as_ref();
    let file = File::open(path)
        .await
        .with_context(|| format!("Failed to open recording: {:?}", path))?;
    let mut input = BufReader::new(file);

    let mut magic = [0u8; 8];
    input.read_exact(&mut magic).await?;
    if &magic != DUMP_MAGIC {
        bail!("Not an elementary stream dump: {:?}", path);
    }

    let mut frames = Vec::new();
    loop {
        let kind = match input.read_u8().await {
            Ok(0) => TrackKind::Video,
            Ok(1) => TrackKind::Audio,
            Ok(other) => bail!("Unknown track kind {} in {:?}", other, path),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        };
        let flags = input.read_u8().await?;
        let sequence = input.read_u64().await?;
        let timestamp_us = input.read_u64().await?;
        let len = input.read_u32().await? as usize;
        let mut data = vec![0u8; len];
        input.read_exact(&mut data).await?;

        frames.push(EncodedFrame {
            kind,
            data,
            timestamp_us,
            key_frame: flags & FLAG_KEY_FRAME != 0,
            sequence,
        });
    }

    Ok(frames)
}
