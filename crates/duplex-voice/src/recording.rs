//! Local recording of the user's side of a session.
//!
//! The recorder subscribes to capture fan-out on its own, so it neither slows
//! nor depends on the uplink. Audio accumulates as 16-bit PCM; camera
//! snapshots are kept as JPEG with their offset from the start of recording.
//! Everything is assembled into a [`RecordingArtifact`] when recording stops.

use crate::capture::{AudioFrame, VideoSnapshot};
use crate::config::{CaptureConstraints, RecordingConfig};
use crate::encoder::{encode_jpeg, fit_within};
use crate::error::{SessionError, SessionResult};
use chrono::{DateTime, Utc};
use image::RgbImage;
use serde::Serialize;
use std::io::Cursor;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::{
    self,
    error::{RecvError, TryRecvError},
};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const RECORDING_MIME: &str = "audio/wav";

#[derive(Debug, Clone, Serialize)]
pub struct RecordingMetadata {
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub duration_secs: f64,
    /// Bytes across audio, frames and thumbnail
    pub size_bytes: usize,
    pub mime_type: String,
    pub sample_rate: u32,
    pub video_frames: usize,
}

#[derive(Debug, Clone)]
pub struct RecordedFrame {
    /// Offset from the start of recording
    pub offset: Duration,
    pub jpeg: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct RecordingArtifact {
    /// RIFF/WAV, mono 16-bit
    pub audio: Vec<u8>,
    pub frames: Vec<RecordedFrame>,
    pub thumbnail: Option<Vec<u8>>,
    pub metadata: RecordingMetadata,
}

struct RecordingBuffer {
    session_id: Uuid,
    started_at: DateTime<Utc>,
    started: Instant,
    sample_rate: u32,
    pcm: Vec<i16>,
    frames: Vec<RecordedFrame>,
    first_snapshot: Option<RgbImage>,
    jpeg_quality: u8,
    thumbnail_size: u32,
}

impl RecordingBuffer {
    fn push_audio(&mut self, frame: &AudioFrame) {
        self.pcm.extend(
            frame
                .samples
                .iter()
                .map(|&s| (s.clamp(-1.0, 1.0) * 32767.0) as i16),
        );
    }

    fn push_snapshot(&mut self, snapshot: &VideoSnapshot) {
        let image = match RgbImage::from_raw(snapshot.width, snapshot.height, snapshot.rgb.as_ref().clone()) {
            Some(img) if snapshot.width > 0 && snapshot.height > 0 => img,
            _ => {
                warn!("Recorder skipped malformed snapshot {}x{}", snapshot.width, snapshot.height);
                return;
            }
        };
        match encode_jpeg(&image, self.jpeg_quality) {
            Ok(jpeg) => self.frames.push(RecordedFrame {
                offset: snapshot.captured_at.saturating_duration_since(self.started),
                jpeg,
            }),
            Err(e) => {
                warn!("Recorder failed to encode snapshot: {}", e);
                return;
            }
        }
        if self.first_snapshot.is_none() {
            self.first_snapshot = Some(image);
        }
    }

    fn finalize(self) -> SessionResult<RecordingArtifact> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
            for &s in &self.pcm {
                writer.write_sample(s)?;
            }
            writer.finalize()?;
        }
        let audio = cursor.into_inner();

        let thumbnail = match self.first_snapshot {
            Some(image) => Some(encode_jpeg(&fit_within(image, self.thumbnail_size), self.jpeg_quality)?),
            None => None,
        };

        let size_bytes = audio.len()
            + self.frames.iter().map(|f| f.jpeg.len()).sum::<usize>()
            + thumbnail.as_ref().map(|t| t.len()).unwrap_or(0);
        let duration_secs = if self.sample_rate == 0 {
            0.0
        } else {
            self.pcm.len() as f64 / self.sample_rate as f64
        };

        Ok(RecordingArtifact {
            metadata: RecordingMetadata {
                session_id: self.session_id,
                started_at: self.started_at,
                duration_secs,
                size_bytes,
                mime_type: RECORDING_MIME.to_string(),
                sample_rate: self.sample_rate,
                video_frames: self.frames.len(),
            },
            audio,
            frames: self.frames,
            thumbnail,
        })
    }
}

/// A running recording.
pub struct Recorder {
    stop_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<SessionResult<RecordingArtifact>>>,
}

impl Recorder {
    pub fn start(
        session_id: Uuid,
        config: &RecordingConfig,
        constraints: &CaptureConstraints,
        mut audio_rx: broadcast::Receiver<AudioFrame>,
        mut video_rx: Option<broadcast::Receiver<VideoSnapshot>>,
    ) -> Self {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let mut buffer = RecordingBuffer {
            session_id,
            started_at: Utc::now(),
            started: Instant::now(),
            sample_rate: constraints.sample_rate,
            pcm: Vec::new(),
            frames: Vec::new(),
            first_snapshot: None,
            jpeg_quality: constraints.jpeg_quality,
            thumbnail_size: config.thumbnail_size,
        };
        info!("⏺️ Recording started for session {}", session_id);

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    frame = audio_rx.recv() => match frame {
                        Ok(frame) => buffer.push_audio(&frame),
                        Err(RecvError::Lagged(n)) => warn!("Recorder lagged, lost {} audio frames", n),
                        Err(RecvError::Closed) => break,
                    },
                    snapshot = async {
                        match video_rx.as_mut() {
                            Some(rx) => rx.recv().await,
                            None => std::future::pending().await,
                        }
                    } => match snapshot {
                        Ok(snapshot) => buffer.push_snapshot(&snapshot),
                        Err(RecvError::Lagged(n)) => warn!("Recorder lagged, lost {} snapshots", n),
                        Err(RecvError::Closed) => video_rx = None,
                    },
                    _ = &mut stop_rx => break,
                }
            }
            // Snapshots already queued when audio ended still belong to the recording.
            if let Some(rx) = video_rx.as_mut() {
                loop {
                    match rx.try_recv() {
                        Ok(snapshot) => buffer.push_snapshot(&snapshot),
                        Err(TryRecvError::Lagged(n)) => warn!("Recorder lagged, lost {} snapshots", n),
                        Err(_) => break,
                    }
                }
            }
            debug!("Recorder collected {} samples, {} frames", buffer.pcm.len(), buffer.frames.len());
            let result = tokio::task::spawn_blocking(move || buffer.finalize())
                .await
                .map_err(|e| SessionError::Recording(format!("finalize task failed: {}", e)))?;
            result
        });

        Self {
            stop_tx: Some(stop_tx),
            task: Some(task),
        }
    }

    /// Stop recording and assemble the artifact.
    pub async fn finish(mut self) -> SessionResult<RecordingArtifact> {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        let task = self
            .task
            .take()
            .ok_or_else(|| SessionError::Recording("recorder already finished".to_string()))?;
        let artifact = task
            .await
            .map_err(|e| SessionError::Recording(format!("recorder task failed: {}", e)))??;
        info!(
            "⏹️ Recording finalized: {:.1}s, {} bytes, {} frames",
            artifact.metadata.duration_secs, artifact.metadata.size_bytes, artifact.metadata.video_frames
        );
        Ok(artifact)
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
