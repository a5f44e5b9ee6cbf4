//! Uplink encoding: captured frames into transport chunks.
//!
//! Audio becomes 16-bit little-endian PCM tagged with its rate; camera
//! snapshots become JPEG. [`run_uplink`] is the pump that moves encoded
//! chunks from capture to the session channel while the session accepts them.

use crate::capture::{AudioFrame, VideoSnapshot};
use crate::channel::SessionChannel;
use crate::config::CaptureConstraints;
use crate::error::{SessionError, SessionResult};
use crate::session::SessionGate;
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

pub const MIME_JPEG: &str = "image/jpeg";

pub fn pcm_mime(sample_rate: u32) -> String {
    format!("audio/pcm;rate={}", sample_rate)
}

/// One encoded unit of uplink media.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportChunk {
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl TransportChunk {
    pub fn is_audio(&self) -> bool {
        self.mime_type.starts_with("audio/")
    }
}

/// Stateless encoder for uplink media.
#[derive(Debug, Clone)]
pub struct UplinkEncoder {
    max_dimension: u32,
    jpeg_quality: u8,
}

impl UplinkEncoder {
    pub fn new(constraints: &CaptureConstraints) -> Self {
        Self {
            max_dimension: constraints.max_snapshot_dimension,
            jpeg_quality: constraints.jpeg_quality,
        }
    }

    /// f32 samples to clamped 16-bit little-endian PCM.
    pub fn encode_audio(&self, frame: &AudioFrame) -> TransportChunk {
        let mut data = Vec::with_capacity(frame.samples.len() * 2);
        for &s in frame.samples.iter() {
            let v = (s.clamp(-1.0, 1.0) * 32767.0) as i16;
            data.extend_from_slice(&v.to_le_bytes());
        }
        TransportChunk {
            mime_type: pcm_mime(frame.sample_rate),
            data,
        }
    }

    /// JPEG-encode a snapshot, downscaling when its longest side exceeds the limit.
    pub fn encode_video_snapshot(&self, snapshot: &VideoSnapshot) -> SessionResult<TransportChunk> {
        if snapshot.width == 0 || snapshot.height == 0 {
            return Err(SessionError::Encode(format!(
                "snapshot has zero dimension {}x{}",
                snapshot.width, snapshot.height
            )));
        }
        let image = RgbImage::from_raw(snapshot.width, snapshot.height, snapshot.rgb.as_ref().clone())
            .ok_or_else(|| {
                SessionError::Encode(format!(
                    "snapshot buffer of {} bytes does not match {}x{} RGB",
                    snapshot.rgb.len(),
                    snapshot.width,
                    snapshot.height
                ))
            })?;
        let image = fit_within(image, self.max_dimension);
        let data = encode_jpeg(&image, self.jpeg_quality)?;
        Ok(TransportChunk {
            mime_type: MIME_JPEG.to_string(),
            data,
        })
    }
}

/// Shrink so the longest side is at most `max_side`; never upscales.
pub fn fit_within(image: RgbImage, max_side: u32) -> RgbImage {
    let (w, h) = image.dimensions();
    let longest = w.max(h);
    if max_side == 0 || longest <= max_side {
        return image;
    }
    let scale = max_side as f64 / longest as f64;
    let nw = ((w as f64 * scale).round() as u32).max(1);
    let nh = ((h as f64 * scale).round() as u32).max(1);
    image::imageops::thumbnail(&image, nw, nh)
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> SessionResult<Vec<u8>> {
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100)).encode_image(image)?;
    Ok(out)
}

async fn recv_optional<T: Clone>(rx: &mut Option<broadcast::Receiver<T>>) -> Result<T, RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Forward captured media to the channel until capture ends or the session drains.
///
/// Encode failures drop the frame. A lagging receiver skips ahead.
pub async fn run_uplink(
    encoder: UplinkEncoder,
    mut audio_rx: broadcast::Receiver<AudioFrame>,
    mut video_rx: Option<broadcast::Receiver<VideoSnapshot>>,
    channel: Arc<dyn SessionChannel>,
    mut gate: SessionGate,
) {
    info!("📤 Uplink pump started");
    let mut sent: u64 = 0;
    loop {
        let chunk = tokio::select! {
            _ = gate.shutting_down() => break,
            frame = audio_rx.recv() => match frame {
                Ok(frame) => encoder.encode_audio(&frame),
                Err(RecvError::Lagged(n)) => {
                    debug!("Uplink lagged, skipped {} audio frames", n);
                    continue;
                }
                Err(RecvError::Closed) => break,
            },
            snapshot = recv_optional(&mut video_rx) => match snapshot {
                Ok(snapshot) => match encoder.encode_video_snapshot(&snapshot) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        warn!("Dropping snapshot: {}", e);
                        continue;
                    }
                },
                Err(RecvError::Lagged(n)) => {
                    debug!("Uplink lagged, skipped {} snapshots", n);
                    continue;
                }
                Err(RecvError::Closed) => {
                    video_rx = None;
                    continue;
                }
            },
        };

        if !gate.accepts_uplink() {
            if gate.is_shutting_down() {
                break;
            }
            continue;
        }
        if let Err(e) = channel.send_media(chunk) {
            debug!("Uplink send failed: {}", e);
            continue;
        }
        sent += 1;
    }
    info!("📤 Uplink pump stopped after {} chunks", sent);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoder() -> UplinkEncoder {
        UplinkEncoder::new(&CaptureConstraints {
            max_snapshot_dimension: 64,
            ..Default::default()
        })
    }

    #[test]
    fn audio_is_little_endian_pcm16() {
        let frame = AudioFrame::new(vec![0.0, 1.0, -1.0, 2.0], 16000);
        let chunk = encoder().encode_audio(&frame);
        assert_eq!(chunk.mime_type, "audio/pcm;rate=16000");
        assert!(chunk.is_audio());
        assert_eq!(chunk.data.len(), 8);
        assert_eq!(&chunk.data[0..2], &[0, 0]);
        assert_eq!(i16::from_le_bytes([chunk.data[2], chunk.data[3]]), 32767);
        assert_eq!(i16::from_le_bytes([chunk.data[4], chunk.data[5]]), -32767);
        // Out-of-range input clamps.
        assert_eq!(i16::from_le_bytes([chunk.data[6], chunk.data[7]]), 32767);
    }

    #[test]
    fn snapshot_encodes_as_jpeg() {
        let snapshot = VideoSnapshot::from_image(RgbImage::new(32, 16));
        let chunk = encoder().encode_video_snapshot(&snapshot).unwrap();
        assert_eq!(chunk.mime_type, MIME_JPEG);
        assert_eq!(&chunk.data[0..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn large_snapshot_is_downscaled() {
        let image = fit_within(RgbImage::new(640, 320), 64);
        assert_eq!(image.dimensions(), (64, 32));
        let small = fit_within(RgbImage::new(10, 5), 64);
        assert_eq!(small.dimensions(), (10, 5));
    }

    #[test]
    fn zero_sized_snapshot_is_rejected() {
        let snapshot = VideoSnapshot {
            width: 0,
            height: 10,
            rgb: Arc::new(Vec::new()),
            captured_at: std::time::Instant::now(),
        };
        assert!(matches!(
            encoder().encode_video_snapshot(&snapshot),
            Err(SessionError::Encode(_))
        ));
    }

    #[test]
    fn truncated_snapshot_is_rejected() {
        let snapshot = VideoSnapshot {
            width: 4,
            height: 4,
            rgb: Arc::new(vec![0u8; 10]),
            captured_at: std::time::Instant::now(),
        };
        assert!(encoder().encode_video_snapshot(&snapshot).is_err());
    }
}
