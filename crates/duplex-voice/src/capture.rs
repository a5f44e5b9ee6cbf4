//! Microphone and camera capture using CPAL.
//!
//! Hardware streams run on their own threads (cpal `Stream` is `!Send` on
//! some platforms). Frames fan out through `tokio::sync::broadcast`: capture
//! never waits on a consumer, and a consumer that falls behind loses its
//! oldest frames instead of stalling the microphone.

use crate::config::CaptureConstraints;
use crate::error::{SessionError, SessionResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Fixed-size block of mono samples at the uplink rate.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// f32, normalized to -1.0..1.0
    pub samples: Arc<[f32]>,
    pub sample_rate: u32,
    pub captured_at: Instant,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
            captured_at: Instant::now(),
        }
    }

    /// Root-mean-square energy of the block.
    pub fn rms(&self) -> f32 {
        rms(&self.samples)
    }
}

pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}

/// A raw RGB8 camera frame.
#[derive(Debug, Clone)]
pub struct VideoSnapshot {
    pub width: u32,
    pub height: u32,
    /// Row-major RGB8, `width * height * 3` bytes when well-formed.
    pub rgb: Arc<Vec<u8>>,
    pub captured_at: Instant,
}

impl VideoSnapshot {
    pub fn from_image(image: image::RgbImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            width,
            height,
            rgb: Arc::new(image.into_raw()),
            captured_at: Instant::now(),
        }
    }
}

/// Receives interleaved device samples and publishes fixed uplink frames.
///
/// Down-mixes to mono and resamples (nearest lower sample) to the uplink rate.
pub struct FrameSink {
    tx: broadcast::Sender<AudioFrame>,
    block_size: usize,
    target_rate: u32,
    channels: usize,
    step: f64,
    pos: f64,
    pending: Vec<f32>,
}

impl FrameSink {
    fn new(tx: broadcast::Sender<AudioFrame>, constraints: &CaptureConstraints) -> Self {
        Self {
            tx,
            block_size: constraints.block_size,
            target_rate: constraints.sample_rate,
            channels: 1,
            step: 1.0,
            pos: 0.0,
            pending: Vec::with_capacity(constraints.block_size),
        }
    }

    /// Declare the device format. Must be called before pushing samples.
    pub fn set_source_format(&mut self, channels: u16, sample_rate: u32) {
        self.channels = channels.max(1) as usize;
        self.step = sample_rate.max(1) as f64 / self.target_rate as f64;
        self.pos = 0.0;
    }

    pub fn push_interleaved(&mut self, data: &[f32]) {
        let channels = self.channels;
        let frames = data.len() / channels;
        while self.pos < frames as f64 {
            let idx = self.pos as usize * channels;
            let sample = if channels == 1 {
                data[idx]
            } else {
                data[idx..idx + channels].iter().sum::<f32>() / channels as f32
            };
            self.pending.push(sample);
            if self.pending.len() >= self.block_size {
                let block = std::mem::replace(&mut self.pending, Vec::with_capacity(self.block_size));
                // No subscribers is fine; the frame is simply not observed.
                let _ = self.tx.send(AudioFrame::new(block, self.target_rate));
            }
            self.pos += self.step;
        }
        self.pos -= frames as f64;
    }

    pub fn push_interleaved_i16(&mut self, data: &[i16]) {
        let converted: Vec<f32> = data.iter().map(|&s| s as f32 / 32768.0).collect();
        self.push_interleaved(&converted);
    }
}

/// A running hardware stream. Dropping it must also stop it.
pub trait DeviceStream: Send {
    fn stop(&mut self);
}

/// Something that can produce a camera frame on demand.
pub trait VideoSource: Send {
    fn grab(&mut self) -> SessionResult<image::RgbImage>;
}

/// Opens capture hardware.
pub trait CaptureBackend: Send + Sync {
    fn open_microphone(
        &self,
        constraints: &CaptureConstraints,
        sink: FrameSink,
    ) -> SessionResult<Box<dyn DeviceStream>>;

    fn open_camera(&self, constraints: &CaptureConstraints) -> SessionResult<Box<dyn VideoSource>>;
}

pub type CameraFactory =
    Arc<dyn Fn(&CaptureConstraints) -> SessionResult<Box<dyn VideoSource>> + Send + Sync>;

/// Microphone through CPAL; camera through an injected factory.
#[derive(Default, Clone)]
pub struct CpalCaptureBackend {
    camera: Option<CameraFactory>,
}

impl CpalCaptureBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_camera(mut self, factory: CameraFactory) -> Self {
        self.camera = Some(factory);
        self
    }

    /// List available input devices
    pub fn list_input_devices() -> SessionResult<Vec<String>> {
        let host = cpal::default_host();
        let devices = host.input_devices()?;
        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }
}

impl CaptureBackend for CpalCaptureBackend {
    fn open_microphone(
        &self,
        constraints: &CaptureConstraints,
        sink: FrameSink,
    ) -> SessionResult<Box<dyn DeviceStream>> {
        let wanted = constraints.input_device.clone();
        let (ready_tx, ready_rx) = std_mpsc::channel::<SessionResult<()>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let thread = thread::Builder::new()
            .name("duplex-mic".to_string())
            .spawn(move || {
                let stream = match build_input_stream(wanted.as_deref(), sink) {
                    Ok(s) => s,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                // Park until stop or until the handle is dropped.
                let _ = stop_rx.recv();
                drop(stream);
                debug!("Microphone stream dropped");
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Box::new(CpalMicStream {
                stop_tx: Some(stop_tx),
                thread: Some(thread),
            })),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => Err(SessionError::DeviceNotFound(
                "microphone thread exited before the stream started".to_string(),
            )),
        }
    }

    fn open_camera(&self, constraints: &CaptureConstraints) -> SessionResult<Box<dyn VideoSource>> {
        match &self.camera {
            Some(factory) => factory(constraints),
            None => Err(SessionError::DeviceNotFound("no camera source configured".to_string())),
        }
    }
}

fn build_input_stream(wanted: Option<&str>, mut sink: FrameSink) -> SessionResult<cpal::Stream> {
    let host = cpal::default_host();
    let device = match wanted {
        Some(name) => host
            .input_devices()?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| SessionError::DeviceNotFound(format!("input device '{}'", name)))?,
        None => host
            .default_input_device()
            .ok_or_else(|| SessionError::DeviceNotFound("No input device available".to_string()))?,
    };
    info!("🎤 Using input device: {}", device.name().unwrap_or_else(|_| "Unknown".to_string()));

    let supported = device.default_input_config()?;
    let sample_format = supported.sample_format();
    let config = supported.config();
    sink.set_source_format(config.channels, config.sample_rate.0);
    info!(
        "🔧 Capture format: {:?}, {} Hz, {} ch",
        sample_format, config.sample_rate.0, config.channels
    );

    let err_fn = |err: cpal::StreamError| warn!("Audio stream error: {}", err);
    let stream = match sample_format {
        cpal::SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| sink.push_interleaved(data),
            err_fn,
            None,
        )?,
        cpal::SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| sink.push_interleaved_i16(data),
            err_fn,
            None,
        )?,
        other => {
            return Err(SessionError::DeviceNotFound(format!(
                "unsupported input sample format {:?}",
                other
            )))
        }
    };
    stream.play()?;
    info!("✅ Audio capture started");
    Ok(stream)
}

struct CpalMicStream {
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl DeviceStream for CpalMicStream {
    fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Microphone thread panicked");
            }
        }
    }
}

impl Drop for CpalMicStream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Samples a `VideoSource` at a fixed interval on its own thread.
struct SnapshotWorker {
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl SnapshotWorker {
    fn spawn(
        mut source: Box<dyn VideoSource>,
        interval: std::time::Duration,
        tx: broadcast::Sender<VideoSnapshot>,
    ) -> SessionResult<Self> {
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let thread = thread::Builder::new()
            .name("duplex-camera".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(std_mpsc::RecvTimeoutError::Timeout) => {}
                    _ => break,
                }
                match source.grab() {
                    Ok(image) => {
                        let _ = tx.send(VideoSnapshot::from_image(image));
                    }
                    Err(e) => warn!("Camera snapshot failed: {}", e),
                }
            })?;
        Ok(Self {
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        })
    }

    fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Acquires devices for one session.
pub struct CaptureManager;

impl CaptureManager {
    /// Open the microphone (and camera when requested). Either both streams
    /// are running on return, or neither is.
    pub fn acquire(
        backend: &dyn CaptureBackend,
        constraints: &CaptureConstraints,
    ) -> SessionResult<CaptureHandle> {
        info!(
            "🎙️ Acquiring capture ({} Hz, {}-sample frames, video: {})",
            constraints.sample_rate, constraints.block_size, constraints.video_enabled
        );
        let (audio_tx, _) = broadcast::channel(constraints.fanout_capacity);
        let sink = FrameSink::new(audio_tx.clone(), constraints);
        let mut mic = backend.open_microphone(constraints, sink)?;

        let (video_tx, snapshot) = if constraints.video_enabled {
            let camera = match backend.open_camera(constraints) {
                Ok(c) => c,
                Err(e) => {
                    mic.stop();
                    return Err(e);
                }
            };
            let (video_tx, _) = broadcast::channel(constraints.fanout_capacity);
            let worker = match SnapshotWorker::spawn(
                camera,
                constraints.snapshot_interval(),
                video_tx.clone(),
            ) {
                Ok(w) => w,
                Err(e) => {
                    mic.stop();
                    return Err(e);
                }
            };
            (Some(video_tx), Some(worker))
        } else {
            (None, None)
        };

        info!("✅ Capture acquired");
        Ok(CaptureHandle {
            audio_tx: Some(audio_tx),
            video_tx,
            mic: Some(mic),
            snapshot,
        })
    }
}

/// Running capture for one session.
pub struct CaptureHandle {
    audio_tx: Option<broadcast::Sender<AudioFrame>>,
    video_tx: Option<broadcast::Sender<VideoSnapshot>>,
    mic: Option<Box<dyn DeviceStream>>,
    snapshot: Option<SnapshotWorker>,
}

impl CaptureHandle {
    /// New independent audio subscriber. `None` once released.
    pub fn subscribe_audio(&self) -> Option<broadcast::Receiver<AudioFrame>> {
        self.audio_tx.as_ref().map(|tx| tx.subscribe())
    }

    /// New independent video subscriber. `None` without a camera or once released.
    pub fn subscribe_video(&self) -> Option<broadcast::Receiver<VideoSnapshot>> {
        self.video_tx.as_ref().map(|tx| tx.subscribe())
    }

    pub fn is_released(&self) -> bool {
        self.mic.is_none() && self.snapshot.is_none()
    }

    /// Stop every hardware stream. Idempotent. Subscribers observe `Closed`
    /// once the last sender is gone.
    pub fn release(&mut self) {
        if self.is_released() {
            return;
        }
        if let Some(mut worker) = self.snapshot.take() {
            worker.stop();
        }
        if let Some(mut mic) = self.mic.take() {
            mic.stop();
        }
        self.audio_tx = None;
        self.video_tx = None;
        info!("⏹️ Capture released");
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullStream {
        stops: Arc<AtomicUsize>,
        _sink: FrameSink,
    }

    impl DeviceStream for NullStream {
        fn stop(&mut self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct NullBackend {
        stops: Arc<AtomicUsize>,
        camera_ok: bool,
    }

    struct BlankCamera;

    impl VideoSource for BlankCamera {
        fn grab(&mut self) -> SessionResult<image::RgbImage> {
            Ok(image::RgbImage::new(4, 4))
        }
    }

    impl CaptureBackend for NullBackend {
        fn open_microphone(
            &self,
            _constraints: &CaptureConstraints,
            sink: FrameSink,
        ) -> SessionResult<Box<dyn DeviceStream>> {
            Ok(Box::new(NullStream {
                stops: self.stops.clone(),
                _sink: sink,
            }))
        }

        fn open_camera(&self, _c: &CaptureConstraints) -> SessionResult<Box<dyn VideoSource>> {
            if self.camera_ok {
                Ok(Box::new(BlankCamera))
            } else {
                Err(SessionError::PermissionDenied("camera".into()))
            }
        }
    }

    fn sink_with(block: usize) -> (FrameSink, broadcast::Receiver<AudioFrame>) {
        let (tx, rx) = broadcast::channel(16);
        let constraints = CaptureConstraints {
            block_size: block,
            ..Default::default()
        };
        (FrameSink::new(tx, &constraints), rx)
    }

    #[test]
    fn sink_emits_fixed_blocks() {
        let (mut sink, mut rx) = sink_with(4);
        sink.set_source_format(1, 16000);
        sink.push_interleaved(&[0.1; 10]);
        assert_eq!(rx.try_recv().unwrap().samples.len(), 4);
        assert_eq!(rx.try_recv().unwrap().samples.len(), 4);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn sink_downmixes_and_resamples() {
        let (mut sink, mut rx) = sink_with(4);
        // 48 kHz stereo -> 16 kHz mono: every third frame survives.
        sink.set_source_format(2, 48000);
        let stereo: Vec<f32> = (0..12).flat_map(|i| [i as f32, i as f32 + 1.0]).collect();
        sink.push_interleaved(&stereo);
        let frame = rx.try_recv().unwrap();
        assert_eq!(frame.samples.as_ref(), &[0.5, 3.5, 6.5, 9.5]);
        assert_eq!(frame.sample_rate, 16000);
    }

    #[test]
    fn rms_of_constant_signal() {
        assert!((rms(&[0.5; 8]) - 0.5).abs() < 1e-6);
        assert_eq!(rms(&[]), 0.0);
    }

    #[test]
    fn camera_failure_releases_microphone() {
        let stops = Arc::new(AtomicUsize::new(0));
        let backend = NullBackend {
            stops: stops.clone(),
            camera_ok: false,
        };
        let constraints = CaptureConstraints {
            video_enabled: true,
            ..Default::default()
        };
        let result = CaptureManager::acquire(&backend, &constraints);
        assert!(matches!(result, Err(SessionError::PermissionDenied(_))));
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn release_is_idempotent() {
        let stops = Arc::new(AtomicUsize::new(0));
        let backend = NullBackend {
            stops: stops.clone(),
            camera_ok: true,
        };
        let constraints = CaptureConstraints {
            video_enabled: true,
            snapshot_interval_ms: 10,
            ..Default::default()
        };
        let mut handle = CaptureManager::acquire(&backend, &constraints).unwrap();
        assert!(handle.subscribe_audio().is_some());
        assert!(handle.subscribe_video().is_some());

        handle.release();
        handle.release();
        drop(handle);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[ignore] // Requires audio hardware
    fn list_devices() {
        let devices = CpalCaptureBackend::list_input_devices();
        assert!(devices.is_ok());
    }
}
