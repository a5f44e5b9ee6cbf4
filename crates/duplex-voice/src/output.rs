//! **RodioOutput**: the output device behind the downlink scheduler.
//!
//! A single `TimelineMixer` source is handed to rodio once. Scheduled voices
//! carry the frame they start on; the mixer sums every voice that overlaps
//! the frame being rendered, so back-to-back chunks join without a gap. The
//! number of frames rendered so far is the output clock.

use crate::decode::DecodedAudio;
use crate::error::{SessionError, SessionResult};
use crate::scheduler::{CompletionFn, OutputDevice, PlayingSource};
use rodio::{OutputStream, Source};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{error, info, warn};

/// How far ahead of the rendered position the reported clock runs, so a
/// voice scheduled "now" normally reaches the mixer before its start frame.
const CLOCK_LEAD: u64 = 256;

struct Voice {
    samples: Vec<f32>,
    start_frame: u64,
    stopped: Arc<AtomicBool>,
    on_complete: Option<CompletionFn>,
}

#[derive(Default)]
struct MixerShared {
    pending: Mutex<Vec<Voice>>,
    has_pending: AtomicBool,
    frames_rendered: AtomicU64,
    alive: AtomicBool,
}

/// Infinite mono source that renders scheduled voices at exact offsets.
pub struct TimelineMixer {
    shared: Arc<MixerShared>,
    active: Vec<Voice>,
    sample_rate: u32,
}

impl TimelineMixer {
    /// Move newly scheduled voices into the active set. A voice that arrives
    /// after its start frame is shifted to `frame` so it plays from its head.
    fn pick_up_pending(&mut self, frame: u64) {
        let Ok(mut pending) = self.shared.pending.lock() else {
            return;
        };
        self.shared.has_pending.store(false, Ordering::Release);
        for mut voice in pending.drain(..) {
            if voice.start_frame < frame {
                voice.start_frame = frame;
            }
            self.active.push(voice);
        }
    }
}

impl Iterator for TimelineMixer {
    type Item = f32;

    fn next(&mut self) -> Option<f32> {
        let frame = self.shared.frames_rendered.load(Ordering::Acquire);
        if self.shared.has_pending.load(Ordering::Acquire) {
            self.pick_up_pending(frame);
        }

        let mut mixed = 0.0f32;
        self.active.retain_mut(|voice| {
            if voice.stopped.load(Ordering::Relaxed) {
                return false;
            }
            if frame < voice.start_frame {
                return true;
            }
            let idx = (frame - voice.start_frame) as usize;
            if let Some(s) = voice.samples.get(idx) {
                mixed += *s;
                true
            } else {
                if let Some(done) = voice.on_complete.take() {
                    done();
                }
                false
            }
        });

        self.shared.frames_rendered.store(frame + 1, Ordering::Release);
        Some(mixed.clamp(-1.0, 1.0))
    }
}

impl Source for TimelineMixer {
    fn current_frame_len(&self) -> Option<usize> {
        None
    }

    fn channels(&self) -> u16 {
        1
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn total_duration(&self) -> Option<Duration> {
        None
    }
}

impl Drop for TimelineMixer {
    fn drop(&mut self) {
        self.shared.alive.store(false, Ordering::SeqCst);
    }
}

struct MixerVoiceHandle {
    stopped: Arc<AtomicBool>,
    shared: Arc<MixerShared>,
}

impl PlayingSource for MixerVoiceHandle {
    fn stop(&mut self) -> SessionResult<()> {
        self.stopped.store(true, Ordering::SeqCst);
        if self.shared.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SessionError::Playback("output stream is closed".to_string()))
        }
    }
}

/// Default output device through rodio.
pub struct RodioOutput {
    shared: Arc<MixerShared>,
    sample_rate: u32,
    stop_tx: Mutex<Option<std_mpsc::Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl RodioOutput {
    /// Open the default output device and start the mixer at `sample_rate`.
    pub fn new(sample_rate: u32) -> SessionResult<Self> {
        info!("🔊 Initializing audio playback ({} Hz timeline)", sample_rate);
        let shared = Arc::new(MixerShared {
            alive: AtomicBool::new(true),
            ..Default::default()
        });
        let mixer = TimelineMixer {
            shared: shared.clone(),
            active: Vec::new(),
            sample_rate,
        };

        let (ready_tx, ready_rx) = std_mpsc::channel::<SessionResult<()>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        // OutputStream is !Send; it lives and dies on this thread.
        let thread = thread::Builder::new()
            .name("duplex-output".to_string())
            .spawn(move || {
                let (stream, handle) = match OutputStream::try_default() {
                    Ok(s) => s,
                    Err(e) => {
                        let _ = ready_tx.send(Err(SessionError::Playback(e.to_string())));
                        return;
                    }
                };
                if let Err(e) = handle.play_raw(mixer) {
                    let _ = ready_tx.send(Err(SessionError::Playback(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));
                let _ = stop_rx.recv();
                drop(stream);
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                info!("✅ Audio playback initialized");
                Ok(Self {
                    shared,
                    sample_rate,
                    stop_tx: Mutex::new(Some(stop_tx)),
                    thread: Mutex::new(Some(thread)),
                })
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => Err(SessionError::Playback(
                "output thread exited before the stream started".to_string(),
            )),
        }
    }

    /// Release the output device.
    pub fn shutdown(&self) {
        if let Ok(mut tx) = self.stop_tx.lock() {
            if let Some(tx) = tx.take() {
                let _ = tx.send(());
            }
        }
        if let Ok(mut thread) = self.thread.lock() {
            if let Some(thread) = thread.take() {
                if thread.join().is_err() {
                    error!("Output thread panicked");
                }
            }
        }
    }

    fn frames_rendered(&self) -> u64 {
        self.shared.frames_rendered.load(Ordering::Acquire)
    }
}

impl OutputDevice for RodioOutput {
    fn current_time(&self) -> f64 {
        (self.frames_rendered() + CLOCK_LEAD) as f64 / self.sample_rate as f64
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn start(
        &self,
        audio: DecodedAudio,
        start_at: f64,
        on_complete: CompletionFn,
    ) -> SessionResult<Box<dyn PlayingSource>> {
        if !self.shared.alive.load(Ordering::SeqCst) {
            return Err(SessionError::Playback("output stream is closed".to_string()));
        }
        let audio = audio.into_rate(self.sample_rate);
        let start_frame = (start_at * self.sample_rate as f64).round() as u64;
        if start_frame < self.frames_rendered() {
            warn!("Voice scheduled {} frames in the past", self.frames_rendered() - start_frame);
        }
        let stopped = Arc::new(AtomicBool::new(false));
        let voice = Voice {
            samples: audio.samples,
            start_frame,
            stopped: stopped.clone(),
            on_complete: Some(on_complete),
        };
        self.shared
            .pending
            .lock()
            .map_err(|_| SessionError::Playback("mixer lock poisoned".to_string()))?
            .push(voice);
        self.shared.has_pending.store(true, Ordering::Release);
        Ok(Box::new(MixerVoiceHandle {
            stopped,
            shared: self.shared.clone(),
        }))
    }
}

impl Drop for RodioOutput {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn mixer(rate: u32) -> (TimelineMixer, Arc<MixerShared>) {
        let shared = Arc::new(MixerShared {
            alive: AtomicBool::new(true),
            ..Default::default()
        });
        (
            TimelineMixer {
                shared: shared.clone(),
                active: Vec::new(),
                sample_rate: rate,
            },
            shared,
        )
    }

    fn push(shared: &MixerShared, samples: Vec<f32>, start_frame: u64, done: Arc<AtomicUsize>) -> Arc<AtomicBool> {
        let stopped = Arc::new(AtomicBool::new(false));
        shared.pending.lock().unwrap().push(Voice {
            samples,
            start_frame,
            stopped: stopped.clone(),
            on_complete: Some(Box::new(move || {
                done.fetch_add(1, Ordering::SeqCst);
            })),
        });
        shared.has_pending.store(true, Ordering::SeqCst);
        stopped
    }

    #[test]
    fn voices_join_without_gap() {
        let (mut m, shared) = mixer(1000);
        let done = Arc::new(AtomicUsize::new(0));
        push(&shared, vec![0.25; 3], 2, done.clone());
        push(&shared, vec![0.5; 2], 5, done.clone());

        let out: Vec<f32> = m.by_ref().take(9).collect();
        assert_eq!(out, vec![0.0, 0.0, 0.25, 0.25, 0.25, 0.5, 0.5, 0.0, 0.0]);
        assert_eq!(done.load(Ordering::SeqCst), 2);
        assert_eq!(shared.frames_rendered.load(Ordering::SeqCst), 9);
    }

    #[test]
    fn late_voice_plays_from_its_head() {
        let (mut m, shared) = mixer(24000);
        let done = Arc::new(AtomicUsize::new(0));
        let _ = m.by_ref().take(512).count();

        // Scheduled for frame 256 but only handed over at frame 512.
        let ramp: Vec<f32> = (1..=1000).map(|i| i as f32 / 1000.0).collect();
        push(&shared, ramp.clone(), CLOCK_LEAD, done.clone());

        let out: Vec<f32> = m.by_ref().take(1000).collect();
        assert_eq!(out[0], ramp[0]);
        assert_eq!(out, ramp);
        assert_eq!(m.next(), Some(0.0));
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn voice_scheduled_mid_block_is_picked_up_immediately() {
        let (mut m, shared) = mixer(1000);
        let done = Arc::new(AtomicUsize::new(0));
        let _ = m.by_ref().take(3).count();
        push(&shared, vec![0.5; 2], 4, done.clone());

        let out: Vec<f32> = m.by_ref().take(4).collect();
        assert_eq!(out, vec![0.0, 0.5, 0.5, 0.0]);
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stopped_voice_is_silent_and_not_completed() {
        let (mut m, shared) = mixer(1000);
        let done = Arc::new(AtomicUsize::new(0));
        let stopped = push(&shared, vec![0.5; 10], 0, done.clone());
        assert_eq!(m.next(), Some(0.5));
        stopped.store(true, Ordering::SeqCst);
        let rest: Vec<f32> = m.by_ref().take(12).collect();
        assert!(rest.iter().all(|s| *s == 0.0));
        assert_eq!(done.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn stop_after_mixer_dropped_reports_error() {
        let (m, shared) = mixer(1000);
        let mut handle = MixerVoiceHandle {
            stopped: Arc::new(AtomicBool::new(false)),
            shared,
        };
        assert!(handle.stop().is_ok());
        drop(m);
        assert!(handle.stop().is_err());
    }

    #[test]
    #[ignore] // Requires an audio output device
    fn rodio_output_clock_advances() {
        let output = RodioOutput::new(24000).expect("output device");
        let t0 = output.current_time();
        std::thread::sleep(Duration::from_millis(200));
        assert!(output.current_time() > t0);
    }
}
