//! Energy-based voice activity detection.
//!
//! Speaking starts as soon as frame energy crosses the threshold and clears
//! only after the energy has stayed below it for the whole silence timeout.
//! Any loud frame in between cancels the pending clear. The signal is
//! advisory (UI only); barge-in is decided by the remote service.

use crate::capture::AudioFrame;
use crate::config::VadConfig;
use crate::session::SessionGate;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadTransition {
    SpeechStarted,
    SpeechEnded,
}

/// Hysteresis state machine. Pure: time is passed in.
#[derive(Debug, Clone)]
pub struct VadDetector {
    threshold: f32,
    silence_timeout: Duration,
    speaking: bool,
    clear_deadline: Option<Instant>,
    energy: f32,
}

impl VadDetector {
    pub fn new(config: &VadConfig) -> Self {
        Self {
            threshold: config.voice_threshold,
            silence_timeout: config.silence_timeout(),
            speaking: false,
            clear_deadline: None,
            energy: 0.0,
        }
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    /// Most recent energy fed to the detector.
    pub fn energy(&self) -> f32 {
        self.energy
    }

    pub fn update(&mut self, energy: f32, now: Instant) -> Option<VadTransition> {
        self.energy = energy;
        if energy > self.threshold {
            self.clear_deadline = None;
            if !self.speaking {
                self.speaking = true;
                return Some(VadTransition::SpeechStarted);
            }
            return None;
        }

        if !self.speaking {
            return None;
        }
        match self.clear_deadline {
            None => {
                self.clear_deadline = Some(now + self.silence_timeout);
                None
            }
            Some(deadline) if now >= deadline => {
                self.speaking = false;
                self.clear_deadline = None;
                Some(VadTransition::SpeechEnded)
            }
            Some(_) => None,
        }
    }
}

pub type OnVadChange = Arc<dyn Fn(bool) + Send + Sync>;

/// Poll capture energy at a fixed interval and publish `speaking` changes.
///
/// Uses the newest frame available at each tick; older frames are skipped.
pub async fn run_vad_loop(
    config: VadConfig,
    mut audio_rx: broadcast::Receiver<AudioFrame>,
    speaking_tx: watch::Sender<bool>,
    on_change: Option<OnVadChange>,
    mut gate: SessionGate,
) {
    let mut detector = VadDetector::new(&config);
    let mut ticker = tokio::time::interval(config.poll_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    info!(
        "🎙️ VAD polling every {}ms (threshold {}, silence {}ms)",
        config.poll_interval_ms, config.voice_threshold, config.silence_timeout_ms
    );

    loop {
        tokio::select! {
            _ = gate.shutting_down() => break,
            _ = ticker.tick() => {}
        }

        let mut latest: Option<AudioFrame> = None;
        let mut closed = false;
        loop {
            match audio_rx.try_recv() {
                Ok(frame) => latest = Some(frame),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    debug!("VAD skipped {} frames", n);
                }
                Err(broadcast::error::TryRecvError::Empty) => break,
                Err(broadcast::error::TryRecvError::Closed) => {
                    closed = true;
                    break;
                }
            }
        }

        // No new frame: treat as unchanged energy so a running silence
        // countdown still completes.
        let energy = latest.map(|f| f.rms()).unwrap_or_else(|| detector.energy());
        if let Some(transition) = detector.update(energy, Instant::now()) {
            let speaking = transition == VadTransition::SpeechStarted;
            debug!("VAD: {:?} (energy {:.4})", transition, energy);
            speaking_tx.send_replace(speaking);
            if let Some(cb) = &on_change {
                cb(speaking);
            }
        }
        if closed {
            break;
        }
    }

    if speaking_tx.send_replace(false) {
        if let Some(cb) = &on_change {
            cb(false);
        }
    }
    info!("🎙️ VAD stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> VadDetector {
        VadDetector::new(&VadConfig {
            voice_threshold: 0.1,
            silence_timeout_ms: 3000,
            poll_interval_ms: 100,
        })
    }

    #[test]
    fn loud_frame_starts_speech() {
        let mut vad = detector();
        let t0 = Instant::now();
        assert_eq!(vad.update(0.01, t0), None);
        assert_eq!(vad.update(0.5, t0), Some(VadTransition::SpeechStarted));
        assert_eq!(vad.update(0.5, t0 + Duration::from_millis(100)), None);
        assert!(vad.is_speaking());
    }

    #[test]
    fn short_pause_does_not_clear() {
        let mut vad = detector();
        let t0 = Instant::now();
        vad.update(0.5, t0);
        // Quiet for 2.5 s, then loud again: still speaking throughout.
        for ms in (100..=2500).step_by(100) {
            assert_eq!(vad.update(0.0, t0 + Duration::from_millis(ms)), None);
        }
        assert!(vad.is_speaking());
        assert_eq!(vad.update(0.5, t0 + Duration::from_millis(2600)), None);

        // The countdown restarts from the next quiet frame.
        assert_eq!(vad.update(0.0, t0 + Duration::from_millis(2700)), None);
        assert_eq!(vad.update(0.0, t0 + Duration::from_millis(5600)), None);
        assert!(vad.is_speaking());
    }

    #[test]
    fn sustained_silence_clears_after_timeout() {
        let mut vad = detector();
        let t0 = Instant::now();
        vad.update(0.5, t0);
        assert_eq!(vad.update(0.0, t0 + Duration::from_millis(100)), None);
        assert_eq!(vad.update(0.0, t0 + Duration::from_millis(3000)), None);
        assert_eq!(
            vad.update(0.0, t0 + Duration::from_millis(3100)),
            Some(VadTransition::SpeechEnded)
        );
        assert!(!vad.is_speaking());
        assert_eq!(vad.update(0.0, t0 + Duration::from_millis(9000)), None);
    }

    #[tokio::test]
    async fn loop_publishes_changes() {
        let session = crate::session::Session::new();
        session.transition(crate::session::SessionState::Active).unwrap();
        let (frame_tx, frame_rx) = broadcast::channel(8);
        let (speaking_tx, mut speaking_rx) = watch::channel(false);
        let config = VadConfig {
            voice_threshold: 0.1,
            silence_timeout_ms: 3000,
            poll_interval_ms: 100,
        };
        let task = tokio::spawn(run_vad_loop(config, frame_rx, speaking_tx, None, session.gate()));

        frame_tx.send(AudioFrame::new(vec![0.5; 160], 16000)).unwrap();
        speaking_rx.changed().await.unwrap();
        assert!(*speaking_rx.borrow());

        session.transition(crate::session::SessionState::Draining).unwrap();
        task.await.unwrap();
        assert!(!*speaking_rx.borrow());
    }
}
