//! Gapless downlink scheduling.
//!
//! Each decoded chunk starts at `max(now, next_start)` on the output clock and
//! pushes `next_start` forward by its duration, so chunks play back to back in
//! arrival order and a late chunk starts immediately instead of in the past.
//! Every started chunk is tracked in the [`PlaybackRegistry`] until it ends
//! naturally or is stopped by a flush.

use crate::decode::DecodedAudio;
use crate::error::SessionResult;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Opaque handle to a scheduled chunk. Never reused within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(u64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Fired once when a source plays to its end. Not fired for stopped sources.
pub type CompletionFn = Box<dyn FnOnce() + Send>;

/// A source that has been handed to the output device.
pub trait PlayingSource: Send {
    fn stop(&mut self) -> SessionResult<()>;
}

/// The audio output: a monotonic clock plus sample-accurate start.
pub trait OutputDevice: Send + Sync {
    /// Output clock in seconds. Never decreases.
    fn current_time(&self) -> f64;

    /// Rate the device wants samples at.
    fn sample_rate(&self) -> u32;

    fn start(
        &self,
        audio: DecodedAudio,
        start_at: f64,
        on_complete: CompletionFn,
    ) -> SessionResult<Box<dyn PlayingSource>>;
}

pub struct PlaybackEntry {
    pub id: EntryId,
    /// Seconds
    pub duration: f64,
    /// Seconds on the output clock
    pub scheduled_start: f64,
    source: Box<dyn PlayingSource>,
}

impl fmt::Debug for PlaybackEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaybackEntry")
            .field("id", &self.id)
            .field("duration", &self.duration)
            .field("scheduled_start", &self.scheduled_start)
            .finish()
    }
}

/// Arena of live playback entries.
#[derive(Default)]
pub struct PlaybackRegistry {
    entries: HashMap<EntryId, PlaybackEntry>,
    next_id: u64,
}

impl PlaybackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate(&mut self) -> EntryId {
        self.next_id += 1;
        EntryId(self.next_id)
    }

    fn insert(&mut self, entry: PlaybackEntry) {
        self.entries.insert(entry.id, entry);
    }

    pub fn remove(&mut self, id: EntryId) -> Option<PlaybackEntry> {
        self.entries.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: EntryId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Entries ordered by start time.
    pub fn entries(&self) -> Vec<&PlaybackEntry> {
        let mut v: Vec<&PlaybackEntry> = self.entries.values().collect();
        v.sort_by(|a, b| a.scheduled_start.total_cmp(&b.scheduled_start));
        v
    }

    /// Stop and drop every entry. A source that fails to stop (already
    /// finished, device gone) is logged and dropped anyway.
    pub fn stop_all(&mut self) -> usize {
        let count = self.entries.len();
        for (id, mut entry) in self.entries.drain() {
            if let Err(e) = entry.source.stop() {
                debug!("Stop of playback entry {} ignored: {}", id, e);
            }
        }
        count
    }
}

/// The single playback cursor of a session.
#[derive(Debug, Default, Clone, Copy)]
pub struct OutputTimeline {
    next_start_time: f64,
}

impl OutputTimeline {
    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    /// Reserve `duration` seconds and return where the chunk starts.
    fn reserve(&mut self, now: f64, duration: f64) -> f64 {
        let start = now.max(self.next_start_time);
        self.next_start_time = start + duration;
        start
    }

    fn reset(&mut self, now: f64) {
        self.next_start_time = now;
    }
}

pub type FinishedNotifier = Arc<dyn Fn(EntryId) + Send + Sync>;

/// Schedules decoded chunks back to back on one output device.
pub struct DownlinkScheduler {
    device: Arc<dyn OutputDevice>,
    registry: PlaybackRegistry,
    timeline: OutputTimeline,
    notifier: FinishedNotifier,
}

impl DownlinkScheduler {
    /// `notifier` is called (from the device's thread) when an entry ends
    /// naturally; route it back to whoever owns the scheduler and call
    /// [`DownlinkScheduler::on_finished`] there.
    pub fn new(device: Arc<dyn OutputDevice>, notifier: FinishedNotifier) -> Self {
        Self {
            device,
            registry: PlaybackRegistry::new(),
            timeline: OutputTimeline::default(),
            notifier,
        }
    }

    pub fn current_time(&self) -> f64 {
        self.device.current_time()
    }

    pub fn next_start_time(&self) -> f64 {
        self.timeline.next_start_time()
    }

    pub fn active_count(&self) -> usize {
        self.registry.len()
    }

    pub fn registry(&self) -> &PlaybackRegistry {
        &self.registry
    }

    /// Start `audio` right after everything already scheduled.
    pub fn schedule(&mut self, audio: DecodedAudio) -> SessionResult<EntryId> {
        let audio = audio.into_rate(self.device.sample_rate());
        let duration = audio.duration_secs();
        let now = self.device.current_time();
        let start = now.max(self.timeline.next_start_time());

        let id = self.registry.allocate();
        let notifier = self.notifier.clone();
        let source = self
            .device
            .start(audio, start, Box::new(move || notifier(id)))?;

        let reserved = self.timeline.reserve(now, duration);
        debug_assert_eq!(reserved, start);
        self.registry.insert(PlaybackEntry {
            id,
            duration,
            scheduled_start: start,
            source,
        });
        debug!(
            "🔈 Scheduled {} at {:.3}s for {:.3}s (now {:.3}s, {} active)",
            id,
            start,
            duration,
            now,
            self.registry.len()
        );
        Ok(id)
    }

    /// An entry played to its end. Returns false when it was already gone
    /// (stopped by a flush before its completion was delivered).
    pub fn on_finished(&mut self, id: EntryId) -> bool {
        self.registry.remove(id).is_some()
    }

    /// Barge-in: stop everything and pull the cursor back to now.
    pub fn flush(&mut self) -> usize {
        let stopped = self.registry.stop_all();
        let now = self.device.current_time();
        self.timeline.reset(now);
        info!("⏹️ Playback flushed ({} entries stopped, cursor at {:.3}s)", stopped, now);
        stopped
    }

    /// Teardown: stop everything. The cursor no longer matters.
    pub fn stop_all(&mut self) -> usize {
        let stopped = self.registry.stop_all();
        if stopped > 0 {
            warn!("Stopped {} playback entries during teardown", stopped);
        }
        stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SessionError;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    /// Device with a hand-driven clock that records every start.
    #[derive(Default)]
    struct ManualDevice {
        clock_ms: AtomicU64,
        starts: Mutex<Vec<f64>>,
        stops: Arc<AtomicU64>,
        fail_stop: bool,
    }

    struct ManualSource {
        stops: Arc<AtomicU64>,
        fail: bool,
    }

    impl PlayingSource for ManualSource {
        fn stop(&mut self) -> SessionResult<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(SessionError::Playback("already finished".into()))
            } else {
                Ok(())
            }
        }
    }

    impl ManualDevice {
        fn set_time(&self, secs: f64) {
            self.clock_ms.store((secs * 1000.0).round() as u64, Ordering::SeqCst);
        }
    }

    impl OutputDevice for ManualDevice {
        fn current_time(&self) -> f64 {
            self.clock_ms.load(Ordering::SeqCst) as f64 / 1000.0
        }

        fn sample_rate(&self) -> u32 {
            1000
        }

        fn start(
            &self,
            _audio: DecodedAudio,
            start_at: f64,
            _on_complete: CompletionFn,
        ) -> SessionResult<Box<dyn PlayingSource>> {
            self.starts.lock().unwrap().push(start_at);
            Ok(Box::new(ManualSource {
                stops: self.stops.clone(),
                fail: self.fail_stop,
            }))
        }
    }

    fn chunk(secs: f64) -> DecodedAudio {
        DecodedAudio::new(vec![0.0; (secs * 1000.0).round() as usize], 1000)
    }

    fn scheduler(device: Arc<ManualDevice>) -> DownlinkScheduler {
        DownlinkScheduler::new(device, Arc::new(|_| {}))
    }

    #[test]
    fn chunks_play_back_to_back() {
        let device = Arc::new(ManualDevice::default());
        let mut s = scheduler(device.clone());

        s.schedule(chunk(0.5)).unwrap();
        s.schedule(chunk(0.7)).unwrap();
        s.schedule(chunk(0.3)).unwrap();

        let starts = device.starts.lock().unwrap().clone();
        assert_eq!(starts, vec![0.0, 0.5, 1.2]);
        assert!((s.next_start_time() - 1.5).abs() < 1e-9);
        assert_eq!(s.active_count(), 3);
    }

    #[test]
    fn late_chunk_starts_now() {
        let device = Arc::new(ManualDevice::default());
        let mut s = scheduler(device.clone());
        s.schedule(chunk(0.2)).unwrap();
        device.set_time(1.0);
        s.schedule(chunk(0.2)).unwrap();
        let starts = device.starts.lock().unwrap().clone();
        assert_eq!(starts, vec![0.0, 1.0]);
        assert!((s.next_start_time() - 1.2).abs() < 1e-9);
    }

    #[test]
    fn interruption_resets_cursor() {
        let device = Arc::new(ManualDevice::default());
        let mut s = scheduler(device.clone());
        s.schedule(chunk(0.5)).unwrap();
        s.schedule(chunk(0.7)).unwrap();
        s.schedule(chunk(0.3)).unwrap();

        device.set_time(0.9);
        assert_eq!(s.flush(), 3);
        assert_eq!(s.active_count(), 0);
        assert!((s.next_start_time() - 0.9).abs() < 1e-9);
        assert_eq!(device.stops.load(Ordering::SeqCst), 3);

        s.schedule(chunk(0.1)).unwrap();
        assert_eq!(*device.starts.lock().unwrap().last().unwrap(), 0.9);
    }

    #[test]
    fn stop_errors_are_swallowed() {
        let device = Arc::new(ManualDevice {
            fail_stop: true,
            ..Default::default()
        });
        let mut s = scheduler(device.clone());
        s.schedule(chunk(0.1)).unwrap();
        s.schedule(chunk(0.1)).unwrap();
        assert_eq!(s.flush(), 2);
        assert!(s.registry().is_empty());
    }

    #[test]
    fn natural_completion_removes_entry_once() {
        let device = Arc::new(ManualDevice::default());
        let mut s = scheduler(device);
        let a = s.schedule(chunk(0.1)).unwrap();
        let b = s.schedule(chunk(0.1)).unwrap();
        assert_ne!(a, b);
        assert!(s.on_finished(a));
        assert!(!s.on_finished(a));
        assert!(s.registry().contains(b));
        assert_eq!(s.active_count(), 1);
    }

    #[test]
    fn chunks_are_resampled_to_device_rate() {
        let device = Arc::new(ManualDevice::default());
        let mut s = scheduler(device);
        // 0.5 s at 24 kHz becomes 0.5 s at the device's 1 kHz.
        s.schedule(DecodedAudio::new(vec![0.0; 12000], 24000)).unwrap();
        assert!((s.next_start_time() - 0.5).abs() < 1e-9);
    }
}
