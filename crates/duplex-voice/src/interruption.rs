//! Barge-in handling.
//!
//! Runs inside the session's event loop, so the flush is atomic with respect
//! to scheduling: no chunk can be registered between "stop everything" and
//! "cursor back to now". The generation counter lets workers tag results
//! with the interruption epoch they were requested in; results from an
//! older epoch are dropped when they come back.

use crate::scheduler::DownlinkScheduler;
use crate::voice_path::VoicePathSelector;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InterruptionReport {
    pub stopped: usize,
    /// Where the next chunk will start.
    pub cursor: f64,
    pub generation: u64,
}

#[derive(Debug, Default)]
pub struct InterruptionHandler {
    generation: u64,
    interruptions: u64,
}

impl InterruptionHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether work tagged with `generation` still belongs to the live epoch.
    pub fn is_current(&self, generation: u64) -> bool {
        generation == self.generation
    }

    pub fn interruptions(&self) -> u64 {
        self.interruptions
    }

    /// Stop all playback, reset the cursor, forget the interrupted turn.
    pub fn interrupt(
        &mut self,
        scheduler: &mut DownlinkScheduler,
        voice: &mut VoicePathSelector,
    ) -> InterruptionReport {
        self.generation += 1;
        self.interruptions += 1;
        let stopped = scheduler.flush();
        voice.abandon_turn();
        let report = InterruptionReport {
            stopped,
            cursor: scheduler.next_start_time(),
            generation: self.generation,
        };
        info!(
            "✋ Interruption #{}: {} chunks stopped, cursor {:.3}s",
            self.interruptions, report.stopped, report.cursor
        );
        report
    }
}
