//! Which voice speaks a model turn.
//!
//! `Native` plays the service's own audio. `Alternate` discards that audio,
//! collects the turn's text and has a local backend speak it once the turn
//! completes. The choice is latched when a turn's first part arrives, so a
//! toggle mid-turn only affects the next turn and a turn is never voiced by
//! both paths.

use crate::error::{SessionError, SessionResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VoicePath {
    #[default]
    Native,
    Alternate,
}

impl fmt::Display for VoicePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoicePath::Native => f.write_str("native"),
            VoicePath::Alternate => f.write_str("alternate"),
        }
    }
}

#[derive(Debug, Default)]
pub struct VoicePathSelector {
    requested: VoicePath,
    alternate_available: bool,
    turn: Option<VoicePath>,
    text_parts: String,
    transcript: String,
}

impl VoicePathSelector {
    pub fn new(alternate_available: bool) -> Self {
        Self {
            alternate_available,
            ..Default::default()
        }
    }

    pub fn requested(&self) -> VoicePath {
        self.requested
    }

    pub fn alternate_available(&self) -> bool {
        self.alternate_available
    }

    /// Path of the turn in progress, if one has started.
    pub fn current_turn(&self) -> Option<VoicePath> {
        self.turn
    }

    /// Request a path for subsequent turns.
    pub fn request(&mut self, path: VoicePath) -> SessionResult<()> {
        if path == VoicePath::Alternate && !self.alternate_available {
            return Err(SessionError::BackendUnavailable(
                "alternate voice path is disabled for this session".to_string(),
            ));
        }
        if self.requested != path {
            info!("🔀 Voice path {} requested (applies from the next turn)", path);
        }
        self.requested = path;
        Ok(())
    }

    /// The backend failed: fall back to native for the rest of the session.
    pub fn disable_alternate(&mut self) {
        if self.alternate_available {
            warn!("Alternate voice path disabled for the rest of the session");
        }
        self.alternate_available = false;
        self.requested = VoicePath::Native;
    }

    /// Latch (on first call per turn) and return the path of the current turn.
    pub fn turn_path(&mut self) -> VoicePath {
        let requested = self.requested;
        *self.turn.get_or_insert_with(|| {
            debug!("Turn latched to {} voice", requested);
            requested
        })
    }

    /// Text part of the current turn. Only kept on alternate turns.
    pub fn push_text(&mut self, text: &str) {
        if self.turn_path() == VoicePath::Alternate {
            self.text_parts.push_str(text);
        }
    }

    /// Transcript of the model's own speech. Used when a turn carries no text parts.
    pub fn push_transcript(&mut self, text: &str) {
        if self.turn_path() == VoicePath::Alternate {
            self.transcript.push_str(text);
        }
    }

    /// Whether native audio of the current turn should play.
    pub fn accepts_native_audio(&mut self) -> bool {
        self.turn_path() == VoicePath::Native
    }

    /// End the turn. Returns the text to synthesize for an alternate turn.
    pub fn finish_turn(&mut self) -> Option<String> {
        let path = self.turn.take();
        let parts = std::mem::take(&mut self.text_parts);
        let transcript = std::mem::take(&mut self.transcript);
        if path != Some(VoicePath::Alternate) {
            return None;
        }
        let text = if parts.trim().is_empty() { transcript } else { parts };
        let text = text.trim().to_string();
        (!text.is_empty()).then_some(text)
    }

    /// Barge-in: drop whatever the current turn collected.
    pub fn abandon_turn(&mut self) {
        self.turn = None;
        self.text_parts.clear();
        self.transcript.clear();
    }
}
