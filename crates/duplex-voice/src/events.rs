//! The session's event queue and the callbacks it reports through.

use crate::channel::{InboundEvent, Speaker};
use crate::decode::DecodedAudio;
use crate::error::{ErrorSeverity, SessionError, SessionResult};
use crate::recording::RecordingArtifact;
use crate::scheduler::EntryId;
use crate::session::SessionState;
use crate::vad::OnVadChange;
use crate::voice_path::VoicePath;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{error, warn};

/// Why a session is being torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownReason {
    /// The user (or embedding application) asked for it.
    Requested,
    /// The last [`crate::SessionHandle`] was dropped.
    HandleDropped,
    /// The service closed the channel.
    RemoteClosed,
    /// A fatal error.
    Fatal,
}

/// Everything the event loop reacts to. Produced by the channel thread, the
/// worker tasks, the output device and the [`crate::SessionHandle`].
pub enum SessionEvent {
    Inbound(InboundEvent),
    ChunkDecoded {
        generation: u64,
        audio: DecodedAudio,
    },
    DecodeFailed {
        generation: u64,
        error: SessionError,
    },
    SynthesisReady {
        generation: u64,
        audio: DecodedAudio,
    },
    SynthesisFailed {
        generation: u64,
        error: SessionError,
    },
    PlaybackFinished(EntryId),
    SelectVoicePath {
        path: VoicePath,
        reply: oneshot::Sender<SessionResult<()>>,
    },
    TeardownRequested(TeardownReason),
}

impl fmt::Debug for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEvent::Inbound(ev) => f.debug_tuple("Inbound").field(ev).finish(),
            SessionEvent::ChunkDecoded { generation, audio } => f
                .debug_struct("ChunkDecoded")
                .field("generation", generation)
                .field("secs", &audio.duration_secs())
                .finish(),
            SessionEvent::DecodeFailed { generation, error } => f
                .debug_struct("DecodeFailed")
                .field("generation", generation)
                .field("error", error)
                .finish(),
            SessionEvent::SynthesisReady { generation, audio } => f
                .debug_struct("SynthesisReady")
                .field("generation", generation)
                .field("secs", &audio.duration_secs())
                .finish(),
            SessionEvent::SynthesisFailed { generation, error } => f
                .debug_struct("SynthesisFailed")
                .field("generation", generation)
                .field("error", error)
                .finish(),
            SessionEvent::PlaybackFinished(id) => f.debug_tuple("PlaybackFinished").field(id).finish(),
            SessionEvent::SelectVoicePath { path, .. } => {
                f.debug_struct("SelectVoicePath").field("path", path).finish()
            }
            SessionEvent::TeardownRequested(reason) => {
                f.debug_tuple("TeardownRequested").field(reason).finish()
            }
        }
    }
}

/// Conversation text surfaced to the UI.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TranscriptEvent {
    /// Text part of a model turn.
    ModelText { text: String },
    Transcription { speaker: Speaker, text: String },
    TurnComplete,
    Interrupted,
}

pub type OnStateChange = Arc<dyn Fn(SessionState) + Send + Sync>;
pub type OnTranscriptEvent = Arc<dyn Fn(TranscriptEvent) + Send + Sync>;
pub type OnError = Arc<dyn Fn(&SessionError, ErrorSeverity) + Send + Sync>;
pub type OnRecording = Arc<dyn Fn(RecordingArtifact) + Send + Sync>;

/// Hooks for the embedding application. All optional; called from the
/// session's tasks, so keep them short.
#[derive(Clone, Default)]
pub struct SessionCallbacks {
    on_state_change: Option<OnStateChange>,
    on_transcript_event: Option<OnTranscriptEvent>,
    on_error: Option<OnError>,
    on_vad_change: Option<OnVadChange>,
    on_recording: Option<OnRecording>,
}

impl SessionCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_state_change(mut self, f: impl Fn(SessionState) + Send + Sync + 'static) -> Self {
        self.on_state_change = Some(Arc::new(f));
        self
    }

    pub fn on_transcript_event(mut self, f: impl Fn(TranscriptEvent) + Send + Sync + 'static) -> Self {
        self.on_transcript_event = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&SessionError, ErrorSeverity) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    pub fn on_vad_change(mut self, f: impl Fn(bool) + Send + Sync + 'static) -> Self {
        self.on_vad_change = Some(Arc::new(f));
        self
    }

    pub fn on_recording(mut self, f: impl Fn(RecordingArtifact) + Send + Sync + 'static) -> Self {
        self.on_recording = Some(Arc::new(f));
        self
    }

    pub(crate) fn vad_hook(&self) -> Option<OnVadChange> {
        self.on_vad_change.clone()
    }

    pub(crate) fn state_changed(&self, state: SessionState) {
        if let Some(cb) = &self.on_state_change {
            cb(state);
        }
    }

    pub(crate) fn transcript(&self, event: TranscriptEvent) {
        if let Some(cb) = &self.on_transcript_event {
            cb(event);
        }
    }

    /// Log and forward an error with its severity.
    pub(crate) fn error(&self, err: &SessionError) {
        let severity = err.severity();
        match severity {
            ErrorSeverity::Fatal => error!("❌ {}", err),
            ErrorSeverity::Recoverable => warn!("{}", err),
        }
        if let Some(cb) = &self.on_error {
            cb(err, severity);
        }
    }

    pub(crate) fn recording(&self, artifact: RecordingArtifact) {
        if let Some(cb) = &self.on_recording {
            cb(artifact);
        }
    }
}

impl fmt::Debug for SessionCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCallbacks")
            .field("on_state_change", &self.on_state_change.is_some())
            .field("on_transcript_event", &self.on_transcript_event.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_vad_change", &self.on_vad_change.is_some())
            .field("on_recording", &self.on_recording.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn errors_carry_severity() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callbacks = SessionCallbacks::new().on_error(move |_, severity| {
            sink.lock().unwrap().push(severity);
        });
        callbacks.error(&SessionError::Connection("dropped".into()));
        callbacks.error(&SessionError::Decode("bad chunk".into()));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![ErrorSeverity::Fatal, ErrorSeverity::Recoverable]
        );
    }

    #[test]
    fn missing_callbacks_are_ignored() {
        let callbacks = SessionCallbacks::new();
        callbacks.state_changed(SessionState::Active);
        callbacks.transcript(TranscriptEvent::TurnComplete);
        assert!(callbacks.vad_hook().is_none());
    }

    #[test]
    fn transcript_events_serialize_tagged() {
        let json = serde_json::to_value(TranscriptEvent::Transcription {
            speaker: Speaker::User,
            text: "hi".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "transcription");
        assert_eq!(json["speaker"], "user");
    }
}
