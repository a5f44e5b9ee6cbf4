//! # Duplex Voice - Real-time Voice Sessions
//!
//! Streams microphone audio (and optional camera snapshots) to a live
//! conversational service while playing its spoken replies back gaplessly,
//! with barge-in, local voice activity detection, an alternate local voice
//! and session recording.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                       Session Event Loop                          │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────────┐      │
//! │  │   Capture    │ → │   Uplink     │ → │  Live Channel    │      │
//! │  │ (cpal, cam)  │   │ (PCM / JPEG) │   │ (tungstenite)    │      │
//! │  └──────────────┘   └──────────────┘   └──────────────────┘      │
//! │     ↓       ↓                                   ↓                │
//! │  ┌──────┐ ┌──────────┐   ┌──────────────┐  ┌──────────────┐      │
//! │  │ VAD  │ │ Recorder │   │ Voice Path   │← │  Inbound     │      │
//! │  │(RMS) │ │ (hound)  │   │ native / alt │  │  events      │      │
//! │  └──────┘ └──────────┘   └──────────────┘  └──────────────┘      │
//! │                                ↓                 ↓ Interrupted   │
//! │  ┌──────────────┐   ┌──────────────────┐  ┌──────────────┐       │
//! │  │  Audio Out   │ ← │ Downlink         │← │ Interruption │       │
//! │  │   (rodio)    │   │ Scheduler        │  │   Handler    │       │
//! │  └──────────────┘   └──────────────────┘  └──────────────┘       │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Start a session with [`LiveSession::start`] and control it through the
//! returned [`SessionHandle`].

pub mod capture;
pub mod channel;
pub mod config;
pub mod decode;
pub mod encoder;
pub mod error;
pub mod events;
pub mod interruption;
pub mod lifecycle;
pub mod output;
pub mod protocol;
pub mod recording;
pub mod scheduler;
pub mod session;
pub mod synthesis;
pub mod vad;
pub mod voice_path;

pub use capture::{
    AudioFrame, CaptureBackend, CaptureHandle, CaptureManager, CpalCaptureBackend, DeviceStream,
    FrameSink, VideoSnapshot, VideoSource,
};
pub use channel::{
    AudioPayload, ChannelConfig, ChannelConnector, InboundEvent, InboundSink, LiveConnector,
    SessionChannel, Speaker,
};
pub use config::{
    AlternateVoiceConfig, CaptureConstraints, LiveConfig, PlaybackConfig, RecordingConfig,
    ResponseModality, SessionConfig, VadConfig,
};
pub use decode::{DecodedAudio, PayloadDecoder, Pcm16Decoder};
pub use encoder::{TransportChunk, UplinkEncoder};
pub use error::{ErrorSeverity, SessionError, SessionResult};
pub use events::{SessionCallbacks, SessionEvent, TeardownReason, TranscriptEvent};
pub use interruption::{InterruptionHandler, InterruptionReport};
pub use lifecycle::{LiveSession, SessionDeps, SessionHandle};
pub use output::RodioOutput;
pub use recording::{RecordedFrame, Recorder, RecordingArtifact, RecordingMetadata};
pub use scheduler::{DownlinkScheduler, EntryId, OutputDevice, PlaybackRegistry, PlayingSource};
pub use session::{Session, SessionGate, SessionState};
pub use synthesis::{HttpSynthesisBackend, SynthesisBackend, VoiceParams};
pub use vad::{VadDetector, VadTransition};
pub use voice_path::{VoicePath, VoicePathSelector};
