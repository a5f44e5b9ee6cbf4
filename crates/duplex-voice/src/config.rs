//! Session configuration.
//!
//! Loaded from TOML and overlaid from the environment. Every section has
//! defaults so an empty file (or no file) yields a usable configuration once
//! an API key is present.
//!
//! | Env | Default | Description |
//! |-----|---------|-------------|
//! | GEMINI_API_KEY / DUPLEX_API_KEY | (none) | Key for the live endpoint. |
//! | DUPLEX_MODEL | gemini-2.0-flash-live-001 | Model requested in the setup message. |
//! | DUPLEX_ENDPOINT | Gemini BidiGenerateContent | Websocket endpoint (key is appended). |
//! | DUPLEX_VOICE | Puck | Prebuilt voice name. |
//! | DUPLEX_PERSONA | (none) | Persona / system instruction. |
//! | DUPLEX_VIDEO_ENABLED | false | Stream 1 fps camera snapshots. |
//! | DUPLEX_ALT_VOICE_ENABLED | false | Enable the local synthesis backend. |
//! | DUPLEX_ALT_VOICE_URL | http://127.0.0.1:8004 | Base URL of the synthesis backend. |
//! | DUPLEX_RECORDING_ENABLED | true | Keep a local recording of the session. |

use crate::error::{SessionError, SessionResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_LIVE_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

fn default_voice() -> String {
    "Puck".to_string()
}

/// What the remote service answers with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResponseModality {
    #[default]
    Audio,
    Text,
}

impl ResponseModality {
    pub fn as_wire(&self) -> &'static str {
        match self {
            ResponseModality::Audio => "AUDIO",
            ResponseModality::Text => "TEXT",
        }
    }
}

/// Top-level configuration for one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Persona / system instruction sent when the channel opens.
    #[serde(default)]
    pub persona_instruction: String,
    /// Prebuilt voice of the remote service.
    #[serde(default = "default_voice")]
    pub voice: String,
    #[serde(default)]
    pub response_modality: ResponseModality,
    #[serde(default)]
    pub capture: CaptureConstraints,
    #[serde(default)]
    pub playback: PlaybackConfig,
    #[serde(default)]
    pub vad: VadConfig,
    #[serde(default)]
    pub alternate_voice: AlternateVoiceConfig,
    #[serde(default)]
    pub live: LiveConfig,
    #[serde(default)]
    pub recording: RecordingConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            persona_instruction: String::new(),
            voice: default_voice(),
            response_modality: ResponseModality::default(),
            capture: CaptureConstraints::default(),
            playback: PlaybackConfig::default(),
            vad: VadConfig::default(),
            alternate_voice: AlternateVoiceConfig::default(),
            live: LiveConfig::default(),
            recording: RecordingConfig::default(),
        }
    }
}

/// Microphone and camera constraints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConstraints {
    /// Uplink sample rate in Hz (default: 16000)
    pub sample_rate: u32,
    /// Samples per uplink frame (default: 4096)
    pub block_size: usize,
    /// Capture camera snapshots alongside audio
    pub video_enabled: bool,
    /// Interval between camera snapshots (default: 1000ms)
    pub snapshot_interval_ms: u64,
    /// Longest side of an uplinked snapshot; larger frames are downscaled
    pub max_snapshot_dimension: u32,
    /// JPEG quality 1-100
    pub jpeg_quality: u8,
    /// Broadcast capacity per subscriber, in frames
    pub fanout_capacity: usize,
    /// Preferred input device name; default device when unset
    pub input_device: Option<String>,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            block_size: 4096,
            video_enabled: false,
            snapshot_interval_ms: 1000,
            max_snapshot_dimension: 768,
            jpeg_quality: 80,
            fanout_capacity: 64,
            input_device: None,
        }
    }
}

impl CaptureConstraints {
    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Rate of the output timeline; inbound audio at other rates is resampled (default: 24000)
    pub sample_rate: u32,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self { sample_rate: 24000 }
    }
}

/// Voice activity detection thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// RMS energy above which the user counts as speaking
    pub voice_threshold: f32,
    /// Continuous silence required before speaking clears (default: 3000ms)
    pub silence_timeout_ms: u64,
    /// How often the detector samples capture energy (default: 100ms)
    pub poll_interval_ms: u64,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            voice_threshold: 0.02,
            silence_timeout_ms: 3000,
            poll_interval_ms: 100,
        }
    }
}

impl VadConfig {
    pub fn silence_timeout(&self) -> Duration {
        Duration::from_millis(self.silence_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Local speech-synthesis backend used by the alternate voice path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlternateVoiceConfig {
    pub enabled: bool,
    /// Base URL without trailing slash
    pub base_url: String,
    pub voice: String,
    /// Expressiveness passed to the backend (0.0 - 2.0)
    pub exaggeration: f32,
    pub timeout_secs: u64,
}

impl Default for AlternateVoiceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "http://127.0.0.1:8004".to_string(),
            voice: "default".to_string(),
            exaggeration: 0.5,
            timeout_secs: 30,
        }
    }
}

/// Remote live endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    pub endpoint: String,
    pub model: String,
    /// Never serialized back out.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub connect_timeout_secs: u64,
    /// How long to wait for the setup acknowledgement
    pub setup_timeout_secs: u64,
    /// Ask the service for transcripts of both sides
    pub transcription: bool,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_LIVE_ENDPOINT.to_string(),
            model: "gemini-2.0-flash-live-001".to_string(),
            api_key: None,
            connect_timeout_secs: 10,
            setup_timeout_secs: 15,
            transcription: true,
        }
    }
}

impl LiveConfig {
    /// The websocket URL with the API key attached.
    pub fn url(&self) -> SessionResult<String> {
        let key = self.api_key.as_deref().ok_or_else(|| {
            SessionError::Config("live channel requires GEMINI_API_KEY or DUPLEX_API_KEY".to_string())
        })?;
        let mut url = url::Url::parse(&self.endpoint)?;
        url.query_pairs_mut().append_pair("key", key);
        Ok(url.to_string())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn setup_timeout(&self) -> Duration {
        Duration::from_secs(self.setup_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    pub enabled: bool,
    /// Longest side of the thumbnail
    pub thumbnail_size: u32,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            thumbnail_size: 160,
        }
    }
}

impl SessionConfig {
    /// Parse a TOML document. Missing sections take their defaults.
    pub fn from_toml_str(s: &str) -> SessionResult<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Load from a TOML file, then apply environment overrides.
    pub fn from_file(path: impl AsRef<Path>) -> SessionResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let mut config = Self::from_toml_str(&raw)?;
        config.apply_env();
        Ok(config)
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Overlay `DUPLEX_*` variables (and `GEMINI_API_KEY`) onto this config.
    pub fn apply_env(&mut self) {
        if let Some(key) = env_opt_string("DUPLEX_API_KEY").or_else(|| env_opt_string("GEMINI_API_KEY")) {
            self.live.api_key = Some(key);
        }
        if let Some(model) = env_opt_string("DUPLEX_MODEL") {
            self.live.model = model;
        }
        if let Some(endpoint) = env_opt_string("DUPLEX_ENDPOINT") {
            self.live.endpoint = endpoint;
        }
        if let Some(voice) = env_opt_string("DUPLEX_VOICE") {
            self.voice = voice;
        }
        if let Some(persona) = env_opt_string("DUPLEX_PERSONA") {
            self.persona_instruction = persona;
        }
        self.capture.video_enabled = env_bool("DUPLEX_VIDEO_ENABLED", self.capture.video_enabled);
        self.alternate_voice.enabled =
            env_bool("DUPLEX_ALT_VOICE_ENABLED", self.alternate_voice.enabled);
        if let Some(url) = env_opt_string("DUPLEX_ALT_VOICE_URL") {
            self.alternate_voice.base_url = url;
        }
        self.recording.enabled = env_bool("DUPLEX_RECORDING_ENABLED", self.recording.enabled);
    }

    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> SessionResult<()> {
        let c = &self.capture;
        if c.sample_rate == 0 || c.block_size == 0 {
            return Err(SessionError::Config(
                "capture sample_rate and block_size must be non-zero".to_string(),
            ));
        }
        if c.video_enabled && c.snapshot_interval_ms == 0 {
            return Err(SessionError::Config(
                "snapshot_interval_ms must be non-zero when video is enabled".to_string(),
            ));
        }
        if c.jpeg_quality == 0 || c.jpeg_quality > 100 {
            return Err(SessionError::Config(format!(
                "jpeg_quality must be 1-100, got {}",
                c.jpeg_quality
            )));
        }
        if c.fanout_capacity == 0 {
            return Err(SessionError::Config("fanout_capacity must be non-zero".to_string()));
        }
        if self.playback.sample_rate == 0 {
            return Err(SessionError::Config("playback sample_rate must be non-zero".to_string()));
        }
        if self.vad.poll_interval_ms == 0 {
            return Err(SessionError::Config("vad poll_interval_ms must be non-zero".to_string()));
        }
        if !(0.0..=1.0).contains(&self.vad.voice_threshold) {
            return Err(SessionError::Config(format!(
                "vad voice_threshold must be within 0.0-1.0, got {}",
                self.vad.voice_threshold
            )));
        }
        if self.voice.trim().is_empty() {
            return Err(SessionError::Config("voice must not be empty".to_string()));
        }
        Ok(())
    }

}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => {
            let v = v.trim();
            if v.is_empty() {
                default
            } else {
                v.eq_ignore_ascii_case("true") || v == "1"
            }
        }
        Err(_) => default,
    }
}

fn env_opt_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_pipeline_expectations() {
        let c = SessionConfig::default();
        assert_eq!(c.capture.sample_rate, 16000);
        assert_eq!(c.capture.block_size, 4096);
        assert_eq!(c.capture.snapshot_interval(), Duration::from_secs(1));
        assert_eq!(c.playback.sample_rate, 24000);
        assert_eq!(c.vad.silence_timeout(), Duration::from_millis(3000));
        assert_eq!(c.response_modality, ResponseModality::Audio);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn partial_toml_keeps_section_defaults() {
        let c = SessionConfig::from_toml_str(
            r#"
            persona_instruction = "You are a patient interviewer."
            voice = "Kore"

            [capture]
            video_enabled = true

            [vad]
            voice_threshold = 0.05
            "#,
        )
        .unwrap();
        assert_eq!(c.voice, "Kore");
        assert!(c.capture.video_enabled);
        assert_eq!(c.capture.block_size, 4096);
        assert!((c.vad.voice_threshold - 0.05).abs() < 1e-6);
        assert_eq!(c.vad.silence_timeout_ms, 3000);
        assert!(c.recording.enabled);
    }

    #[test]
    fn validate_rejects_unusable_values() {
        let mut c = SessionConfig::default();
        c.capture.block_size = 0;
        assert!(matches!(c.validate(), Err(SessionError::Config(_))));

        let mut c = SessionConfig::default();
        c.capture.jpeg_quality = 0;
        assert!(c.validate().is_err());

        let mut c = SessionConfig::default();
        c.vad.voice_threshold = 1.5;
        assert!(c.validate().is_err());
    }

    #[test]
    fn live_url_requires_key() {
        let mut c = SessionConfig::default();
        c.live.api_key = None;
        assert!(matches!(c.live.url(), Err(SessionError::Config(_))));

        c.live.api_key = Some("abc123".into());
        let url = c.live.url().unwrap();
        assert!(url.starts_with("wss://generativelanguage.googleapis.com/"));
        assert!(url.ends_with("?key=abc123"));
    }
}
