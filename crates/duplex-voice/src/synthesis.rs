//! Local speech synthesis for the alternate voice path.
//!
//! The backend is a small HTTP service:
//! `POST {base}/synthesize {text, voice, exaggeration}` returns encoded audio
//! (WAV or MP3), `GET {base}/health` returns `{"available": bool}`.

use crate::config::AlternateVoiceConfig;
use crate::error::{SessionError, SessionResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

/// Voice parameters for one synthesis request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VoiceParams {
    pub voice: String,
    pub exaggeration: f32,
}

impl From<&AlternateVoiceConfig> for VoiceParams {
    fn from(config: &AlternateVoiceConfig) -> Self {
        Self {
            voice: config.voice.clone(),
            exaggeration: config.exaggeration,
        }
    }
}

/// Backend that turns text into encoded audio bytes.
#[async_trait]
pub trait SynthesisBackend: Send + Sync {
    /// Empty text yields empty audio.
    async fn synthesize(&self, text: &str, params: &VoiceParams) -> SessionResult<Vec<u8>>;

    /// Whether the backend is reachable and ready.
    async fn health(&self) -> bool;
}

#[derive(Serialize)]
struct SynthesizeRequest<'a> {
    text: &'a str,
    voice: &'a str,
    exaggeration: f32,
}

#[derive(Deserialize)]
struct HealthResponse {
    #[serde(default)]
    available: bool,
}

/// reqwest client for the local synthesis service.
#[derive(Debug, Clone)]
pub struct HttpSynthesisBackend {
    /// Base URL without trailing slash (e.g. http://127.0.0.1:8004).
    pub base_url: String,
    client: reqwest::Client,
}

impl HttpSynthesisBackend {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> SessionResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SessionError::BackendUnavailable(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn from_config(config: &AlternateVoiceConfig) -> SessionResult<Self> {
        Self::new(config.base_url.clone(), Duration::from_secs(config.timeout_secs))
    }
}

#[async_trait]
impl SynthesisBackend for HttpSynthesisBackend {
    async fn synthesize(&self, text: &str, params: &VoiceParams) -> SessionResult<Vec<u8>> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/synthesize", self.base_url);
        debug!("Synthesizing {} chars via {}", text.len(), url);
        let res = self
            .client
            .post(&url)
            .json(&SynthesizeRequest {
                text,
                voice: &params.voice,
                exaggeration: params.exaggeration,
            })
            .send()
            .await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(SessionError::BackendUnavailable(format!(
                "synthesis error {}: {}",
                status, body
            )));
        }
        let bytes = res.bytes().await?;
        info!("🗣️ Synthesized {} bytes of audio", bytes.len());
        Ok(bytes.to_vec())
    }

    async fn health(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        match self.client.get(&url).send().await {
            Ok(res) if res.status().is_success() => res
                .json::<HealthResponse>()
                .await
                .map(|h| h.available)
                .unwrap_or(false),
            Ok(res) => {
                debug!("Synthesis health check returned {}", res.status());
                false
            }
            Err(e) => {
                debug!("Synthesis health check failed: {}", e);
                false
            }
        }
    }
}
