//! JSON messages of the live BidiGenerateContent protocol.
//!
//! Client: one `setup` message, then `realtimeInput` media chunks.
//! Server: `setupComplete`, then `serverContent` carrying model turn parts,
//! transcriptions and the `interrupted` / `turnComplete` markers.

use crate::channel::{AudioPayload, InboundEvent, Speaker};
use crate::config::ResponseModality;
use crate::encoder::TransportChunk;
use crate::error::SessionResult;
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupMessage {
    pub setup: Setup,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<EmptyConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_transcription: Option<EmptyConfig>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Serialize)]
pub struct Content {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Serialize)]
pub struct TextPart {
    pub text: String,
}

/// Serializes as `{}`.
#[derive(Debug, Serialize, Default)]
pub struct EmptyConfig {}

/// Build the setup message for a session.
pub fn setup_message(
    model: &str,
    persona_instruction: &str,
    voice: &str,
    modality: ResponseModality,
    transcription: bool,
) -> SetupMessage {
    let model = if model.starts_with("models/") {
        model.to_string()
    } else {
        format!("models/{}", model)
    };
    let system_instruction = if persona_instruction.trim().is_empty() {
        None
    } else {
        Some(Content {
            parts: vec![TextPart {
                text: persona_instruction.to_string(),
            }],
        })
    };
    SetupMessage {
        setup: Setup {
            model,
            generation_config: GenerationConfig {
                response_modalities: vec![modality.as_wire().to_string()],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: voice.to_string(),
                        },
                    },
                },
            },
            system_instruction,
            input_audio_transcription: transcription.then(EmptyConfig::default),
            output_audio_transcription: transcription.then(EmptyConfig::default),
        },
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    /// base64
    pub data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInputMessage {
    pub realtime_input: RealtimeInput,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<Blob>,
}

/// Render one uplink chunk as a `realtimeInput` message.
pub fn realtime_input(chunk: &TransportChunk) -> SessionResult<String> {
    let message = RealtimeInputMessage {
        realtime_input: RealtimeInput {
            media_chunks: vec![Blob {
                mime_type: chunk.mime_type.clone(),
                data: general_purpose::STANDARD.encode(&chunk.data),
            }],
        },
    };
    Ok(serde_json::to_string(&message)?)
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
    #[serde(default)]
    pub go_away: Option<GoAway>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<ModelTurn>,
    #[serde(default)]
    pub turn_complete: bool,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub input_transcription: Option<Transcription>,
    #[serde(default)]
    pub output_transcription: Option<Transcription>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ModelTurn {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub inline_data: Option<Blob>,
}

#[derive(Debug, Deserialize, Default)]
pub struct Transcription {
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    #[serde(default)]
    pub time_left: Option<String>,
}

/// What one server message means for the session.
#[derive(Debug, Default)]
pub struct ParsedServerMessage {
    pub setup_complete: bool,
    /// Server announced it will close the connection soon.
    pub go_away: Option<String>,
    /// In the order the session must observe them.
    pub events: Vec<InboundEvent>,
}

/// Split a raw server message into ordered inbound events.
///
/// `interrupted` comes first (it cancels audio already scheduled), then the
/// user's transcription, the model parts in order, the model's transcription,
/// and finally `turnComplete`.
pub fn parse_server_message(raw: &str) -> SessionResult<ParsedServerMessage> {
    let msg: ServerMessage = serde_json::from_str(raw)?;
    let mut parsed = ParsedServerMessage {
        setup_complete: msg.setup_complete.is_some(),
        go_away: msg
            .go_away
            .map(|g| g.time_left.unwrap_or_else(|| "unknown".to_string())),
        events: Vec::new(),
    };

    let Some(content) = msg.server_content else {
        return Ok(parsed);
    };
    let events = &mut parsed.events;

    if content.interrupted {
        events.push(InboundEvent::Interrupted);
    }
    if let Some(text) = content.input_transcription.and_then(|t| t.text) {
        if !text.is_empty() {
            events.push(InboundEvent::Transcription {
                speaker: Speaker::User,
                text,
            });
        }
    }
    if let Some(turn) = content.model_turn {
        for part in turn.parts {
            if let Some(text) = part.text {
                if !text.is_empty() {
                    events.push(InboundEvent::TextPart(text));
                }
            }
            if let Some(blob) = part.inline_data {
                if blob.mime_type.starts_with("audio/") {
                    events.push(InboundEvent::AudioPart(AudioPayload::base64(
                        blob.mime_type,
                        blob.data,
                    )));
                }
            }
        }
    }
    if let Some(text) = content.output_transcription.and_then(|t| t.text) {
        if !text.is_empty() {
            events.push(InboundEvent::Transcription {
                speaker: Speaker::Model,
                text,
            });
        }
    }
    if content.turn_complete {
        events.push(InboundEvent::TurnComplete);
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_message_shape() {
        let msg = setup_message("gemini-live", "Be brief.", "Kore", ResponseModality::Audio, true);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["setup"]["model"], "models/gemini-live");
        assert_eq!(json["setup"]["generationConfig"]["responseModalities"][0], "AUDIO");
        assert_eq!(
            json["setup"]["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]
                ["voiceName"],
            "Kore"
        );
        assert_eq!(json["setup"]["systemInstruction"]["parts"][0]["text"], "Be brief.");
        assert!(json["setup"]["inputAudioTranscription"].is_object());
    }

    #[test]
    fn setup_omits_empty_persona_and_transcription() {
        let msg = setup_message("models/m", "  ", "Puck", ResponseModality::Audio, false);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["setup"]["model"], "models/m");
        assert!(json["setup"].get("systemInstruction").is_none());
        assert!(json["setup"].get("outputAudioTranscription").is_none());
    }

    #[test]
    fn realtime_input_is_base64() {
        let chunk = TransportChunk {
            mime_type: "audio/pcm;rate=16000".into(),
            data: vec![1, 2, 3],
        };
        let raw = realtime_input(&chunk).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        let blob = &json["realtimeInput"]["mediaChunks"][0];
        assert_eq!(blob["mimeType"], "audio/pcm;rate=16000");
        assert_eq!(blob["data"], "AQID");
    }

    #[test]
    fn server_content_preserves_part_order() {
        let raw = r#"{
            "serverContent": {
                "modelTurn": { "parts": [
                    { "text": "Hello" },
                    { "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": "AAA=" } },
                    { "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": "AQE=" } }
                ]},
                "outputTranscription": { "text": "Hello there" },
                "turnComplete": true
            }
        }"#;
        let parsed = parse_server_message(raw).unwrap();
        assert!(!parsed.setup_complete);
        assert_eq!(parsed.events.len(), 5);
        assert!(matches!(&parsed.events[0], InboundEvent::TextPart(t) if t == "Hello"));
        assert!(matches!(&parsed.events[1], InboundEvent::AudioPart(p) if p.mime_type == "audio/pcm;rate=24000"));
        assert!(matches!(&parsed.events[2], InboundEvent::AudioPart(_)));
        assert!(matches!(
            &parsed.events[3],
            InboundEvent::Transcription { speaker: Speaker::Model, .. }
        ));
        assert!(matches!(parsed.events[4], InboundEvent::TurnComplete));
    }

    #[test]
    fn interrupted_and_setup_complete() {
        let parsed = parse_server_message(r#"{"setupComplete": {}}"#).unwrap();
        assert!(parsed.setup_complete);
        assert!(parsed.events.is_empty());

        let parsed = parse_server_message(
            r#"{"serverContent": {"interrupted": true, "inputTranscription": {"text": "wait"}}}"#,
        )
        .unwrap();
        assert!(matches!(parsed.events[0], InboundEvent::Interrupted));
        assert!(matches!(
            &parsed.events[1],
            InboundEvent::Transcription { speaker: Speaker::User, text } if text == "wait"
        ));
    }

    #[test]
    fn unknown_fields_are_ignored_and_garbage_rejected() {
        let parsed = parse_server_message(r#"{"usageMetadata": {"totalTokenCount": 4}}"#).unwrap();
        assert!(parsed.events.is_empty());
        assert!(parse_server_message("not json").is_err());

        let parsed = parse_server_message(r#"{"goAway": {"timeLeft": "10s"}}"#).unwrap();
        assert_eq!(parsed.go_away.as_deref(), Some("10s"));
    }
}
