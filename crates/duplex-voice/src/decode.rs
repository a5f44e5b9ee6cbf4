//! Turning inbound payloads into playable samples.

use crate::channel::AudioPayload;
use crate::error::{SessionError, SessionResult};
use rodio::Source;
use std::io::Cursor;
use std::time::Duration;

/// Rate assumed for raw PCM when the mime type does not carry one.
pub const DEFAULT_PCM_RATE: u32 = 24000;

/// Mono f32 samples ready for the output timeline.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl DecodedAudio {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self { samples, sample_rate }
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.duration_secs())
    }

    /// Resample to `rate` if needed.
    pub fn into_rate(self, rate: u32) -> Self {
        if self.sample_rate == rate || rate == 0 {
            return self;
        }
        Self {
            samples: resample_linear(&self.samples, self.sample_rate, rate),
            sample_rate: rate,
        }
    }
}

/// Decodes a downlink payload. Implementations must be pure: same payload,
/// same samples.
pub trait PayloadDecoder: Send + Sync {
    fn decode(&self, payload: AudioPayload) -> SessionResult<DecodedAudio>;
}

/// Raw 16-bit little-endian PCM (`audio/pcm;rate=N`), with a container
/// fallback for anything else (WAV, MP3, ...).
#[derive(Debug, Default, Clone)]
pub struct Pcm16Decoder;

impl PayloadDecoder for Pcm16Decoder {
    fn decode(&self, payload: AudioPayload) -> SessionResult<DecodedAudio> {
        let mime = payload.mime_type.clone();
        let bytes = payload.into_bytes()?;
        if is_raw_pcm(&mime) {
            let rate = parse_rate(&mime).unwrap_or(DEFAULT_PCM_RATE);
            Ok(DecodedAudio::new(pcm16_le_to_f32(&bytes)?, rate))
        } else {
            decode_encoded_audio(bytes)
        }
    }
}

fn is_raw_pcm(mime: &str) -> bool {
    let base = mime.split(';').next().unwrap_or_default().trim();
    base.eq_ignore_ascii_case("audio/pcm") || base.eq_ignore_ascii_case("audio/l16")
}

/// `audio/pcm;rate=24000` -> 24000
pub fn parse_rate(mime: &str) -> Option<u32> {
    mime.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if key.trim().eq_ignore_ascii_case("rate") {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}

pub fn pcm16_le_to_f32(bytes: &[u8]) -> SessionResult<Vec<f32>> {
    if bytes.is_empty() {
        return Err(SessionError::Decode("empty PCM payload".to_string()));
    }
    if bytes.len() % 2 != 0 {
        return Err(SessionError::Decode(format!(
            "PCM16 payload has odd length {}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]) as f32 / 32768.0)
        .collect())
}

/// Decode a container format (WAV, MP3, ...) and down-mix to mono.
pub fn decode_encoded_audio(bytes: Vec<u8>) -> SessionResult<DecodedAudio> {
    if bytes.is_empty() {
        return Err(SessionError::Decode("empty audio payload".to_string()));
    }
    let decoder = rodio::Decoder::new(Cursor::new(bytes))
        .map_err(|e| SessionError::Decode(format!("Decode failed: {}", e)))?;
    let channels = decoder.channels().max(1) as usize;
    let sample_rate = decoder.sample_rate();
    let interleaved: Vec<f32> = decoder.convert_samples::<f32>().collect();
    let samples = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks_exact(channels)
            .map(|c| c.iter().sum::<f32>() / channels as f32)
            .collect()
    };
    if samples.is_empty() {
        return Err(SessionError::Decode("audio payload contains no samples".to_string()));
    }
    Ok(DecodedAudio::new(samples, sample_rate))
}

/// Linear-interpolating resampler.
pub fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if samples.is_empty() || from_rate == 0 || to_rate == 0 || from_rate == to_rate {
        return samples.to_vec();
    }
    let out_len = (samples.len() as u64 * to_rate as u64 / from_rate as u64) as usize;
    let step = from_rate as f64 / to_rate as f64;
    let last = samples.len() - 1;
    (0..out_len)
        .map(|i| {
            let pos = i as f64 * step;
            let idx = pos as usize;
            if idx >= last {
                return samples[last];
            }
            let frac = (pos - idx as f64) as f32;
            samples[idx] * (1.0 - frac) + samples[idx + 1] * frac
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcm_payload_decodes_with_rate() {
        // 0, 16384, -32768
        let payload = AudioPayload::bytes("audio/pcm;rate=24000", vec![0, 0, 0, 0x40, 0, 0x80]);
        let audio = Pcm16Decoder.decode(payload).unwrap();
        assert_eq!(audio.sample_rate, 24000);
        assert_eq!(audio.samples, vec![0.0, 0.5, -1.0]);
    }

    #[test]
    fn base64_pcm_duration() {
        // 12000 zero samples at 24 kHz = 0.5 s
        use base64::{engine::general_purpose, Engine as _};
        let data = general_purpose::STANDARD.encode(vec![0u8; 24000]);
        let audio = Pcm16Decoder
            .decode(AudioPayload::base64("audio/pcm;rate=24000", data))
            .unwrap();
        assert!((audio.duration_secs() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn malformed_payloads_are_decode_errors() {
        let odd = AudioPayload::bytes("audio/pcm;rate=24000", vec![1, 2, 3]);
        assert!(matches!(Pcm16Decoder.decode(odd), Err(SessionError::Decode(_))));
        let empty = AudioPayload::bytes("audio/pcm", Vec::new());
        assert!(matches!(Pcm16Decoder.decode(empty), Err(SessionError::Decode(_))));
        let junk = AudioPayload::bytes("audio/mpeg", vec![0x12; 64]);
        assert!(matches!(Pcm16Decoder.decode(junk), Err(SessionError::Decode(_))));
    }

    #[test]
    fn rate_parsing() {
        assert_eq!(parse_rate("audio/pcm;rate=16000"), Some(16000));
        assert_eq!(parse_rate("audio/pcm; rate = 8000"), Some(8000));
        assert_eq!(parse_rate("audio/pcm"), None);
        assert_eq!(parse_rate("audio/pcm;rate=abc"), None);
    }

    #[test]
    fn resampling_preserves_duration() {
        let input = vec![0.25f32; 16000];
        let out = resample_linear(&input, 16000, 24000);
        assert_eq!(out.len(), 24000);
        assert!(out.iter().all(|s| (s - 0.25).abs() < 1e-6));

        let audio = DecodedAudio::new(vec![0.0; 8000], 16000).into_rate(24000);
        assert_eq!(audio.sample_rate, 24000);
        assert!((audio.duration_secs() - 0.5).abs() < 1e-6);
    }
}
