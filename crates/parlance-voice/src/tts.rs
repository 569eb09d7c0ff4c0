use std::time::Duration;

use base64::Engine;
use parlance_types::VoiceOptions;
use serde::{Deserialize, Serialize};

use crate::config::TtsConfig;
use crate::error::VoiceError;

/// Maximum text input size for TTS (64 KiB). Prevents resource exhaustion from
/// oversized synthesis requests.
const MAX_TTS_INPUT_BYTES: usize = 64 * 1024;

/// Turns text into encoded audio.
///
/// Every call is independent; a failure affects only its own fragment.
#[async_trait::async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, voice: &VoiceOptions) -> Result<Vec<u8>, VoiceError>;
}

#[derive(Serialize)]
struct TtsRequest<'a> {
    audio: TtsAudio<'a>,
    request: TtsText<'a>,
}

#[derive(Serialize)]
struct TtsAudio<'a> {
    voice_type: &'a str,
    encoding: &'a str,
    speed_ratio: f32,
}

#[derive(Serialize)]
struct TtsText<'a> {
    text: &'a str,
}

/// The backend answers with base64 audio under either key.
#[derive(Deserialize)]
struct TtsResponse {
    #[serde(default)]
    audio: Option<String>,
    #[serde(default)]
    data: Option<String>,
}

/// JSON-over-HTTP synthesis backend.
#[derive(Debug, Clone)]
pub struct HttpSynthesizer {
    client: reqwest::Client,
    config: TtsConfig,
}

impl HttpSynthesizer {
    pub fn new(config: TtsConfig) -> Result<Self, VoiceError> {
        if config.url.is_empty() {
            return Err(VoiceError::Config("TTS url must not be empty".to_string()));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;
        Ok(Self { client, config })
    }
}

#[async_trait::async_trait]
impl Synthesizer for HttpSynthesizer {
    async fn synthesize(&self, text: &str, voice: &VoiceOptions) -> Result<Vec<u8>, VoiceError> {
        if text.trim().is_empty() {
            return Err(VoiceError::Tts("nothing to synthesize".to_string()));
        }
        if text.len() > MAX_TTS_INPUT_BYTES {
            return Err(VoiceError::Tts(format!(
                "text exceeds maximum size: {} bytes (limit: {} bytes)",
                text.len(),
                MAX_TTS_INPUT_BYTES
            )));
        }
        if voice.speed_ratio < 0.1 || voice.speed_ratio > 10.0 {
            return Err(VoiceError::Config(
                "Speed must be between 0.1 and 10.0".to_string(),
            ));
        }

        let body = TtsRequest {
            audio: TtsAudio {
                voice_type: &voice.voice_type,
                encoding: voice.encoding.extension(),
                speed_ratio: voice.speed_ratio,
            },
            request: TtsText { text },
        };

        let response = self
            .client
            .post(&self.config.url)
            .header(reqwest::header::AUTHORIZATION, &self.config.api_key)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;

        let payload: TtsResponse = response.json().await?;
        let encoded = payload
            .audio
            .or(payload.data)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| VoiceError::Tts("response carried no audio".to_string()))?;

        let bytes = base64::engine::general_purpose::STANDARD.decode(encoded)?;
        tracing::debug!(chars = text.chars().count(), bytes = bytes.len(), "fragment synthesized");
        Ok(bytes)
    }
}
