use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::AsrConfig;
use crate::error::VoiceError;

/// Turns a stored recording into text.
#[async_trait::async_trait]
pub trait Recognizer: Send + Sync {
    /// Transcribes the clip reachable at `audio_url`. `format` names its
    /// container, e.g. `webm` or `mp3`.
    async fn transcribe(&self, audio_url: &str, format: &str) -> Result<String, VoiceError>;
}

#[derive(Serialize)]
struct AsrRequest<'a> {
    model: &'a str,
    audio: AsrAudio<'a>,
}

#[derive(Serialize)]
struct AsrAudio<'a> {
    format: &'a str,
    url: &'a str,
}

#[derive(Deserialize)]
struct AsrResponse {
    #[serde(default)]
    data: Option<AsrData>,
}

#[derive(Deserialize)]
struct AsrData {
    #[serde(default)]
    result: Option<AsrResult>,
}

#[derive(Deserialize)]
struct AsrResult {
    #[serde(default)]
    text: Option<String>,
}

/// JSON-over-HTTP recognition backend. The backend fetches the clip itself,
/// so `audio_url` must be reachable from it.
#[derive(Debug, Clone)]
pub struct HttpRecognizer {
    client: reqwest::Client,
    config: AsrConfig,
}

impl HttpRecognizer {
    pub fn new(config: AsrConfig) -> Result<Self, VoiceError> {
        if config.url.is_empty() {
            return Err(VoiceError::Config("ASR url must not be empty".to_string()));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;
        Ok(Self { client, config })
    }
}

#[async_trait::async_trait]
impl Recognizer for HttpRecognizer {
    async fn transcribe(&self, audio_url: &str, format: &str) -> Result<String, VoiceError> {
        let body = AsrRequest {
            model: "asr",
            audio: AsrAudio {
                format,
                url: audio_url,
            },
        };

        let response = self
            .client
            .post(&self.config.url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;

        let payload: AsrResponse = response.json().await?;
        let text = payload
            .data
            .and_then(|d| d.result)
            .and_then(|r| r.text)
            .ok_or_else(|| VoiceError::Asr("response carried no transcript".to_string()))?;

        tracing::debug!(format, chars = text.chars().count(), "clip transcribed");
        Ok(text)
    }
}
