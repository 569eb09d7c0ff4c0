use parlance_types::AudioEncoding;
use serde::{Deserialize, Serialize};
use std::fmt;

fn default_tts_url() -> String {
    "https://openai.qiniu.com/v1/voice/tts".to_string()
}

fn default_timeout_seconds() -> u64 {
    30
}

/// Connection settings for the speech synthesis backend.
#[derive(Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    #[serde(default = "default_tts_url")]
    pub url: String,
    #[serde(default, skip_serializing)]
    pub api_key: String,
    /// Container format requested for every fragment.
    #[serde(default)]
    pub encoding: AudioEncoding,
    /// Per-request timeout in seconds. Default: 30.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            url: default_tts_url(),
            api_key: String::new(),
            encoding: AudioEncoding::default(),
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

impl fmt::Debug for TtsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TtsConfig")
            .field("url", &self.url)
            .field("api_key", &"[REDACTED]")
            .field("encoding", &self.encoding)
            .field("timeout_seconds", &self.timeout_seconds)
            .finish()
    }
}

impl TtsConfig {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: api_key.into(),
            ..Self::default()
        }
    }
}

fn default_asr_url() -> String {
    "https://openai.qiniu.com/v1/voice/asr".to_string()
}

/// Connection settings for the speech recognition backend.
#[derive(Clone, Serialize, Deserialize)]
pub struct AsrConfig {
    #[serde(default = "default_asr_url")]
    pub url: String,
    /// Falls back to the TTS key when empty.
    #[serde(default, skip_serializing)]
    pub api_key: String,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl Default for AsrConfig {
    fn default() -> Self {
        Self {
            url: default_asr_url(),
            api_key: String::new(),
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

impl fmt::Debug for AsrConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsrConfig")
            .field("url", &self.url)
            .field("api_key", &"[REDACTED]")
            .field("timeout_seconds", &self.timeout_seconds)
            .finish()
    }
}

impl AsrConfig {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: api_key.into(),
            ..Self::default()
        }
    }
}
