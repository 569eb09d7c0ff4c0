//! Voice options for speech synthesis.
//!
//! A `VoiceOptions` value is derived from the assistant bound to a session
//! and travels with every synthesis call of a turn.

use serde::{Deserialize, Serialize};

/// Container format returned by the synthesis backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioEncoding {
    /// MPEG-1 Layer III frames. Fragments concatenate without re-muxing.
    #[default]
    Mp3,
    /// RIFF/WAVE with a 44-byte canonical header.
    Wav,
}

impl AudioEncoding {
    /// File extension used for stored clips.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Mp3 => "mp3",
            Self::Wav => "wav",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Mp3 => "audio/mpeg",
            Self::Wav => "audio/wav",
        }
    }
}

/// Per-turn synthesis parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceOptions {
    /// Backend voice identifier.
    pub voice_type: String,
    #[serde(default)]
    pub encoding: AudioEncoding,
    /// Speech speed multiplier (1.0 is normal).
    #[serde(default = "default_speed_ratio")]
    pub speed_ratio: f32,
}

fn default_speed_ratio() -> f32 {
    1.0
}

impl Default for VoiceOptions {
    fn default() -> Self {
        Self {
            voice_type: "qiniu_zh_female_wwxkjx".to_string(),
            encoding: AudioEncoding::Mp3,
            speed_ratio: default_speed_ratio(),
        }
    }
}
