use thiserror::Error;

#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("TTS error: {0}")]
    Tts(String),

    #[error("ASR error: {0}")]
    Asr(String),

    #[error("voice backend request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("TTS returned undecodable audio: {0}")]
    Decode(#[from] base64::DecodeError),
}
