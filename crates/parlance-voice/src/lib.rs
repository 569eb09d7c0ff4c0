//! Speech side channel of a streaming turn.
//!
//! Token deltas are cut into synthesis-sized fragments by the
//! [`SentenceSegmenter`], each fragment is spoken through a [`Synthesizer`],
//! and the [`AudioAssembler`] hands the resulting clips back in the order the
//! fragments were produced, collecting them per step so a finished message can
//! be stored as one clip.
//!
//! Synthesis is best effort. A failed fragment leaves a gap in the audio and
//! never interrupts the text stream.
//!
//! The [`Recognizer`] covers the opposite direction: spoken user input is
//! transcribed before its turn starts.

pub mod asr;
pub mod assembler;
pub mod audio;
pub mod config;
pub mod error;
pub mod prompts;
pub mod segmenter;
pub mod tts;

pub use asr::{HttpRecognizer, Recognizer};
pub use assembler::{AudioAssembler, ReadyFragment};
pub use audio::concat_clips;
pub use config::{AsrConfig, TtsConfig};
pub use error::VoiceError;
pub use prompts::ToolPrompts;
pub use segmenter::{SegmenterConfig, SentenceSegmenter};
pub use tts::{HttpSynthesizer, Synthesizer};
