//! Ordered, non-blocking synthesis of a turn's fragments.
//!
//! Fragments are handed over with [`AudioAssembler::feed`] and synthesized
//! concurrently; results come back through [`AudioAssembler::next_ready`]
//! strictly in the order the fragments were fed, whatever order the backend
//! finishes them in. Every successful clip is also kept in its step's bucket
//! until [`AudioAssembler::finish_step`] joins the bucket into one clip.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::stream::{FuturesOrdered, StreamExt};
use parlance_types::VoiceOptions;

use crate::audio::concat_clips;
use crate::error::VoiceError;
use crate::tts::Synthesizer;

type Synthesis = BoxFuture<'static, (String, Result<Vec<u8>, VoiceError>)>;

/// A synthesized fragment ready to be sent to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyFragment {
    pub step_id: String,
    pub audio: Vec<u8>,
}

/// Per-turn synthesis queue and clip collector.
pub struct AudioAssembler {
    synthesizer: Arc<dyn Synthesizer>,
    voice: VoiceOptions,
    pending: FuturesOrdered<Synthesis>,
    clips: HashMap<String, Vec<Vec<u8>>>,
}

impl AudioAssembler {
    pub fn new(synthesizer: Arc<dyn Synthesizer>, voice: VoiceOptions) -> Self {
        Self {
            synthesizer,
            voice,
            pending: FuturesOrdered::new(),
            clips: HashMap::new(),
        }
    }

    pub fn voice(&self) -> &VoiceOptions {
        &self.voice
    }

    /// Queues `text` for synthesis on behalf of `step_id`. Returns
    /// immediately.
    pub fn feed(&mut self, step_id: &str, text: String) {
        let synthesizer = Arc::clone(&self.synthesizer);
        let voice = self.voice.clone();
        let step_id = step_id.to_string();
        self.pending.push_back(Box::pin(async move {
            let result = synthesizer.synthesize(&text, &voice).await;
            if let Err(e) = &result {
                tracing::warn!(step_id = %step_id, error = %e, "fragment synthesis failed");
            }
            (step_id, result)
        }));
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Waits for the next fragment in feed order.
    ///
    /// Failed fragments are skipped. Returns `None` once nothing is pending.
    /// Cancel safe: dropping the future loses no finished fragment.
    pub async fn next_ready(&mut self) -> Option<ReadyFragment> {
        while let Some((step_id, result)) = self.pending.next().await {
            match result {
                Ok(audio) if !audio.is_empty() => {
                    self.clips
                        .entry(step_id.clone())
                        .or_default()
                        .push(audio.clone());
                    return Some(ReadyFragment { step_id, audio });
                }
                Ok(_) => tracing::warn!(step_id = %step_id, "synthesis returned no audio"),
                Err(_) => {}
            }
        }
        None
    }

    /// Waits for every queued fragment.
    pub async fn drain(&mut self) -> Vec<ReadyFragment> {
        let mut ready = Vec::new();
        while let Some(fragment) = self.next_ready().await {
            ready.push(fragment);
        }
        ready
    }

    /// Joins the clips collected for `step_id` into one clip and forgets the
    /// step. Call after [`drain`](Self::drain) so no fragment is missing.
    pub fn finish_step(&mut self, step_id: &str) -> Option<Vec<u8>> {
        let clips = self.clips.remove(step_id)?;
        concat_clips(self.voice.encoding, &clips)
    }

    /// Drops everything buffered for the turn, including in-flight requests.
    pub fn discard(&mut self) {
        self.pending = FuturesOrdered::new();
        self.clips.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// Answers with the UTF-8 text itself, delayed by a per-text latency.
    struct EchoSynthesizer {
        latency: HashMap<String, Duration>,
        fail: Vec<String>,
    }

    #[async_trait::async_trait]
    impl Synthesizer for EchoSynthesizer {
        async fn synthesize(
            &self,
            text: &str,
            _voice: &VoiceOptions,
        ) -> Result<Vec<u8>, VoiceError> {
            if let Some(delay) = self.latency.get(text) {
                tokio::time::sleep(*delay).await;
            }
            if self.fail.iter().any(|f| f == text) {
                return Err(VoiceError::Tts("backend unavailable".to_string()));
            }
            Ok(text.as_bytes().to_vec())
        }
    }

    fn assembler(latency: &[(&str, u64)], fail: &[&str]) -> AudioAssembler {
        let synth = EchoSynthesizer {
            latency: latency
                .iter()
                .map(|(t, ms)| (t.to_string(), Duration::from_millis(*ms)))
                .collect(),
            fail: fail.iter().map(|f| f.to_string()).collect(),
        };
        AudioAssembler::new(Arc::new(synth), VoiceOptions::default())
    }

    #[tokio::test]
    async fn clip_preserves_emission_order_under_varying_latency() {
        let first = "你好，今天天气不错。";
        let second = "要不要我帮你查查附近的公园？";

        for (slow, fast) in [(80, 5), (5, 80), (30, 30)] {
            let mut asm = assembler(&[(first, slow), (second, fast)], &[]);
            asm.feed("step-1", first.to_string());
            asm.feed("step-1", second.to_string());

            let ready = asm.drain().await;
            let texts: Vec<_> = ready
                .iter()
                .map(|r| String::from_utf8(r.audio.clone()).expect("utf-8"))
                .collect();
            assert_eq!(texts, [first, second]);

            let clip = asm.finish_step("step-1").expect("clip");
            assert_eq!(String::from_utf8(clip).expect("utf-8"), format!("{first}{second}"));
        }
    }

    #[tokio::test]
    async fn failed_fragment_leaves_a_gap() {
        let mut asm = assembler(&[], &["broken。"]);
        asm.feed("s", "one。".to_string());
        asm.feed("s", "broken。".to_string());
        asm.feed("s", "three。".to_string());

        let ready = asm.drain().await;
        assert_eq!(ready.len(), 2);
        assert_eq!(asm.finish_step("s").expect("clip"), "one。three。".as_bytes());
    }

    #[tokio::test]
    async fn steps_keep_separate_buckets() {
        let mut asm = assembler(&[], &[]);
        asm.feed("a", "alpha".to_string());
        asm.feed("b", "beta".to_string());
        asm.feed("a", "gamma".to_string());
        asm.drain().await;

        assert_eq!(asm.finish_step("b").expect("clip"), b"beta");
        assert_eq!(asm.finish_step("a").expect("clip"), b"alphagamma");
        assert_eq!(asm.finish_step("a"), None);
    }

    #[tokio::test]
    async fn all_failures_yield_no_clip() {
        let mut asm = assembler(&[], &["x"]);
        asm.feed("s", "x".to_string());
        assert!(asm.drain().await.is_empty());
        assert_eq!(asm.finish_step("s"), None);
    }

    #[tokio::test]
    async fn discard_forgets_in_flight_work() {
        let mut asm = assembler(&[("slow", 1_000)], &[]);
        asm.feed("s", "slow".to_string());
        assert!(asm.has_pending());

        asm.discard();
        assert!(!asm.has_pending());
        assert_eq!(asm.next_ready().await, None);
        assert_eq!(asm.finish_step("s"), None);
    }
}
