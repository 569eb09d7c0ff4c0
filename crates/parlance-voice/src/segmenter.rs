//! Sentence segmentation of streamed text.
//!
//! Synthesis latency is dominated by the first fragment, so fragments should
//! be short, but a fragment that stops mid-clause sounds broken. The
//! segmenter buffers deltas until the buffer is long enough, holds at least
//! one punctuation mark, and either closes a sentence or has grown past the
//! soft cap without sitting on a comma-class mark.

/// Marks that close a sentence.
const TERMINAL_MARKS: &[char] = &['。', '？', '！', '!', '?', '\n'];

/// Marks that only pause a clause. A fragment never ends on one of these
/// unless it is the final remainder.
const SOFT_MARKS: &[char] = &['，', ',', '、', '；', ';', '：', ':', '.', '…'];

/// Length thresholds in characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmenterConfig {
    pub min_len: usize,
    pub max_len: usize,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            min_len: 10,
            max_len: 40,
        }
    }
}

fn is_terminal(c: char) -> bool {
    TERMINAL_MARKS.contains(&c)
}

fn is_soft(c: char) -> bool {
    SOFT_MARKS.contains(&c)
}

fn is_punctuation(c: char) -> bool {
    is_terminal(c) || is_soft(c)
}

/// Buffers token deltas and releases synthesis-ready fragments.
#[derive(Debug, Clone, Default)]
pub struct SentenceSegmenter {
    config: SegmenterConfig,
    buffer: String,
    len: usize,
}

impl SentenceSegmenter {
    pub fn new(config: SegmenterConfig) -> Self {
        Self {
            config,
            buffer: String::new(),
            len: 0,
        }
    }

    /// Appends `delta` and returns the buffered fragment if it is ready.
    pub fn feed(&mut self, delta: &str) -> Option<String> {
        if delta.is_empty() {
            return None;
        }
        self.buffer.push_str(delta);
        self.len += delta.chars().count();

        if self.ready() {
            self.len = 0;
            Some(std::mem::take(&mut self.buffer))
        } else {
            None
        }
    }

    /// Returns whatever is buffered and resets the segmenter.
    pub fn finish(&mut self) -> Option<String> {
        self.len = 0;
        let rest = std::mem::take(&mut self.buffer);
        if rest.trim().is_empty() {
            None
        } else {
            Some(rest)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    fn ready(&self) -> bool {
        if self.len < self.config.min_len || !self.buffer.chars().any(is_punctuation) {
            return false;
        }
        // A trailing newline is itself terminal.
        if self.buffer.ends_with('\n') {
            return true;
        }
        match self.buffer.trim_end().chars().next_back() {
            Some(last) if is_terminal(last) => true,
            Some(last) if is_soft(last) => false,
            _ => self.len >= self.config.max_len,
        }
    }
}
