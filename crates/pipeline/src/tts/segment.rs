//! Sentence segmentation for streaming synthesis.
//!
//! LLM tokens arrive in fragments; sending each fragment to the synthesizer
//! ruins prosody, while waiting for the full reply ruins latency. The
//! segmenter buffers incoming text and emits chunks at sentence boundaries
//! within a [min, max] character envelope, never splitting inside a word.

use unicode_segmentation::UnicodeSegmentation;

/// Segmenter configuration.
#[derive(Debug, Clone)]
pub struct SegmenterConfig {
    /// Do not emit before this many characters unless the text ends.
    pub min_chars: usize,
    /// Force a split at a word boundary once the buffer exceeds this.
    pub max_chars: usize,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            min_chars: 80,
            max_chars: 220,
        }
    }
}

/// Buffers text fragments and yields synthesis-sized segments.
pub struct SentenceSegmenter {
    config: SegmenterConfig,
    buffer: String,
}

impl SentenceSegmenter {
    pub fn new(config: SegmenterConfig) -> Self {
        Self {
            config,
            buffer: String::new(),
        }
    }

    /// Add a text fragment, returning any segments that became ready.
    pub fn push(&mut self, text: &str) -> Vec<String> {
        self.buffer.push_str(text);
        let mut out = Vec::new();
        while let Some(segment) = self.next_segment() {
            out.push(segment);
        }
        out
    }

    /// Emit whatever remains, trimmed. Call at end of input.
    pub fn flush(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let rest = rest.trim();
        if rest.is_empty() {
            None
        } else {
            Some(rest.to_string())
        }
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    fn next_segment(&mut self) -> Option<String> {
        let chars = self.buffer.chars().count();
        if chars < self.config.min_chars {
            return None;
        }

        // Prefer the first sentence end at or after min_chars.
        if let Some(end) = self.sentence_end_after(self.config.min_chars) {
            return Some(self.take_prefix(end));
        }

        // No sentence boundary in reach: once past max, cut at the last word
        // boundary inside the envelope.
        if chars > self.config.max_chars {
            if let Some(end) = self.word_boundary_before(self.config.max_chars) {
                return Some(self.take_prefix(end));
            }
        }

        None
    }

    /// Byte offset one past the first sentence terminator whose char index
    /// is >= `min_chars` and which ends a sentence (followed by whitespace
    /// or end of buffer).
    fn sentence_end_after(&self, min_chars: usize) -> Option<usize> {
        let mut iter = self.buffer.char_indices().enumerate().peekable();
        while let Some((char_idx, (byte_idx, c))) = iter.next() {
            if !matches!(c, '.' | '!' | '?' | '\n' | '…') {
                continue;
            }
            if char_idx + 1 < min_chars {
                continue;
            }
            let next = iter.peek().map(|&(_, (_, n))| n);
            if next.map_or(true, |n| n.is_whitespace()) {
                return Some(byte_idx + c.len_utf8());
            }
        }
        None
    }

    /// Byte offset of the last word boundary at or before `max_chars` chars.
    fn word_boundary_before(&self, max_chars: usize) -> Option<usize> {
        let byte_limit = self
            .buffer
            .char_indices()
            .nth(max_chars)
            .map(|(b, _)| b)
            .unwrap_or(self.buffer.len());

        self.buffer
            .split_word_bound_indices()
            .map(|(b, _)| b)
            .take_while(|&b| b <= byte_limit)
            .filter(|&b| b > 0)
            .last()
    }

    fn take_prefix(&mut self, byte_end: usize) -> String {
        let rest = self.buffer.split_off(byte_end);
        let segment = std::mem::replace(&mut self.buffer, rest);
        self.buffer = self.buffer.trim_start().to_string();
        segment.trim().to_string()
    }
}
