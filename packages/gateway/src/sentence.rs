//! Sentence-bounded coalescing of incremental text.
//!
//! Upstream text arrives token by token; forwarding every fragment makes a
//! rendered chat bubble flicker. Fragments are held until the buffer is long
//! enough and ends a sentence, or until the stream goes idle.

use std::time::{Duration, Instant};

/// Minimum buffered characters before a boundary flush is considered.
pub const FLUSH_THRESHOLD_CHARS: usize = 80;

/// A non-empty buffer that has not flushed for this long is force-flushed.
pub const IDLE_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

const CJK_BOUNDARIES: [char; 4] = ['。', '？', '．', '\n'];
const LATIN_BOUNDARIES: [char; 2] = ['.', '\n'];

#[derive(Debug)]
pub struct SentenceBoundaryBuffer {
    buffer: String,
    last_flush: Instant,
}

impl Default for SentenceBoundaryBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl SentenceBoundaryBuffer {
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
            last_flush: Instant::now(),
        }
    }

    /// Appends a fragment and flushes up to and including the last sentence
    /// boundary, but only once the buffer holds at least
    /// [`FLUSH_THRESHOLD_CHARS`] characters. The whole buffer is scanned, not
    /// just the new fragment, so a boundary established earlier still counts.
    pub fn push(&mut self, fragment: &str) -> Option<String> {
        self.buffer.push_str(fragment);
        if self.buffer.chars().count() < FLUSH_THRESHOLD_CHARS {
            return None;
        }

        let boundaries = self.boundary_set();
        let split_at = self
            .buffer
            .char_indices()
            .filter(|(_, c)| boundaries.contains(c))
            .map(|(i, c)| i + c.len_utf8())
            .last()?;

        let remainder = self.buffer.split_off(split_at);
        let flushed = std::mem::replace(&mut self.buffer, remainder);
        self.last_flush = Instant::now();
        Some(flushed)
    }

    /// Drains everything regardless of length or punctuation. Used at stream
    /// end and on idle timeout.
    pub fn force_flush(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        self.last_flush = Instant::now();
        Some(std::mem::take(&mut self.buffer))
    }

    /// True when a non-empty buffer has gone `timeout` without flushing.
    pub fn idle_expired(&self, timeout: Duration) -> bool {
        !self.buffer.is_empty() && self.last_flush.elapsed() >= timeout
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    // Latin periods are common mid-sentence in CJK text (version strings,
    // URLs), so when the buffer is dominated by CJK script only full-width
    // terminators count.
    fn boundary_set(&self) -> &'static [char] {
        if self.buffer.chars().any(is_cjk) {
            &CJK_BOUNDARIES
        } else {
            &LATIN_BOUNDARIES
        }
    }
}

fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{3040}'..='\u{309F}'   // hiragana
        | '\u{30A0}'..='\u{30FF}' // katakana
        | '\u{4E00}'..='\u{9FAF}' // unified ideographs
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn holds_below_threshold() {
        let mut buffer = SentenceBoundaryBuffer::new();
        assert_eq!(buffer.push("短い文です。"), None);
        assert!(!buffer.is_empty());
    }

    #[test]
    fn cjk_flush_at_full_width_period_once_threshold_met() {
        let mut buffer = SentenceBoundaryBuffer::new();
        let text: String = "あ".repeat(78) + "。次の文です";

        // Fed one character at a time: exactly one boundary flush happens,
        // at the 80th character, covering everything through the 。.
        let mut flushes = Vec::new();
        for c in text.chars() {
            if let Some(flushed) = buffer.push(&c.to_string()) {
                flushes.push(flushed);
            }
        }
        assert_eq!(flushes.len(), 1);
        assert_eq!(flushes[0], "あ".repeat(78) + "。");

        // The dangling tail only comes out on the forced end-of-stream flush.
        assert_eq!(buffer.force_flush().as_deref(), Some("次の文です"));
        assert!(buffer.is_empty());
        assert_eq!(buffer.force_flush(), None);
    }

    #[test]
    fn latin_period_ignored_when_cjk_present() {
        let mut buffer = SentenceBoundaryBuffer::new();
        let text = "バージョン1.2.3を使います".repeat(8);
        let mut flushed = false;
        for c in text.chars() {
            flushed |= buffer.push(&c.to_string()).is_some();
        }
        // Plenty of Latin periods, no full-width terminator: nothing flushes.
        assert!(!flushed);
        assert!(buffer.force_flush().is_some());
    }

    #[test]
    fn latin_text_flushes_on_period() {
        let mut buffer = SentenceBoundaryBuffer::new();
        let sentence = "This is a reasonably long English sentence used as filler text here. ";
        let flushed = buffer
            .push(&sentence.repeat(2))
            .expect("threshold and boundary are both met");
        assert!(flushed.ends_with('.'));
        // Trailing space after the final period stays buffered.
        assert!(!buffer.is_empty());
    }

    #[test]
    fn newline_counts_as_boundary() {
        let mut buffer = SentenceBoundaryBuffer::new();
        let text = "x".repeat(79) + "\n" + "tail";
        let flushed = buffer.push(&text).unwrap();
        assert_eq!(flushed, "x".repeat(79) + "\n");
        assert_eq!(buffer.force_flush().as_deref(), Some("tail"));
    }

    #[test]
    fn no_characters_are_lost_across_flushes() {
        let mut buffer = SentenceBoundaryBuffer::new();
        let input = "これはテストです。次の文です。".repeat(10);
        let mut output = String::new();
        for c in input.chars() {
            if let Some(flushed) = buffer.push(&c.to_string()) {
                output.push_str(&flushed);
            }
        }
        if let Some(flushed) = buffer.force_flush() {
            output.push_str(&flushed);
        }
        assert_eq!(output, input);
    }

    #[test]
    fn idle_expiry_requires_content() {
        let buffer = SentenceBoundaryBuffer::new();
        assert!(!buffer.idle_expired(Duration::ZERO));

        let mut buffer = SentenceBoundaryBuffer::new();
        let _ = buffer.push("pending");
        assert!(buffer.idle_expired(Duration::ZERO));
        assert!(!buffer.idle_expired(Duration::from_secs(60)));
    }
}
