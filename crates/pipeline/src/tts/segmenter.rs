//! Sentence-level segmentation for TTS
//!
//! Splits streamed reply text into speakable segments. The first segment of a
//! reply may end at soft punctuation once it is long enough, so audio starts early;
//! later segments end at hard punctuation for better prosody.

/// Segmenter configuration
#[derive(Debug, Clone)]
pub struct SegmenterOptions {
    /// Minimum characters before a soft boundary can end the first segment
    pub first_min_chars: usize,
    /// Allow soft boundaries after the first segment
    pub soft_split_later: bool,
    /// Minimum characters before a soft boundary can end a later segment
    pub later_min_chars: usize,
    /// Force a cut once this many characters are buffered without a boundary
    pub max_chars: usize,
}

impl Default for SegmenterOptions {
    fn default() -> Self {
        Self {
            first_min_chars: 10,
            soft_split_later: false,
            later_min_chars: 60,
            max_chars: 200,
        }
    }
}

/// Incremental text segmenter for one reply at a time
#[derive(Debug, Clone)]
pub struct TextSegmenter {
    options: SegmenterOptions,
    /// Text not yet emitted
    buffer: String,
    /// First segment of the reply emitted?
    first_emitted: bool,
}

impl TextSegmenter {
    pub fn new(options: SegmenterOptions) -> Self {
        Self {
            options,
            buffer: String::new(),
            first_emitted: false,
        }
    }

    /// Add text; returns every segment completed by it
    pub fn push(&mut self, text: &str) -> Vec<String> {
        self.buffer.push_str(text);

        let mut segments = Vec::new();
        while let Some(end) = self.next_cut() {
            let raw: String = self.buffer.drain(..end).collect();
            if let Some(segment) = self.emit(&raw) {
                segments.push(segment);
            }
        }
        segments
    }

    /// End of reply: the remaining text as a final segment
    pub fn flush(&mut self) -> Option<String> {
        let raw = std::mem::take(&mut self.buffer);
        self.emit(&raw)
    }

    /// Start a new reply
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.first_emitted = false;
    }

    /// Buffered characters not yet emitted
    pub fn pending(&self) -> &str {
        &self.buffer
    }

    fn emit(&mut self, raw: &str) -> Option<String> {
        let segment = raw.trim();
        if segment.is_empty() {
            return None;
        }
        self.first_emitted = true;
        Some(segment.to_string())
    }

    /// Byte offset just past the next boundary, or a forced cut
    fn next_cut(&self) -> Option<usize> {
        let chars: Vec<(usize, char)> = self.buffer.char_indices().collect();
        let soft_min = if !self.first_emitted {
            Some(self.options.first_min_chars)
        } else if self.options.soft_split_later {
            Some(self.options.later_min_chars)
        } else {
            None
        };

        for (pos, &(offset, c)) in chars.iter().enumerate() {
            let prev = pos.checked_sub(1).map(|p| chars[p].1);
            let next = chars.get(pos + 1).map(|&(_, c)| c);
            let end = offset + c.len_utf8();

            if c == '.' {
                match period_boundary(prev, next) {
                    Boundary::Yes => return Some(end),
                    Boundary::NeedMore => return None,
                    Boundary::No => continue,
                }
            }

            if is_hard(c) {
                return Some(end);
            }

            if let Some(min) = soft_min {
                if is_soft(c) {
                    match numeric_separator(c, prev, next) {
                        Boundary::NeedMore => return None,
                        Boundary::No => continue,
                        Boundary::Yes => {}
                    }
                    if self.buffer[..end].trim().chars().count() >= min {
                        return Some(end);
                    }
                }
            }
        }

        self.forced_cut(&chars)
    }

    /// Cut an over-long buffer at the last whitespace before the cap
    fn forced_cut(&self, chars: &[(usize, char)]) -> Option<usize> {
        let max = self.options.max_chars.max(1);
        if chars.len() <= max {
            return None;
        }

        let cap = chars[max].0;
        match self.buffer[..cap].rfind(char::is_whitespace) {
            Some(ws) if !self.buffer[..ws].trim().is_empty() => Some(ws),
            _ => Some(cap),
        }
    }
}

impl Default for TextSegmenter {
    fn default() -> Self {
        Self::new(SegmenterOptions::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Boundary {
    Yes,
    No,
    NeedMore,
}

/// Hard sentence terminators other than `.`
fn is_hard(c: char) -> bool {
    matches!(c, '!' | '?' | ';' | '。' | '！' | '？' | '；' | '।' | '॥')
}

fn is_soft(c: char) -> bool {
    matches!(c, ',' | ':' | '\n' | '，' | '：' | '、')
}

fn is_ellipsis(c: char) -> bool {
    c == '.' || c == '…'
}

/// Decimal points and ellipses are not sentence ends
fn period_boundary(prev: Option<char>, next: Option<char>) -> Boundary {
    let Some(next) = next else {
        // "3." may become "3.5"; "wait." may become "wait..."
        return Boundary::NeedMore;
    };

    if is_ellipsis(next) {
        return Boundary::No;
    }
    if prev.map_or(false, |p| p.is_ascii_digit()) && next.is_ascii_digit() {
        return Boundary::No;
    }
    if prev.map_or(false, is_ellipsis) {
        // End of an ellipsis run splits only before whitespace
        return if next.is_whitespace() {
            Boundary::Yes
        } else {
            Boundary::No
        };
    }
    Boundary::Yes
}

/// "1,000" and "10:30" are not clause breaks
fn numeric_separator(c: char, prev: Option<char>, next: Option<char>) -> Boundary {
    if c != ',' && c != ':' {
        return Boundary::Yes;
    }
    if !prev.map_or(false, |p| p.is_ascii_digit()) {
        return Boundary::Yes;
    }
    match next {
        None => Boundary::NeedMore,
        Some(n) if n.is_ascii_digit() => Boundary::No,
        Some(_) => Boundary::Yes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segmenter(first_min_chars: usize) -> TextSegmenter {
        TextSegmenter::new(SegmenterOptions {
            first_min_chars,
            ..Default::default()
        })
    }

    fn segment_all(seg: &mut TextSegmenter, text: &str) -> Vec<String> {
        let mut out = seg.push(text);
        out.extend(seg.flush());
        out
    }

    #[test]
    fn test_hard_boundary_before_qualifying_soft() {
        let mut seg = segmenter(12);
        assert_eq!(
            segment_all(&mut seg, "Hello, world. How are you?"),
            vec!["Hello, world.", "How are you?"]
        );
    }

    #[test]
    fn test_soft_boundary_wins_when_earlier() {
        let mut seg = segmenter(5);
        assert_eq!(
            segment_all(&mut seg, "Hello, world. How are you?"),
            vec!["Hello,", "world.", "How are you?"]
        );
    }

    #[test]
    fn test_soft_split_only_for_first_segment() {
        let mut seg = segmenter(5);
        let out = segment_all(&mut seg, "Sure thing, I can help. First, open the app, then sign in.");
        assert_eq!(
            out,
            vec!["Sure thing,", "I can help.", "First, open the app, then sign in."]
        );
    }

    #[test]
    fn test_soft_split_later_when_enabled() {
        let mut seg = TextSegmenter::new(SegmenterOptions {
            first_min_chars: 100,
            soft_split_later: true,
            later_min_chars: 5,
            max_chars: 200,
        });
        let out = segment_all(&mut seg, "Okay. First step, then more");
        assert_eq!(out, vec!["Okay.", "First step,", "then more"]);
    }

    #[test]
    fn test_streaming_tokens() {
        let mut seg = segmenter(100);
        let mut out = Vec::new();
        for token in ["The price", " is 3", ".", "5 dollars", ". Anything", " else?"] {
            out.extend(seg.push(token));
        }
        assert_eq!(out, vec!["The price is 3.5 dollars.", "Anything else?"]);
        assert!(seg.flush().is_none());
    }

    #[test]
    fn test_trailing_period_waits_for_lookahead() {
        let mut seg = segmenter(100);
        assert!(seg.push("Please wait.").is_empty());
        assert!(seg.push("..").is_empty());
        assert_eq!(seg.push(" Done"), vec!["Please wait..."]);
        assert_eq!(seg.flush().as_deref(), Some("Done"));
    }

    #[test]
    fn test_ellipsis_inside_word_run() {
        let mut seg = segmenter(100);
        assert_eq!(segment_all(&mut seg, "So...yeah. Ok"), vec!["So...yeah.", "Ok"]);
        seg.reset();
        assert_eq!(segment_all(&mut seg, "Hmm… let me see."), vec!["Hmm… let me see."]);
    }

    #[test]
    fn test_numbers_are_not_boundaries() {
        let mut seg = segmenter(3);
        assert_eq!(
            segment_all(&mut seg, "It costs 1,000 at 10:30 today"),
            vec!["It costs 1,000 at 10:30 today"]
        );
    }

    #[test]
    fn test_locale_punctuation() {
        let mut seg = segmenter(100);
        assert_eq!(segment_all(&mut seg, "你好。今天好吗？"), vec!["你好。", "今天好吗？"]);

        let mut seg = segmenter(2);
        assert_eq!(segment_all(&mut seg, "好的，我们走"), vec!["好的，", "我们走"]);

        let mut seg = segmenter(100);
        assert_eq!(segment_all(&mut seg, "नमस्ते। कैसे हो"), vec!["नमस्ते।", "कैसे हो"]);
    }

    #[test]
    fn test_forced_cut_at_whitespace() {
        let mut seg = TextSegmenter::new(SegmenterOptions {
            max_chars: 12,
            ..Default::default()
        });
        let out = seg.push("one two three four five");
        assert_eq!(out, vec!["one two", "three four"]);
        assert_eq!(seg.flush().as_deref(), Some("five"));
    }

    #[test]
    fn test_forced_cut_without_whitespace() {
        let mut seg = TextSegmenter::new(SegmenterOptions {
            max_chars: 5,
            ..Default::default()
        });
        assert_eq!(seg.push("abcdefghijk"), vec!["abcde", "fghij"]);
        assert_eq!(seg.flush().as_deref(), Some("k"));
    }

    #[test]
    fn test_empty_segments_dropped() {
        let mut seg = segmenter(1);
        assert_eq!(seg.push("Hi.   "), vec!["Hi."]);
        assert!(seg.push("   ").is_empty());
        assert!(seg.flush().is_none());
    }

    #[test]
    fn test_reset_restores_first_segment_rules() {
        let mut seg = segmenter(5);
        assert_eq!(seg.push("Hello, "), vec!["Hello,"]);
        assert!(seg.push("again, ").is_empty());
        seg.reset();
        assert_eq!(seg.push("Hello, "), vec!["Hello,"]);
    }
}
