/// Punctuation that may close a spoken sentence.
const TERMINATORS: &[char] = &['。', '！', '？', '.', '!', '?', '；', ';', '\n'];

/// A terminator only closes the sentence once the buffer has this much
/// non-whitespace text (UTF-8 bytes), so stray leading dots keep buffering.
const MIN_SENTENCE_BYTES: usize = 4;

/// Splits a live token stream into complete sentences as soon as a terminal
/// punctuation lands, so synthesis of sentence N starts while the LLM is
/// still generating sentence N+1.
///
/// Append-only and prefix-monotone: feeding a longer prefix of the same
/// stream never changes sentences already emitted. One instance per turn.
#[derive(Default)]
pub struct SentenceSegmenter {
    pending: String,
    visible_bytes: usize,
}

impl SentenceSegmenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a token and returns any sentences completed by it.
    pub fn push(&mut self, delta: &str) -> Vec<String> {
        let mut sentences = Vec::new();
        for ch in delta.chars() {
            self.pending.push(ch);
            if !ch.is_whitespace() {
                self.visible_bytes += ch.len_utf8();
            }
            if TERMINATORS.contains(&ch) && self.visible_bytes >= MIN_SENTENCE_BYTES {
                sentences.push(std::mem::take(&mut self.pending));
                self.visible_bytes = 0;
            }
        }
        sentences
    }

    /// Drains the unterminated residual at end of stream.
    pub fn flush(&mut self) -> Option<String> {
        self.visible_bytes = 0;
        let rest = std::mem::take(&mut self.pending);
        let rest = rest.trim();
        if rest.is_empty() {
            None
        } else {
            Some(rest.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment_all(deltas: &[&str]) -> Vec<String> {
        let mut seg = SentenceSegmenter::new();
        let mut out = Vec::new();
        for d in deltas {
            out.extend(seg.push(d));
        }
        out.extend(seg.flush());
        out
    }

    #[test]
    fn splits_multi_sentence_reply() {
        let out = segment_all(&["你好。今天天气不错！再见。"]);
        assert_eq!(out, vec!["你好。", "今天天气不错！", "再见。"]);
    }

    #[test]
    fn boundary_split_across_tokens() {
        let out = segment_all(&["今天天", "气不错", "！再", "见。"]);
        assert_eq!(out, vec!["今天天气不错！", "再见。"]);
    }

    #[test]
    fn short_fragment_keeps_buffering() {
        let mut seg = SentenceSegmenter::new();
        // "OK." is under the minimum, so the terminator does not fire yet.
        assert!(seg.push("OK.").is_empty());
        assert_eq!(seg.push(" I will check."), vec!["OK. I will check."]);
    }

    #[test]
    fn ascii_punctuation_and_newline() {
        let out = segment_all(&["First line.\nsecond part; third?tail"]);
        assert_eq!(out, vec!["First line.", "\nsecond part;", " third?", "tail"]);
    }

    #[test]
    fn flush_returns_unterminated_residual() {
        let mut seg = SentenceSegmenter::new();
        assert!(seg.push("没有标点的结尾").is_empty());
        assert_eq!(seg.flush().as_deref(), Some("没有标点的结尾"));
        assert_eq!(seg.flush(), None);
    }

    #[test]
    fn whitespace_only_flush_is_empty() {
        let mut seg = SentenceSegmenter::new();
        seg.push("   \n ");
        assert_eq!(seg.flush(), None);
    }

    #[test]
    fn prefix_monotone() {
        let text = "你好。今天天气不错！short. 再见吧？结尾";
        let chars: Vec<char> = text.chars().collect();
        let mut previous: Vec<String> = Vec::new();
        for end in 0..=chars.len() {
            let prefix: String = chars[..end].iter().collect();
            let mut seg = SentenceSegmenter::new();
            let emitted = seg.push(&prefix);
            // Everything emitted for a shorter prefix must be a prefix of
            // what a longer one emits (flush excluded, it is end-of-stream).
            assert!(emitted.len() >= previous.len());
            assert_eq!(&emitted[..previous.len()], previous.as_slice());
            previous = emitted;
        }
    }
}
