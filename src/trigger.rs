//! When to run extraction while a document grows, and on which text.

use tracing::debug;

pub const DEFAULT_SENTENCE_THRESHOLD: usize = 4;
pub const DEFAULT_WINDOW_LINES: usize = 4;

/// A decision to run extraction. Commit it once the extraction succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trigger {
    /// Trimmed text since the watermark, narrowed to the last few lines.
    pub delta: String,
    pub watermark: usize,
    pub sentence_count: usize,
}

#[derive(Debug, Clone)]
pub struct TriggerPolicy {
    sentence_threshold: usize,
    window_lines: usize,
    last_count: usize,
    watermark: usize,
}

impl Default for TriggerPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_SENTENCE_THRESHOLD, DEFAULT_WINDOW_LINES)
    }
}

impl TriggerPolicy {
    pub fn new(sentence_threshold: usize, window_lines: usize) -> Self {
        Self {
            sentence_threshold: sentence_threshold.max(1),
            window_lines: window_lines.max(1),
            last_count: 0,
            watermark: 0,
        }
    }

    /// Starts from an existing document so its old content never triggers.
    pub fn resume(mut self, document: &str) -> Self {
        self.last_count = count_sentences(document);
        self.watermark = document.len();
        self
    }

    pub fn watermark(&self) -> usize {
        self.watermark
    }

    pub fn last_count(&self) -> usize {
        self.last_count
    }

    /// Pure check: fires once enough new sentences have been written.
    pub fn should_trigger(&self, document: &str) -> Option<Trigger> {
        let count = count_sentences(document);
        if count < self.last_count + self.sentence_threshold {
            return None;
        }

        let start = floor_char_boundary(document, self.watermark);
        let delta = last_lines(document[start..].trim(), self.window_lines);
        debug!(
            sentences = count,
            previous = self.last_count,
            watermark = self.watermark,
            delta_len = delta.len(),
            "extraction triggered"
        );
        Some(Trigger {
            delta,
            watermark: document.len(),
            sentence_count: count,
        })
    }

    /// Moves the watermark after the document was rewritten underneath it.
    pub fn rebase(&mut self, map_offset: impl Fn(usize) -> usize) {
        self.watermark = map_offset(self.watermark);
    }

    /// Advances past a trigger whose extraction completed.
    pub fn commit(&mut self, trigger: &Trigger) {
        self.watermark = self.watermark.max(trigger.watermark);
        self.last_count = self.last_count.max(trigger.sentence_count);
    }
}

/// Number of `.`, `!` or `?` immediately followed by whitespace.
pub fn count_sentences(text: &str) -> usize {
    let mut chars = text.chars().peekable();
    let mut count = 0;
    while let Some(c) = chars.next() {
        if matches!(c, '.' | '!' | '?') && chars.peek().is_some_and(|n| n.is_whitespace()) {
            count += 1;
        }
    }
    count
}

/// The last `n` lines of `text`, or all of them when there are fewer.
pub fn last_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let skip = lines.len().saturating_sub(n);
    lines[skip..].join("\n")
}

// The watermark can point past the end or mid-char after the user deletes text.
fn floor_char_boundary(text: &str, index: usize) -> usize {
    let mut i = index.min(text.len());
    while !text.is_char_boundary(i) {
        i -= 1;
    }
    i
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_sentences() {
        assert_eq!(count_sentences("One. Two! Three? "), 3);
        assert_eq!(count_sentences("One. Two! Three?"), 2);
        assert_eq!(count_sentences("v1.2 is out.\nNext"), 1);
        assert_eq!(count_sentences("What?! Really. "), 2);
        assert_eq!(count_sentences(""), 0);
    }

    #[test]
    fn test_last_lines() {
        assert_eq!(last_lines("a\nb\nc\nd\ne\nf", 4), "c\nd\ne\nf");
        assert_eq!(last_lines("a\nb", 4), "a\nb");
        assert_eq!(last_lines("", 4), "");
    }

    #[test]
    fn test_fires_once_after_fourth_sentence() {
        let sentences = [
            "Einstein published his theory. ",
            "Bohr disagreed. ",
            "They argued for years. ",
            "Nobody won. ",
            "Physics moved on. ",
            "Students still read both. ",
            "The debate is famous. ",
        ];

        let mut policy = TriggerPolicy::default();
        let mut document = String::new();
        let mut fired = Vec::new();

        for (i, sentence) in sentences.iter().enumerate() {
            document.push_str(sentence);
            if let Some(trigger) = policy.should_trigger(&document) {
                policy.commit(&trigger);
                fired.push((i, trigger));
            }
        }

        assert_eq!(fired.len(), 1);
        let (index, trigger) = &fired[0];
        assert_eq!(*index, 3);
        assert_eq!(trigger.delta, sentences[..4].concat().trim());
        assert_eq!(policy.watermark(), sentences[..4].concat().len());
    }

    #[test]
    fn test_delta_starts_at_watermark() {
        let mut policy = TriggerPolicy::new(2, 4);
        let mut document = String::from("Old one. Old two. ");
        let first = policy.should_trigger(&document).unwrap();
        policy.commit(&first);

        document.push_str("New one. New two. ");
        let second = policy.should_trigger(&document).unwrap();
        assert_eq!(second.delta, "New one. New two.");
    }

    #[test]
    fn test_no_fire_checks_are_pure() {
        let policy = TriggerPolicy::default();
        let document = "One. Two. Three. ";
        for _ in 0..3 {
            assert!(policy.should_trigger(document).is_none());
        }
        assert_eq!(policy.watermark(), 0);
        assert_eq!(policy.last_count(), 0);
    }

    #[test]
    fn test_uncommitted_trigger_widens_next_delta() {
        let policy = TriggerPolicy::new(1, 10);
        let first = policy.should_trigger("Alpha. ").unwrap();
        // Extraction failed: nothing committed, so the retry covers both sentences
        let retry = policy.should_trigger("Alpha. Beta. ").unwrap();
        assert_eq!(first.delta, "Alpha.");
        assert_eq!(retry.delta, "Alpha. Beta.");
    }

    #[test]
    fn test_delta_narrowed_to_last_lines() {
        let policy = TriggerPolicy::new(1, 2);
        let trigger = policy
            .should_trigger("Line one.\nLine two.\nLine three.\nLine four.\n")
            .unwrap();
        assert_eq!(trigger.delta, "Line three.\nLine four.");
    }

    #[test]
    fn test_rebase_follows_rewritten_text() {
        let mut policy = TriggerPolicy::new(1, 4).resume("Bohr spoke. ");
        policy.rebase(|offset| offset + 4);
        assert_eq!(policy.watermark(), "[[Bohr]] spoke. ".len());

        let trigger = policy.should_trigger("[[Bohr]] spoke. Then silence. ").unwrap();
        assert_eq!(trigger.delta, "Then silence.");
    }

    #[test]
    fn test_resume_and_shrunk_document() {
        let mut policy = TriggerPolicy::new(1, 4).resume("Loaded é. ");
        assert!(policy.should_trigger("Loaded é. ").is_none());

        // Pretend the watermark sits inside the two-byte "é"
        policy.watermark = "Loaded ".len() + 1;
        let trigger = policy.should_trigger("Loaded é. Fresh. ").unwrap();
        assert_eq!(trigger.delta, "é. Fresh.");

        policy.watermark = 10_000;
        let trigger = policy.should_trigger("Short. Text. ").unwrap();
        assert_eq!(trigger.delta, "");
    }
}
