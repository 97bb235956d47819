use std::sync::LazyLock;

use regex::Regex;
use rust_stemmers::{Algorithm, Stemmer};

/// A normalized token with its byte range in the source text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LemmaToken {
    pub lemma: String,
    pub start: usize,
    pub end: usize,
}

impl LemmaToken {
    pub fn is_punctuation(&self) -> bool {
        !self.lemma.chars().any(|c| c.is_alphanumeric())
    }
}

/// Morphological normalizer: `lemmatize(text) -> [(lemma, start, end)]`.
///
/// Implementations must return tokens in text order, with non-overlapping
/// ranges that lie on char boundaries, and must never emit whitespace tokens.
pub trait Lemmatizer: Send + Sync {
    fn lemmatize(&self, text: &str) -> Vec<LemmaToken>;

    /// Lemma sequence of a short phrase, for matching against documents.
    fn lemma_sequence(&self, phrase: &str) -> Vec<String> {
        self.lemmatize(phrase).into_iter().map(|t| t.lemma).collect()
    }
}

// Words are runs of letters/digits; every other non-space char is its own token,
// so "Einstein's" splits into "Einstein", "'", "s".
static TOKEN_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\p{L}\p{N}_]+|[^\s\p{L}\p{N}_]").expect("token pattern"));

/// Snowball (English) stemmer standing in for a dictionary lemmatizer.
pub struct StemLemmatizer {
    stemmer: Stemmer,
}

impl StemLemmatizer {
    pub fn english() -> Self {
        Self {
            stemmer: Stemmer::create(Algorithm::English),
        }
    }

    /// Stem a single word (lowercased first).
    pub fn stem(&self, word: &str) -> String {
        let lower = word.to_lowercase();
        self.stemmer.stem(&lower).into_owned()
    }
}

impl Default for StemLemmatizer {
    fn default() -> Self {
        Self::english()
    }
}

impl Lemmatizer for StemLemmatizer {
    fn lemmatize(&self, text: &str) -> Vec<LemmaToken> {
        TOKEN_PATTERN
            .find_iter(text)
            .map(|m| LemmaToken {
                lemma: self.stem(m.as_str()),
                start: m.start(),
                end: m.end(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_carry_offsets() {
        let lemmatizer = StemLemmatizer::english();
        let text = "Scientists studied Einstein's work.";
        let tokens = lemmatizer.lemmatize(text);

        let surfaces: Vec<&str> = tokens.iter().map(|t| &text[t.start..t.end]).collect();
        assert_eq!(
            surfaces,
            vec!["Scientists", "studied", "Einstein", "'", "s", "work", "."]
        );
        assert!(tokens[3].is_punctuation());
        assert!(!tokens[2].is_punctuation());
    }

    #[test]
    fn test_inflections_share_lemma() {
        let lemmatizer = StemLemmatizer::english();
        assert_eq!(lemmatizer.stem("studied"), lemmatizer.stem("studies"));
        assert_eq!(lemmatizer.stem("Theories"), lemmatizer.stem("theory"));
        assert_eq!(lemmatizer.stem("Einstein"), "einstein");
        assert_eq!(
            lemmatizer.lemma_sequence("black holes"),
            lemmatizer.lemma_sequence("Black Hole")
        );
    }

    #[test]
    fn test_multibyte_offsets() {
        let lemmatizer = StemLemmatizer::english();
        let text = "Schrödinger’s cat";
        let tokens = lemmatizer.lemmatize(text);
        assert_eq!(&text[tokens[0].start..tokens[0].end], "Schrödinger");
        assert_eq!(&text[tokens[1].start..tokens[1].end], "’");
        assert_eq!(tokens.last().map(|t| t.lemma.as_str()), Some("cat"));
    }
}
