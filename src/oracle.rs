//! Entity extraction capability and its built-in implementations.
//!
//! The extractor is the only component that talks to a model. Everything
//! it returns is validated into [`TaggedToken`] before the rest of the crate
//! sees it.

use std::fmt;
use std::io::Write;
use std::process::{Command, Stdio};
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, TagError};

/// Sub-word continuation prefix used by WordPiece tokenizers.
pub const CONTINUATION_MARKER: &str = "##";

/// BIO label attached to one oracle token.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityLabel {
    Outside,
    Begin(String),
    Inside(String),
}

impl EntityLabel {
    pub fn is_outside(&self) -> bool {
        matches!(self, EntityLabel::Outside)
    }

    pub fn kind(&self) -> Option<&str> {
        match self {
            EntityLabel::Begin(kind) | EntityLabel::Inside(kind) => Some(kind),
            EntityLabel::Outside => None,
        }
    }
}

impl fmt::Display for EntityLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityLabel::Outside => write!(f, "O"),
            EntityLabel::Begin(kind) => write!(f, "B-{}", kind),
            EntityLabel::Inside(kind) => write!(f, "I-{}", kind),
        }
    }
}

impl FromStr for EntityLabel {
    type Err = TagError;

    /// Accepts `O`, `B-KIND`, `I-KIND` and bare `KIND` (aggregated pipelines).
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let valid_kind = |kind: &str| {
            !kind.is_empty()
                && kind
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
        };

        if s == "O" {
            return Ok(EntityLabel::Outside);
        }
        let label = match s.split_once('-') {
            Some(("B", kind)) => EntityLabel::Begin(kind.to_string()),
            Some(("I", kind)) => EntityLabel::Inside(kind.to_string()),
            Some(_) => return Err(TagError::InvalidPrediction(format!("unknown label `{}`", s))),
            None => EntityLabel::Begin(s.to_string()),
        };
        match label.kind() {
            Some(kind) if valid_kind(kind) => Ok(label),
            _ => Err(TagError::InvalidPrediction(format!("unknown label `{}`", s))),
        }
    }
}

/// One token as seen by the normalizer.
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedToken {
    pub token: String,
    pub label: EntityLabel,
    pub confidence: f32,
}

impl TaggedToken {
    pub fn new(token: impl Into<String>, label: EntityLabel, confidence: f32) -> Self {
        Self {
            token: token.into(),
            label,
            confidence,
        }
    }

    pub fn is_continuation(&self) -> bool {
        self.token.starts_with(CONTINUATION_MARKER)
    }
}

/// Token-classification output as emitted by an external model process.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RawPrediction {
    pub word: String,
    #[serde(alias = "entity_group", alias = "label")]
    pub entity: String,
    #[serde(default = "default_score")]
    pub score: f32,
}

fn default_score() -> f32 {
    1.0
}

impl TryFrom<RawPrediction> for TaggedToken {
    type Error = TagError;

    fn try_from(raw: RawPrediction) -> Result<Self> {
        if !raw.score.is_finite() || !(0.0..=1.0).contains(&raw.score) {
            return Err(TagError::InvalidPrediction(format!(
                "score {} for `{}` is outside [0, 1]",
                raw.score, raw.word
            )));
        }
        Ok(TaggedToken {
            label: raw.entity.parse()?,
            token: raw.word,
            confidence: raw.score,
        })
    }
}

/// `predict(text)` capability of the entity model.
pub trait EntityExtractor: Send + Sync {
    fn predict(&self, text: &str) -> Result<Vec<TaggedToken>>;

    fn name(&self) -> &'static str;
}

/// Heuristic extractor: each run of capitalized words becomes one `B-ENTITY`
/// token, the way an aggregating token-classification pipeline reports
/// whole entities.
///
/// Deterministic and model-free; the default when no external model is
/// configured.
#[derive(Debug, Clone, Default)]
pub struct RuleExtractor;

static WORD_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\p{L}\p{N}][\p{L}\p{N}'’-]*").expect("word pattern"));

const COMMON_CAPITALIZED: &[&str] = &[
    "The", "A", "An", "This", "That", "These", "Those", "I", "You", "He", "She", "It", "We",
    "They", "My", "Your", "His", "Her", "Its", "Our", "Their", "In", "On", "At", "To", "For",
    "Of", "With", "By", "From", "And", "But", "Or", "If", "When", "While", "After", "Before",
    "Then", "There", "Here", "What", "Which", "Who", "Why", "How", "Today", "Yesterday",
    "Tomorrow", "Monday", "Tuesday", "Wednesday", "Thursday", "Friday", "Saturday", "Sunday",
];

impl RuleExtractor {
    pub fn new() -> Self {
        Self
    }

    fn is_capitalized(word: &str) -> bool {
        word.chars().next().is_some_and(|c| c.is_uppercase())
    }
}

impl EntityExtractor for RuleExtractor {
    fn predict(&self, text: &str) -> Result<Vec<TaggedToken>> {
        let mut tokens = Vec::new();
        let mut run: Option<(String, f32)> = None;
        let mut sentence_start = true;
        let mut last_end = 0;

        let flush = |run: &mut Option<(String, f32)>, tokens: &mut Vec<TaggedToken>| {
            if let Some((phrase, confidence)) = run.take() {
                tokens.push(TaggedToken::new(
                    phrase,
                    EntityLabel::Begin("ENTITY".to_string()),
                    confidence,
                ));
            }
        };

        for m in WORD_PATTERN.find_iter(text) {
            let gap = &text[last_end..m.start()];
            if gap.chars().any(|c| matches!(c, '.' | '!' | '?' | '\n')) {
                sentence_start = true;
            }
            if gap.chars().any(|c| !c.is_whitespace()) {
                flush(&mut run, &mut tokens);
            }
            last_end = m.end();

            let surface = m.as_str();
            let word = surface
                .trim_end_matches("'s")
                .trim_end_matches("’s")
                .trim_end_matches(['\'', '’']);
            let possessive = word.len() != surface.len();

            if Self::is_capitalized(word) && !COMMON_CAPITALIZED.iter().any(|c| *c == word) {
                match run.as_mut() {
                    Some((phrase, _)) => {
                        phrase.push(' ');
                        phrase.push_str(word);
                    }
                    // Sentence-initial capitals are ambiguous
                    None => run = Some((word.to_string(), if sentence_start { 0.5 } else { 0.8 })),
                }
                if possessive {
                    flush(&mut run, &mut tokens);
                }
            } else {
                flush(&mut run, &mut tokens);
                tokens.push(TaggedToken::new(word, EntityLabel::Outside, 1.0));
            }
            sentence_start = false;
        }
        flush(&mut run, &mut tokens);

        debug!(tokens = tokens.len(), "rule extractor finished");
        Ok(tokens)
    }

    fn name(&self) -> &'static str {
        "rule"
    }
}

/// Runs an external model process: text on stdin, JSON predictions on stdout.
#[derive(Debug, Clone)]
pub struct CommandExtractor {
    program: String,
    args: Vec<String>,
}

impl CommandExtractor {
    /// Builds from `[program, args...]`; `None` when the command line is empty.
    pub fn from_command_line(command: &[String]) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

impl EntityExtractor for CommandExtractor {
    fn predict(&self, text: &str) -> Result<Vec<TaggedToken>> {
        let unavailable = |what: &str, err: &dyn fmt::Display| {
            TagError::OracleUnavailable(format!("{} `{}`: {}", what, self.program, err))
        };

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| unavailable("failed to spawn", &e))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(text.as_bytes())
                .map_err(|e| unavailable("failed to write to", &e))?;
        }

        let output = child
            .wait_with_output()
            .map_err(|e| unavailable("failed to wait for", &e))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(unavailable("non-zero exit from", &stderr.trim()));
        }

        let raw: Vec<RawPrediction> = serde_json::from_slice(&output.stdout)
            .map_err(|e| TagError::InvalidPrediction(e.to_string()))?;
        raw.into_iter().map(TaggedToken::try_from).collect()
    }

    fn name(&self) -> &'static str {
        "command"
    }
}
