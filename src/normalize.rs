//! Turns per-token oracle output into whole tags and registry aliases.

use std::collections::BTreeSet;

use tracing::debug;

use crate::oracle::{TaggedToken, CONTINUATION_MARKER};

pub const LINK_OPEN: &str = "[[";
pub const LINK_CLOSE: &str = "]]";

/// Canonical markup alias for a tag: `Einstein` -> `[[Einstein]]`.
pub fn canonical_alias(tag: &str) -> String {
    format!("{}{}{}", LINK_OPEN, tag.trim(), LINK_CLOSE)
}

/// Whether `tag` can live inside a `[[...]]` span without breaking the markup.
pub fn is_linkable(tag: &str) -> bool {
    let tag = tag.trim();
    !tag.is_empty() && !tag.contains(['[', ']', '\n'])
}

/// Merges BIO-labelled tokens into a set of tag strings.
///
/// Tokens below `min_confidence` count as outside any entity.
pub fn normalize(tokens: &[TaggedToken], min_confidence: f32) -> BTreeSet<String> {
    let mut tags = BTreeSet::new();
    let mut current = String::new();

    let flush = |current: &mut String, tags: &mut BTreeSet<String>| {
        let tag = current.trim();
        if is_linkable(tag) {
            tags.insert(tag.to_string());
        }
        current.clear();
    };

    for token in tokens {
        if token.label.is_outside() || token.confidence < min_confidence {
            flush(&mut current, &mut tags);
        } else if token.is_continuation() {
            current.push_str(&token.token[CONTINUATION_MARKER.len()..]);
        } else {
            flush(&mut current, &mut tags);
            current.push_str(&token.token);
        }
    }
    flush(&mut current, &mut tags);

    debug!(tokens = tokens.len(), tags = tags.len(), "normalized oracle output");
    tags
}

/// Self-referential alias/target pairs for freshly extracted tags.
pub fn tag_aliases<'a>(tags: impl IntoIterator<Item = &'a String>) -> Vec<(String, String)> {
    tags.into_iter()
        .map(|tag| (canonical_alias(tag), tag.clone()))
        .collect()
}
