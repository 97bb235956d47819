//! `[[target]]` link spans embedded in plain text.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

// Non-greedy and single-line: brackets never nest and an unterminated `[[`
// simply fails to match.
static LINK_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[\[([^\n]*?)\]\]").expect("link pattern"));

/// A link span over document byte offsets; `end` is exclusive.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct LinkSpan {
    pub start: usize,
    pub end: usize,
    pub target: String,
}

impl LinkSpan {
    pub fn contains(&self, offset: usize) -> bool {
        self.start <= offset && offset < self.end
    }

    pub fn intersects(&self, start: usize, end: usize) -> bool {
        start < self.end && self.start < end
    }
}

/// All link spans in `text`, in order and non-overlapping.
pub fn find_links(text: &str) -> Vec<LinkSpan> {
    LINK_PATTERN
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            Some(LinkSpan {
                start: whole.start(),
                end: whole.end(),
                target: caps.get(1).map(|m| m.as_str().trim().to_string()).unwrap_or_default(),
            })
        })
        .collect()
}

/// The link under `offset` (e.g. a click position), if any and non-empty.
pub fn link_at(text: &str, offset: usize) -> Option<LinkSpan> {
    find_links(text)
        .into_iter()
        .find(|span| span.contains(offset) && !span.target.is_empty())
}

/// Distinct link targets in order of first appearance.
pub fn link_targets(text: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    find_links(text)
        .into_iter()
        .filter(|span| !span.target.is_empty() && seen.insert(span.target.clone()))
        .map(|span| span.target)
        .collect()
}
