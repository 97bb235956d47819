//! Wraps every lemma-level occurrence of a registry target in `[[...]]`.
//!
//! Existing link spans are protected and never re-wrapped, so rewriting is
//! idempotent. Matching is greedy left to right; when several targets match
//! at one position the one registered first wins.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::debug;

use crate::lemma::{LemmaToken, Lemmatizer};
use crate::markup::{find_links, LinkSpan};
use crate::normalize::{canonical_alias, is_linkable};
use crate::registry::TagRegistry;

/// A registry target prepared for matching.
#[derive(Debug, Clone)]
struct Pattern {
    target: String,
    lemmas: Vec<String>,
}

pub struct SpanRewriter {
    lemmatizer: Arc<dyn Lemmatizer>,
}

/// Result of one rewrite pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rewrite {
    pub text: String,
    /// Spans inserted by this pass, in offsets of the rewritten text.
    pub inserted: Vec<LinkSpan>,
    // Source range each inserted span replaced.
    replaced: Vec<(usize, usize)>,
}

impl Rewrite {
    pub fn changed(&self) -> bool {
        !self.inserted.is_empty()
    }

    /// Maps a byte offset of the input onto the rewritten text. Offsets
    /// inside a replaced range land at the end of its link.
    pub fn map_offset(&self, offset: usize) -> usize {
        let mut shift: isize = 0;
        for (&(start, end), span) in self.replaced.iter().zip(&self.inserted) {
            if offset <= start {
                break;
            }
            if offset < end {
                return span.end;
            }
            shift = span.end as isize - end as isize;
        }
        (offset as isize + shift) as usize
    }
}

impl SpanRewriter {
    pub fn new(lemmatizer: Arc<dyn Lemmatizer>) -> Self {
        Self { lemmatizer }
    }

    pub fn rewrite(&self, document: &str, registry: &TagRegistry) -> String {
        self.rewrite_with_report(document, registry).text
    }

    pub fn rewrite_with_report(&self, document: &str, registry: &TagRegistry) -> Rewrite {
        let protected = find_links(document);
        let tokens = self.lemmatizer.lemmatize(document);
        let patterns = self.patterns(registry);
        let by_first = index_by_first_lemma(&patterns);

        let mut replacements: Vec<(usize, usize, &str)> = Vec::new();
        let mut i = 0;
        while i < tokens.len() {
            let matched = by_first
                .get(tokens[i].lemma.as_str())
                .into_iter()
                .flatten()
                .map(|&p| &patterns[p])
                .find_map(|pattern| {
                    let (start, end) = match_at(&tokens, i, &pattern.lemmas)?;
                    if protected.iter().any(|link| link.intersects(start, end)) {
                        return None;
                    }
                    Some((start, end, pattern))
                });

            match matched {
                Some((start, end, pattern)) => {
                    replacements.push((start, end, pattern.target.as_str()));
                    i += pattern.lemmas.len();
                }
                None => i += 1,
            }
        }

        let inserted = inserted_spans(&replacements);
        let replaced = replacements.iter().map(|&(start, end, _)| (start, end)).collect();
        let mut text = document.to_string();
        for &(start, end, target) in replacements.iter().rev() {
            text.replace_range(start..end, &canonical_alias(target));
        }

        debug!(
            tokens = tokens.len(),
            patterns = patterns.len(),
            protected = protected.len(),
            inserted = inserted.len(),
            "rewrite pass finished"
        );
        Rewrite {
            text,
            inserted,
            replaced,
        }
    }

    /// One pattern per distinct lemma sequence, in registry order.
    fn patterns(&self, registry: &TagRegistry) -> Vec<Pattern> {
        let mut seen: HashSet<Vec<String>> = HashSet::new();
        registry
            .distinct_targets()
            .into_iter()
            .filter(|target| is_linkable(target))
            .filter_map(|target| {
                let lemmas = self.lemmatizer.lemma_sequence(target);
                if lemmas.is_empty() || !seen.insert(lemmas.clone()) {
                    return None;
                }
                Some(Pattern {
                    target: target.trim().to_string(),
                    lemmas,
                })
            })
            .collect()
    }
}

fn index_by_first_lemma(patterns: &[Pattern]) -> HashMap<&str, Vec<usize>> {
    let mut index: HashMap<&str, Vec<usize>> = HashMap::new();
    for (i, pattern) in patterns.iter().enumerate() {
        index.entry(pattern.lemmas[0].as_str()).or_default().push(i);
    }
    index
}

/// Byte range covered by `lemmas` when they match contiguously at `tokens[i..]`.
fn match_at(tokens: &[LemmaToken], i: usize, lemmas: &[String]) -> Option<(usize, usize)> {
    let window = tokens.get(i..i + lemmas.len())?;
    if window.iter().zip(lemmas).all(|(t, l)| &t.lemma == l) {
        Some((window[0].start, window[window.len() - 1].end))
    } else {
        None
    }
}

// Ascending replacements -> where each new span lands in the output.
fn inserted_spans(replacements: &[(usize, usize, &str)]) -> Vec<LinkSpan> {
    let mut shift: isize = 0;
    replacements
        .iter()
        .map(|&(start, end, target)| {
            let markup_len = canonical_alias(target).len();
            let new_start = (start as isize + shift) as usize;
            shift += markup_len as isize - (end - start) as isize;
            LinkSpan {
                start: new_start,
                end: new_start + markup_len,
                target: target.to_string(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lemma::StemLemmatizer;
    use proptest::prelude::*;

    fn rewriter() -> SpanRewriter {
        SpanRewriter::new(Arc::new(StemLemmatizer::english()))
    }

    fn registry(items: &[(&str, &str)]) -> TagRegistry {
        let mut registry = TagRegistry::new();
        registry.merge(items.iter().map(|(a, t)| (a.to_string(), t.to_string())));
        registry
    }

    #[test]
    fn test_wraps_every_unlinked_occurrence() {
        let reg = registry(&[("[[Einstein]]", "Einstein")]);
        let doc = "Einstein published his theory. Scientists studied Einstein's work.";
        assert_eq!(
            rewriter().rewrite(doc, &reg),
            "[[Einstein]] published his theory. Scientists studied [[Einstein]]'s work."
        );
    }

    #[test]
    fn test_inflected_forms_use_target_text() {
        let reg = registry(&[("[[black hole]]", "black hole")]);
        let doc = "Black holes evaporate. One black hole is enough.";
        assert_eq!(
            rewriter().rewrite(doc, &reg),
            "[[black hole]] evaporate. One [[black hole]] is enough."
        );
    }

    #[test]
    fn test_existing_links_are_protected() {
        let reg = registry(&[("[[Einstein]]", "Einstein"), ("[[theory]]", "theory")]);
        let doc = "[[Einstein]] and [[Einstein theory]] but theory.";
        assert_eq!(
            rewriter().rewrite(doc, &reg),
            "[[Einstein]] and [[Einstein theory]] but [[theory]]."
        );
    }

    #[test]
    fn test_first_registered_target_wins() {
        // Longer and shorter candidates at the same position: insertion order decides
        let reg = registry(&[
            ("[[quantum]]", "quantum"),
            ("[[quantum mechanics]]", "quantum mechanics"),
        ]);
        assert_eq!(
            rewriter().rewrite("quantum mechanics rocks", &reg),
            "[[quantum]] mechanics rocks"
        );

        let reg = registry(&[
            ("[[quantum mechanics]]", "quantum mechanics"),
            ("[[quantum]]", "quantum"),
        ]);
        assert_eq!(
            rewriter().rewrite("quantum mechanics and quantum", &reg),
            "[[quantum mechanics]] and [[quantum]]"
        );
    }

    #[test]
    fn test_identical_lemmas_resolve_to_first_entry() {
        let reg = registry(&[("[[Theory]]", "Theory"), ("[[theories]]", "theories")]);
        assert_eq!(rewriter().rewrite("a theory", &reg), "a [[Theory]]");
    }

    #[test]
    fn test_text_inside_links_is_left_alone() {
        let reg = registry(&[("[[old physics]]", "old physics"), ("[[old]]", "old")]);
        let doc = "[[old physics]] is old";
        assert_eq!(rewriter().rewrite(doc, &reg), "[[old physics]] is [[old]]");
    }

    #[test]
    fn test_unlinkable_and_empty_targets_are_ignored() {
        let reg = registry(&[("[[weird]]", "a]]b"), ("[[blank]]", " "), ("[[b]]", "b")]);
        let out = rewriter().rewrite("a]]b stays", &reg);
        assert_eq!(out, "a]][[b]] stays");
    }

    #[test]
    fn test_report_spans_point_into_output() {
        let reg = registry(&[("[[Bohr]]", "Bohr"), ("[[Einstein]]", "Einstein")]);
        let result = rewriter().rewrite_with_report("Bohr met Einstein.", &reg);

        assert!(result.changed());
        assert_eq!(result.text, "[[Bohr]] met [[Einstein]].");
        for span in &result.inserted {
            assert_eq!(&result.text[span.start..span.end], canonical_alias(&span.target));
        }

        // "Bohr met Einstein." -> offsets shift by the four bracket bytes per link
        assert_eq!(result.map_offset(0), 0);
        assert_eq!(result.map_offset(2), 8);
        assert_eq!(result.map_offset(5), 9);
        assert_eq!(result.map_offset(18), 26);

        let again = rewriter().rewrite_with_report(&result.text, &reg);
        assert!(!again.changed());
        assert_eq!(again.text, result.text);
    }

    #[test]
    fn test_empty_inputs() {
        assert_eq!(rewriter().rewrite("", &registry(&[("[[x]]", "x")])), "");
        assert_eq!(rewriter().rewrite("plain text", &TagRegistry::new()), "plain text");
    }

    fn word() -> impl Strategy<Value = String> {
        prop::sample::select(vec![
            "Einstein", "einstein's", "theory", "theories", "quantum", "mechanics",
            "black", "holes", "hole", "the", "and", "[[", "]]", "[[theory]]", ".", "\n",
        ])
        .prop_map(str::to_string)
    }

    proptest! {
        #[test]
        fn test_rewrite_is_idempotent_and_non_overlapping(
            words in prop::collection::vec(word(), 0..40)
        ) {
            let reg = registry(&[
                ("[[Einstein]]", "Einstein"),
                ("[[quantum mechanics]]", "quantum mechanics"),
                ("[[theory]]", "theory"),
                ("[[black hole]]", "black hole"),
                ("[[quantum]]", "quantum"),
            ]);
            let doc = words.join(" ");
            let rw = rewriter();

            let once = rw.rewrite(&doc, &reg);
            let twice = rw.rewrite(&once, &reg);
            prop_assert_eq!(&once, &twice);

            let links = find_links(&once);
            for pair in links.windows(2) {
                prop_assert!(pair[0].end <= pair[1].start);
            }
        }
    }
}
