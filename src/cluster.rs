//! Superset clustering of registry tags.
//!
//! Tags are normalized (lowercased, lemmatized, punctuation dropped), embedded,
//! and grouped with DBSCAN over cosine distance. Sparse tags are reported as
//! noise and never forced into a cluster. Each cluster gets a representative
//! label from a keyphrase pass over its members, or the member nearest the
//! centroid when no keyphrase scores.

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::Serialize;
use tracing::{debug, info};

use crate::embed::{centroid, cosine_similarity, Embedder};
use crate::error::{Result, TagError};
use crate::lemma::Lemmatizer;
use crate::normalize::canonical_alias;

pub const DEFAULT_EPS: f32 = 0.6;
pub const DEFAULT_MIN_CLUSTER_SIZE: usize = 2;

const MAX_NGRAM: usize = 3;

const STOP_WORDS: &[&str] = &[
    "a", "an", "the", "and", "or", "but", "in", "on", "at", "to", "for",
    "of", "with", "by", "from", "as", "is", "was", "are", "were", "been",
    "be", "have", "has", "had", "do", "does", "did", "will", "would",
    "could", "should", "may", "might", "must", "can", "this", "that",
    "these", "those", "i", "you", "he", "she", "it", "we", "they", "his",
    "her", "its", "their", "our", "my", "your", "what", "which", "who",
    "whom", "where", "when", "why", "how", "all", "each", "both", "few",
    "more", "most", "other", "some", "such", "no", "nor", "not", "only",
    "own", "same", "so", "than", "too", "very", "just", "also", "into",
    "over", "under", "about", "between", "after", "before",
];

static WORD_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\p{L}\p{N}][\p{L}\p{N}'’-]*").expect("word pattern"));

/// A group of related tags and the label that stands for them.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct TagCluster {
    pub label: String,
    pub members: BTreeSet<String>,
}

impl TagCluster {
    /// Self-referential alias for the label, to be offered to a
    /// non-overwriting registry merge.
    pub fn as_alias(&self) -> (String, String) {
        (canonical_alias(&self.label), self.label.clone())
    }
}

pub struct TagClusterer {
    embedder: Arc<dyn Embedder>,
    lemmatizer: Arc<dyn Lemmatizer>,
    eps: f32,
    min_cluster_size: usize,
}

impl TagClusterer {
    pub fn new(embedder: Arc<dyn Embedder>, lemmatizer: Arc<dyn Lemmatizer>) -> Self {
        Self {
            embedder,
            lemmatizer,
            eps: DEFAULT_EPS,
            min_cluster_size: DEFAULT_MIN_CLUSTER_SIZE,
        }
    }

    /// Maximum cosine distance between neighbours.
    pub fn with_eps(mut self, eps: f32) -> Self {
        self.eps = eps.clamp(0.0, 2.0);
        self
    }

    /// Neighbours a core point needs, itself included.
    pub fn with_min_cluster_size(mut self, min_cluster_size: usize) -> Self {
        self.min_cluster_size = min_cluster_size.max(1);
        self
    }

    pub fn normalize_tag(&self, tag: &str) -> String {
        self.lemmatizer
            .lemmatize(&tag.to_lowercase())
            .into_iter()
            .filter(|t| !t.is_punctuation())
            .map(|t| t.lemma)
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Clusters `tags`, sorted by label. Duplicates and blank tags are ignored.
    pub fn cluster<S: AsRef<str>>(&self, tags: &[S]) -> Result<Vec<TagCluster>> {
        let mut seen = HashSet::new();
        let tags: Vec<&str> = tags
            .iter()
            .map(|t| t.as_ref().trim())
            .filter(|t| !t.is_empty() && seen.insert(*t))
            .collect();
        if tags.is_empty() {
            return Ok(Vec::new());
        }

        let normalized: Vec<String> = tags.iter().map(|t| self.normalize_tag(t)).collect();
        let vectors = self.embed_checked(&normalized)?;
        let assignments = dbscan(&vectors, self.eps, self.min_cluster_size);

        let count = assignments.iter().flatten().max().map_or(0, |m| m + 1);
        let mut groups: Vec<Vec<usize>> = vec![Vec::new(); count];
        for (i, assignment) in assignments.iter().enumerate() {
            if let Some(c) = assignment {
                groups[*c].push(i);
            }
        }

        let mut used = HashSet::new();
        let mut clusters = Vec::with_capacity(groups.len());
        for group in &groups {
            let members: Vec<&str> = group.iter().map(|&i| tags[i]).collect();
            let member_vectors: Vec<&[f32]> = group.iter().map(|&i| vectors[i].as_slice()).collect();
            let central = central_member(&members, &member_vectors)?;
            let label = match self.keyphrase(&members)? {
                Some(phrase) => phrase,
                None => central.to_string(),
            };
            debug!(label = %label, members = members.len(), "cluster labelled");
            clusters.push(TagCluster {
                label: unique_label(label, central, &mut used),
                members: members.iter().map(|m| m.to_string()).collect(),
            });
        }
        clusters.sort_by(|a, b| a.label.cmp(&b.label));

        let clustered: usize = groups.iter().map(Vec::len).sum();
        info!(
            tags = tags.len(),
            clusters = clusters.len(),
            noise = tags.len() - clustered,
            "clustered tags"
        );
        Ok(clusters)
    }

    fn embed_checked(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let vectors = self.embedder.embed(texts)?;
        if vectors.len() != texts.len() {
            return Err(TagError::Embedding(format!(
                "expected {} vectors, got {}",
                texts.len(),
                vectors.len()
            )));
        }
        Ok(vectors)
    }

    /// Best 1..=3-gram of the members, scored against the joined members.
    /// `None` when no candidate scores above zero.
    fn keyphrase(&self, members: &[&str]) -> Result<Option<String>> {
        let candidates = keyphrase_candidates(members);
        if candidates.is_empty() {
            return Ok(None);
        }

        let mut texts = Vec::with_capacity(candidates.len() + 1);
        texts.push(members.join(". "));
        texts.extend(candidates.iter().cloned());
        let vectors = self.embed_checked(&texts)?;
        let Some((document, scored)) = vectors.split_first() else {
            return Ok(None);
        };

        let mut best: Option<(usize, f32)> = None;
        for (i, vector) in scored.iter().enumerate() {
            let score = cosine_similarity(document, vector);
            if score > 0.0 && best.map_or(true, |(_, b)| score > b) {
                best = Some((i, score));
            }
        }
        Ok(best.map(|(i, _)| candidates[i].clone()))
    }
}

fn keyphrase_candidates(members: &[&str]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut candidates = Vec::new();
    for member in members {
        let lower = member.to_lowercase();
        let words: Vec<&str> = WORD_PATTERN
            .find_iter(&lower)
            .map(|m| m.as_str())
            .filter(|w| w.chars().count() >= 2 && !STOP_WORDS.iter().any(|s| s == w))
            .collect();
        for start in 0..words.len() {
            for n in 1..=MAX_NGRAM.min(words.len() - start) {
                let phrase = words[start..start + n].join(" ");
                if seen.insert(phrase.clone()) {
                    candidates.push(phrase);
                }
            }
        }
    }
    candidates
}

fn central_member<'a>(members: &[&'a str], vectors: &[&[f32]]) -> Result<&'a str> {
    let mean = centroid(vectors)?;
    let mut best = (0, f32::NEG_INFINITY);
    for (i, vector) in vectors.iter().enumerate() {
        let score = cosine_similarity(&mean, vector);
        if score > best.1 {
            best = (i, score);
        }
    }
    Ok(members[best.0])
}

// Taken label -> centroid member -> numbered suffix.
fn unique_label(label: String, central: &str, used: &mut HashSet<String>) -> String {
    let base = if used.contains(&label) {
        central.to_string()
    } else {
        label
    };
    let mut candidate = base.clone();
    let mut n = 2;
    while used.contains(&candidate) {
        candidate = format!("{} {}", base, n);
        n += 1;
    }
    used.insert(candidate.clone());
    candidate
}

fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    1.0 - cosine_similarity(a, b)
}

/// Cluster id per point; `None` is noise.
fn dbscan(points: &[Vec<f32>], eps: f32, min_points: usize) -> Vec<Option<usize>> {
    let n = points.len();
    let neighbours: Vec<Vec<usize>> = (0..n)
        .map(|i| {
            (0..n)
                .filter(|&j| cosine_distance(&points[i], &points[j]) <= eps)
                .collect()
        })
        .collect();

    let mut labels: Vec<Option<usize>> = vec![None; n];
    let mut visited = vec![false; n];
    let mut next = 0;

    for i in 0..n {
        if visited[i] {
            continue;
        }
        visited[i] = true;
        if neighbours[i].len() < min_points {
            continue;
        }

        let cluster = next;
        next += 1;
        labels[i] = Some(cluster);
        let mut queue: VecDeque<usize> = neighbours[i].iter().copied().collect();
        while let Some(j) = queue.pop_front() {
            // Border points first seen as noise still join
            if labels[j].is_none() {
                labels[j] = Some(cluster);
            }
            if visited[j] {
                continue;
            }
            visited[j] = true;
            if neighbours[j].len() >= min_points {
                queue.extend(neighbours[j].iter().copied());
            }
        }
    }
    labels
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lemma::StemLemmatizer;

    /// One axis per topic word, so the geometry is obvious.
    struct AxisEmbedder;

    impl Embedder for AxisEmbedder {
        fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|t| {
                    let t = t.to_lowercase();
                    vec![
                        t.matches("quantum").count() as f32,
                        t.matches("hole").count() as f32,
                        t.matches("einstein").count() as f32,
                    ]
                })
                .collect())
        }
    }

    struct ShortEmbedder;

    impl Embedder for ShortEmbedder {
        fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(vec![vec![1.0]])
        }
    }

    fn clusterer() -> TagClusterer {
        TagClusterer::new(Arc::new(AxisEmbedder), Arc::new(StemLemmatizer::english()))
    }

    fn names(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_quantum_tags_form_one_cluster() {
        let tags = ["quantum physics", "quantum theory", "quantum mechanics", "black holes"];
        let clusters = clusterer().cluster(&tags).unwrap();

        assert_eq!(clusters.len(), 1);
        assert_eq!(
            clusters[0].members,
            names(&["quantum mechanics", "quantum physics", "quantum theory"])
        );
        assert_eq!(clusters[0].label, "quantum");
        assert_eq!(
            clusters[0].as_alias(),
            ("[[quantum]]".to_string(), "quantum".to_string())
        );
    }

    #[test]
    fn test_black_holes_never_join_quantum() {
        let tags = [
            "quantum physics",
            "black holes",
            "quantum theory",
            "Black Hole",
            "quantum mechanics",
        ];
        let clusters = clusterer().cluster(&tags).unwrap();

        let labels: Vec<&str> = clusters.iter().map(|c| c.label.as_str()).collect();
        assert_eq!(labels, vec!["black holes", "quantum"]);
        assert_eq!(clusters[0].members, names(&["Black Hole", "black holes"]));
        assert!(!clusters[1].members.contains("black holes"));
    }

    #[test]
    fn test_min_cluster_size_turns_small_groups_into_noise() {
        let tags = ["quantum physics", "quantum theory", "quantum mechanics"];
        let clusters = clusterer().with_min_cluster_size(4).cluster(&tags).unwrap();
        assert!(clusters.is_empty());
    }

    #[test]
    fn test_duplicates_and_empty_input() {
        let none: [&str; 0] = [];
        assert!(clusterer().cluster(&none).unwrap().is_empty());

        // A repeated tag is one point, so it cannot form a cluster on its own
        let clusters = clusterer().cluster(&["Einstein", "Einstein", " "]).unwrap();
        assert!(clusters.is_empty());
    }

    #[test]
    fn test_normalize_tag() {
        let c = clusterer();
        assert_eq!(c.normalize_tag("Black Holes!"), "black hole");
        assert_eq!(c.normalize_tag("Einstein's theories"), "einstein s theori");
    }

    #[test]
    fn test_keyphrase_candidates_skip_stop_words() {
        let candidates = keyphrase_candidates(&["theory of relativity", "the relativity"]);
        assert_eq!(
            candidates,
            vec!["theory", "theory relativity", "relativity"]
        );
        assert!(keyphrase_candidates(&["of the", "a"]).is_empty());
    }

    #[test]
    fn test_label_falls_back_to_central_member() {
        let c = clusterer();
        assert_eq!(c.keyphrase(&["of the", "to be"]).unwrap(), None);

        let members = ["far", "middle", "near"];
        let vectors: Vec<Vec<f32>> = vec![vec![1.0, 0.0], vec![0.7, 0.7], vec![0.0, 1.0]];
        let slices: Vec<&[f32]> = vectors.iter().map(Vec::as_slice).collect();
        assert_eq!(central_member(&members, &slices).unwrap(), "middle");
    }

    #[test]
    fn test_unique_label_collisions() {
        let mut used = HashSet::new();
        assert_eq!(unique_label("quantum".into(), "quantum theory", &mut used), "quantum");
        assert_eq!(
            unique_label("quantum".into(), "quantum physics", &mut used),
            "quantum physics"
        );
        assert_eq!(
            unique_label("quantum".into(), "quantum physics", &mut used),
            "quantum physics 2"
        );
    }

    #[test]
    fn test_dbscan_chains_and_marks_noise() {
        let angle = |deg: f32| vec![deg.to_radians().cos(), deg.to_radians().sin()];
        let points = vec![angle(0.0), angle(10.0), angle(20.0), angle(90.0)];
        let labels = dbscan(&points, 0.02, 2);
        assert_eq!(labels, vec![Some(0), Some(0), Some(0), None]);
    }

    #[test]
    fn test_embedder_returning_wrong_count_is_an_error() {
        let c = TagClusterer::new(Arc::new(ShortEmbedder), Arc::new(StemLemmatizer::english()));
        let err = c.cluster(&["a tag", "another tag"]).unwrap_err();
        assert!(matches!(err, TagError::Embedding(_)));
    }
}
