use blake3::Hasher;

use crate::error::{Result, TagError};
use crate::lemma::{Lemmatizer, StemLemmatizer};

/// Embedding oracle: one fixed-length vector per input string.
pub trait Embedder: Send + Sync {
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Feature-hashing embedder over stemmed words and character trigrams.
///
/// Captures lexical overlap only ("quantum theory" ~ "quantum physics"), which
/// is enough to group surface variants without a neural model. Buckets come
/// from BLAKE3 digests, so vectors are identical on every platform and build.
pub struct HashingEmbedder {
    dimensions: usize,
    lemmatizer: StemLemmatizer,
}

const WORD_WEIGHT: f32 = 1.0;
const TRIGRAM_WEIGHT: f32 = 0.35;

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
            lemmatizer: StemLemmatizer::english(),
        }
    }

    fn bucket(&self, feature: &str, salt: u8) -> (usize, f32) {
        let mut hasher = Hasher::new();
        hasher.update(&[salt]);
        hasher.update(feature.as_bytes());
        let digest = hasher.finalize();
        let mut word = [0u8; 8];
        word.copy_from_slice(&digest.as_bytes()[..8]);
        let h = u64::from_le_bytes(word);
        let index = (h % self.dimensions as u64) as usize;
        // Top bit picks the sign so collisions tend to cancel
        let sign = if h >> 63 == 0 { 1.0 } else { -1.0 };
        (index, sign)
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dimensions];

        for token in self.lemmatizer.lemmatize(text) {
            if token.is_punctuation() {
                continue;
            }
            let (i, sign) = self.bucket(&token.lemma, 0);
            v[i] += sign * WORD_WEIGHT;

            let padded: Vec<char> = format!(" {} ", token.lemma).chars().collect();
            for window in padded.windows(3) {
                let trigram: String = window.iter().collect();
                let (i, sign) = self.bucket(&trigram, 1);
                v[i] += sign * TRIGRAM_WEIGHT;
            }
        }

        normalize(&mut v);
        v
    }
}

impl Embedder for HashingEmbedder {
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

fn normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Cosine similarity; 0.0 for zero vectors or mismatched lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na * nb)
}

/// Element-wise mean of equally sized vectors.
pub fn centroid(vectors: &[&[f32]]) -> Result<Vec<f32>> {
    let Some(first) = vectors.first() else {
        return Ok(Vec::new());
    };
    let dims = first.len();
    let mut mean = vec![0.0f32; dims];
    for v in vectors {
        if v.len() != dims {
            return Err(TagError::Embedding(format!(
                "dimension mismatch: expected {}, got {}",
                dims,
                v.len()
            )));
        }
        for (m, x) in mean.iter_mut().zip(v.iter()) {
            *m += x;
        }
    }
    let n = vectors.len() as f32;
    for m in mean.iter_mut() {
        *m /= n;
    }
    Ok(mean)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]), 1.0);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 1.0], &[1.0, 0.0]) - 0.7071).abs() < 1e-3);
    }

    #[test]
    fn test_centroid() {
        let a = [1.0f32, 0.0];
        let b = [0.0f32, 1.0];
        assert_eq!(centroid(&[&a[..], &b[..]]).unwrap(), vec![0.5, 0.5]);
        assert!(centroid(&[&a[..], &[1.0f32][..]]).is_err());
        assert!(centroid(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_hashing_embedder_is_deterministic_and_normalized() {
        let embedder = HashingEmbedder::new(128);
        let texts = vec!["quantum theory".to_string(), "quantum theory".to_string()];
        let vectors = embedder.embed(&texts).unwrap();

        assert_eq!(vectors[0].len(), 128);
        assert_eq!(vectors[0], vectors[1]);
        let norm: f32 = vectors[0].iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_buckets_are_fixed_across_builds() {
        let embedder = HashingEmbedder::new(256);
        assert_eq!(embedder.bucket("quantum", 0), (180, -1.0));
        assert_eq!(embedder.bucket("hole", 0), (73, -1.0));
        assert_eq!(embedder.bucket(" qu", 1), (148, 1.0));
    }

    #[test]
    fn test_hashing_embedder_lexical_overlap() {
        let embedder = HashingEmbedder::new(256);
        let texts: Vec<String> = ["quantum physics", "quantum theory", "black holes"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let v = embedder.embed(&texts).unwrap();

        let related = cosine_similarity(&v[0], &v[1]);
        let unrelated = cosine_similarity(&v[0], &v[2]);
        assert!(related > unrelated);
    }
}
