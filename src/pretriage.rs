//! Similarity pretriage of canonical records against inclusion and exclusion
//! keyword lists.
//!
//! Scores are appended next to the record; the record itself is untouched.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use serde::Serialize;

use crate::record::{CanonicalRecord, NOT_AVAILABLE};

pub const EMBEDDING_DIMENSION: usize = 768;
pub const DEFAULT_THRESHOLD: f32 = 0.3;

pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Vec<f32>;
}

/// Deterministic bag-of-words vectors: each token is hashed to a bucket and a
/// sign, and the result is L2-normalized. Needs no model files or network.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(EMBEDDING_DIMENSION)
    }
}

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() > 1)
        .map(str::to_lowercase)
}

impl Embedder for HashingEmbedder {
    fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        for token in tokens(text) {
            let mut hasher = DefaultHasher::new();
            token.hash(&mut hasher);
            let h = hasher.finish();
            let bucket = (h % self.dimension as u64) as usize;
            let sign = if h >> 63 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|x| *x /= norm);
        }
        vector
    }
}

/// Cosine similarity; zero when either vector is all zeros.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredRecord {
    #[serde(flatten)]
    pub record: CanonicalRecord,
    pub score_inclusion: f32,
    pub score_exclusion: f32,
}

#[derive(Debug, Clone)]
pub struct PretriageConfig {
    pub inclusion: Vec<String>,
    pub exclusion: Vec<String>,
    pub inclusion_threshold: f32,
    pub exclusion_threshold: f32,
}

impl Default for PretriageConfig {
    fn default() -> Self {
        Self {
            inclusion: Vec::new(),
            exclusion: Vec::new(),
            inclusion_threshold: DEFAULT_THRESHOLD,
            exclusion_threshold: DEFAULT_THRESHOLD,
        }
    }
}

fn record_text(record: &CanonicalRecord) -> String {
    [record.title(), record.abstract_text()]
        .into_iter()
        .filter(|t| *t != NOT_AVAILABLE)
        .collect::<Vec<_>>()
        .join(". ")
}

fn best_match(vector: &[f32], keys: &[Vec<f32>]) -> f32 {
    keys.iter().map(|k| cosine(vector, k)).fold(0.0, f32::max)
}

/// Keep records whose inclusion score reaches the inclusion threshold and
/// whose exclusion score stays at or below the exclusion threshold.
pub fn pretriage(
    records: &[CanonicalRecord],
    config: &PretriageConfig,
    embedder: &dyn Embedder,
) -> Vec<ScoredRecord> {
    if config.inclusion.is_empty() {
        return records
            .iter()
            .cloned()
            .map(|record| ScoredRecord {
                record,
                score_inclusion: 0.0,
                score_exclusion: 0.0,
            })
            .collect();
    }

    let inclusion: Vec<Vec<f32>> = config.inclusion.iter().map(|k| embedder.embed(k)).collect();
    let exclusion: Vec<Vec<f32>> = config.exclusion.iter().map(|k| embedder.embed(k)).collect();

    let kept: Vec<ScoredRecord> = records
        .iter()
        .filter_map(|record| {
            let vector = embedder.embed(&record_text(record));
            let score_inclusion = best_match(&vector, &inclusion);
            let score_exclusion = best_match(&vector, &exclusion);
            (score_inclusion >= config.inclusion_threshold
                && score_exclusion <= config.exclusion_threshold)
                .then(|| ScoredRecord {
                    record: record.clone(),
                    score_inclusion,
                    score_exclusion,
                })
        })
        .collect();
    tracing::info!(input = records.len(), kept = kept.len(), "pretriage finished");
    kept
}
