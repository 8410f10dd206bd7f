//! Merges the dense and sparse rankings of one query into a single list.
//!
//! Linear fusion normalizes each source per query and mixes them with
//! `alpha`; Reciprocal Rank Fusion scores by position only and is
//! normalized by its best attainable value so every fused score lies in
//! `[0, 1]`. Equal scores resolve by the leading source's rank (dense,
//! except for pure-sparse linear fusion), then the other source's rank,
//! then id.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use ragdb_core::config::{FusionMethod, ScoreNormalization, SearchDefaults};
use ragdb_core::{ChunkId, Error, Result, ResultSource, SearchHit};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FusionParams {
    pub method: FusionMethod,
    /// Dense weight for linear fusion.
    pub alpha: f32,
    pub rrf_k: f32,
    pub normalization: ScoreNormalization,
}

impl Default for FusionParams {
    fn default() -> Self {
        Self::from(&SearchDefaults::default())
    }
}

impl From<&SearchDefaults> for FusionParams {
    fn from(d: &SearchDefaults) -> Self {
        Self { method: d.fusion_method, alpha: d.alpha, rrf_k: d.rrf_k, normalization: d.normalization }
    }
}

impl FusionParams {
    pub fn linear(alpha: f32) -> Self {
        Self { method: FusionMethod::Linear, alpha, ..Self::default() }
    }

    pub fn rrf(k: f32) -> Self {
        Self { method: FusionMethod::Rrf, rrf_k: k, ..Self::default() }
    }

    pub fn with_normalization(mut self, normalization: ScoreNormalization) -> Self {
        self.normalization = normalization;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.alpha) {
            return Err(Error::invalid_argument(format!("alpha must be in [0, 1], got {}", self.alpha)));
        }
        if !self.rrf_k.is_finite() || self.rrf_k < 0.0 {
            return Err(Error::invalid_argument(format!("rrf_k must be a non-negative number, got {}", self.rrf_k)));
        }
        Ok(())
    }
}

/// One fused candidate. Ranks are zero-based positions in the deduplicated
/// source lists.
#[derive(Debug, Clone, PartialEq)]
pub struct FusedHit {
    pub id: ChunkId,
    pub score: f32,
    pub dense_rank: Option<usize>,
    pub sparse_rank: Option<usize>,
    pub source: ResultSource,
}

/// Min-max scaling to `[0, 1]`. A constant list maps to 1.0 when its value
/// is positive and to 0.0 otherwise.
pub fn min_max(scores: &[f32]) -> Vec<f32> {
    let (lo, hi) = scores
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &s| (lo.min(s), hi.max(s)));
    let span = hi - lo;
    scores
        .iter()
        .map(|&s| {
            if span > f32::EPSILON {
                (s - lo) / span
            } else if hi > 0.0 {
                1.0
            } else {
                0.0
            }
        })
        .collect()
}

/// Drops repeated ids, keeping the first (best) position.
fn dedup(hits: &[SearchHit]) -> Vec<&SearchHit> {
    let mut seen = std::collections::HashSet::new();
    hits.iter().filter(|h| seen.insert(h.id.as_str())).collect()
}

fn normalized(hits: &[&SearchHit], normalization: ScoreNormalization) -> Vec<f32> {
    let raw: Vec<f32> = hits.iter().map(|h| h.score).collect();
    match normalization {
        ScoreNormalization::MinMax => min_max(&raw),
        ScoreNormalization::None => raw.into_iter().map(|s| s.clamp(0.0, 1.0)).collect(),
    }
}

#[derive(Default)]
struct Slot {
    dense_rank: Option<usize>,
    sparse_rank: Option<usize>,
    score: f32,
}

pub fn fuse(dense: &[SearchHit], sparse: &[SearchHit], params: &FusionParams) -> Vec<FusedHit> {
    let dense = dedup(dense);
    let sparse = dedup(sparse);
    let mut slots: HashMap<&str, Slot> = HashMap::with_capacity(dense.len() + sparse.len());

    match params.method {
        FusionMethod::Linear => {
            let alpha = params.alpha;
            for (rank, (hit, s)) in dense.iter().zip(normalized(&dense, params.normalization)).enumerate() {
                let slot = slots.entry(hit.id.as_str()).or_default();
                slot.dense_rank = Some(rank);
                slot.score += alpha * s;
            }
            for (rank, (hit, s)) in sparse.iter().zip(normalized(&sparse, params.normalization)).enumerate() {
                let slot = slots.entry(hit.id.as_str()).or_default();
                slot.sparse_rank = Some(rank);
                slot.score += (1.0 - alpha) * s;
            }
        }
        FusionMethod::Rrf => {
            let k = params.rrf_k;
            // Best attainable: rank 0 in both sources.
            let best = 2.0 / (k + 1.0);
            for (rank, hit) in dense.iter().enumerate() {
                let slot = slots.entry(hit.id.as_str()).or_default();
                slot.dense_rank = Some(rank);
                slot.score += 1.0 / (k + rank as f32 + 1.0) / best;
            }
            for (rank, hit) in sparse.iter().enumerate() {
                let slot = slots.entry(hit.id.as_str()).or_default();
                slot.sparse_rank = Some(rank);
                slot.score += 1.0 / (k + rank as f32 + 1.0) / best;
            }
        }
    }

    let sparse_leads = params.method == FusionMethod::Linear && params.alpha == 0.0;
    let mut fused: Vec<FusedHit> = slots
        .into_iter()
        .map(|(id, slot)| FusedHit {
            id: id.to_string(),
            score: slot.score.clamp(0.0, 1.0),
            dense_rank: slot.dense_rank,
            sparse_rank: slot.sparse_rank,
            source: ResultSource::Fused,
        })
        .collect();
    fused.sort_by(|a, b| {
        let (lead_a, lead_b, other_a, other_b) = if sparse_leads {
            (a.sparse_rank, b.sparse_rank, a.dense_rank, b.dense_rank)
        } else {
            (a.dense_rank, b.dense_rank, a.sparse_rank, b.sparse_rank)
        };
        b.score
            .total_cmp(&a.score)
            .then_with(|| by_rank(lead_a, lead_b))
            .then_with(|| by_rank(other_a, other_b))
            .then_with(|| a.id.cmp(&b.id))
    });
    fused
}

/// Present ranks first, lower rank first.
fn by_rank(a: Option<usize>, b: Option<usize>) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Ranking from one surviving path when the other failed. Scores are
/// min-max normalized and the list keeps the path's own order.
pub fn single_source(hits: &[SearchHit], source: ResultSource) -> Vec<FusedHit> {
    let hits = dedup(hits);
    let scores = min_max(&hits.iter().map(|h| h.score).collect::<Vec<_>>());
    hits.iter()
        .zip(scores)
        .enumerate()
        .map(|(rank, (hit, score))| FusedHit {
            id: hit.id.clone(),
            score,
            dense_rank: (source == ResultSource::Dense).then_some(rank),
            sparse_rank: (source == ResultSource::Sparse).then_some(rank),
            source,
        })
        .collect()
}
