//! Distances (smaller is closer) and their mapping to `[0, 1]` scores.
//!
//! Cosine vectors are L2-normalized on the way in, so cosine distance is
//! `1 - dot`. Euclidean works on squared distances internally.

use ragdb_core::config::Metric;

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

pub fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Returns the vector in the form the index stores and compares.
pub fn prepare(metric: Metric, v: &[f32]) -> Vec<f32> {
    match metric {
        Metric::Cosine => {
            let norm = dot(v, v).sqrt();
            if norm > 0.0 {
                v.iter().map(|x| x / norm).collect()
            } else {
                v.to_vec()
            }
        }
        Metric::Euclidean => v.to_vec(),
    }
}

/// Distance between two prepared vectors.
pub fn distance(metric: Metric, a: &[f32], b: &[f32]) -> f32 {
    match metric {
        Metric::Cosine => 1.0 - dot(a, b),
        Metric::Euclidean => squared_l2(a, b),
    }
}

/// Maps a distance to a similarity score in `[0, 1]`.
pub fn score(metric: Metric, distance: f32) -> f32 {
    let s = match metric {
        // (1 + cos) / 2
        Metric::Cosine => 1.0 - distance / 2.0,
        Metric::Euclidean => 1.0 / (1.0 + distance.max(0.0).sqrt()),
    };
    s.clamp(0.0, 1.0)
}
