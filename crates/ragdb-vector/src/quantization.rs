//! Vector compression for the graph traversal pass.
//!
//! Scalar: f32 → u8 with per-vector min/scale calibration (4× smaller).
//! Binary: one sign bit per dimension (32× smaller), compared by Hamming
//! distance. Both are approximations; the index rescores the oversampled
//! candidate set against the full-precision vectors.

use ragdb_core::config::{Metric, Quantization};

use crate::distance::dot;

#[derive(Debug, Clone)]
pub enum Code {
    Scalar { min: f32, scale: f32, codes: Vec<u8> },
    Binary(Vec<u64>),
}

impl Code {
    pub fn encode(mode: Quantization, v: &[f32]) -> Option<Code> {
        match mode {
            Quantization::None => None,
            Quantization::Scalar => {
                let min = v.iter().copied().fold(f32::INFINITY, f32::min);
                let max = v.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                if !min.is_finite() || !max.is_finite() {
                    return Some(Code::Scalar { min: 0.0, scale: 0.0, codes: vec![0; v.len()] });
                }
                let scale = (max - min) / 255.0;
                let codes = v
                    .iter()
                    .map(|x| if scale > 0.0 { ((x - min) / scale).round().clamp(0.0, 255.0) as u8 } else { 0 })
                    .collect();
                Some(Code::Scalar { min, scale, codes })
            }
            Quantization::Binary => Some(Code::Binary(sign_bits(v))),
        }
    }

    pub fn decode(&self) -> Vec<f32> {
        match self {
            Code::Scalar { min, scale, codes } => codes.iter().map(|&c| min + f32::from(c) * scale).collect(),
            Code::Binary(bits) => {
                let dim = bits.len() * 64;
                (0..dim).map(|i| if (bits[i / 64] >> (i % 64)) & 1 == 1 { 1.0 } else { -1.0 }).collect()
            }
        }
    }

    pub fn size_bytes(&self) -> usize {
        match self {
            Code::Scalar { codes, .. } => codes.len() + 2 * std::mem::size_of::<f32>(),
            Code::Binary(bits) => bits.len() * std::mem::size_of::<u64>(),
        }
    }
}

fn sign_bits(v: &[f32]) -> Vec<u64> {
    let mut bits = vec![0u64; v.len().div_ceil(64)];
    for (i, x) in v.iter().enumerate() {
        if *x > 0.0 {
            bits[i / 64] |= 1 << (i % 64);
        }
    }
    bits
}

/// A query prepared once per search for approximate comparisons.
pub struct QueryCode {
    metric: Metric,
    vector: Vec<f32>,
    sum: f32,
    bits: Vec<u64>,
    dim: usize,
}

impl QueryCode {
    pub fn new(metric: Metric, query: &[f32]) -> Self {
        Self { metric, vector: query.to_vec(), sum: query.iter().sum(), bits: sign_bits(query), dim: query.len() }
    }

    /// Approximate distance on the same scale as [`crate::distance::distance`]
    /// for scalar codes; a Hamming proxy for binary codes.
    pub fn distance(&self, code: &Code) -> f32 {
        match code {
            Code::Scalar { min, scale, codes } => match self.metric {
                Metric::Cosine => {
                    // q · (min + scale·c) without materializing the decoded vector
                    let qc: f32 = self.vector.iter().zip(codes).map(|(q, &c)| q * f32::from(c)).sum();
                    1.0 - (min * self.sum + scale * qc)
                }
                Metric::Euclidean => self
                    .vector
                    .iter()
                    .zip(codes)
                    .map(|(q, &c)| {
                        let d = q - (min + scale * f32::from(c));
                        d * d
                    })
                    .sum(),
            },
            Code::Binary(bits) => {
                let hamming: u32 = self.bits.iter().zip(bits).map(|(a, b)| (a ^ b).count_ones()).sum();
                2.0 * hamming as f32 / self.dim.max(1) as f32
            }
        }
    }
}

/// Relative error of a scalar round trip; used in tests and stats.
pub fn reconstruction_error(v: &[f32]) -> f32 {
    let Some(code) = Code::encode(Quantization::Scalar, v) else {
        return 0.0;
    };
    let decoded = code.decode();
    let err: f32 = v.iter().zip(&decoded).map(|(a, b)| (a - b) * (a - b)).sum::<f32>().sqrt();
    let norm = dot(v, v).sqrt().max(1e-12);
    err / norm
}
