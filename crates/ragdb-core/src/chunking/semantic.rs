use std::ops::Range;

use serde_json::Value;
use unicode_segmentation::UnicodeSegmentation;

use super::{assemble, char_len, ChunkStrategy, Piece, SemanticParams};
use crate::error::{Error, Result};
use crate::types::{Chunk, Document};

/// Sentences of `document` in order, trimmed. The caller embeds these and
/// passes the vectors to [`chunk_semantic`].
pub fn semantic_units(document: &Document) -> Vec<&str> {
    unit_spans(&document.raw_text).into_iter().map(|r| &document.raw_text[r]).collect()
}

fn unit_spans(text: &str) -> Vec<Range<usize>> {
    text.split_sentence_bound_indices()
        .filter_map(|(i, s)| {
            let lead = s.len() - s.trim_start().len();
            let body = s.trim();
            (!body.is_empty()).then(|| i + lead..i + lead + body.len())
        })
        .collect()
}

/// Groups consecutive sentences while the cosine similarity of adjacent
/// sentence vectors stays at or above `params.threshold`. A group also
/// closes before it would exceed `params.size`. Groups shorter than
/// `min_chunk_size` merge into the following group; a short final group
/// merges into the one before it.
pub fn chunk_semantic(document: &Document, params: &SemanticParams, vectors: &[Vec<f32>]) -> Result<Vec<Chunk>> {
    ChunkStrategy::Semantic(params.clone()).validate()?;
    let text = document.raw_text.as_str();
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    let spans = unit_spans(text);
    if vectors.len() != spans.len() {
        return Err(Error::invalid_argument(format!(
            "expected {} sentence vectors, got {}",
            spans.len(),
            vectors.len()
        )));
    }
    let chars = |a: usize, b: usize| char_len(&text[spans[a].start..spans[b].end]);

    let mut groups: Vec<(usize, usize)> = Vec::new();
    let mut first = 0;
    for i in 1..spans.len() {
        let similar = cosine(&vectors[i - 1], &vectors[i]) >= params.threshold;
        if !similar || chars(first, i) > params.size {
            groups.push((first, i - 1));
            first = i;
        }
    }
    groups.push((first, spans.len() - 1));

    let mut merged: Vec<(usize, usize)> = Vec::with_capacity(groups.len());
    let mut carry: Option<usize> = None;
    let last = groups.len() - 1;
    for (i, (a, b)) in groups.into_iter().enumerate() {
        let a = carry.take().unwrap_or(a);
        let short = chars(a, b) < params.min_chunk_size;
        if short && i < last {
            carry = Some(a);
        } else if short && i == last && !merged.is_empty() {
            if let Some(prev) = merged.last_mut() {
                prev.1 = b;
            }
        } else {
            merged.push((a, b));
        }
    }

    let pieces = merged
        .into_iter()
        .map(|(a, b)| {
            let mut piece = Piece::new(spans[a].start, spans[b].end);
            piece.oversized = chars(a, b) > params.size;
            piece.extra.insert("sentence_count".into(), Value::from(b - a + 1));
            piece
        })
        .collect();
    Ok(assemble(document, "semantic", pieces))
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}
