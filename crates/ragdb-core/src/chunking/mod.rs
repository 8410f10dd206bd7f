//! Document chunking.
//!
//! A document is split into ordered [`Chunk`]s under one of four strategies:
//!
//! - **Fixed**: hard windows of `size` characters, backed off to the last
//!   sentence boundary inside the window, with `overlap` characters repeated
//!   at the start of the next chunk.
//! - **Recursive**: split on paragraphs, then lines, then sentences, then
//!   words, descending only while a piece is still larger than `size`, and
//!   greedily merge the pieces back up to `size`.
//! - **Semantic**: group consecutive sentences while adjacent sentence
//!   embeddings stay similar. Needs vectors, see [`chunk_semantic`].
//! - **Structural**: split at Markdown headings and record the enclosing
//!   heading path in the chunk metadata.
//!
//! Sizes are measured in characters (Unicode scalar values). Every chunk
//! records `start_char`/`end_char` offsets into the raw text. A piece that
//! cannot be split below `size` is kept whole and flagged `oversized`.

mod fixed;
mod recursive;
mod semantic;
mod structural;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use unicode_segmentation::UnicodeSegmentation;

use crate::error::{Error, Result};
use crate::types::{Chunk, Document, Payload};

pub use semantic::{chunk_semantic, semantic_units};

/// Closed set of chunking strategies with their parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum ChunkStrategy {
    Fixed { size: usize, overlap: usize },
    Recursive { size: usize, overlap: usize },
    Semantic(SemanticParams),
    Structural { size: usize, overlap: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticParams {
    pub size: usize,
    /// Cosine similarity below which a new chunk starts.
    pub threshold: f32,
    pub min_chunk_size: usize,
}

impl Default for SemanticParams {
    fn default() -> Self {
        Self { size: 1000, threshold: 0.5, min_chunk_size: 100 }
    }
}

impl Default for ChunkStrategy {
    fn default() -> Self {
        ChunkStrategy::Recursive { size: 1000, overlap: 200 }
    }
}

impl ChunkStrategy {
    /// Picks a strategy from a file extension: Markdown is split by
    /// headings, everything else recursively.
    pub fn for_extension(ext: &str, size: usize, overlap: usize) -> Self {
        match ext.to_ascii_lowercase().as_str() {
            "md" | "markdown" | "mdx" => ChunkStrategy::Structural { size, overlap },
            _ => ChunkStrategy::Recursive { size, overlap },
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ChunkStrategy::Fixed { .. } => "fixed",
            ChunkStrategy::Recursive { .. } => "recursive",
            ChunkStrategy::Semantic(_) => "semantic",
            ChunkStrategy::Structural { .. } => "structural",
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            ChunkStrategy::Fixed { size, overlap }
            | ChunkStrategy::Recursive { size, overlap }
            | ChunkStrategy::Structural { size, overlap } => {
                if *size == 0 {
                    return Err(Error::invalid_argument("chunk size must be positive"));
                }
                if overlap >= size {
                    return Err(Error::invalid_argument(format!("overlap ({overlap}) must be smaller than size ({size})")));
                }
                Ok(())
            }
            ChunkStrategy::Semantic(p) => {
                if p.size == 0 {
                    return Err(Error::invalid_argument("chunk size must be positive"));
                }
                if !(-1.0..=1.0).contains(&p.threshold) {
                    return Err(Error::invalid_argument("semantic threshold must be within [-1, 1]"));
                }
                Ok(())
            }
        }
    }
}

/// Splits `document` under `strategy`.
///
/// The semantic strategy needs sentence embeddings and is rejected here;
/// call [`chunk_semantic`] with vectors for [`semantic_units`] instead.
pub fn chunk(document: &Document, strategy: &ChunkStrategy) -> Result<Vec<Chunk>> {
    strategy.validate()?;
    if document.raw_text.trim().is_empty() {
        return Ok(Vec::new());
    }
    let text = document.raw_text.as_str();
    let pieces = match strategy {
        ChunkStrategy::Fixed { size, overlap } => fixed::split(text, *size, *overlap),
        ChunkStrategy::Recursive { size, overlap } => recursive::split(text, 0..text.len(), *size, *overlap),
        ChunkStrategy::Structural { size, overlap } => structural::split(text, *size, *overlap),
        ChunkStrategy::Semantic(_) => {
            return Err(Error::invalid_argument(
                "semantic chunking needs sentence embeddings; use chunk_semantic",
            ))
        }
    };
    Ok(assemble(document, strategy.name(), pieces))
}

/// A byte span of the raw text plus strategy-specific metadata.
#[derive(Debug, Clone)]
pub(crate) struct Piece {
    pub start: usize,
    pub end: usize,
    pub oversized: bool,
    pub extra: Payload,
}

impl Piece {
    pub(crate) fn new(start: usize, end: usize) -> Self {
        Self { start, end, oversized: false, extra: Payload::new() }
    }
}

/// Turns byte spans into chunks: trims surrounding whitespace, drops empty
/// spans and numbers the rest.
pub(crate) fn assemble(document: &Document, strategy: &str, pieces: Vec<Piece>) -> Vec<Chunk> {
    let text = document.raw_text.as_str();
    let index = CharIndex::new(text);
    let mut chunks = Vec::with_capacity(pieces.len());
    for piece in pieces {
        let raw = &text[piece.start..piece.end];
        let trimmed_start = raw.trim_start();
        let start = piece.start + (raw.len() - trimmed_start.len());
        let body = trimmed_start.trim_end();
        if body.is_empty() {
            continue;
        }
        let end = start + body.len();
        let mut metadata = document.metadata.clone();
        metadata.insert("chunk_strategy".into(), Value::from(strategy));
        metadata.insert("start_char".into(), Value::from(index.char_at(start)));
        metadata.insert("end_char".into(), Value::from(index.char_at(end)));
        if piece.oversized {
            metadata.insert("oversized".into(), Value::Bool(true));
        }
        metadata.extend(piece.extra);
        chunks.push(Chunk::new(&document.id, chunks.len(), body, metadata));
    }
    chunks
}

/// Maps byte offsets to character offsets.
pub(crate) struct CharIndex {
    starts: Vec<usize>,
}

impl CharIndex {
    pub(crate) fn new(text: &str) -> Self {
        let mut starts: Vec<usize> = text.char_indices().map(|(b, _)| b).collect();
        starts.push(text.len());
        Self { starts }
    }

    pub(crate) fn char_at(&self, byte: usize) -> usize {
        match self.starts.binary_search(&byte) {
            Ok(i) | Err(i) => i,
        }
    }

    pub(crate) fn byte_at(&self, ch: usize) -> usize {
        self.starts[ch.min(self.starts.len() - 1)]
    }

    pub(crate) fn len_chars(&self) -> usize {
        self.starts.len() - 1
    }
}

pub(crate) fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Byte offsets where a new sentence starts, excluding 0.
pub(crate) fn sentence_starts(text: &str) -> Vec<usize> {
    text.split_sentence_bound_indices().map(|(i, _)| i).filter(|&i| i > 0).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_no_chunks() {
        for strategy in [
            ChunkStrategy::Fixed { size: 10, overlap: 2 },
            ChunkStrategy::Recursive { size: 10, overlap: 2 },
            ChunkStrategy::Structural { size: 10, overlap: 2 },
        ] {
            assert!(chunk(&Document::new("   \n\n "), &strategy).expect("chunk").is_empty());
        }
    }

    #[test]
    fn overlap_must_be_smaller_than_size() {
        let err = chunk(&Document::new("text"), &ChunkStrategy::Fixed { size: 4, overlap: 4 }).expect_err("invalid");
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn semantic_requires_vectors() {
        let err = chunk(&Document::new("a. b."), &ChunkStrategy::Semantic(SemanticParams::default())).expect_err("needs vectors");
        assert!(err.to_string().contains("chunk_semantic"));
    }

    #[test]
    fn char_index_handles_multibyte() {
        let idx = CharIndex::new("héllo");
        assert_eq!(idx.len_chars(), 5);
        assert_eq!(idx.char_at(3), 2);
        assert_eq!(idx.byte_at(2), 3);
    }
}
