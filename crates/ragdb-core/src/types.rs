//! Domain types shared by the chunker, the indexes and the orchestrator.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type ChunkId = String;
/// Free-form JSON metadata attached to documents and chunks; filters are
/// evaluated against it.
pub type Payload = serde_json::Map<String, Value>;

/// A source document as handed over by a loader.
///
/// `id` defaults to the blake3 digest of `raw_text`, so ingesting the same
/// content twice addresses the same chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub raw_text: String,
    pub metadata: Payload,
}

impl Document {
    pub fn new(raw_text: impl Into<String>) -> Self {
        let raw_text = raw_text.into();
        Self { id: content_hash(&raw_text), raw_text, metadata: Payload::new() }
    }

    /// Overrides the content-derived id with an external identity.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_metadata(mut self, metadata: Payload) -> Self {
        self.metadata = metadata;
        self
    }
}

pub fn content_hash(s: &str) -> String {
    blake3::hash(s.as_bytes()).to_hex().to_string()
}

/// Deterministic chunk id for a position inside a document.
pub fn chunk_id(document_id: &str, position_index: usize) -> ChunkId {
    format!("{}:{}", document_id, position_index)
}

/// An independently indexed unit of a document. Never edited in place; a
/// re-ingested document supersedes its previous chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: ChunkId,
    pub document_id: String,
    pub text: String,
    pub position_index: usize,
    pub metadata: Payload,
}

impl Chunk {
    pub fn new(document_id: &str, position_index: usize, text: impl Into<String>, metadata: Payload) -> Self {
        Self {
            id: chunk_id(document_id, position_index),
            document_id: document_id.to_string(),
            text: text.into(),
            position_index,
            metadata,
        }
    }

    /// Metadata plus the document identity, as stored next to the vector.
    pub fn payload(&self) -> Payload {
        let mut payload = self.metadata.clone();
        payload.insert("document_id".into(), Value::String(self.document_id.clone()));
        payload.insert("position_index".into(), Value::from(self.position_index));
        payload
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub chunk_id: ChunkId,
    pub vector: Vec<f32>,
    pub model_id: String,
}

/// The unit owned by the vector and sparse indexes, one per chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub id: ChunkId,
    pub vector: Vec<f32>,
    pub text: String,
    pub payload: Payload,
}

impl IndexEntry {
    pub fn from_chunk(chunk: &Chunk, vector: Vec<f32>) -> Self {
        Self { id: chunk.id.clone(), vector, text: chunk.text.clone(), payload: chunk.payload() }
    }
}

/// Which stage produced a score.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ResultSource {
    Dense,
    Sparse,
    Fused,
    Reranked,
}

/// The minimal surface returned by both indexes.
///
/// `score` is engine-specific but higher is always better; the fusion stage
/// maps it into `[0, 1]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchHit {
    pub id: ChunkId,
    pub score: f32,
    pub source: ResultSource,
}

impl SearchHit {
    pub fn new(id: impl Into<ChunkId>, score: f32, source: ResultSource) -> Self {
        Self { id: id.into(), score, source }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievalResult {
    pub chunk_id: ChunkId,
    pub score: f32,
    pub source: ResultSource,
    pub text: String,
    pub payload: Payload,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_id_is_content_hash() {
        let a = Document::new("same text");
        let b = Document::new("same text");
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, Document::new("other text").id);
        assert_eq!(a.with_id("doc-1").id, "doc-1");
    }

    #[test]
    fn chunk_payload_carries_document_identity() {
        let chunk = Chunk::new("doc", 3, "text", Payload::new());
        assert_eq!(chunk.id, "doc:3");
        let payload = chunk.payload();
        assert_eq!(payload["document_id"], "doc");
        assert_eq!(payload["position_index"], 3);
    }
}
