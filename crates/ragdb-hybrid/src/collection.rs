use std::collections::{BTreeSet, HashMap};

use parking_lot::RwLock;

use ragdb_core::config::CollectionSettings;
use ragdb_core::traits::{SparseStore, VectorStore};
use ragdb_core::{Chunk, ChunkId, Result};
use ragdb_text::{Analyzer, Bm25Index, Bm25Params};
use ragdb_vector::{FlatIndex, HnswIndex, HnswParams};

/// Chooses the index backends for new collections.
pub trait StoreFactory: Send + Sync + 'static {
    type Vector: VectorStore + 'static;
    type Sparse: SparseStore + 'static;

    fn vector_store(&self, settings: &CollectionSettings) -> Result<Self::Vector>;
    fn sparse_store(&self, settings: &CollectionSettings) -> Result<Self::Sparse>;
}

/// HNSW for dense search, BM25 for sparse.
#[derive(Debug, Clone, Copy, Default)]
pub struct HnswBm25;

impl StoreFactory for HnswBm25 {
    type Vector = HnswIndex;
    type Sparse = Bm25Index;

    fn vector_store(&self, settings: &CollectionSettings) -> Result<HnswIndex> {
        HnswIndex::new(settings.dimension, HnswParams::from(settings))
    }

    fn sparse_store(&self, settings: &CollectionSettings) -> Result<Bm25Index> {
        Ok(bm25(settings))
    }
}

/// Exact scan for dense search; suits small collections and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlatBm25;

impl StoreFactory for FlatBm25 {
    type Vector = FlatIndex;
    type Sparse = Bm25Index;

    fn vector_store(&self, settings: &CollectionSettings) -> Result<FlatIndex> {
        FlatIndex::new(settings.dimension, settings.metric)
    }

    fn sparse_store(&self, settings: &CollectionSettings) -> Result<Bm25Index> {
        Ok(bm25(settings))
    }
}

fn bm25(settings: &CollectionSettings) -> Bm25Index {
    Bm25Index::new(Bm25Params { k1: settings.bm25_k1, b: settings.bm25_b }, Analyzer::new(settings.stemming))
}

/// Chunks known to a collection, and which document each came from.
#[derive(Default)]
pub(crate) struct Catalog {
    pub chunks: HashMap<ChunkId, Chunk>,
    pub documents: HashMap<String, BTreeSet<ChunkId>>,
}

impl Catalog {
    pub fn insert(&mut self, chunk: Chunk) {
        self.documents.entry(chunk.document_id.clone()).or_default().insert(chunk.id.clone());
        self.chunks.insert(chunk.id.clone(), chunk);
    }

    pub fn remove(&mut self, id: &str) -> bool {
        let Some(chunk) = self.chunks.remove(id) else {
            return false;
        };
        if let Some(ids) = self.documents.get_mut(&chunk.document_id) {
            ids.remove(id);
            if ids.is_empty() {
                self.documents.remove(&chunk.document_id);
            }
        }
        true
    }

    pub fn document_chunks(&self, document_id: &str) -> impl Iterator<Item = &ChunkId> {
        self.documents.get(document_id).into_iter().flatten()
    }
}

/// One named collection: its settings, both indexes and the chunk catalog.
///
/// Writers serialize on `writer`; readers only take the catalog read lock and
/// the stores' own read paths, so searches proceed during an upsert.
pub struct Collection<V, S> {
    pub(crate) name: String,
    pub(crate) settings: CollectionSettings,
    pub(crate) vectors: V,
    pub(crate) sparse: S,
    pub(crate) catalog: RwLock<Catalog>,
    pub(crate) writer: tokio::sync::Mutex<()>,
}

impl<V: VectorStore, S: SparseStore> Collection<V, S> {
    pub(crate) fn new(name: &str, settings: CollectionSettings, vectors: V, sparse: S) -> Self {
        Self {
            name: name.to_string(),
            settings,
            vectors,
            sparse,
            catalog: RwLock::new(Catalog::default()),
            writer: tokio::sync::Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &CollectionSettings {
        &self.settings
    }

    pub fn dimension(&self) -> usize {
        self.settings.dimension
    }

    pub fn len(&self) -> usize {
        self.catalog.read().chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn chunk(&self, id: &str) -> Option<Chunk> {
        self.catalog.read().chunks.get(id).cloned()
    }

    pub fn vector_store(&self) -> &V {
        &self.vectors
    }

    pub fn sparse_store(&self) -> &S {
        &self.sparse
    }
}
