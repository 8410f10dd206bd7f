//! The retrieval engine: named collections, the ingest pipeline and the query
//! pipeline.
//!
//! A query moves through `Idle → Embedding → Searching → Fusing →
//! (Reranking) → Done`; any stage may end in `Failed`. Dense and sparse
//! searches run side by side on the blocking pool. When exactly one of them
//! fails the query is answered from the survivor and the response carries a
//! warning; degraded responses are never cached.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use ragdb_core::chunking::{chunk, chunk_semantic, semantic_units, ChunkStrategy, SemanticParams};
use ragdb_core::config::{CollectionSettings, EngineConfig, SearchDefaults};
use ragdb_core::traits::{SparseStore, VectorStore};
use ragdb_core::{
    Chunk, ChunkId, Document, Error, ErrorKind, Filter, IndexEntry, Result, ResultSource, RetrievalResult, SearchHit,
    ValidationError,
};
use ragdb_embed::{EmbeddingService, RetryPolicy};

use crate::cache::{QueryCache, QueryKey};
use crate::collection::{Collection, HnswBm25, StoreFactory};
use crate::fusion::{fuse, single_source, FusedHit, FusionParams};
use crate::rerank::{Reranker, TermOverlapModel};

/// A chunk to store, with its vector when the caller already has one.
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertRecord {
    pub chunk: Chunk,
    pub vector: Option<Vec<f32>>,
}

impl UpsertRecord {
    pub fn new(chunk: Chunk) -> Self {
        Self { chunk, vector: None }
    }

    pub fn with_vector(mut self, vector: Vec<f32>) -> Self {
        self.vector = Some(vector);
        self
    }
}

impl From<Chunk> for UpsertRecord {
    fn from(chunk: Chunk) -> Self {
        Self::new(chunk)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertOptions {
    /// Remove chunks of the touched documents that this batch does not
    /// contain (a document re-chunked into fewer pieces).
    pub replace_documents: bool,
}

/// A record (or document) that was skipped.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkError {
    pub chunk_id: ChunkId,
    pub kind: ErrorKind,
    pub message: String,
}

impl ChunkError {
    fn new(chunk_id: impl Into<ChunkId>, error: &Error) -> Self {
        Self { chunk_id: chunk_id.into(), kind: error.kind(), message: error.to_string() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UpsertResponse {
    pub upserted: usize,
    pub superseded: usize,
    pub errors: Vec<ChunkError>,
    pub fallback_used: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStage {
    Idle,
    Embedding,
    Searching,
    Fusing,
    Reranking,
    Done,
    Failed,
}

impl QueryStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryStage::Idle => "idle",
            QueryStage::Embedding => "embedding",
            QueryStage::Searching => "searching",
            QueryStage::Fusing => "fusing",
            QueryStage::Reranking => "reranking",
            QueryStage::Done => "done",
            QueryStage::Failed => "failed",
        }
    }
}

impl fmt::Display for QueryStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Warning {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResponse {
    pub results: Vec<RetrievalResult>,
    pub warnings: Vec<Warning>,
    pub cached: bool,
    pub fallback_used: bool,
    pub trace: Vec<QueryStage>,
}

impl SearchResponse {
    pub fn is_degraded(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// Query parameters. Unset fields take the engine's [`SearchDefaults`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchRequest {
    pub query: String,
    pub top_k: Option<usize>,
    pub filter: Option<Filter>,
    pub fusion: Option<FusionParams>,
    pub rerank: bool,
    pub score_threshold: Option<f32>,
    pub deadline: Option<Duration>,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self { query: query.into(), ..Self::default() }
    }

    pub fn top_k(mut self, k: usize) -> Self {
        self.top_k = Some(k);
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn fusion(mut self, params: FusionParams) -> Self {
        self.fusion = Some(params);
        self
    }

    pub fn linear(self, alpha: f32) -> Self {
        self.fusion(FusionParams::linear(alpha))
    }

    pub fn rrf(self) -> Self {
        self.fusion(FusionParams::rrf(SearchDefaults::default().rrf_k))
    }

    pub fn rerank(mut self, rerank: bool) -> Self {
        self.rerank = rerank;
        self
    }

    pub fn score_threshold(mut self, threshold: f32) -> Self {
        self.score_threshold = Some(threshold);
        self
    }

    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// A request with defaults applied and validated.
#[derive(Debug, Serialize)]
struct QueryPlan {
    query: String,
    top_k: usize,
    filter: Option<Filter>,
    fusion: FusionParams,
    rerank: bool,
    score_threshold: Option<f32>,
    #[serde(skip)]
    depth: usize,
}

async fn within<T>(deadline: Option<Instant>, stage: QueryStage, fut: impl Future<Output = Result<T>>) -> Result<T> {
    match deadline {
        None => fut.await,
        Some(at) => tokio::time::timeout_at(at, fut).await.map_err(|_| Error::timeout(stage.as_str()))?,
    }
}

fn joined<T>(path: &str, r: std::result::Result<Result<T>, tokio::task::JoinError>) -> Result<T> {
    r.map_err(|e| Error::IndexUnavailable(format!("{path} search task failed: {e}")))?
}

type Coll<F> = Collection<<F as StoreFactory>::Vector, <F as StoreFactory>::Sparse>;

pub struct Engine<F: StoreFactory = HnswBm25> {
    factory: F,
    collections: RwLock<HashMap<String, Arc<Coll<F>>>>,
    embedder: Arc<EmbeddingService>,
    reranker: Option<Reranker>,
    cache: QueryCache<SearchResponse>,
    defaults: SearchDefaults,
}

impl Engine<HnswBm25> {
    /// HNSW + BM25 engine with providers, cache and defaults from configuration.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        config.validate()?;
        let embedder = EmbeddingService::from_settings(&config.embedding, &config.retry, config.collection.dimension)?;
        let reranker = Reranker::new(
            Arc::new(TermOverlapModel::new(config.collection.stemming)),
            RetryPolicy::from(&config.retry),
        );
        Ok(Self::new(HnswBm25, embedder)
            .with_reranker(reranker)
            .with_query_cache(QueryCache::new(
                config.cache.capacity,
                Duration::from_secs(config.cache.cache_ttl_seconds),
            ))
            .with_search_defaults(config.search.clone()))
    }
}

impl<F: StoreFactory> Engine<F> {
    pub fn new(factory: F, embedder: EmbeddingService) -> Self {
        Self {
            factory,
            collections: RwLock::new(HashMap::new()),
            embedder: Arc::new(embedder),
            reranker: None,
            cache: QueryCache::new(10_000, Duration::from_secs(300)),
            defaults: SearchDefaults::default(),
        }
    }

    pub fn with_reranker(mut self, reranker: Reranker) -> Self {
        self.reranker = Some(reranker);
        self
    }

    pub fn with_query_cache(mut self, cache: QueryCache<SearchResponse>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_search_defaults(mut self, defaults: SearchDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn embedder(&self) -> &EmbeddingService {
        &self.embedder
    }

    pub fn query_cache(&self) -> &QueryCache<SearchResponse> {
        &self.cache
    }

    pub fn create_collection(&self, name: &str, settings: CollectionSettings) -> Result<()> {
        if name.trim().is_empty() {
            return Err(Error::invalid_argument("collection name must not be empty"));
        }
        settings.validate()?;
        if settings.dimension != self.embedder.dimension() {
            warn!(
                collection = name,
                collection_dim = settings.dimension,
                embedder_dim = self.embedder.dimension(),
                "embedder dimension differs; records without vectors will be rejected"
            );
        }
        let mut collections = self.collections.write();
        if collections.contains_key(name) {
            return Err(Error::invalid_argument(format!("collection {name} already exists")));
        }
        let vectors = self.factory.vector_store(&settings)?;
        let sparse = self.factory.sparse_store(&settings)?;
        info!(collection = name, dimension = settings.dimension, metric = ?settings.metric, "collection created");
        collections.insert(name.to_string(), Arc::new(Collection::new(name, settings, vectors, sparse)));
        Ok(())
    }

    pub fn drop_collection(&self, name: &str) -> Result<()> {
        self.collections
            .write()
            .remove(name)
            .ok_or_else(|| ValidationError::UnknownCollection(name.to_string()))?;
        self.cache.invalidate(name);
        info!(collection = name, "collection dropped");
        Ok(())
    }

    /// Collection names, sorted.
    pub fn collections(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn collection(&self, name: &str) -> Result<Arc<Coll<F>>> {
        self.collections
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ValidationError::UnknownCollection(name.to_string()).into())
    }

    /// Inserts or replaces chunks by id. Records without a vector are
    /// embedded first; a record that cannot be embedded or has the wrong
    /// dimension is reported in `errors` and the rest still commit.
    #[instrument(skip(self, records), fields(records = records.len()))]
    pub async fn upsert(
        &self,
        collection: &str,
        records: Vec<UpsertRecord>,
        options: UpsertOptions,
    ) -> Result<UpsertResponse> {
        let replace: Vec<String> = if options.replace_documents {
            let mut seen = HashSet::new();
            records
                .iter()
                .filter(|r| seen.insert(r.chunk.document_id.as_str()))
                .map(|r| r.chunk.document_id.clone())
                .collect()
        } else {
            Vec::new()
        };
        self.write(collection, records, &replace).await
    }

    /// Chunks `documents` and upserts the result, superseding chunks left
    /// over from earlier versions of the same documents. A document that
    /// fails to chunk is reported under its id and keeps its old chunks.
    #[instrument(skip(self, documents, strategy), fields(documents = documents.len(), strategy = strategy.name()))]
    pub async fn ingest(
        &self,
        collection: &str,
        documents: &[Document],
        strategy: &ChunkStrategy,
    ) -> Result<UpsertResponse> {
        strategy.validate()?;
        self.collection(collection)?;

        let mut records = Vec::new();
        let mut chunked = Vec::new();
        let mut errors = Vec::new();
        for doc in documents {
            let chunks = match strategy {
                ChunkStrategy::Semantic(params) => self.semantic_chunks(doc, params).await,
                other => chunk(doc, other),
            };
            match chunks {
                Ok(chunks) => {
                    debug!(document = %doc.id, chunks = chunks.len(), "chunked");
                    records.extend(chunks.into_iter().map(UpsertRecord::from));
                    chunked.push(doc.id.clone());
                }
                Err(e) => {
                    warn!(document = %doc.id, error = %e, "document skipped");
                    errors.push(ChunkError::new(doc.id.clone(), &e));
                }
            }
        }

        let mut response = self.write(collection, records, &chunked).await?;
        errors.append(&mut response.errors);
        response.errors = errors;
        Ok(response)
    }

    async fn semantic_chunks(&self, doc: &Document, params: &SemanticParams) -> Result<Vec<Chunk>> {
        let units: Vec<String> = semantic_units(doc).into_iter().map(str::to_string).collect();
        if units.is_empty() {
            return Ok(Vec::new());
        }
        let vectors = self
            .embedder
            .embed_batch(&units)
            .await
            .items
            .into_iter()
            .map(|item| item.map(|e| e.vector))
            .collect::<Result<Vec<_>>>()?;
        chunk_semantic(doc, params, &vectors)
    }

    async fn write(&self, name: &str, records: Vec<UpsertRecord>, replace_documents: &[String]) -> Result<UpsertResponse> {
        let coll = self.collection(name)?;
        let dim = coll.dimension();
        let mut response = UpsertResponse::default();

        // Later records win on duplicate ids.
        let mut seen = HashSet::new();
        let mut records: Vec<UpsertRecord> =
            records.into_iter().rev().filter(|r| seen.insert(r.chunk.id.clone())).collect();
        records.reverse();

        let mut ready: Vec<(Chunk, Vec<f32>)> = Vec::with_capacity(records.len());
        let mut pending: Vec<Chunk> = Vec::new();
        // Documents with a skipped chunk keep their old chunks.
        let mut incomplete: HashSet<String> = HashSet::new();
        for record in records {
            match record.vector {
                _ if record.chunk.id.is_empty() => {
                    response.errors.push(ChunkError::new("", &Error::invalid_argument("chunk id must not be empty")));
                }
                Some(v) if v.len() != dim => {
                    let err: Error = ValidationError::DimensionMismatch { expected: dim, actual: v.len() }.into();
                    incomplete.insert(record.chunk.document_id);
                    response.errors.push(ChunkError::new(record.chunk.id, &err));
                }
                Some(v) => ready.push((record.chunk, v)),
                None => pending.push(record.chunk),
            }
        }

        if !pending.is_empty() {
            let texts: Vec<String> = pending.iter().map(|c| c.text.clone()).collect();
            let batch = self.embedder.embed_batch(&texts).await;
            response.fallback_used = batch.fallback_used;
            if ready.is_empty() && batch.items.iter().all(|i| matches!(i, Err(Error::RetrievalUnavailable(_)))) {
                if let Some(Err(e)) = batch.items.into_iter().next() {
                    warn!(collection = name, error = %e, "no chunk could be embedded");
                    return Err(e);
                }
            } else {
                for (chunk, item) in pending.into_iter().zip(batch.items) {
                    match item {
                        Ok(e) if e.vector.len() != dim => {
                            let err: Error = ValidationError::DimensionMismatch { expected: dim, actual: e.vector.len() }.into();
                            incomplete.insert(chunk.document_id);
                            response.errors.push(ChunkError::new(chunk.id, &err));
                        }
                        Ok(e) => ready.push((chunk, e.vector)),
                        Err(e) => {
                            incomplete.insert(chunk.document_id);
                            response.errors.push(ChunkError::new(chunk.id, &e));
                        }
                    }
                }
            }
        }

        let (chunks, entries): (Vec<Chunk>, Vec<IndexEntry>) = ready
            .into_iter()
            .map(|(chunk, vector)| {
                let entry = IndexEntry::from_chunk(&chunk, vector);
                (chunk, entry)
            })
            .unzip();

        let _writer = coll.writer.lock().await;
        let stale: Vec<ChunkId> = {
            let fresh: HashSet<&str> = chunks.iter().map(|c| c.id.as_str()).collect();
            let catalog = coll.catalog.read();
            replace_documents
                .iter()
                .filter(|doc| !incomplete.contains(doc.as_str()))
                .flat_map(|doc| catalog.document_chunks(doc))
                .filter(|id| !fresh.contains(id.as_str()))
                .cloned()
                .collect()
        };

        let committed = Self::commit(&coll, &entries, &stale);
        if committed.is_ok() {
            let mut catalog = coll.catalog.write();
            for id in &stale {
                catalog.remove(id);
            }
            for chunk in chunks {
                catalog.insert(chunk);
            }
        }
        // Only after the catalog matches the stores: a query that reads the
        // new generation must see the whole batch. Invalidate even on
        // failure since a store may have applied part of it.
        self.cache.invalidate(name);
        committed?;
        response.upserted = entries.len();
        response.superseded = stale.len();
        info!(
            collection = name,
            upserted = response.upserted,
            superseded = response.superseded,
            failed = response.errors.len(),
            fallback_used = response.fallback_used,
            "upsert committed"
        );
        Ok(response)
    }

    fn commit(coll: &Coll<F>, entries: &[IndexEntry], stale: &[ChunkId]) -> Result<()> {
        if !entries.is_empty() {
            coll.vectors.upsert(entries)?;
            coll.sparse.index(entries)?;
        }
        if !stale.is_empty() {
            coll.vectors.delete(stale)?;
            coll.sparse.delete(stale)?;
        }
        Ok(())
    }

    /// Removes chunks by id. Unknown ids are ignored; returns how many were
    /// present.
    #[instrument(skip(self, ids), fields(ids = ids.len()))]
    pub async fn delete(&self, collection: &str, ids: &[ChunkId]) -> Result<usize> {
        let coll = self.collection(collection)?;
        let _writer = coll.writer.lock().await;
        let deleted = coll.vectors.delete(ids).and_then(|_| coll.sparse.delete(ids));
        let removed = match deleted {
            Ok(_) => {
                let mut catalog = coll.catalog.write();
                ids.iter().filter(|id| catalog.remove(id)).count()
            }
            Err(_) => 0,
        };
        self.cache.invalidate(collection);
        deleted?;
        info!(collection, removed, "chunks deleted");
        Ok(removed)
    }

    #[instrument(skip(self, request), fields(top_k = request.top_k, rerank = request.rerank))]
    pub async fn search(&self, collection: &str, request: SearchRequest) -> Result<SearchResponse> {
        let plan = self.plan(request.clone())?;
        let coll = self.collection(collection)?;

        let key = QueryKey::new(collection, &plan)?;
        let generation = self.cache.generation(collection);
        if let Some(mut hit) = self.cache.get(&key) {
            debug!(collection, "query cache hit");
            hit.cached = true;
            return Ok(hit);
        }

        let deadline = request
            .deadline
            .or(self.defaults.deadline_ms.map(Duration::from_millis))
            .map(|d| Instant::now() + d);
        let mut trace = vec![QueryStage::Idle];
        match self.run(&coll, &plan, deadline, &mut trace).await {
            Ok(response) => {
                if !response.is_degraded() {
                    self.cache.put(key, response.clone(), None, generation);
                }
                Ok(response)
            }
            Err(e) => {
                trace.push(QueryStage::Failed);
                warn!(collection, trace = ?trace, error = %e, "query failed");
                Err(e)
            }
        }
    }

    fn plan(&self, request: SearchRequest) -> Result<QueryPlan> {
        if request.query.trim().is_empty() {
            return Err(Error::invalid_argument("query must not be empty"));
        }
        let top_k = request.top_k.unwrap_or(self.defaults.top_k);
        if top_k == 0 {
            return Err(Error::invalid_argument("top_k must be positive"));
        }
        let fusion = request.fusion.unwrap_or_else(|| FusionParams::from(&self.defaults));
        fusion.validate()?;
        if let Some(filter) = &request.filter {
            filter.validate()?;
        }
        let score_threshold = request.score_threshold.or(self.defaults.score_threshold);
        if let Some(t) = score_threshold {
            if !(0.0..=1.0).contains(&t) {
                return Err(Error::invalid_argument(format!("score_threshold must be in [0, 1], got {t}")));
            }
        }
        if request.rerank && self.reranker.is_none() {
            return Err(Error::invalid_argument("rerank requested but no reranker is configured"));
        }
        let depth = if request.rerank { top_k.saturating_mul(self.defaults.rerank_multiplier.max(1)) } else { top_k };
        Ok(QueryPlan {
            query: request.query,
            top_k,
            filter: request.filter,
            fusion,
            rerank: request.rerank,
            score_threshold,
            depth,
        })
    }

    async fn run(
        &self,
        coll: &Arc<Coll<F>>,
        plan: &QueryPlan,
        deadline: Option<Instant>,
        trace: &mut Vec<QueryStage>,
    ) -> Result<SearchResponse> {
        trace.push(QueryStage::Embedding);
        let embedded = within(deadline, QueryStage::Embedding, self.embedder.embed(&plan.query)).await?;
        if embedded.vector.len() != coll.dimension() {
            return Err(ValidationError::DimensionMismatch { expected: coll.dimension(), actual: embedded.vector.len() }
                .into());
        }
        let mut fallback_used = embedded.fallback_used;

        trace.push(QueryStage::Searching);
        let (dense, sparse) = within(deadline, QueryStage::Searching, async {
            Ok(Self::search_paths(coll, embedded.vector, plan).await)
        })
        .await?;

        trace.push(QueryStage::Fusing);
        let mut warnings = Vec::new();
        let fused = match (dense, sparse) {
            (Ok(d), Ok(s)) => fuse(&d, &s, &plan.fusion),
            (Ok(d), Err(e)) => {
                warnings.push(degraded("sparse", &e));
                single_source(&d, ResultSource::Dense)
            }
            (Err(e), Ok(s)) => {
                warnings.push(degraded("dense", &e));
                single_source(&s, ResultSource::Sparse)
            }
            (Err(de), Err(se)) => {
                return Err(Error::IndexUnavailable(format!("dense: {de}; sparse: {se}")));
            }
        };
        let mut results = Self::materialize(coll, fused, plan.depth);

        if plan.rerank {
            if let Some(reranker) = &self.reranker {
                trace.push(QueryStage::Reranking);
                let outcome =
                    within(deadline, QueryStage::Reranking, reranker.rerank(&plan.query, results, plan.top_k)).await?;
                fallback_used |= outcome.fallback_used;
                results = outcome.value;
            }
        }
        results.truncate(plan.top_k);
        if let Some(threshold) = plan.score_threshold {
            results.retain(|r| r.score >= threshold);
        }

        trace.push(QueryStage::Done);
        debug!(results = results.len(), degraded = !warnings.is_empty(), "query done");
        Ok(SearchResponse { results, warnings, cached: false, fallback_used, trace: trace.clone() })
    }

    async fn search_paths(
        coll: &Arc<Coll<F>>,
        vector: Vec<f32>,
        plan: &QueryPlan,
    ) -> (Result<Vec<SearchHit>>, Result<Vec<SearchHit>>) {
        let depth = plan.depth;
        let dense = {
            let coll = Arc::clone(coll);
            let filter = plan.filter.clone();
            tokio::task::spawn_blocking(move || coll.vectors.search(&vector, depth, filter.as_ref()))
        };
        let sparse = {
            let coll = Arc::clone(coll);
            let filter = plan.filter.clone();
            let query = plan.query.clone();
            tokio::task::spawn_blocking(move || coll.sparse.search(&query, depth, filter.as_ref()))
        };
        let (dense, sparse) = tokio::join!(dense, sparse);
        (joined("dense", dense), joined("sparse", sparse))
    }

    /// Attaches chunk text and payload; hits whose chunk was deleted
    /// meanwhile are dropped.
    fn materialize(coll: &Coll<F>, fused: Vec<FusedHit>, limit: usize) -> Vec<RetrievalResult> {
        let catalog = coll.catalog.read();
        fused
            .into_iter()
            .filter_map(|hit| {
                catalog.chunks.get(&hit.id).map(|chunk| RetrievalResult {
                    chunk_id: hit.id,
                    score: hit.score,
                    source: hit.source,
                    text: chunk.text.clone(),
                    payload: chunk.payload(),
                })
            })
            .take(limit)
            .collect()
    }
}

fn degraded(path: &str, error: &Error) -> Warning {
    warn!(path, error = %error, "search path failed, answering from the other");
    Warning { kind: ErrorKind::IndexUnavailable, message: format!("{path} search failed: {error}") }
}
