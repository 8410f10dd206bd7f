use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use ragdb_core::chunking::{ChunkStrategy, SemanticParams};
use ragdb_core::config::{CollectionSettings, Metric};
use ragdb_core::traits::{EmbeddingProvider, ExternalService, SparseStore, VectorStore};
use ragdb_core::{Chunk, ChunkId, Document, Error, Filter, IndexEntry, Payload, Result, ResultSource, SearchHit};
use ragdb_embed::{EmbeddingService, RetryPolicy};
use ragdb_hybrid::{
    Engine, FlatBm25, HnswBm25, QueryStage, Reranker, SearchRequest, StoreFactory, TermOverlapModel, UpsertOptions,
    UpsertRecord,
};
use ragdb_text::Bm25Index;
use ragdb_vector::FlatIndex;

const DIM: usize = 8;

/// Maps words onto a handful of concept axes so that "feline" lands near
/// "cats" without sharing a token. Unknown words add a little noise.
struct Concepts {
    model: &'static str,
    fail: bool,
    /// Rejects any batch containing this word, permanently.
    reject: Option<&'static str>,
    batch: usize,
    delay: Duration,
    calls: AtomicUsize,
}

impl Concepts {
    fn new(model: &'static str) -> Self {
        Self { model, fail: false, reject: None, batch: 64, delay: Duration::ZERO, calls: AtomicUsize::new(0) }
    }

    fn rejecting(word: &'static str) -> Self {
        Self { reject: Some(word), batch: 1, ..Self::new("picky") }
    }

    fn failing(model: &'static str) -> Self {
        Self { fail: true, ..Self::new(model) }
    }

    fn slow(delay: Duration) -> Self {
        Self { delay, ..Self::new("slow") }
    }

    fn axis(word: &str) -> (usize, f32) {
        let w = word.trim_end_matches('s');
        match w {
            "cat" | "feline" | "kitten" => (0, 1.0),
            "dog" | "puppy" | "canine" => (1, 1.0),
            "car" | "engine" | "vehicle" => (2, 1.0),
            "mammal" | "animal" => (3, 1.0),
            other => (4 + other.len() % 4, 0.1),
        }
    }

    fn vector(text: &str) -> Vec<f32> {
        let mut v = vec![0.0; DIM];
        for word in text.split_whitespace() {
            let word: String = word.chars().filter(|c| c.is_alphabetic()).flat_map(char::to_lowercase).collect();
            if word.is_empty() {
                continue;
            }
            let (axis, weight) = Self::axis(&word);
            v[axis] += weight;
        }
        v
    }
}

impl ExternalService for Concepts {
    fn name(&self) -> &str {
        self.model
    }
}

#[async_trait]
impl EmbeddingProvider for Concepts {
    fn model_id(&self) -> &str {
        self.model
    }

    fn dimension(&self) -> usize {
        DIM
    }

    fn max_batch_size(&self) -> usize {
        self.batch
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            return Err(Error::provider(self.model, "503 service unavailable", true));
        }
        if let Some(word) = self.reject {
            if texts.iter().any(|t| t.contains(word)) {
                return Err(Error::provider(self.model, "400 input rejected", false));
            }
        }
        Ok(texts.iter().map(|t| Self::vector(t)).collect())
    }
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 2,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(2),
        call_timeout: Duration::from_secs(2),
        ..RetryPolicy::default()
    }
}

fn settings() -> CollectionSettings {
    CollectionSettings { dimension: DIM, metric: Metric::Cosine, ..CollectionSettings::default() }
}

fn animal_chunks() -> Vec<UpsertRecord> {
    ["cats are mammals", "dogs are mammals", "cars have engines"]
        .iter()
        .map(|text| {
            let doc = text.split_whitespace().next().unwrap_or_default();
            let kind = if doc == "cars" { "machine" } else { "animal" };
            let meta = json!({ "kind": kind }).as_object().cloned().unwrap_or_default();
            UpsertRecord::new(Chunk::new(doc, 0, *text, meta))
        })
        .collect()
}

async fn engine_with<F: StoreFactory>(factory: F, service: EmbeddingService) -> Engine<F> {
    let engine = Engine::new(factory, service)
        .with_reranker(Reranker::new(Arc::new(TermOverlapModel::default()), fast_retry()));
    engine.create_collection("docs", settings()).unwrap();
    let response = engine.upsert("docs", animal_chunks(), UpsertOptions::default()).await.unwrap();
    assert_eq!(response.upserted, 3);
    engine
}

async fn animals() -> Engine<HnswBm25> {
    engine_with(HnswBm25, EmbeddingService::new(Arc::new(Concepts::new("concepts")), fast_retry())).await
}

fn ids(response: &ragdb_hybrid::SearchResponse) -> Vec<&str> {
    response.results.iter().map(|r| r.chunk_id.as_str()).collect()
}

#[tokio::test]
async fn dense_heavy_linear_fusion_finds_synonyms() {
    let engine = animals().await;
    let response = engine.search("docs", SearchRequest::new("feline animal").linear(0.8)).await.unwrap();
    assert_eq!(response.results[0].chunk_id, "cats:0");
    assert_eq!(response.results[0].source, ResultSource::Fused);
    assert_eq!(response.results[0].text, "cats are mammals");
    assert_eq!(response.results[0].payload["document_id"], "cats");
}

#[tokio::test]
async fn rrf_ranks_both_mammals_above_cars() {
    let engine = animals().await;
    let response = engine.search("docs", SearchRequest::new("mammals").rrf()).await.unwrap();
    let order = ids(&response);
    let pos = |id: &str| order.iter().position(|x| *x == id).unwrap_or(usize::MAX);
    assert!(pos("cats:0") < pos("cars:0"), "{order:?}");
    assert!(pos("dogs:0") < pos("cars:0"), "{order:?}");
    assert!(response.results.iter().all(|r| (0.0..=1.0).contains(&r.score)));
    assert_eq!(
        response.trace,
        vec![QueryStage::Idle, QueryStage::Embedding, QueryStage::Searching, QueryStage::Fusing, QueryStage::Done]
    );
}

#[tokio::test]
async fn upsert_uses_fallback_when_primary_always_fails() {
    let primary = Arc::new(Concepts::failing("primary"));
    let service = EmbeddingService::new(primary.clone(), fast_retry()).with_fallback(Arc::new(Concepts::new("backup")));
    let engine = Engine::new(FlatBm25, service);
    engine.create_collection("docs", settings()).unwrap();

    let response = engine.upsert("docs", animal_chunks(), UpsertOptions::default()).await.unwrap();
    assert_eq!(response.upserted, 3);
    assert!(response.fallback_used);
    assert!(response.errors.is_empty());
    assert_eq!(primary.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn upsert_without_any_provider_is_unavailable() {
    let service = EmbeddingService::new(Arc::new(Concepts::failing("primary")), fast_retry());
    let engine = Engine::new(FlatBm25, service);
    engine.create_collection("docs", settings()).unwrap();
    let err = engine.upsert("docs", animal_chunks(), UpsertOptions::default()).await.unwrap_err();
    assert!(matches!(err, Error::RetrievalUnavailable(_)), "{err:?}");
}

#[tokio::test]
async fn high_threshold_returns_empty_not_error() {
    let engine = animals().await;
    // No lexical match, so the best RRF score is a single first place: 0.5.
    let base = engine.search("docs", SearchRequest::new("feline").rrf()).await.unwrap();
    assert!((base.results[0].score - 0.5).abs() < 1e-6);

    let response = engine.search("docs", SearchRequest::new("feline").rrf().score_threshold(0.9)).await.unwrap();
    assert!(response.results.is_empty());
}

#[tokio::test]
async fn delete_is_idempotent_and_hides_results() {
    let engine = animals().await;
    let ids_to_delete: Vec<ChunkId> = vec!["cats:0".into()];
    assert_eq!(engine.delete("docs", &ids_to_delete).await.unwrap(), 1);
    assert_eq!(engine.delete("docs", &ids_to_delete).await.unwrap(), 0);

    let response = engine.search("docs", SearchRequest::new("cats mammals")).await.unwrap();
    assert!(!ids(&response).contains(&"cats:0"));
}

#[tokio::test]
async fn fresh_upsert_is_visible_and_invalidates_cache() {
    let engine = animals().await;
    let request = SearchRequest::new("zebra").linear(0.5);
    let first = engine.search("docs", request.clone()).await.unwrap();
    assert!(!first.cached);
    let second = engine.search("docs", request.clone()).await.unwrap();
    assert!(second.cached);
    assert_eq!(second.results, first.results);

    let zebra = UpsertRecord::new(Chunk::new("zebra", 0, "zebra stripes", Payload::new()));
    engine.upsert("docs", vec![zebra], UpsertOptions::default()).await.unwrap();

    let third = engine.search("docs", request).await.unwrap();
    assert!(!third.cached);
    assert_eq!(third.results[0].chunk_id, "zebra:0");
}

#[tokio::test]
async fn filters_restrict_results() {
    let engine = animals().await;
    let response = engine
        .search("docs", SearchRequest::new("mammals engines").filter(Filter::eq("kind", "machine")))
        .await
        .unwrap();
    assert_eq!(ids(&response), vec!["cars:0"]);

    let malformed = Filter::between("kind", Some(5.0), Some(1.0));
    let err = engine.search("docs", SearchRequest::new("x").filter(malformed)).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[tokio::test]
async fn rerank_reorders_the_shortlist() {
    let engine = animals().await;
    let response = engine.search("docs", SearchRequest::new("dogs mammals").top_k(2).rerank(true)).await.unwrap();
    assert_eq!(response.results.len(), 2);
    assert_eq!(response.results[0].chunk_id, "dogs:0");
    assert!(response.results.iter().all(|r| r.source == ResultSource::Reranked));
    assert!(response.trace.contains(&QueryStage::Reranking));
}

#[tokio::test]
async fn request_validation() {
    let engine = animals().await;
    assert!(matches!(
        engine.search("docs", SearchRequest::new("cats").top_k(0)).await,
        Err(Error::Validation(_))
    ));
    assert!(matches!(
        engine.search("nope", SearchRequest::new("cats")).await,
        Err(Error::Validation(ragdb_core::ValidationError::UnknownCollection(_)))
    ));
    assert!(matches!(engine.search("docs", SearchRequest::new("cats").linear(2.0)).await, Err(Error::Validation(_))));
    assert!(engine.create_collection("docs", settings()).is_err());
}

#[tokio::test]
async fn huge_top_k_with_rerank_is_not_an_overflow() {
    let engine = animals().await;
    let response = engine.search("docs", SearchRequest::new("cats").top_k(usize::MAX).rerank(true)).await.unwrap();
    assert_eq!(response.results.len(), 3);
}

#[tokio::test]
async fn wrong_dimension_records_are_reported_not_fatal() {
    let engine = animals().await;
    let good = UpsertRecord::new(Chunk::new("ok", 0, "kitten", Payload::new()));
    let bad = UpsertRecord::new(Chunk::new("bad", 0, "x", Payload::new())).with_vector(vec![1.0; 3]);
    let response = engine.upsert("docs", vec![good, bad], UpsertOptions::default()).await.unwrap();
    assert_eq!(response.upserted, 1);
    assert_eq!(response.errors.len(), 1);
    assert_eq!(response.errors[0].chunk_id, "bad:0");
    assert_eq!(response.errors[0].kind, ragdb_core::ErrorKind::Validation);
}

#[tokio::test]
async fn deadline_aborts_with_timeout() {
    let service = EmbeddingService::new(Arc::new(Concepts::slow(Duration::from_millis(300))), fast_retry());
    let engine = Engine::new(FlatBm25, service);
    engine.create_collection("docs", settings()).unwrap();
    let err = engine
        .search("docs", SearchRequest::new("cats").deadline(Duration::from_millis(20)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout { ref stage } if stage == "embedding"), "{err:?}");
}

#[tokio::test]
async fn ingest_supersedes_stale_chunks() {
    let engine = animals().await;
    let strategy = ChunkStrategy::Recursive { size: 20, overlap: 0 };
    let long = Document::new("cats purr softly. kittens nap often. felines hunt mice.").with_id("notes");
    let first = engine.ingest("docs", &[long], &strategy).await.unwrap();
    assert!(first.upserted >= 2, "{first:?}");

    let short = Document::new("cats purr.").with_id("notes");
    let second = engine.ingest("docs", &[short], &strategy).await.unwrap();
    assert_eq!(second.upserted, 1);
    assert_eq!(second.superseded, first.upserted - 1);
    assert_eq!(engine.collection("docs").unwrap().len(), 3 + 1);
}

#[tokio::test]
async fn reingest_keeps_old_chunks_of_a_partly_failed_document() {
    let service = EmbeddingService::new(Arc::new(Concepts::rejecting("poison")), fast_retry());
    let engine = Engine::new(FlatBm25, service);
    engine.create_collection("docs", settings()).unwrap();
    let strategy = ChunkStrategy::Recursive { size: 20, overlap: 0 };

    let original = Document::new("cats purr softly. kittens nap often.").with_id("notes");
    engine.ingest("docs", &[original], &strategy).await.unwrap();
    let coll = engine.collection("docs").unwrap();
    assert!(coll.chunk("notes:1").unwrap().text.contains("kittens"));

    let edited = Document::new("cats purr softly. poison ivy grows.").with_id("notes");
    let response = engine.ingest("docs", &[edited], &strategy).await.unwrap();
    assert_eq!(response.upserted, 1);
    assert_eq!(response.superseded, 0);
    assert_eq!(response.errors.len(), 1);
    assert_eq!(response.errors[0].chunk_id, "notes:1");

    assert!(coll.chunk("notes:1").unwrap().text.contains("kittens"));
    let hits = engine.search("docs", SearchRequest::new("kittens")).await.unwrap();
    assert!(ids(&hits).contains(&"notes:1"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_searches_never_cache_a_half_applied_write() {
    let engine = Arc::new(animals().await);
    let stop = Arc::new(AtomicBool::new(false));
    let request = SearchRequest::new("zebra stripes").linear(0.5);

    let readers: Vec<_> = (0..3)
        .map(|_| {
            let engine = Arc::clone(&engine);
            let stop = Arc::clone(&stop);
            let request = request.clone();
            tokio::spawn(async move {
                let mut served = 0usize;
                loop {
                    engine.search("docs", request.clone()).await.unwrap();
                    served += 1;
                    if stop.load(Ordering::SeqCst) {
                        return served;
                    }
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();

    for round in 0..25 {
        let doc = format!("zebra{round}");
        let id: ChunkId = format!("{doc}:0");
        let record = UpsertRecord::new(Chunk::new(&doc, 0, "zebra stripes", Payload::new()));
        engine.upsert("docs", vec![record], UpsertOptions::default()).await.unwrap();
        let after = engine.search("docs", request.clone()).await.unwrap();
        assert!(ids(&after).contains(&id.as_str()), "round {round}: {:?} cached={}", ids(&after), after.cached);

        engine.delete("docs", &[id.clone()]).await.unwrap();
        let gone = engine.search("docs", request.clone()).await.unwrap();
        assert!(!ids(&gone).contains(&id.as_str()), "round {round}: {:?} cached={}", ids(&gone), gone.cached);
    }

    stop.store(true, Ordering::SeqCst);
    for reader in readers {
        assert!(reader.await.unwrap() > 0);
    }
}

#[tokio::test]
async fn semantic_ingest_splits_on_topic_change() {
    let engine = animals().await;
    let strategy = ChunkStrategy::Semantic(SemanticParams { size: 500, threshold: 0.5, min_chunk_size: 1 });
    let doc = Document::new("Cats are mammals. Kittens are feline. Cars have engines.").with_id("mixed");
    let response = engine.ingest("docs", &[doc], &strategy).await.unwrap();
    assert_eq!(response.upserted, 2);
    let coll = engine.collection("docs").unwrap();
    let second = coll.chunk("mixed:1").unwrap();
    assert!(second.text.starts_with("Cars"));
}

/// Wraps a store and fails every operation when `broken`.
struct Flaky<T> {
    inner: T,
    broken: bool,
}

impl<T> Flaky<T> {
    fn fail<R>(&self) -> Result<R> {
        Err(Error::IndexUnavailable("store offline".into()))
    }
}

impl<T: VectorStore> VectorStore for Flaky<T> {
    fn dim(&self) -> usize {
        self.inner.dim()
    }

    fn len(&self) -> usize {
        self.inner.len()
    }

    fn upsert(&self, entries: &[IndexEntry]) -> Result<()> {
        self.inner.upsert(entries)
    }

    fn search(&self, query: &[f32], k: usize, filter: Option<&Filter>) -> Result<Vec<SearchHit>> {
        if self.broken {
            return self.fail();
        }
        self.inner.search(query, k, filter)
    }

    fn delete(&self, ids: &[ChunkId]) -> Result<usize> {
        self.inner.delete(ids)
    }
}

impl<T: SparseStore> SparseStore for Flaky<T> {
    fn len(&self) -> usize {
        self.inner.len()
    }

    fn index(&self, entries: &[IndexEntry]) -> Result<()> {
        self.inner.index(entries)
    }

    fn search(&self, query: &str, k: usize, filter: Option<&Filter>) -> Result<Vec<SearchHit>> {
        if self.broken {
            return self.fail();
        }
        self.inner.search(query, k, filter)
    }

    fn delete(&self, ids: &[ChunkId]) -> Result<usize> {
        self.inner.delete(ids)
    }
}

struct Broken {
    dense: bool,
    sparse: bool,
}

impl StoreFactory for Broken {
    type Vector = Flaky<FlatIndex>;
    type Sparse = Flaky<Bm25Index>;

    fn vector_store(&self, settings: &CollectionSettings) -> Result<Self::Vector> {
        Ok(Flaky { inner: FlatIndex::new(settings.dimension, settings.metric)?, broken: self.dense })
    }

    fn sparse_store(&self, _settings: &CollectionSettings) -> Result<Self::Sparse> {
        Ok(Flaky { inner: Bm25Index::default(), broken: self.sparse })
    }
}

fn concepts() -> EmbeddingService {
    EmbeddingService::new(Arc::new(Concepts::new("concepts")), fast_retry())
}

#[tokio::test]
async fn failed_dense_path_degrades_to_sparse() {
    let engine = engine_with(Broken { dense: true, sparse: false }, concepts()).await;
    let request = SearchRequest::new("mammals");
    let response = engine.search("docs", request.clone()).await.unwrap();

    assert!(response.is_degraded());
    assert_eq!(response.warnings[0].kind, ragdb_core::ErrorKind::IndexUnavailable);
    assert!(response.results.iter().all(|r| r.source == ResultSource::Sparse));
    assert_eq!(response.results.len(), 2);
    assert!(!engine.search("docs", request).await.unwrap().cached, "degraded answers are not cached");
}

#[tokio::test]
async fn both_paths_down_fails_the_query() {
    let engine = engine_with(Broken { dense: true, sparse: true }, concepts()).await;
    let err = engine.search("docs", SearchRequest::new("mammals")).await.unwrap_err();
    assert!(matches!(err, Error::IndexUnavailable(_)));
}

#[tokio::test]
async fn collections_are_listed_and_dropped() {
    let engine = animals().await;
    engine.create_collection("other", settings()).unwrap();
    assert_eq!(engine.collections(), vec!["docs".to_string(), "other".to_string()]);
    engine.drop_collection("other").unwrap();
    assert!(engine.drop_collection("other").is_err());
    assert_eq!(engine.collections(), vec!["docs".to_string()]);
}
