use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;

use ragdb_core::traits::VectorStore;
use ragdb_core::{Error, Filter, IndexEntry, Payload, ValidationError};
use ragdb_vector::{FlatIndex, HnswIndex, HnswParams, Metric, Quantization};

const DIM: usize = 32;

fn random_entries(n: usize, dim: usize, seed: u64) -> Vec<IndexEntry> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|i| IndexEntry {
            id: format!("v{i}"),
            vector: (0..dim).map(|_| rng.gen_range(-1.0f32..1.0)).collect(),
            text: String::new(),
            payload: json!({"bucket": i % 10}).as_object().cloned().unwrap_or_else(Payload::new),
        })
        .collect()
}

fn queries(n: usize, dim: usize) -> Vec<Vec<f32>> {
    let mut rng = StdRng::seed_from_u64(999);
    (0..n).map(|_| (0..dim).map(|_| rng.gen_range(-1.0f32..1.0)).collect()).collect()
}

fn recall(approx: &dyn VectorStore, exact: &dyn VectorStore, k: usize, filter: Option<&Filter>) -> f32 {
    let qs = queries(30, approx.dim());
    let mut found = 0;
    let mut total = 0;
    for q in &qs {
        let truth: HashSet<String> = exact.search(q, k, filter).unwrap().into_iter().map(|h| h.id).collect();
        let got = approx.search(q, k, filter).unwrap();
        found += got.iter().filter(|h| truth.contains(&h.id)).count();
        total += truth.len();
    }
    found as f32 / total.max(1) as f32
}

fn build(params: HnswParams, dim: usize) -> (HnswIndex, FlatIndex) {
    let entries = random_entries(500, dim, 1);
    let hnsw = HnswIndex::new(dim, params).unwrap();
    hnsw.upsert(&entries).unwrap();
    let flat = FlatIndex::new(dim, Metric::Cosine).unwrap();
    flat.upsert(&entries).unwrap();
    (hnsw, flat)
}

#[test]
fn recall_at_10_against_exact() {
    let (hnsw, flat) = build(HnswParams::default(), DIM);
    let r = recall(&hnsw, &flat, 10, None);
    assert!(r >= 0.9, "recall@10 = {r}");
}

#[test]
fn scalar_quantization_rescoring_keeps_recall() {
    let params = HnswParams { quantization: Quantization::Scalar, ..HnswParams::default() };
    let (hnsw, flat) = build(params, DIM);
    let r = recall(&hnsw, &flat, 10, None);
    assert!(r >= 0.85, "scalar recall@10 = {r}");
    let stats = hnsw.stats();
    assert!(stats.code_bytes * 3 < stats.vector_bytes, "{stats:?}");
}

#[test]
fn binary_quantization_with_oversampling() {
    let params = HnswParams { quantization: Quantization::Binary, oversample: 12, ef_search: 128, ..HnswParams::default() };
    let (hnsw, flat) = build(params, 64);
    let r = recall(&hnsw, &flat, 10, None);
    assert!(r >= 0.5, "binary recall@10 = {r}");
}

#[test]
fn huge_k_with_oversampling_returns_everything() {
    let params = HnswParams { quantization: Quantization::Scalar, oversample: 8, ..HnswParams::default() };
    let index = HnswIndex::new(DIM, params).unwrap();
    index.upsert(&random_entries(50, DIM, 5)).unwrap();
    let hits = index.search(&queries(1, DIM)[0], usize::MAX, None).unwrap();
    assert_eq!(hits.len(), 50);
}

#[test]
fn scores_are_sorted_and_bounded() {
    let (hnsw, _) = build(HnswParams::default(), DIM);
    let hits = hnsw.search(&queries(1, DIM)[0], 20, None).unwrap();
    assert_eq!(hits.len(), 20);
    for pair in hits.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }
    assert!(hits.iter().all(|h| (0.0..=1.0).contains(&h.score)));
}

#[test]
fn selective_filter_matches_exact_results() {
    let (hnsw, flat) = build(HnswParams::default(), DIM);
    let filter = Filter::eq("bucket", 3);
    for q in queries(5, DIM) {
        let got: Vec<String> = hnsw.search(&q, 10, Some(&filter)).unwrap().into_iter().map(|h| h.id).collect();
        let want: Vec<String> = flat.search(&q, 10, Some(&filter)).unwrap().into_iter().map(|h| h.id).collect();
        assert_eq!(got, want, "pre-filtered search is exact");
    }
}

#[test]
fn broad_filter_is_applied_during_traversal() {
    let (hnsw, flat) = build(HnswParams::default(), DIM);
    let filter = Filter::between("bucket", None, Some(6.0));
    let hits = hnsw.search(&queries(1, DIM)[0], 10, Some(&filter)).unwrap();
    assert_eq!(hits.len(), 10);
    for h in &hits {
        let n: usize = h.id.trim_start_matches('v').parse().unwrap();
        assert!(n % 10 <= 6, "{} does not match", h.id);
    }
    assert!(recall(&hnsw, &flat, 10, Some(&filter)) >= 0.85);
}

#[test]
fn wrong_dimension_is_rejected() {
    let hnsw = HnswIndex::new(4, HnswParams::default()).unwrap();
    let bad = IndexEntry { id: "x".into(), vector: vec![1.0; 3], text: String::new(), payload: Payload::new() };
    let err = hnsw.upsert(&[bad]).unwrap_err();
    assert!(matches!(err, Error::Validation(ValidationError::DimensionMismatch { expected: 4, actual: 3 })));
    assert!(hnsw.search(&[1.0; 5], 1, None).is_err());
    assert!(hnsw.is_empty());
}

#[test]
fn upsert_replaces_and_delete_is_idempotent() {
    let hnsw = HnswIndex::new(2, HnswParams { metric: Metric::Euclidean, ..HnswParams::default() }).unwrap();
    let e = |id: &str, v: [f32; 2]| IndexEntry { id: id.into(), vector: v.to_vec(), text: String::new(), payload: Payload::new() };
    hnsw.upsert(&[e("a", [0.0, 0.0]), e("b", [10.0, 10.0])]).unwrap();
    hnsw.upsert(&[e("a", [20.0, 20.0])]).unwrap();
    assert_eq!(hnsw.len(), 2);
    assert_eq!(hnsw.search(&[19.0, 19.0], 1, None).unwrap()[0].id, "a");
    assert_eq!(hnsw.search(&[0.0, 0.0], 1, None).unwrap()[0].id, "b");

    assert_eq!(hnsw.delete(&["a".to_string()]).unwrap(), 1);
    assert_eq!(hnsw.delete(&["a".to_string()]).unwrap(), 0);
    let hits = hnsw.search(&[20.0, 20.0], 5, None).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, "b");
}

#[test]
fn readers_run_during_writes() {
    let index = Arc::new(HnswIndex::new(DIM, HnswParams::default()).unwrap());
    let entries = random_entries(300, DIM, 5);
    let writer = {
        let index = Arc::clone(&index);
        thread::spawn(move || {
            for batch in entries.chunks(20) {
                index.upsert(batch).unwrap();
            }
        })
    };
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let index = Arc::clone(&index);
            thread::spawn(move || {
                for q in queries(50, DIM) {
                    let hits = index.search(&q, 5, None).unwrap();
                    assert!(hits.len() <= 5);
                }
            })
        })
        .collect();
    writer.join().unwrap();
    for r in readers {
        r.join().unwrap();
    }
    assert_eq!(index.len(), 300);
}
