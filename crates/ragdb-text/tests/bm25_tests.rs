use ragdb_core::traits::SparseStore;
use ragdb_core::{Filter, IndexEntry, Payload};
use ragdb_text::{Analyzer, Bm25Index, Bm25Params};
use serde_json::json;

fn entry(id: &str, text: &str, payload: serde_json::Value) -> IndexEntry {
    IndexEntry {
        id: id.to_string(),
        vector: Vec::new(),
        text: text.to_string(),
        payload: payload.as_object().cloned().unwrap_or_else(Payload::new),
    }
}

fn corpus() -> Bm25Index {
    let index = Bm25Index::default();
    index
        .index(&[
            entry("cats", "cats are mammals", json!({"topic": "animals"})),
            entry("dogs", "dogs are mammals", json!({"topic": "animals"})),
            entry("cars", "cars have engines", json!({"topic": "vehicles"})),
        ])
        .expect("index");
    index
}

#[test]
fn score_matches_formula() {
    let index = Bm25Index::default();
    index.index(&[entry("a", "cat", json!({})), entry("b", "dog", json!({}))]).expect("index");
    let hits = index.search("cat", 10, None).expect("search");
    assert_eq!(hits.len(), 1);
    // N=2, df=1, tf=1, |d|=avgdl: idf = ln(1.5/1.5 + 1), tf part = 1.
    assert!((hits[0].score - 2f32.ln()).abs() < 1e-5, "score={}", hits[0].score);
}

#[test]
fn shorter_document_wins_on_equal_tf() {
    let index = Bm25Index::default();
    index
        .index(&[
            entry("short", "rust compiler", json!({})),
            entry("long", "rust compiler borrow checker lifetimes traits generics macros", json!({})),
        ])
        .expect("index");
    let hits = index.search("borrow rust", 10, None).expect("search");
    assert_eq!(hits[0].id, "long", "only the long doc has 'borrow'");
    let hits = index.search("rust", 10, None).expect("search");
    assert_eq!(hits[0].id, "short");
    assert!(hits[0].score > hits[1].score);
}

#[test]
fn length_normalization_can_be_disabled() {
    let index = Bm25Index::new(Bm25Params { k1: 1.2, b: 0.0 }, Analyzer::default());
    index
        .index(&[entry("short", "rust", json!({})), entry("long", "rust borrow checker", json!({}))])
        .expect("index");
    let hits = index.search("rust", 10, None).expect("search");
    assert!((hits[0].score - hits[1].score).abs() < 1e-6);
    assert_eq!(hits[0].id, "long", "ties break by id");
}

#[test]
fn unknown_and_stop_word_queries_return_nothing() {
    let index = corpus();
    assert!(index.search("zeppelin", 10, None).expect("search").is_empty());
    assert!(index.search("the are", 10, None).expect("search").is_empty());
    let mixed = index.search("zeppelin mammals", 10, None).expect("search");
    assert_eq!(mixed.len(), 2);
}

#[test]
fn repeated_query_terms_count_once() {
    let index = corpus();
    let once = index.search("engines", 10, None).expect("search");
    let twice = index.search("engines engines", 10, None).expect("search");
    assert_eq!(once, twice);
}

#[test]
fn filter_restricts_candidates() {
    let index = corpus();
    let filter = Filter::eq("topic", "vehicles");
    let hits = index.search("mammals engines", 10, Some(&filter)).expect("search");
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, "cars");
}

#[test]
fn delete_is_idempotent() {
    let index = corpus();
    assert_eq!(index.delete(&["cats".to_string()]).expect("delete"), 1);
    assert_eq!(index.delete(&["cats".to_string()]).expect("delete again"), 0);
    assert_eq!(index.len(), 2);
    let hits = index.search("mammals", 10, None).expect("search");
    assert!(hits.iter().all(|h| h.id != "cats"));
}
