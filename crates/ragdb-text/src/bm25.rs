//! In-memory BM25 inverted index.
//!
//! Score of a chunk `d` for query terms `t`:
//!
//! ```text
//! Σ IDF(t) · tf·(k1+1) / (tf + k1·(1 − b + b·|d|/avgdl))
//! IDF(t) = ln((N − df + 0.5) / (df + 0.5) + 1)
//! ```
//!
//! Query terms are deduplicated and terms outside the vocabulary contribute
//! nothing. Readers share a read lock; `index`/`delete` take the write lock
//! only after tokenizing, so searches are never held up by analysis.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use tracing::{debug, instrument};

use ragdb_core::traits::SparseStore;
use ragdb_core::{ChunkId, Filter, IndexEntry, Payload, ResultSource, Result, SearchHit};

use crate::analyzer::Analyzer;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bm25Params {
    /// Term-frequency saturation.
    pub k1: f32,
    /// Length normalization, 0 disables it.
    pub b: f32,
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self { k1: 1.2, b: 0.75 }
    }
}

struct DocRecord {
    id: ChunkId,
    len: u32,
    terms: Vec<String>,
    payload: Payload,
}

#[derive(Default)]
struct Inner {
    slots: HashMap<ChunkId, u32>,
    docs: Vec<Option<DocRecord>>,
    free: Vec<u32>,
    /// term -> slot -> term frequency
    postings: HashMap<String, HashMap<u32, u32>>,
    total_len: u64,
}

impl Inner {
    fn live(&self) -> usize {
        self.slots.len()
    }

    fn remove(&mut self, id: &str) -> bool {
        let Some(slot) = self.slots.remove(id) else {
            return false;
        };
        if let Some(record) = self.docs[slot as usize].take() {
            self.total_len -= u64::from(record.len);
            for term in &record.terms {
                if let Some(list) = self.postings.get_mut(term) {
                    list.remove(&slot);
                    if list.is_empty() {
                        self.postings.remove(term);
                    }
                }
            }
        }
        self.free.push(slot);
        true
    }

    fn insert(&mut self, id: ChunkId, tokens: Vec<String>, payload: Payload) {
        let mut tf: HashMap<String, u32> = HashMap::new();
        for t in &tokens {
            *tf.entry(t.clone()).or_insert(0) += 1;
        }
        let len = u32::try_from(tokens.len()).unwrap_or(u32::MAX);
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                self.docs.push(None);
                u32::try_from(self.docs.len() - 1).unwrap_or(u32::MAX)
            }
        };
        for (term, count) in &tf {
            self.postings.entry(term.clone()).or_default().insert(slot, *count);
        }
        self.total_len += u64::from(len);
        self.slots.insert(id.clone(), slot);
        self.docs[slot as usize] = Some(DocRecord { id, len, terms: tf.into_keys().collect(), payload });
    }
}

pub struct Bm25Index {
    analyzer: Analyzer,
    params: Bm25Params,
    inner: RwLock<Inner>,
}

impl Bm25Index {
    pub fn new(params: Bm25Params, analyzer: Analyzer) -> Self {
        Self { analyzer, params, inner: RwLock::new(Inner::default()) }
    }

    pub fn params(&self) -> Bm25Params {
        self.params
    }

    pub fn doc_freq(&self, term: &str) -> usize {
        self.inner.read().postings.get(term).map_or(0, HashMap::len)
    }

    pub fn avg_doc_len(&self) -> f32 {
        let inner = self.inner.read();
        if inner.live() == 0 {
            return 0.0;
        }
        inner.total_len as f32 / inner.live() as f32
    }

    /// IDF(t) = ln((N - df + 0.5) / (df + 0.5) + 1)
    pub fn compute_idf(&self, term: &str) -> f32 {
        let inner = self.inner.read();
        idf(inner.live(), inner.postings.get(term).map_or(0, HashMap::len))
    }
}

impl Default for Bm25Index {
    fn default() -> Self {
        Self::new(Bm25Params::default(), Analyzer::default())
    }
}

fn idf(n: usize, df: usize) -> f32 {
    let n = n as f32;
    let df = df as f32;
    ((n - df + 0.5) / (df + 0.5) + 1.0).ln()
}

impl SparseStore for Bm25Index {
    fn len(&self) -> usize {
        self.inner.read().live()
    }

    fn index(&self, entries: &[IndexEntry]) -> Result<()> {
        let analyzed: Vec<(ChunkId, Vec<String>, Payload)> = entries
            .iter()
            .map(|e| (e.id.clone(), self.analyzer.tokens(&e.text), e.payload.clone()))
            .collect();
        let mut inner = self.inner.write();
        for (id, tokens, payload) in analyzed {
            inner.remove(&id);
            inner.insert(id, tokens, payload);
        }
        debug!(indexed = entries.len(), live = inner.live(), "bm25 index updated");
        Ok(())
    }

    #[instrument(level = "debug", skip(self, filter), fields(filtered = filter.is_some()))]
    fn search(&self, query: &str, k: usize, filter: Option<&Filter>) -> Result<Vec<SearchHit>> {
        let mut seen = HashSet::new();
        let terms: Vec<String> = self.analyzer.tokens(query).into_iter().filter(|t| seen.insert(t.clone())).collect();
        if terms.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        let Bm25Params { k1, b } = self.params;
        let inner = self.inner.read();
        let n = inner.live();
        if n == 0 {
            return Ok(Vec::new());
        }
        let avgdl = (inner.total_len as f32 / n as f32).max(1.0);

        let mut admitted: HashMap<u32, bool> = HashMap::new();
        let mut scores: HashMap<u32, f32> = HashMap::new();
        for term in &terms {
            let Some(list) = inner.postings.get(term) else {
                continue;
            };
            let term_idf = idf(n, list.len());
            for (&slot, &tf) in list {
                let Some(record) = inner.docs[slot as usize].as_ref() else {
                    continue;
                };
                let ok = *admitted.entry(slot).or_insert_with(|| filter.map_or(true, |f| f.matches(&record.payload)));
                if !ok {
                    continue;
                }
                let tf = tf as f32;
                let norm = 1.0 - b + b * record.len as f32 / avgdl;
                *scores.entry(slot).or_insert(0.0) += term_idf * tf * (k1 + 1.0) / (tf + k1 * norm);
            }
        }

        let mut hits: Vec<SearchHit> = scores
            .into_iter()
            .filter_map(|(slot, score)| {
                inner.docs[slot as usize].as_ref().map(|r| SearchHit::new(r.id.clone(), score, ResultSource::Sparse))
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        hits.truncate(k);
        Ok(hits)
    }

    fn delete(&self, ids: &[ChunkId]) -> Result<usize> {
        let mut inner = self.inner.write();
        Ok(ids.iter().filter(|id| inner.remove(id)).count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, text: &str) -> IndexEntry {
        IndexEntry { id: id.into(), vector: Vec::new(), text: text.into(), payload: Payload::new() }
    }

    #[test]
    fn idf_prefers_rare_terms() {
        let index = Bm25Index::default();
        index
            .index(&[entry("a", "common rare"), entry("b", "common"), entry("c", "common")])
            .expect("index");
        assert!(index.compute_idf("rare") > index.compute_idf("common"));
        assert_eq!(index.doc_freq("common"), 3);
        assert!(index.compute_idf("common") > 0.0);
    }

    #[test]
    fn reindex_replaces_previous_text() {
        let index = Bm25Index::default();
        index.index(&[entry("a", "apples")]).expect("index");
        index.index(&[entry("a", "oranges")]).expect("reindex");
        assert_eq!(index.len(), 1);
        assert_eq!(index.doc_freq("apples"), 0);
        assert_eq!(index.search("oranges", 5, None).expect("search")[0].id, "a");
    }
}
