//! Hierarchical navigable small world graph.
//!
//! Each inserted node draws a level from an exponential distribution
//! (`ml = 1/ln(m)`) and is linked to up to `m` neighbors per level, chosen
//! from `ef_construction` candidates with the diversity heuristic. Level 0
//! keeps up to `2m` links after back-linking. Searches descend greedily
//! through the upper levels and explore `ef_search` candidates on level 0.
//!
//! Writes are serialized by a writer mutex. An insert plans its links under
//! the read lock and commits them under a short write lock, so searches keep
//! running while the expensive part of an insert is in progress.
//!
//! Deletes tombstone nodes: they keep routing but never appear in results.
//! Once tombstones outnumber live nodes (and a floor of 64) the graph is
//! rebuilt from the live entries.
//!
//! Filtered search: the selectivity of the filter is estimated first (exact
//! count up to 2048 live entries, a 512-entry sample above that). Selective
//! filters (below `exact_filter_threshold`, or fewer matches than `ef`) are
//! applied *before* candidate generation by scanning only the matching
//! entries exactly. Broader filters are applied *during* traversal: every
//! node routes, only matching nodes enter the result set, and `ef` grows by
//! `1/selectivity`.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};

use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, instrument};

use ragdb_core::config::{CollectionSettings, Metric, Quantization};
use ragdb_core::traits::VectorStore;
use ragdb_core::{ChunkId, Error, Filter, IndexEntry, Payload, ResultSource, Result, SearchHit, ValidationError};

use crate::distance::{self, prepare};
use crate::quantization::{Code, QueryCode};

const MAX_LEVEL: usize = 16;
const EXACT_COUNT_LIMIT: usize = 2048;
const SELECTIVITY_SAMPLE: usize = 512;
const COMPACT_FLOOR: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub struct HnswParams {
    pub m: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
    pub metric: Metric,
    pub quantization: Quantization,
    pub oversample: usize,
    pub exact_filter_threshold: f32,
    pub seed: u64,
}

impl Default for HnswParams {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 200,
            ef_search: 64,
            metric: Metric::Cosine,
            quantization: Quantization::None,
            oversample: 4,
            exact_filter_threshold: 0.1,
            seed: 42,
        }
    }
}

impl From<&CollectionSettings> for HnswParams {
    fn from(s: &CollectionSettings) -> Self {
        Self {
            m: s.hnsw_m,
            ef_construction: s.hnsw_ef_construct,
            ef_search: s.hnsw_ef_search,
            metric: s.metric,
            quantization: s.quantization,
            oversample: s.oversample,
            exact_filter_threshold: s.exact_filter_threshold,
            seed: s.seed,
        }
    }
}

impl HnswParams {
    fn max_links(&self, level: usize) -> usize {
        if level == 0 {
            self.m * 2
        } else {
            self.m
        }
    }

    fn ml(&self) -> f64 {
        1.0 / (self.m as f64).ln()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Candidate {
    dist: f32,
    idx: u32,
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dist.total_cmp(&other.dist).then(self.idx.cmp(&other.idx))
    }
}

struct Node {
    id: ChunkId,
    vector: Vec<f32>,
    code: Option<Code>,
    payload: Payload,
    /// Links per level, `0..=level`.
    neighbors: Vec<Vec<u32>>,
    deleted: bool,
}

#[derive(Default)]
struct Graph {
    nodes: Vec<Node>,
    ids: HashMap<ChunkId, u32>,
    entry: Option<u32>,
    max_level: usize,
    deleted: usize,
}

impl Graph {
    fn node(&self, idx: u32) -> &Node {
        &self.nodes[idx as usize]
    }

    fn greedy<F: Fn(u32) -> f32>(&self, dist: &F, mut ep: u32, level: usize) -> u32 {
        let mut best = dist(ep);
        loop {
            let mut changed = false;
            for &nb in &self.node(ep).neighbors[level] {
                let d = dist(nb);
                if d < best {
                    best = d;
                    ep = nb;
                    changed = true;
                }
            }
            if !changed {
                return ep;
            }
        }
    }

    /// Best-first search on one level. Every reachable node routes; only
    /// nodes passing `admit` enter the result set. Sorted by distance.
    fn search_layer<F, A>(&self, dist: &F, eps: &[u32], ef: usize, level: usize, admit: &A) -> Vec<Candidate>
    where
        F: Fn(u32) -> f32,
        A: Fn(u32) -> bool,
    {
        let mut visited: HashSet<u32> = eps.iter().copied().collect();
        let mut frontier: BinaryHeap<Reverse<Candidate>> = BinaryHeap::new();
        let mut results: BinaryHeap<Candidate> = BinaryHeap::new();
        for &ep in eps {
            let c = Candidate { dist: dist(ep), idx: ep };
            frontier.push(Reverse(c));
            if admit(ep) {
                results.push(c);
                if results.len() > ef {
                    results.pop();
                }
            }
        }
        while let Some(Reverse(cur)) = frontier.pop() {
            if results.len() >= ef && results.peek().is_some_and(|worst| cur.dist > worst.dist) {
                break;
            }
            for &nb in &self.node(cur.idx).neighbors[level] {
                if !visited.insert(nb) {
                    continue;
                }
                let d = dist(nb);
                if results.len() >= ef && results.peek().is_some_and(|worst| d >= worst.dist) {
                    continue;
                }
                let c = Candidate { dist: d, idx: nb };
                frontier.push(Reverse(c));
                if admit(nb) {
                    results.push(c);
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }
        results.into_sorted_vec()
    }

    /// Keeps a candidate only if it is closer to the base than to every
    /// neighbor already kept; remaining slots are filled by distance.
    fn select_neighbors(&self, metric: Metric, cands: &[Candidate], m: usize) -> Vec<u32> {
        let mut picked: Vec<Candidate> = Vec::with_capacity(m);
        let mut skipped = Vec::new();
        for c in cands {
            if picked.len() >= m {
                break;
            }
            let v = &self.node(c.idx).vector;
            let diverse = picked.iter().all(|p| distance::distance(metric, v, &self.node(p.idx).vector) > c.dist);
            if diverse {
                picked.push(*c);
            } else {
                skipped.push(*c);
            }
        }
        for c in skipped {
            if picked.len() >= m {
                break;
            }
            picked.push(c);
        }
        picked.into_iter().map(|c| c.idx).collect()
    }

    fn plan(&self, params: &HnswParams, vector: &[f32], level: usize) -> Vec<Vec<u32>> {
        let mut plan = vec![Vec::new(); level + 1];
        let Some(mut ep) = self.entry else {
            return plan;
        };
        let dist = |i: u32| distance::distance(params.metric, vector, &self.node(i).vector);
        for l in (level + 1..=self.max_level).rev() {
            ep = self.greedy(&dist, ep, l);
        }
        let mut eps = vec![ep];
        for l in (0..=level.min(self.max_level)).rev() {
            let cands = self.search_layer(&dist, &eps, params.ef_construction, l, &|_| true);
            plan[l] = self.select_neighbors(params.metric, &cands, params.m);
            eps = cands.iter().map(|c| c.idx).collect();
        }
        plan
    }

    fn commit(
        &mut self,
        params: &HnswParams,
        id: ChunkId,
        vector: Vec<f32>,
        code: Option<Code>,
        payload: Payload,
        plan: Vec<Vec<u32>>,
    ) -> Result<()> {
        let idx = u32::try_from(self.nodes.len()).map_err(|_| Error::Operation("hnsw index is full".into()))?;
        let level = plan.len() - 1;
        self.nodes.push(Node { id: id.clone(), vector, code, payload, neighbors: plan.clone(), deleted: false });
        for (l, links) in plan.iter().enumerate() {
            for &nb in links {
                let overflow = match self.nodes[nb as usize].neighbors.get_mut(l) {
                    Some(list) => {
                        list.push(idx);
                        list.len() > params.max_links(l)
                    }
                    None => false,
                };
                if overflow {
                    self.prune(params, nb, l);
                }
            }
        }
        self.ids.insert(id, idx);
        if self.entry.is_none() || level > self.max_level {
            self.entry = Some(idx);
            self.max_level = level;
        }
        Ok(())
    }

    fn prune(&mut self, params: &HnswParams, node: u32, level: usize) {
        let base = &self.node(node).vector;
        let mut cands: Vec<Candidate> = self.node(node).neighbors[level]
            .iter()
            .map(|&nb| Candidate { dist: distance::distance(params.metric, base, &self.node(nb).vector), idx: nb })
            .collect();
        cands.sort();
        let kept = self.select_neighbors(params.metric, &cands, params.max_links(level));
        self.nodes[node as usize].neighbors[level] = kept;
    }

    fn tombstone(&mut self, id: &str) -> bool {
        match self.ids.remove(id) {
            Some(idx) => {
                self.nodes[idx as usize].deleted = true;
                self.deleted += 1;
                true
            }
            None => false,
        }
    }

    fn rebuilt(&self, params: &HnswParams, rng: &mut StdRng) -> Result<Graph> {
        let mut live: Vec<u32> = self.ids.values().copied().collect();
        live.sort_unstable();
        let mut g = Graph::default();
        for idx in live {
            let node = self.node(idx);
            let plan = g.plan(params, &node.vector, random_level(rng, params));
            g.commit(params, node.id.clone(), node.vector.clone(), node.code.clone(), node.payload.clone(), plan)?;
        }
        Ok(g)
    }
}

fn random_level(rng: &mut StdRng, params: &HnswParams) -> usize {
    let u: f64 = 1.0 - rng.gen::<f64>();
    ((-u.ln() * params.ml()).floor() as usize).min(MAX_LEVEL)
}

struct Selectivity {
    fraction: f32,
    matches: usize,
    /// Matching live nodes, when they were counted exactly.
    exact: Option<Vec<u32>>,
}

fn estimate_selectivity(g: &Graph, filter: &Filter) -> Selectivity {
    let live: Vec<u32> = g.ids.values().copied().collect();
    let n = live.len().max(1);
    if live.len() <= EXACT_COUNT_LIMIT {
        let matching: Vec<u32> = live.into_iter().filter(|&i| filter.matches(&g.node(i).payload)).collect();
        return Selectivity { fraction: matching.len() as f32 / n as f32, matches: matching.len(), exact: Some(matching) };
    }
    let stride = (live.len() / SELECTIVITY_SAMPLE).max(1);
    let (mut seen, mut hits) = (0usize, 0usize);
    for &i in live.iter().step_by(stride).take(SELECTIVITY_SAMPLE) {
        seen += 1;
        if filter.matches(&g.node(i).payload) {
            hits += 1;
        }
    }
    let fraction = hits as f32 / seen.max(1) as f32;
    Selectivity { fraction, matches: (fraction * n as f32).round() as usize, exact: None }
}

/// Size and memory figures for one index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexStats {
    pub live: usize,
    pub deleted: usize,
    pub max_level: usize,
    pub vector_bytes: usize,
    pub code_bytes: usize,
}

pub struct HnswIndex {
    dim: usize,
    params: HnswParams,
    graph: RwLock<Graph>,
    /// Serializes writers; the rng draws node levels.
    writer: Mutex<StdRng>,
}

impl HnswIndex {
    pub fn new(dim: usize, params: HnswParams) -> Result<Self> {
        if dim == 0 {
            return Err(Error::InvalidConfig("vector dimension must be positive".into()));
        }
        if params.m < 2 || params.ef_construction == 0 || params.ef_search == 0 || params.oversample == 0 {
            return Err(Error::InvalidConfig(format!("invalid hnsw parameters: {params:?}")));
        }
        let rng = StdRng::seed_from_u64(params.seed);
        Ok(Self { dim, params, graph: RwLock::new(Graph::default()), writer: Mutex::new(rng) })
    }

    pub fn params(&self) -> &HnswParams {
        &self.params
    }

    pub fn stats(&self) -> IndexStats {
        let g = self.graph.read();
        let live = g.nodes.iter().filter(|n| !n.deleted);
        let (mut vector_bytes, mut code_bytes) = (0, 0);
        for n in live {
            vector_bytes += n.vector.len() * std::mem::size_of::<f32>();
            code_bytes += n.code.as_ref().map_or(0, Code::size_bytes);
        }
        IndexStats { live: g.ids.len(), deleted: g.deleted, max_level: g.max_level, vector_bytes, code_bytes }
    }

    fn check_dim(&self, actual: usize) -> Result<()> {
        if actual != self.dim {
            return Err(ValidationError::DimensionMismatch { expected: self.dim, actual }.into());
        }
        Ok(())
    }

    fn maybe_compact(&self, rng: &mut StdRng) -> Result<()> {
        let needed = {
            let g = self.graph.read();
            g.deleted > COMPACT_FLOOR.max(g.ids.len())
        };
        if !needed {
            return Ok(());
        }
        let fresh = self.graph.read().rebuilt(&self.params, rng)?;
        let mut g = self.graph.write();
        info!(live = fresh.ids.len(), dropped = g.deleted, "hnsw graph compacted");
        *g = fresh;
        Ok(())
    }

    fn graph_search(&self, g: &Graph, q: &[f32], entry: u32, k: usize, ef: usize, filter: Option<&Filter>) -> Vec<Candidate> {
        let metric = self.params.metric;
        let quantized = self.params.quantization != Quantization::None;
        let qc = QueryCode::new(metric, q);
        let approx = |i: u32| {
            let n = g.node(i);
            match &n.code {
                Some(code) => qc.distance(code),
                None => distance::distance(metric, q, &n.vector),
            }
        };
        let admit = |i: u32| {
            let n = g.node(i);
            !n.deleted && filter.map_or(true, |f| f.matches(&n.payload))
        };
        let ef = if quantized { ef.max(k.saturating_mul(self.params.oversample)) } else { ef };

        let mut ep = entry;
        for l in (1..=g.max_level).rev() {
            ep = g.greedy(&approx, ep, l);
        }
        let mut cands = g.search_layer(&approx, &[ep], ef, 0, &admit);
        if quantized {
            for c in &mut cands {
                c.dist = distance::distance(metric, q, &g.node(c.idx).vector);
            }
        }
        cands
    }

    fn exact_scan(&self, g: &Graph, q: &[f32], candidates: impl IntoIterator<Item = u32>) -> Vec<Candidate> {
        candidates
            .into_iter()
            .map(|idx| Candidate { dist: distance::distance(self.params.metric, q, &g.node(idx).vector), idx })
            .collect()
    }

    fn to_hits(&self, g: &Graph, mut cands: Vec<Candidate>, k: usize) -> Vec<SearchHit> {
        cands.sort_by(|a, b| a.dist.total_cmp(&b.dist).then_with(|| g.node(a.idx).id.cmp(&g.node(b.idx).id)));
        cands.truncate(k);
        cands
            .into_iter()
            .map(|c| SearchHit::new(g.node(c.idx).id.clone(), distance::score(self.params.metric, c.dist), ResultSource::Dense))
            .collect()
    }
}

impl VectorStore for HnswIndex {
    fn dim(&self) -> usize {
        self.dim
    }

    fn len(&self) -> usize {
        self.graph.read().ids.len()
    }

    fn upsert(&self, entries: &[IndexEntry]) -> Result<()> {
        for e in entries {
            self.check_dim(e.vector.len())?;
        }
        let mut rng = self.writer.lock();
        for e in entries {
            let vector = prepare(self.params.metric, &e.vector);
            let code = Code::encode(self.params.quantization, &vector);
            let level = random_level(&mut rng, &self.params);
            self.graph.write().tombstone(&e.id);
            let plan = self.graph.read().plan(&self.params, &vector, level);
            self.graph.write().commit(&self.params, e.id.clone(), vector, code, e.payload.clone(), plan)?;
        }
        self.maybe_compact(&mut rng)?;
        debug!(upserted = entries.len(), "hnsw upsert");
        Ok(())
    }

    #[instrument(level = "debug", skip(self, query, filter), fields(filtered = filter.is_some()))]
    fn search(&self, query: &[f32], k: usize, filter: Option<&Filter>) -> Result<Vec<SearchHit>> {
        self.check_dim(query.len())?;
        if let Some(f) = filter {
            f.validate()?;
        }
        if k == 0 {
            return Ok(Vec::new());
        }
        let q = prepare(self.params.metric, query);
        let g = self.graph.read();
        let Some(entry) = g.entry else {
            return Ok(Vec::new());
        };
        if g.ids.is_empty() {
            return Ok(Vec::new());
        }
        let ef = self.params.ef_search.max(k);
        let cands = match filter {
            None => self.graph_search(&g, &q, entry, k, ef, None),
            Some(f) => {
                let sel = estimate_selectivity(&g, f);
                if sel.fraction < self.params.exact_filter_threshold || sel.matches <= ef {
                    debug!(selectivity = sel.fraction, matches = sel.matches, "pre-filter exact scan");
                    match sel.exact {
                        Some(matching) => self.exact_scan(&g, &q, matching),
                        None => {
                            let matching = g.ids.values().copied().filter(|&i| f.matches(&g.node(i).payload));
                            self.exact_scan(&g, &q, matching)
                        }
                    }
                } else {
                    let scaled = ((ef as f32 / sel.fraction.max(f32::EPSILON)).ceil() as usize).clamp(ef, g.ids.len().max(ef));
                    debug!(selectivity = sel.fraction, ef = scaled, "filtered traversal");
                    self.graph_search(&g, &q, entry, k, scaled, Some(f))
                }
            }
        };
        Ok(self.to_hits(&g, cands, k))
    }

    fn delete(&self, ids: &[ChunkId]) -> Result<usize> {
        let mut rng = self.writer.lock();
        let removed = {
            let mut g = self.graph.write();
            ids.iter().filter(|id| g.tombstone(id)).count()
        };
        self.maybe_compact(&mut rng)?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, v: Vec<f32>) -> IndexEntry {
        IndexEntry { id: id.into(), vector: v, text: String::new(), payload: Payload::new() }
    }

    #[test]
    fn levels_follow_ml() {
        let params = HnswParams::default();
        let mut rng = StdRng::seed_from_u64(7);
        let above_zero = (0..10_000).filter(|_| random_level(&mut rng, &params) > 0).count();
        // P(level > 0) = 1/m
        assert!((400..850).contains(&above_zero), "{above_zero}");
    }

    #[test]
    fn compaction_drops_tombstones() {
        let index = HnswIndex::new(2, HnswParams::default()).expect("index");
        let entries: Vec<IndexEntry> = (0..200).map(|i| entry(&format!("n{i}"), vec![i as f32, 1.0])).collect();
        index.upsert(&entries).expect("upsert");
        let ids: Vec<ChunkId> = (0..150).map(|i| format!("n{i}")).collect();
        assert_eq!(index.delete(&ids).expect("delete"), 150);
        let stats = index.stats();
        assert_eq!(stats.live, 50);
        assert_eq!(stats.deleted, 0, "rebuilt once tombstones outnumbered live nodes");
        let hits = index.search(&[199.0, 1.0], 5, None).expect("search");
        assert!(hits.iter().all(|h| h.id.trim_start_matches('n').parse::<usize>().is_ok_and(|i| i >= 150)));
    }
}
