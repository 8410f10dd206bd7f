use std::collections::HashMap;

use parking_lot::RwLock;

use ragdb_core::config::Metric;
use ragdb_core::traits::VectorStore;
use ragdb_core::{ChunkId, Error, Filter, IndexEntry, Payload, ResultSource, Result, SearchHit, ValidationError};

use crate::distance::{self, prepare};

/// Exact nearest neighbours by full scan. Filters are applied before
/// scoring. Used as the recall reference and for small collections.
pub struct FlatIndex {
    dim: usize,
    metric: Metric,
    entries: RwLock<HashMap<ChunkId, (Vec<f32>, Payload)>>,
}

impl FlatIndex {
    pub fn new(dim: usize, metric: Metric) -> Result<Self> {
        if dim == 0 {
            return Err(Error::InvalidConfig("vector dimension must be positive".into()));
        }
        Ok(Self { dim, metric, entries: RwLock::new(HashMap::new()) })
    }

    fn check_dim(&self, actual: usize) -> Result<()> {
        if actual != self.dim {
            return Err(ValidationError::DimensionMismatch { expected: self.dim, actual }.into());
        }
        Ok(())
    }
}

impl VectorStore for FlatIndex {
    fn dim(&self) -> usize {
        self.dim
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }

    fn upsert(&self, entries: &[IndexEntry]) -> Result<()> {
        for e in entries {
            self.check_dim(e.vector.len())?;
        }
        let prepared: Vec<(ChunkId, (Vec<f32>, Payload))> = entries
            .iter()
            .map(|e| (e.id.clone(), (prepare(self.metric, &e.vector), e.payload.clone())))
            .collect();
        self.entries.write().extend(prepared);
        Ok(())
    }

    fn search(&self, query: &[f32], k: usize, filter: Option<&Filter>) -> Result<Vec<SearchHit>> {
        self.check_dim(query.len())?;
        if let Some(f) = filter {
            f.validate()?;
        }
        let q = prepare(self.metric, query);
        let entries = self.entries.read();
        let mut scored: Vec<(f32, &ChunkId)> = entries
            .iter()
            .filter(|(_, (_, payload))| filter.map_or(true, |f| f.matches(payload)))
            .map(|(id, (v, _))| (distance::distance(self.metric, &q, v), id))
            .collect();
        scored.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(b.1)));
        scored.truncate(k);
        Ok(scored
            .into_iter()
            .map(|(d, id)| SearchHit::new(id.clone(), distance::score(self.metric, d), ResultSource::Dense))
            .collect())
    }

    fn delete(&self, ids: &[ChunkId]) -> Result<usize> {
        let mut entries = self.entries.write();
        Ok(ids.iter().filter(|id| entries.remove(id.as_str()).is_some()).count())
    }
}
