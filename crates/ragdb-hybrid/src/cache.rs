//! Query result cache.
//!
//! moka gives sharded concurrent access with bounded capacity and a
//! per-entry TTL. Every collection also carries a generation counter: a
//! mutation bumps it and evicts the collection's entries, and a result
//! computed against an older generation is refused on insert and ignored
//! on lookup, so no response outlives the next mutation.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use moka::sync::Cache;
use moka::Expiry;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, warn};

use ragdb_core::{Error, Result};

/// Cache key: the collection plus a blake3 digest of everything that shapes
/// the result.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
    collection: String,
    digest: [u8; 32],
}

impl QueryKey {
    pub fn new(collection: &str, parts: &impl Serialize) -> Result<Self> {
        let bytes = serde_json::to_vec(parts).map_err(|e| Error::Operation(format!("cache key: {e}")))?;
        let mut hasher = blake3::Hasher::new();
        hasher.update(collection.as_bytes());
        hasher.update(&[0]);
        hasher.update(&bytes);
        Ok(Self { collection: collection.to_string(), digest: *hasher.finalize().as_bytes() })
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }
}

#[derive(Clone)]
struct Cached<V> {
    value: V,
    generation: u64,
    ttl: Duration,
}

struct PerEntryTtl;

impl<V> Expiry<QueryKey, Cached<V>> for PerEntryTtl {
    fn expire_after_create(&self, _key: &QueryKey, value: &Cached<V>, _created_at: Instant) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &QueryKey,
        value: &Cached<V>,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

pub struct QueryCache<V: Clone + Send + Sync + 'static> {
    entries: Cache<QueryKey, Cached<V>>,
    generations: RwLock<HashMap<String, u64>>,
    default_ttl: Duration,
}

impl<V: Clone + Send + Sync + 'static> QueryCache<V> {
    pub fn new(capacity: u64, default_ttl: Duration) -> Self {
        let entries = Cache::builder()
            .max_capacity(capacity)
            .expire_after(PerEntryTtl)
            .support_invalidation_closures()
            .build();
        Self { entries, generations: RwLock::new(HashMap::new()), default_ttl }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Current generation of `collection`; capture it before computing a
    /// result and hand it back to [`put`](Self::put).
    pub fn generation(&self, collection: &str) -> u64 {
        self.generations.read().get(collection).copied().unwrap_or(0)
    }

    pub fn get(&self, key: &QueryKey) -> Option<V> {
        let cached = self.entries.get(key)?;
        (cached.generation == self.generation(key.collection())).then_some(cached.value)
    }

    /// Stores `value` unless the collection changed since `generation` was
    /// read. A zero TTL disables caching for the entry. Returns whether the
    /// value was stored.
    pub fn put(&self, key: QueryKey, value: V, ttl: Option<Duration>, generation: u64) -> bool {
        let ttl = ttl.unwrap_or(self.default_ttl);
        if ttl.is_zero() {
            return false;
        }
        // Held across the insert so an invalidation cannot slip in between.
        let generations = self.generations.read();
        if generations.get(key.collection()).copied().unwrap_or(0) != generation {
            debug!(collection = key.collection(), "refusing stale cache entry");
            return false;
        }
        self.entries.insert(key, Cached { value, generation, ttl });
        true
    }

    /// Drops every entry scoped to `collection`.
    pub fn invalidate(&self, collection: &str) {
        let mut generations = self.generations.write();
        *generations.entry(collection.to_string()).or_insert(0) += 1;
        let target = collection.to_string();
        if let Err(e) = self.entries.invalidate_entries_if(move |key, _| key.collection == target) {
            warn!(collection, error = %e, "cache invalidation predicate rejected; relying on generation check");
        }
        debug!(collection, "query cache invalidated");
    }

    pub fn entry_count(&self) -> u64 {
        self.entries.run_pending_tasks();
        self.entries.entry_count()
    }
}
