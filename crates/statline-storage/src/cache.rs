use statline_core::CategoryId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60);

/// Identifies one cached store query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QuerySignature {
    pub category_id: CategoryId,
    pub range: Option<(i64, i64)>,
}

impl QuerySignature {
    pub fn category(category_id: CategoryId) -> Self {
        Self {
            category_id,
            range: None,
        }
    }

    pub fn range(category_id: CategoryId, from: i64, to: i64) -> Self {
        Self {
            category_id,
            range: Some((from, to)),
        }
    }
}

struct CacheEntry<V> {
    fetched_at: Instant,
    payload: Arc<V>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// TTL-bounded read-through cache over store queries.
///
/// Payloads are handed out behind `Arc` and never mutated; a refresh replaces
/// the whole entry. The loader runs outside the lock, so two concurrent misses
/// on one signature may both load.
pub struct ReadThroughCache<V> {
    default_ttl: Mutex<Duration>,
    entries: Mutex<HashMap<QuerySignature, CacheEntry<V>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V> Default for ReadThroughCache<V> {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL)
    }
}

impl<V> ReadThroughCache<V> {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            default_ttl: Mutex::new(default_ttl),
            entries: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get<E>(
        &self,
        signature: QuerySignature,
        ttl: Option<Duration>,
        loader: impl FnOnce() -> Result<V, E>,
    ) -> Result<Arc<V>, E> {
        self.get_at(signature, ttl, Instant::now(), loader)
    }

    pub fn get_at<E>(
        &self,
        signature: QuerySignature,
        ttl: Option<Duration>,
        now: Instant,
        loader: impl FnOnce() -> Result<V, E>,
    ) -> Result<Arc<V>, E> {
        let ttl = ttl.unwrap_or_else(|| self.ttl());
        if let Some(entry) = self.entries().get(&signature) {
            if now.saturating_duration_since(entry.fetched_at) < ttl {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Arc::clone(&entry.payload));
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let payload = Arc::new(loader()?);
        self.entries().insert(
            signature,
            CacheEntry {
                fetched_at: now,
                payload: Arc::clone(&payload),
            },
        );
        Ok(payload)
    }

    pub fn invalidate(&self, signature: &QuerySignature) -> bool {
        self.entries().remove(signature).is_some()
    }

    /// Drops every signature for a category, ranged or not.
    pub fn invalidate_category(&self, category_id: CategoryId) -> usize {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|signature, _| signature.category_id != category_id);
        before - entries.len()
    }

    pub fn invalidate_all(&self) -> usize {
        let mut entries = self.entries();
        let dropped = entries.len();
        entries.clear();
        dropped
    }

    /// Applies to lookups made after the call; existing entries keep their
    /// original fetch time.
    pub fn set_ttl(&self, ttl: Duration) {
        *self
            .default_ttl
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = ttl;
    }

    pub fn ttl(&self) -> Duration {
        *self
            .default_ttl
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<QuerySignature, CacheEntry<V>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
