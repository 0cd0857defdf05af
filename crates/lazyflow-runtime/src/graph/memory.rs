//! Soft memory budget shared by the caches of a graph.
//!
//! Caches register once and report every allocation and free. When an
//! allocation would push the tracked total over the cache ceiling, the
//! manager asks registered caches to free memory, coldest first, before
//! accounting the allocation. Caches that cannot free anything right now
//! are skipped; the budget is a target, not a hard limit.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;

use crate::config::GraphConfig;
use crate::id::CacheId;

/// Tracing target for memory management.
const TRACING_TARGET: &str = "lazyflow_runtime::memory";

/// A cache whose memory the graph may reclaim.
pub trait CacheMemory: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> String;

    /// Bytes currently held.
    fn memory_size(&self) -> u64;

    /// Frees at least `requested` bytes if possible and returns the number
    /// of bytes actually freed. Entries in use must be kept.
    ///
    /// The manager accounts the returned amount itself; implementations do
    /// not report it through [`MemoryManager::notify_free`].
    fn free_memory(&self, requested: u64) -> u64;
}

/// Snapshot of the memory manager's bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    /// Bytes currently tracked.
    pub used: u64,
    /// Soft ceiling for cache memory.
    pub ceiling: u64,
    /// Registered caches still alive.
    pub caches: usize,
    /// Eviction rounds run.
    pub evictions: u64,
    /// Bytes freed by eviction.
    pub evicted_bytes: u64,
}

/// Tracks cache memory against the soft ceiling and evicts under pressure.
///
/// Cloning is cheap; clones share the same bookkeeping.
#[derive(Clone)]
pub struct MemoryManager {
    inner: Arc<MemoryInner>,
}

struct MemoryInner {
    ceiling: u64,
    min_evictable: u64,
    multiplier: u64,
    decay_interval: u64,
    decay_factor: f64,
    verbose: bool,
    state: Mutex<MemoryState>,
}

struct CacheEntry {
    cache: Weak<dyn CacheMemory>,
    hits: f64,
}

#[derive(Default)]
struct MemoryState {
    next_id: u64,
    caches: HashMap<CacheId, CacheEntry>,
    /// Caches holding memory, in eviction order.
    pool: VecDeque<CacheId>,
    used: u64,
    accesses: u64,
    evictions: u64,
    evicted_bytes: u64,
}

impl MemoryManager {
    pub(crate) fn new(config: &GraphConfig) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                ceiling: config.cache_memory_ceiling(),
                min_evictable: config.min_evictable_size,
                multiplier: config.eviction_multiplier,
                decay_interval: config.hit_decay_interval,
                decay_factor: config.hit_decay_factor,
                verbose: config.verbose_memory,
                state: Mutex::new(MemoryState::default()),
            }),
        }
    }

    /// Soft ceiling for cache memory in bytes.
    pub fn ceiling(&self) -> u64 {
        self.inner.ceiling
    }

    /// Bytes currently tracked.
    pub fn used(&self) -> u64 {
        self.inner.state.lock().used
    }

    pub fn stats(&self) -> MemoryStats {
        let state = self.inner.state.lock();
        MemoryStats {
            used: state.used,
            ceiling: self.inner.ceiling,
            caches: state
                .caches
                .values()
                .filter(|entry| entry.cache.strong_count() > 0)
                .count(),
            evictions: state.evictions,
            evicted_bytes: state.evicted_bytes,
        }
    }

    /// Registers a cache. The manager only keeps a weak reference.
    pub fn register(&self, cache: Weak<dyn CacheMemory>) -> CacheId {
        let mut state = self.inner.state.lock();
        state.next_id += 1;
        let id = CacheId(state.next_id);
        state.caches.insert(id, CacheEntry { cache, hits: 0.0 });
        id
    }

    /// Forgets a cache and the memory it still held.
    pub fn unregister(&self, id: CacheId, held: u64) {
        let mut state = self.inner.state.lock();
        state.caches.remove(&id);
        state.pool.retain(|entry| *entry != id);
        state.used = state.used.saturating_sub(held);
    }

    /// Accounts `bytes` newly held by cache `id`, evicting first if the
    /// ceiling would be exceeded.
    pub fn notify_allocation(&self, id: CacheId, bytes: u64) {
        let overflow = {
            let state = self.inner.state.lock();
            state.used.saturating_add(bytes) > self.inner.ceiling
        };
        if overflow {
            let ceiling = self.inner.ceiling;
            let target = bytes
                .saturating_mul(self.inner.multiplier)
                .clamp(ceiling / 5, ceiling / 2);
            self.free_memory(target);
        }

        let mut state = self.inner.state.lock();
        state.used = state.used.saturating_add(bytes);
        if state.caches.contains_key(&id) && !state.pool.contains(&id) {
            state.pool.push_back(id);
        }
    }

    /// Accounts `bytes` released by a cache on its own.
    pub fn notify_free(&self, id: CacheId, bytes: u64) {
        let mut state = self.inner.state.lock();
        state.used = state.used.saturating_sub(bytes);
        tracing::trace!(target: TRACING_TARGET, cache = %id, bytes, "cache memory released");
    }

    /// Counts a cache hit. Every `hit_decay_interval` hits, all hit counts
    /// decay and the eviction order is rebuilt, coldest first.
    pub fn record_hit(&self, id: CacheId) {
        let mut state = self.inner.state.lock();
        if let Some(entry) = state.caches.get_mut(&id) {
            entry.hits += 1.0;
        }
        state.accesses += 1;
        if state.accesses <= self.inner.decay_interval {
            return;
        }
        state.accesses = 0;
        let factor = self.inner.decay_factor;
        for entry in state.caches.values_mut() {
            entry.hits *= factor;
        }
        let MemoryState { caches, pool, .. } = &mut *state;
        pool.make_contiguous().sort_by(|a, b| {
            let hits = |id: &CacheId| caches.get(id).map_or(0.0, |entry| entry.hits);
            hits(a).total_cmp(&hits(b))
        });
    }

    /// Current hit count of a cache.
    pub fn hits(&self, id: CacheId) -> Option<f64> {
        self.inner.state.lock().caches.get(&id).map(|entry| entry.hits)
    }

    /// Asks caches to free at least `requested` bytes, coldest first.
    /// Returns the bytes actually freed.
    pub fn free_memory(&self, requested: u64) -> u64 {
        let candidates: Vec<(CacheId, Arc<dyn CacheMemory>)> = {
            let mut state = self.inner.state.lock();
            let MemoryState { caches, pool, .. } = &mut *state;
            pool.retain(|id| caches.get(id).is_some_and(|entry| entry.cache.strong_count() > 0));
            pool.iter()
                .filter_map(|id| {
                    caches
                        .get(id)
                        .and_then(|entry| entry.cache.upgrade())
                        .map(|cache| (*id, cache))
                })
                .collect()
        };

        let mut freed = 0u64;
        let mut drained = Vec::new();
        for (id, cache) in candidates {
            if freed >= requested {
                break;
            }
            if cache.memory_size() <= self.inner.min_evictable {
                continue;
            }
            let got = cache.free_memory(requested - freed);
            if got == 0 {
                continue;
            }
            freed += got;
            if cache.memory_size() == 0 {
                drained.push(id);
            }
            if self.inner.verbose {
                tracing::info!(target: TRACING_TARGET, cache = %cache.name(), freed = got, "cache evicted");
            } else {
                tracing::debug!(target: TRACING_TARGET, cache = %cache.name(), freed = got, "cache evicted");
            }
        }

        let mut state = self.inner.state.lock();
        state.used = state.used.saturating_sub(freed);
        state.pool.retain(|id| !drained.contains(id));
        state.evictions += 1;
        state.evicted_bytes += freed;
        if freed < requested {
            tracing::debug!(
                target: TRACING_TARGET,
                requested,
                freed,
                used = state.used,
                "eviction fell short of the request"
            );
        }
        freed
    }
}
