//! Block bookkeeping for caching operators.
//!
//! A [`BlockTable`] maps block keys to either the request currently
//! computing the block or the finished data. Whoever inserts the in-flight
//! entry is the single writer for that block; everyone else waits on the
//! same request.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use lazyflow_core::{Buffer, Result};
use parking_lot::Mutex;

use crate::id::RequestId;
use crate::request::Request;

/// Tracing target for block cache operations.
const TRACING_TARGET: &str = "lazyflow_runtime::cache";

enum BlockEntry {
    InFlight(Request),
    Ready { data: Arc<Buffer>, last_used: u64 },
}

/// Result of [`BlockTable::lookup_or_insert_with`].
#[derive(Debug)]
pub enum BlockLookup {
    /// The block is cached.
    Ready(Arc<Buffer>),
    /// Another requester is computing the block.
    InFlight(Request),
    /// The caller started the computation and must report back through
    /// [`BlockTable::complete`] or [`BlockTable::abandon`].
    Started(Request),
}

impl BlockLookup {
    /// The request to wait on, if the block is not cached yet.
    pub fn request(&self) -> Option<&Request> {
        match self {
            Self::Ready(_) => None,
            Self::InFlight(request) | Self::Started(request) => Some(request),
        }
    }
}

struct TableState<K> {
    entries: HashMap<K, BlockEntry>,
    clock: u64,
    bytes: u64,
}

impl<K: Eq + Hash> TableState<K> {
    /// Existing entry for `key`, touching it when it is cached.
    fn find(&mut self, key: &K) -> Option<BlockLookup> {
        self.clock += 1;
        let now = self.clock;
        match self.entries.get_mut(key)? {
            BlockEntry::Ready { data, last_used } => {
                *last_used = now;
                Some(BlockLookup::Ready(data.clone()))
            }
            BlockEntry::InFlight(request) => Some(BlockLookup::InFlight(request.clone())),
        }
    }
}

/// Thread-safe table of cached blocks.
pub struct BlockTable<K> {
    state: Mutex<TableState<K>>,
}

impl<K: Eq + Hash + Clone> BlockTable<K> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TableState {
                entries: HashMap::new(),
                clock: 0,
                bytes: 0,
            }),
        }
    }

    /// Looks `key` up, starting its computation with `start` when absent.
    ///
    /// `start` runs without the table lock held. When two callers race on
    /// the same key, the first insert wins and the other request is dropped
    /// before it was ever launched.
    pub fn lookup_or_insert_with(
        &self,
        key: &K,
        start: impl FnOnce() -> Result<Request>,
    ) -> Result<BlockLookup> {
        if let Some(found) = self.state.lock().find(key) {
            return Ok(found);
        }
        let request = start()?;

        let mut state = self.state.lock();
        if let Some(found) = state.find(key) {
            tracing::trace!(target: TRACING_TARGET, request = %request.id(), "lost block insert race");
            return Ok(found);
        }
        state
            .entries
            .insert(key.clone(), BlockEntry::InFlight(request.clone()));
        Ok(BlockLookup::Started(request))
    }

    /// Stores the data computed by request `request`. Returns the number of
    /// bytes added, or `None` when the block was invalidated in the meantime.
    ///
    /// Requests are matched by id so that completion hooks need not keep
    /// the request alive.
    pub fn complete(&self, key: &K, request: RequestId, data: Arc<Buffer>) -> Option<u64> {
        let mut state = self.state.lock();
        match state.entries.get(key) {
            Some(BlockEntry::InFlight(current)) if current.id() == request => {}
            _ => {
                tracing::trace!(target: TRACING_TARGET, request = %request, "stale block result dropped");
                return None;
            }
        }
        let bytes = data.num_bytes() as u64;
        state.clock += 1;
        let last_used = state.clock;
        state.bytes += bytes;
        state
            .entries
            .insert(key.clone(), BlockEntry::Ready { data, last_used });
        Some(bytes)
    }

    /// Forgets the in-flight entry of a failed or canceled `request`.
    pub fn abandon(&self, key: &K, request: RequestId) {
        let mut state = self.state.lock();
        if let Some(BlockEntry::InFlight(current)) = state.entries.get(key)
            && current.id() == request
        {
            state.entries.remove(key);
        }
    }

    /// Drops every entry whose key matches `pred`, in flight or not.
    /// Returns the bytes released.
    pub fn invalidate(&self, mut pred: impl FnMut(&K) -> bool) -> u64 {
        let mut state = self.state.lock();
        let mut freed = 0;
        state.entries.retain(|key, entry| {
            if !pred(key) {
                return true;
            }
            if let BlockEntry::Ready { data, .. } = entry {
                freed += data.num_bytes() as u64;
            }
            false
        });
        state.bytes -= freed;
        freed
    }

    /// Drops everything. Returns the bytes released.
    pub fn clear(&self) -> u64 {
        self.invalidate(|_| true)
    }

    /// Frees least recently used ready blocks until at least `requested`
    /// bytes are released. In-flight blocks are never touched.
    pub fn evict_lru(&self, requested: u64) -> u64 {
        let mut state = self.state.lock();
        let mut ready: Vec<(u64, K, u64)> = state
            .entries
            .iter()
            .filter_map(|(key, entry)| match entry {
                BlockEntry::Ready { data, last_used } => {
                    Some((*last_used, key.clone(), data.num_bytes() as u64))
                }
                BlockEntry::InFlight(_) => None,
            })
            .collect();
        ready.sort_unstable_by_key(|(last_used, ..)| *last_used);

        let mut freed = 0;
        for (_, key, bytes) in ready {
            if freed >= requested {
                break;
            }
            state.entries.remove(&key);
            freed += bytes;
        }
        state.bytes -= freed;
        freed
    }

    /// Bytes held by ready blocks.
    pub fn memory_size(&self) -> u64 {
        self.state.lock().bytes
    }

    pub fn is_ready(&self, key: &K) -> bool {
        matches!(self.state.lock().entries.get(key), Some(BlockEntry::Ready { .. }))
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ready blocks, in no particular order.
    pub fn ready_blocks(&self) -> Vec<(K, Arc<Buffer>)> {
        self.state
            .lock()
            .entries
            .iter()
            .filter_map(|(key, entry)| match entry {
                BlockEntry::Ready { data, .. } => Some((key.clone(), data.clone())),
                BlockEntry::InFlight(_) => None,
            })
            .collect()
    }

    /// Inserts finished data directly, replacing whatever was there.
    /// Returns the bytes added.
    pub fn insert_ready(&self, key: K, data: Arc<Buffer>) -> u64 {
        let mut state = self.state.lock();
        state.clock += 1;
        let last_used = state.clock;
        let bytes = data.num_bytes() as u64;
        let previous = state
            .entries
            .insert(key, BlockEntry::Ready { data, last_used });
        if let Some(BlockEntry::Ready { data, .. }) = previous {
            state.bytes -= data.num_bytes() as u64;
        }
        state.bytes += bytes;
        bytes
    }
}

impl<K: Eq + Hash + Clone> Default for BlockTable<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use lazyflow_core::{DType, Roi};

    use super::*;

    fn block(value: f64) -> Request {
        let mut data = Buffer::zeros(DType::F64, &[4, 4]);
        data.fill(value);
        Request::ready(data, Roi::full(&[4, 4]))
    }

    fn data() -> Arc<Buffer> {
        Arc::new(Buffer::zeros(DType::F64, &[4, 4]))
    }

    #[test]
    fn test_single_writer() {
        let table = BlockTable::new();
        let first = table.lookup_or_insert_with(&0u32, || Ok(block(1.0))).unwrap();
        assert!(matches!(first, BlockLookup::Started(_)));

        let mut started = false;
        let second = table
            .lookup_or_insert_with(&0u32, || {
                started = true;
                Ok(block(2.0))
            })
            .unwrap();
        assert!(!started);
        assert!(second.request().unwrap().ptr_eq(first.request().unwrap()));
    }

    #[test]
    fn test_start_may_use_the_table() {
        let table = BlockTable::new();
        table.insert_ready(1u32, data());
        let lookup = table
            .lookup_or_insert_with(&0u32, || {
                assert_eq!(table.memory_size(), 128);
                assert!(matches!(
                    table.lookup_or_insert_with(&1, || Ok(block(0.0))).unwrap(),
                    BlockLookup::Ready(_)
                ));
                Ok(block(1.0))
            })
            .unwrap();
        assert!(matches!(lookup, BlockLookup::Started(_)));
    }

    #[test]
    fn test_racing_insert_keeps_first_request() {
        let table = BlockTable::new();
        let winner = block(2.0);
        let lookup = table
            .lookup_or_insert_with(&0u32, || {
                let inner = table.lookup_or_insert_with(&0, || Ok(winner.clone())).unwrap();
                assert!(matches!(inner, BlockLookup::Started(_)));
                Ok(block(1.0))
            })
            .unwrap();
        match lookup {
            BlockLookup::InFlight(request) => assert!(request.ptr_eq(&winner)),
            other => panic!("expected the first insert to win, got {other:?}"),
        }
    }

    #[test]
    fn test_complete_then_hit() {
        let table = BlockTable::new();
        let lookup = table.lookup_or_insert_with(&0u32, || Ok(block(1.0))).unwrap();
        let request = lookup.request().unwrap().clone();
        assert_eq!(table.complete(&0, request.id(), data()), Some(128));
        assert_eq!(table.memory_size(), 128);
        assert!(matches!(
            table.lookup_or_insert_with(&0, || Ok(block(1.0))).unwrap(),
            BlockLookup::Ready(_)
        ));
    }

    #[test]
    fn test_invalidated_result_is_dropped() {
        let table = BlockTable::new();
        let lookup = table.lookup_or_insert_with(&0u32, || Ok(block(1.0))).unwrap();
        let request = lookup.request().unwrap().clone();
        table.invalidate(|_| true);
        assert_eq!(table.complete(&0, request.id(), data()), None);
        assert!(table.is_empty());
        assert_eq!(table.memory_size(), 0);
    }

    #[test]
    fn test_evict_lru_skips_in_flight() {
        let table = BlockTable::new();
        for key in 0u32..3 {
            table.insert_ready(key, data());
        }
        table.lookup_or_insert_with(&9, || Ok(block(1.0))).unwrap();
        // Touch block 0 so block 1 becomes the oldest.
        table.lookup_or_insert_with(&0, || Ok(block(1.0))).unwrap();

        assert_eq!(table.evict_lru(100), 128);
        assert!(!table.is_ready(&1));
        assert!(table.is_ready(&0));

        assert_eq!(table.evict_lru(u64::MAX), 256);
        assert_eq!(table.len(), 1);
        assert_eq!(table.memory_size(), 0);
    }
}
