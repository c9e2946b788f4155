// =============================================================================
// Bounded FIFO caches — market outcomes, order-book tops, market end times
// =============================================================================
//
// All caches are capped with insertion-order (FIFO) eviction. The workload is
// near-uniform over a bounded working set, so LRU bookkeeping buys nothing.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::Serialize;

// ---------------------------------------------------------------------------
// Generic bounded insertion-order map
// ---------------------------------------------------------------------------

/// A HashMap with a capacity cap and FIFO eviction. Not thread-safe on its
/// own; the caches below wrap it in a lock.
pub struct FifoMap<V> {
    map: HashMap<String, V>,
    order: Vec<String>,
    capacity: usize,
}

impl<V> FifoMap<V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            map: HashMap::new(),
            order: Vec::new(),
            capacity,
        }
    }

    pub fn get(&self, key: &str) -> Option<&V> {
        self.map.get(key)
    }

    pub fn insert(&mut self, key: String, value: V) {
        if !self.map.contains_key(&key) {
            self.order.push(key.clone());
            while self.order.len() > self.capacity {
                let oldest = self.order.remove(0);
                self.map.remove(&oldest);
            }
        }
        self.map.insert(key, value);
    }

    pub fn remove(&mut self, key: &str) -> Option<V> {
        let removed = self.map.remove(key);
        if removed.is_some() {
            self.order.retain(|k| k != key);
        }
        removed
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut V> {
        self.map.values_mut()
    }
}

// ---------------------------------------------------------------------------
// Outcome cache
// ---------------------------------------------------------------------------

/// What Gamma last told us about the market behind one token.
#[derive(Debug, Clone, Serialize)]
pub struct OutcomeEntry {
    /// Winning outcome name, once determinable.
    pub winner: Option<String>,
    /// Winner is known — resolved entries never expire.
    pub resolved: bool,
    pub market_closed: bool,
    /// Market end time (epoch ms), when Gamma supplied one.
    pub end_time_ms: Option<i64>,
    pub resolved_at_ms: Option<i64>,
    pub last_checked_ms: i64,
}

/// Default cap for the outcome cache.
pub const OUTCOME_CACHE_CAPACITY: usize = 2000;
/// How long an ACTIVE (unresolved) entry is honoured.
pub const OUTCOME_ACTIVE_TTL_MS: i64 = 30_000;

/// Token → market outcome, resolved entries cached indefinitely.
pub struct OutcomeCache {
    inner: RwLock<FifoMap<OutcomeEntry>>,
    active_ttl_ms: i64,
}

impl OutcomeCache {
    pub fn new(capacity: usize, active_ttl_ms: i64) -> Self {
        Self {
            inner: RwLock::new(FifoMap::new(capacity)),
            active_ttl_ms,
        }
    }

    /// Return the cached entry if it is still honoured: resolved entries
    /// always are, unresolved entries only within the ACTIVE TTL.
    pub fn get(&self, token_id: &str, now_ms: i64) -> Option<OutcomeEntry> {
        let inner = self.inner.read();
        let entry = inner.get(token_id)?;
        if entry.resolved || now_ms - entry.last_checked_ms < self.active_ttl_ms {
            Some(entry.clone())
        } else {
            None
        }
    }

    pub fn set(&self, token_id: &str, entry: OutcomeEntry) {
        self.inner.write().insert(token_id.to_string(), entry);
    }

    /// Force every unresolved entry to re-check on next access (soft reset).
    pub fn expire_active(&self) {
        let mut inner = self.inner.write();
        for entry in inner.values_mut() {
            if !entry.resolved {
                entry.last_checked_ms = i64::MIN / 2;
            }
        }
    }

    /// Drop everything (hard reset / shrink corrective action).
    pub fn clear(&self) {
        self.inner.write().clear();
    }

    pub fn remove(&self, token_id: &str) {
        self.inner.write().remove(token_id);
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }
}

// ---------------------------------------------------------------------------
// Order book cache
// ---------------------------------------------------------------------------

/// Top-of-book observed for one token.
#[derive(Debug, Clone, Copy)]
pub struct BookTop {
    pub best_bid: Option<f64>,
    pub best_ask: Option<f64>,
    pub fetched_at_ms: i64,
}

/// Default cap for the order book cache.
pub const BOOK_CACHE_CAPACITY: usize = 500;
/// Freshness window for a cached top-of-book.
pub const BOOK_CACHE_TTL_MS: i64 = 2_000;

/// Token → top-of-book with a short freshness window.
pub struct BookCache {
    inner: RwLock<FifoMap<BookTop>>,
    ttl_ms: i64,
}

impl BookCache {
    pub fn new(capacity: usize, ttl_ms: i64) -> Self {
        Self {
            inner: RwLock::new(FifoMap::new(capacity)),
            ttl_ms,
        }
    }

    pub fn get(&self, token_id: &str, now_ms: i64) -> Option<BookTop> {
        let inner = self.inner.read();
        let top = inner.get(token_id)?;
        if now_ms - top.fetched_at_ms < self.ttl_ms {
            Some(*top)
        } else {
            None
        }
    }

    pub fn set(&self, token_id: &str, top: BookTop) {
        self.inner.write().insert(token_id.to_string(), top);
    }

    pub fn invalidate(&self, token_id: &str) {
        self.inner.write().remove(token_id);
    }

    pub fn invalidate_all(&self) {
        self.inner.write().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }
}

// ---------------------------------------------------------------------------
// Market end-time cache
// ---------------------------------------------------------------------------

/// Default cap for the end-time cache.
pub const END_TIME_CACHE_CAPACITY: usize = 1000;

/// Token → market end time (epoch ms). End times never change, so no TTL.
pub struct EndTimeCache {
    inner: RwLock<FifoMap<i64>>,
}

impl EndTimeCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(FifoMap::new(capacity)),
        }
    }

    pub fn get(&self, token_id: &str) -> Option<i64> {
        self.inner.read().get(token_id).copied()
    }

    pub fn set(&self, token_id: &str, end_time_ms: i64) {
        self.inner.write().insert(token_id.to_string(), end_time_ms);
    }

    pub fn clear(&self) {
        self.inner.write().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }
}
