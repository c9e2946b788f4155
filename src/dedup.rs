// =============================================================================
// Log Deduper — rate-limits repetitive log emissions
// =============================================================================
//
// Callers ask `should_log(key, ttl_ms, fingerprint)` before emitting a log
// line that is likely to repeat every refresh cycle. The same (key,
// fingerprint) pair fires at most once per TTL; a changed fingerprint counts
// as a new event and fires immediately.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;

/// Maximum number of distinct (key, fingerprint) entries retained. Oldest
/// entries are evicted first (insertion order).
const MAX_ENTRIES: usize = 1000;

/// Thread-safe deduplication gate for log lines.
pub struct LogDeduper {
    inner: RwLock<Inner>,
}

struct Inner {
    last_emitted: HashMap<String, i64>,
    insertion_order: Vec<String>,
}

impl LogDeduper {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                last_emitted: HashMap::new(),
                insertion_order: Vec::new(),
            }),
        }
    }

    /// Return `true` iff no log with the same `key` and `fingerprint` has
    /// been approved within the last `ttl_ms` milliseconds.
    ///
    /// A `true` return records the emission, so callers must only ask when
    /// they intend to log on approval.
    pub fn should_log(&self, key: &str, ttl_ms: i64, fingerprint: Option<&str>, now_ms: i64) -> bool {
        let composite = match fingerprint {
            Some(fp) => format!("{key}|{fp}"),
            None => format!("{key}|"),
        };

        let mut inner = self.inner.write();
        if let Some(&last) = inner.last_emitted.get(&composite) {
            if now_ms - last < ttl_ms {
                return false;
            }
        }

        if !inner.last_emitted.contains_key(&composite) {
            inner.insertion_order.push(composite.clone());
            while inner.insertion_order.len() > MAX_ENTRIES {
                let oldest = inner.insertion_order.remove(0);
                inner.last_emitted.remove(&oldest);
            }
        }
        inner.last_emitted.insert(composite, now_ms);
        true
    }

    /// Forget all suppression state (soft reset).
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.last_emitted.clear();
        inner.insertion_order.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.read().last_emitted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LogDeduper {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LogDeduper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogDeduper")
            .field("entries", &self.len())
            .finish()
    }
}
