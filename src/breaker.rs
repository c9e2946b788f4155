// =============================================================================
// Per-Token Circuit Breaker — suspends price fetches for failing tokens
// =============================================================================
//
// Failures for a token are counted within a sliding window. Three failures
// inside the window open the circuit for a cooldown period, during which
// callers must skip the upstream call and reuse the token's last known price
// (emitting the position with `exec_price_trusted = false`). A success closes
// and deletes the entry; an expired cooldown deletes it lazily on the next
// query.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::types::ErrorKind;

/// Failures older than this no longer count toward opening the circuit.
const WINDOW_MS: i64 = 30_000;
/// Consecutive in-window failures required to open the circuit.
const OPEN_THRESHOLD: u32 = 3;
/// How long an open circuit stays open.
const COOLDOWN_MS: i64 = 60_000;
/// Maximum tracked tokens; oldest entries are evicted first.
const MAX_ENTRIES: usize = 500;

/// Bookkeeping for one token's recent failures.
#[derive(Debug, Clone)]
pub struct BreakerEntry {
    pub first_failure_at_ms: i64,
    pub failure_count: u32,
    /// 0 while the circuit is closed.
    pub opened_at_ms: i64,
    pub error_kind: ErrorKind,
    /// Price observed before the failures began, reusable while open.
    pub last_known_price: Option<f64>,
}

/// Thread-safe per-token circuit breaker.
pub struct TokenCircuitBreaker {
    inner: RwLock<Inner>,
}

struct Inner {
    entries: HashMap<String, BreakerEntry>,
    insertion_order: Vec<String>,
}

impl TokenCircuitBreaker {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                entries: HashMap::new(),
                insertion_order: Vec::new(),
            }),
        }
    }

    /// Record a failed upstream call for `token_id`.
    ///
    /// Returns `true` if this failure opened the circuit.
    pub fn record_failure(
        &self,
        token_id: &str,
        kind: ErrorKind,
        last_known_price: Option<f64>,
        now_ms: i64,
    ) -> bool {
        let mut inner = self.inner.write();

        let entry = match inner.entries.get_mut(token_id) {
            Some(e) => {
                if now_ms - e.first_failure_at_ms > WINDOW_MS {
                    // Stale window — start counting over.
                    e.first_failure_at_ms = now_ms;
                    e.failure_count = 1;
                } else {
                    e.failure_count += 1;
                }
                e.error_kind = kind;
                if last_known_price.is_some() {
                    e.last_known_price = last_known_price;
                }
                e.clone()
            }
            None => {
                let e = BreakerEntry {
                    first_failure_at_ms: now_ms,
                    failure_count: 1,
                    opened_at_ms: 0,
                    error_kind: kind,
                    last_known_price,
                };
                inner.insertion_order.push(token_id.to_string());
                inner.entries.insert(token_id.to_string(), e.clone());
                Self::evict_over_capacity(&mut inner);
                e
            }
        };

        if entry.failure_count >= OPEN_THRESHOLD && entry.opened_at_ms == 0 {
            if let Some(e) = inner.entries.get_mut(token_id) {
                e.opened_at_ms = now_ms;
            }
            warn!(
                token_id,
                failures = entry.failure_count,
                error_kind = %kind,
                cooldown_ms = COOLDOWN_MS,
                "circuit opened — suspending price fetches for token"
            );
            return true;
        }

        debug!(
            token_id,
            failures = entry.failure_count,
            error_kind = %kind,
            "token failure recorded"
        );
        false
    }

    /// Whether the circuit for `token_id` is currently open. An entry whose
    /// cooldown has elapsed is deleted and reported closed.
    pub fn is_open(&self, token_id: &str, now_ms: i64) -> bool {
        {
            let inner = self.inner.read();
            match inner.entries.get(token_id) {
                Some(e) if e.opened_at_ms > 0 => {
                    if now_ms - e.opened_at_ms < COOLDOWN_MS {
                        return true;
                    }
                }
                _ => return false,
            }
        }
        // Cooldown elapsed — drop the entry so the token gets a clean slate.
        let mut inner = self.inner.write();
        if let Some(e) = inner.entries.get(token_id) {
            if e.opened_at_ms > 0 && now_ms - e.opened_at_ms >= COOLDOWN_MS {
                inner.entries.remove(token_id);
                inner.insertion_order.retain(|t| t != token_id);
                debug!(token_id, "circuit cooldown elapsed — entry cleared");
            }
        }
        false
    }

    /// A successful call wipes any failure history for the token.
    pub fn record_success(&self, token_id: &str) {
        let mut inner = self.inner.write();
        if inner.entries.remove(token_id).is_some() {
            inner.insertion_order.retain(|t| t != token_id);
        }
    }

    /// Last price observed for the token before its failures, if any.
    pub fn last_known_price(&self, token_id: &str) -> Option<f64> {
        self.inner.read().entries.get(token_id).and_then(|e| e.last_known_price)
    }

    /// Drop all entries (hard reset).
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.entries.clear();
        inner.insertion_order.clear();
    }

    /// Remove bookkeeping for a token that has left the portfolio.
    pub fn forget(&self, token_id: &str) {
        self.record_success(token_id);
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict_over_capacity(inner: &mut Inner) {
        while inner.insertion_order.len() > MAX_ENTRIES {
            let oldest = inner.insertion_order.remove(0);
            inner.entries.remove(&oldest);
        }
    }
}

impl Default for TokenCircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TokenCircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCircuitBreaker")
            .field("tracked_tokens", &self.len())
            .finish()
    }
}
