// =============================================================================
// Gamma Outcome Fetcher — batched market resolution lookups with fallback
// =============================================================================
//
// Resolves each token's market outcome (winner, closed flag, end time)
// through the Gamma markets endpoint. Token ids are chunked into batches; a
// batch that fails with 422 / 429 / 5xx is retried token-by-token. Failures
// are non-fatal: a token without an outcome entry simply stays unverified
// this cycle.
// =============================================================================

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::caches::{EndTimeCache, OutcomeCache, OutcomeEntry};
use crate::polymarket::types::GammaMarket;
use crate::polymarket::{batch_should_fall_back, Gateway};

// ---------------------------------------------------------------------------
// Per-refresh metrics
// ---------------------------------------------------------------------------

/// Counters for the current refresh cycle; reset at the start of each.
#[derive(Debug, Default)]
pub struct GammaCounters {
    pub requests: AtomicU64,
    pub token_ids_fetched: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
}

/// Serialisable snapshot of [`GammaCounters`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct GammaMetrics {
    pub gamma_requests: u64,
    pub token_ids_fetched: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

impl GammaCounters {
    pub fn reset(&self) {
        self.requests.store(0, Ordering::Relaxed);
        self.token_ids_fetched.store(0, Ordering::Relaxed);
        self.cache_hits.store(0, Ordering::Relaxed);
        self.cache_misses.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> GammaMetrics {
        GammaMetrics {
            gamma_requests: self.requests.load(Ordering::Relaxed),
            token_ids_fetched: self.token_ids_fetched.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
        }
    }
}

// ---------------------------------------------------------------------------
// Winner determination
// ---------------------------------------------------------------------------

/// Choose the winning outcome of a market, in priority order:
/// 1. the highest `outcomePrices` entry when it exceeds 0.5,
/// 2. an explicit winner field,
/// 3. any token flagged `winner == true`.
pub fn determine_winner(market: &GammaMarket) -> Option<String> {
    if !market.outcome_prices.is_empty() && market.outcome_prices.len() == market.outcomes.len() {
        let (idx, &best) = market
            .outcome_prices
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))?;
        if best > 0.5 {
            return market.outcomes.get(idx).cloned();
        }
    }

    if let Some(explicit) = market.resolved_outcome.as_ref() {
        if !explicit.is_empty() {
            return Some(explicit.clone());
        }
    }

    market
        .tokens
        .iter()
        .find(|t| t.winner)
        .and_then(|t| t.outcome.clone())
}

// ---------------------------------------------------------------------------
// Fetcher
// ---------------------------------------------------------------------------

/// Batched + single-token-fallback resolver for market outcomes.
pub struct OutcomeFetcher {
    gateway: Arc<dyn Gateway>,
    cache: Arc<OutcomeCache>,
    end_times: Arc<EndTimeCache>,
    counters: GammaCounters,
    batch_size: usize,
}

impl OutcomeFetcher {
    pub fn new(
        gateway: Arc<dyn Gateway>,
        cache: Arc<OutcomeCache>,
        end_times: Arc<EndTimeCache>,
        batch_size: usize,
    ) -> Self {
        Self {
            gateway,
            cache,
            end_times,
            counters: GammaCounters::default(),
            batch_size: batch_size.max(1),
        }
    }

    /// Reset the per-refresh counters. Called once at the top of each cycle.
    pub fn begin_refresh(&self) {
        self.counters.reset();
    }

    pub fn metrics(&self) -> GammaMetrics {
        self.counters.snapshot()
    }

    /// Cached outcome for one token, honouring the ACTIVE TTL.
    pub fn cached(&self, token_id: &str, now_ms: i64) -> Option<OutcomeEntry> {
        self.cache.get(token_id, now_ms)
    }

    /// Ensure outcome entries exist for as many of `token_ids` as possible.
    ///
    /// Tokens with a valid cache entry are skipped; the rest are fetched in
    /// batches with per-token fallback on batch-level 422 / 429 / 5xx.
    pub async fn prime(&self, token_ids: &[String], now_ms: i64) {
        let mut missing: Vec<String> = Vec::new();
        let mut seen: HashSet<&str> = HashSet::new();

        for token in token_ids {
            if !seen.insert(token.as_str()) {
                continue;
            }
            if self.cache.get(token, now_ms).is_some() {
                self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            } else {
                self.counters.cache_misses.fetch_add(1, Ordering::Relaxed);
                missing.push(token.clone());
            }
        }

        if missing.is_empty() {
            return;
        }

        debug!(missing = missing.len(), "priming market outcomes");

        for chunk in missing.chunks(self.batch_size) {
            self.counters.requests.fetch_add(1, Ordering::Relaxed);
            match self.gateway.fetch_markets_by_token_ids(chunk).await {
                Ok(markets) => {
                    self.counters
                        .token_ids_fetched
                        .fetch_add(chunk.len() as u64, Ordering::Relaxed);
                    self.absorb(&markets, chunk, now_ms);
                }
                Err(err) if batch_should_fall_back(&err) => {
                    warn!(
                        chunk_size = chunk.len(),
                        error = %err,
                        "gamma batch failed — retrying tokens individually"
                    );
                    for token in chunk {
                        self.counters.requests.fetch_add(1, Ordering::Relaxed);
                        match self
                            .gateway
                            .fetch_markets_by_token_ids(std::slice::from_ref(token))
                            .await
                        {
                            Ok(markets) => {
                                self.counters.token_ids_fetched.fetch_add(1, Ordering::Relaxed);
                                self.absorb(&markets, std::slice::from_ref(token), now_ms);
                            }
                            Err(single_err) => {
                                debug!(
                                    token_id = %token,
                                    error = %single_err,
                                    "single-token gamma lookup failed — token stays unverified"
                                );
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!(
                        chunk_size = chunk.len(),
                        error = %err,
                        "gamma batch failed — tokens stay unverified this cycle"
                    );
                }
            }
        }
    }

    /// Map fetched markets back to the tokens that requested them and update
    /// the outcome and end-time caches.
    fn absorb(&self, markets: &[GammaMarket], requested: &[String], now_ms: i64) {
        let requested_set: HashSet<&str> = requested.iter().map(|s| s.as_str()).collect();

        for market in markets {
            let winner = determine_winner(market);
            let resolved = winner.is_some();
            let market_closed = market.closed.unwrap_or(false) || resolved;
            let end_time_ms = market.end_time_ms();

            for token in market.token_ids() {
                if !requested_set.contains(token.as_str()) {
                    continue;
                }

                if let Some(end_ms) = end_time_ms {
                    self.end_times.set(&token, end_ms);
                }

                self.cache.set(
                    &token,
                    OutcomeEntry {
                        winner: winner.clone(),
                        resolved,
                        market_closed,
                        end_time_ms,
                        resolved_at_ms: if resolved { Some(now_ms) } else { None },
                        last_checked_ms: now_ms,
                    },
                );
            }
        }
    }
}

impl std::fmt::Debug for OutcomeFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutcomeFetcher")
            .field("batch_size", &self.batch_size)
            .field("cached_outcomes", &self.cache.len())
            .finish()
    }
}
