// =============================================================================
// Entry Meta Resolver — acquisition history from paginated trade fills
// =============================================================================
//
// One wallet-wide sweep of the trade-history endpoint (side = BUY) serves
// every token in the portfolio: fills are grouped by token and reduced to a
// size-weighted entry price plus first/last acquisition timestamps. The
// sweep is cached briefly so repeated refreshes don't re-page the history.
// Failures are non-fatal; positions simply go without entry metadata.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::polymarket::Gateway;
use crate::position::EntryMeta;

/// Per-token reduction of the wallet's BUY fills.
#[derive(Debug, Clone, Copy)]
pub struct TokenEntryStats {
    /// Size-weighted mean BUY price, in cents.
    pub avg_entry_price_cents: f64,
    /// Epoch seconds of the earliest BUY.
    pub first_acquired_at: i64,
    /// Epoch seconds of the latest BUY.
    pub last_acquired_at: i64,
}

impl TokenEntryStats {
    /// Expand into the position-level metadata.
    pub fn to_entry_meta(&self, now_sec: i64, use_last_acquired: bool) -> EntryMeta {
        let anchor = if use_last_acquired {
            self.last_acquired_at
        } else {
            self.first_acquired_at
        };
        EntryMeta {
            avg_entry_price_cents: self.avg_entry_price_cents,
            first_acquired_at: self.first_acquired_at,
            last_acquired_at: self.last_acquired_at,
            time_held_sec: (now_sec - anchor).max(0),
        }
    }
}

struct CachedSweep {
    address: String,
    fetched_at_ms: i64,
    stats: HashMap<String, TokenEntryStats>,
}

/// Batched, cached resolver of per-token entry metadata.
pub struct EntryMetaResolver {
    gateway: Arc<dyn Gateway>,
    cache: RwLock<Option<CachedSweep>>,
    cache_ttl_ms: i64,
    trades_per_page: u32,
    max_pages: u32,
}

impl EntryMetaResolver {
    pub fn new(
        gateway: Arc<dyn Gateway>,
        cache_ttl_ms: i64,
        trades_per_page: u32,
        max_pages: u32,
    ) -> Self {
        Self {
            gateway,
            cache: RwLock::new(None),
            cache_ttl_ms,
            trades_per_page: trades_per_page.max(1),
            max_pages: max_pages.max(1),
        }
    }

    /// Entry stats for every token the wallet has bought, keyed by token id.
    ///
    /// Returns an empty map when the sweep fails; the error never escapes.
    pub async fn resolve(&self, address: &str, now_ms: i64) -> HashMap<String, TokenEntryStats> {
        {
            let cache = self.cache.read();
            if let Some(sweep) = cache.as_ref() {
                if sweep.address == address && now_ms - sweep.fetched_at_ms < self.cache_ttl_ms {
                    return sweep.stats.clone();
                }
            }
        }

        let stats = match self.sweep(address).await {
            Ok(stats) => stats,
            Err(err) => {
                warn!(address, error = %err, "trade-history sweep failed — positions go without entry metadata");
                return HashMap::new();
            }
        };

        debug!(address, tokens = stats.len(), "entry metadata resolved");

        *self.cache.write() = Some(CachedSweep {
            address: address.to_string(),
            fetched_at_ms: now_ms,
            stats: stats.clone(),
        });
        stats
    }

    /// Drop the cached sweep.
    pub fn clear(&self) {
        *self.cache.write() = None;
    }

    async fn sweep(&self, address: &str) -> anyhow::Result<HashMap<String, TokenEntryStats>> {
        struct Accum {
            weighted_price_sum: f64,
            size_sum: f64,
            first_at: i64,
            last_at: i64,
        }

        let mut accum: HashMap<String, Accum> = HashMap::new();

        for page in 0..self.max_pages {
            let offset = page * self.trades_per_page;
            let fills = self
                .gateway
                .fetch_trades(address, "BUY", self.trades_per_page, offset)
                .await?;

            let page_len = fills.len();

            for fill in fills {
                let Some(token) = fill.asset else { continue };
                let size = fill.size.unwrap_or(0.0);
                let price = fill.price.unwrap_or(0.0);
                if size <= 0.0 || price <= 0.0 {
                    continue;
                }

                let entry = accum.entry(token).or_insert(Accum {
                    weighted_price_sum: 0.0,
                    size_sum: 0.0,
                    first_at: i64::MAX,
                    last_at: i64::MIN,
                });
                entry.weighted_price_sum += price * size;
                entry.size_sum += size;
                entry.first_at = entry.first_at.min(fill.timestamp);
                entry.last_at = entry.last_at.max(fill.timestamp);
            }

            if page_len < self.trades_per_page as usize {
                break;
            }
        }

        Ok(accum
            .into_iter()
            .filter(|(_, a)| a.size_sum > 0.0)
            .map(|(token, a)| {
                (
                    token,
                    TokenEntryStats {
                        avg_entry_price_cents: (a.weighted_price_sum / a.size_sum) * 100.0,
                        first_acquired_at: a.first_at,
                        last_acquired_at: a.last_at,
                    },
                )
            })
            .collect())
    }
}

impl std::fmt::Debug for EntryMetaResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryMetaResolver")
            .field("trades_per_page", &self.trades_per_page)
            .field("max_pages", &self.max_pages)
            .finish()
    }
}
