// =============================================================================
// On-Chain Redeemable Prober — cached payoutDenominator reads
// =============================================================================
//
// The settlement contract is the ground truth for redeemability: a non-zero
// `payoutDenominator(conditionId)` means payouts have been reported and the
// shares can be redeemed. Reads go through the gateway and are cached per
// condition id, since a resolved denominator never goes back to zero and an
// unresolved one rarely flips within minutes.
// =============================================================================

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::caches::FifoMap;
use crate::polymarket::Gateway;

/// Conditions tracked at once; oldest evicted first.
const CHAIN_CACHE_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy)]
struct ChainEntry {
    denominator: u128,
    checked_at_ms: i64,
}

/// Cached reader of `payoutDenominator` per condition id.
pub struct ChainProber {
    gateway: Arc<dyn Gateway>,
    cache: RwLock<FifoMap<ChainEntry>>,
    ttl_ms: i64,
}

impl ChainProber {
    pub fn new(gateway: Arc<dyn Gateway>, ttl_ms: i64) -> Self {
        Self {
            gateway,
            cache: RwLock::new(FifoMap::new(CHAIN_CACHE_CAPACITY)),
            ttl_ms,
        }
    }

    /// Whether the condition has reported payouts on-chain.
    ///
    /// Served from cache within the TTL; otherwise one `eth_call` through
    /// the gateway.
    pub async fn is_redeemable(&self, condition_id: &str, now_ms: i64) -> anyhow::Result<bool> {
        if let Some(entry) = self.cached(condition_id, now_ms) {
            return Ok(entry.denominator > 0);
        }

        let denominator = self.gateway.payout_denominator(condition_id).await?;
        debug!(condition_id, denominator, "payout denominator probed");

        self.cache.write().insert(
            condition_id.to_string(),
            ChainEntry {
                denominator,
                checked_at_ms: now_ms,
            },
        );
        Ok(denominator > 0)
    }

    /// Drop all cached reads (hard reset).
    pub fn clear(&self) {
        self.cache.write().clear();
    }

    pub fn len(&self) -> usize {
        self.cache.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn cached(&self, condition_id: &str, now_ms: i64) -> Option<ChainEntry> {
        let cache = self.cache.read();
        let entry = cache.get(condition_id)?;
        if now_ms - entry.checked_at_ms < self.ttl_ms {
            Some(*entry)
        } else {
            None
        }
    }
}

impl std::fmt::Debug for ChainProber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainProber")
            .field("cached_conditions", &self.len())
            .field("ttl_ms", &self.ttl_ms)
            .finish()
    }
}
