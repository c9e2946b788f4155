// =============================================================================
// Runtime Configuration — engine tunables with atomic save
// =============================================================================
//
// Every cadence, TTL, cap, and threshold the engine honours lives here so
// operators can tune behaviour without recompiling. Persistence uses an
// atomic tmp + rename pattern to prevent corruption on crash. All fields
// carry `#[serde(default)]` so adding new fields never breaks loading an
// older config file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_refresh_interval_ms() -> u64 {
    30_000
}

fn default_min_refresh_ms() -> u64 {
    5_000
}

fn default_api_timeout_ms() -> u64 {
    10_000
}

fn default_watchdog_timeout_ms() -> u64 {
    15_000
}

fn default_base_backoff_ms() -> u64 {
    5_000
}

fn default_max_backoff_ms() -> u64 {
    120_000
}

fn default_max_stale_age_ms() -> i64 {
    30_000
}

fn default_soft_reset_failure_threshold() -> u32 {
    5
}

fn default_hard_reset_degraded_ms() -> u64 {
    120_000
}

fn default_recovery_mode_max_cycles() -> u32 {
    3
}

fn default_outcome_cache_capacity() -> usize {
    crate::caches::OUTCOME_CACHE_CAPACITY
}

fn default_outcome_cache_ttl_ms() -> i64 {
    crate::caches::OUTCOME_ACTIVE_TTL_MS
}

fn default_order_book_cache_capacity() -> usize {
    crate::caches::BOOK_CACHE_CAPACITY
}

fn default_order_book_cache_ttl_ms() -> i64 {
    crate::caches::BOOK_CACHE_TTL_MS
}

fn default_end_time_cache_capacity() -> usize {
    crate::caches::END_TIME_CACHE_CAPACITY
}

fn default_entry_meta_cache_ttl_ms() -> i64 {
    90_000
}

fn default_trades_per_page() -> u32 {
    500
}

fn default_max_trade_pages() -> u32 {
    20
}

fn default_gamma_batch_size() -> usize {
    25
}

fn default_enrich_batch_size() -> usize {
    5
}

fn default_enrich_batch_pause_ms() -> u64 {
    200
}

fn default_book_anomaly_spread() -> f64 {
    0.20
}

fn default_sticky_address_ms() -> i64 {
    600_000
}

fn default_profile_cache_ttl_ms() -> i64 {
    300_000
}

fn default_onchain_cache_ttl_ms() -> i64 {
    300_000
}

fn default_health_log_interval_ms() -> i64 {
    300_000
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level runtime configuration for the portfolio engine.
///
/// Every field has a serde default so older JSON files missing new fields
/// still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    // --- Refresh cadence -----------------------------------------------------

    /// Period of the background refresh tick.
    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,

    /// Hard floor between two refreshes regardless of callers.
    #[serde(default = "default_min_refresh_ms")]
    pub min_refresh_ms: u64,

    /// Per-request deadline for outbound HTTP calls.
    #[serde(default = "default_api_timeout_ms")]
    pub api_timeout_ms: u64,

    /// Deadline for one whole refresh; exceeding it aborts in-flight I/O.
    #[serde(default = "default_watchdog_timeout_ms")]
    pub watchdog_timeout_ms: u64,

    // --- Failure handling ----------------------------------------------------

    /// First backoff step after a failed refresh; doubles per failure.
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,

    /// Backoff ceiling.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Stale-snapshot age that triggers automatic soft recovery.
    #[serde(default = "default_max_stale_age_ms")]
    pub max_stale_age_ms: i64,

    /// Consecutive refresh failures that trigger a soft reset.
    #[serde(default = "default_soft_reset_failure_threshold")]
    pub soft_reset_failure_threshold: u32,

    /// Cumulative time in degraded mode that triggers a hard reset.
    #[serde(default = "default_hard_reset_degraded_ms")]
    pub hard_reset_degraded_ms: u64,

    /// Successful cycles after which recovery mode exits unconditionally.
    #[serde(default = "default_recovery_mode_max_cycles")]
    pub recovery_mode_max_cycles: u32,

    // --- Cache sizing --------------------------------------------------------

    #[serde(default = "default_outcome_cache_capacity")]
    pub outcome_cache_capacity: usize,

    /// TTL for unresolved outcome entries; resolved entries never expire.
    #[serde(default = "default_outcome_cache_ttl_ms")]
    pub outcome_cache_ttl_ms: i64,

    #[serde(default = "default_order_book_cache_capacity")]
    pub order_book_cache_capacity: usize,

    #[serde(default = "default_order_book_cache_ttl_ms")]
    pub order_book_cache_ttl_ms: i64,

    #[serde(default = "default_end_time_cache_capacity")]
    pub end_time_cache_capacity: usize,

    #[serde(default = "default_entry_meta_cache_ttl_ms")]
    pub entry_meta_cache_ttl_ms: i64,

    #[serde(default = "default_onchain_cache_ttl_ms")]
    pub onchain_cache_ttl_ms: i64,

    #[serde(default = "default_profile_cache_ttl_ms")]
    pub profile_cache_ttl_ms: i64,

    // --- Trade-history pagination -------------------------------------------

    #[serde(default = "default_trades_per_page")]
    pub trades_per_page: u32,

    #[serde(default = "default_max_trade_pages")]
    pub max_trade_pages: u32,

    /// Base `time_held_sec` on the latest BUY instead of the earliest.
    #[serde(default)]
    pub use_last_acquired_for_time_held: bool,

    // --- Enrichment shape ----------------------------------------------------

    /// Token ids per Gamma markets request.
    #[serde(default = "default_gamma_batch_size")]
    pub gamma_batch_size: usize,

    /// Positions enriched concurrently per batch.
    #[serde(default = "default_enrich_batch_size")]
    pub enrich_batch_size: usize,

    /// Pause between enrichment batches.
    #[serde(default = "default_enrich_batch_pause_ms")]
    pub enrich_batch_pause_ms: u64,

    /// Bid/ask spread above which a book is flagged anomalous.
    #[serde(default = "default_book_anomaly_spread")]
    pub book_anomaly_spread: f64,

    // --- Address selection ---------------------------------------------------

    /// Window during which the holding-address choice will not flip without
    /// strong evidence.
    #[serde(default = "default_sticky_address_ms")]
    pub sticky_address_ms: i64,

    // --- Observability -------------------------------------------------------

    #[serde(default = "default_health_log_interval_ms")]
    pub health_log_interval_ms: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        // Deserialising an empty object applies every field default.
        serde_json::from_str("{}").expect("empty config must deserialise")
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;

        info!(
            path = %path.display(),
            refresh_interval_ms = config.refresh_interval_ms,
            "engine config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise engine config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }
}
