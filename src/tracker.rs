// =============================================================================
// Portfolio Tracker — refresh controller, atomic publish, query surface
// =============================================================================
//
// The tracker periodically rebuilds a consistent snapshot of the wallet's
// open positions and publishes it atomically. One refresh is in flight at
// most at any instant; concurrent callers join the outcome of the running
// cycle. A refresh that fails or produces a rejected candidate re-publishes
// the last good snapshot marked stale, and repeated failures escalate
// through soft and hard resets until the pipeline heals itself.
//
// All read paths serve Arc clones or defensive copies of the published
// snapshot; nothing hands out a mutable view.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::address::AddressResolver;
use crate::breaker::TokenCircuitBreaker;
use crate::caches::{BookCache, EndTimeCache, OutcomeCache};
use crate::dedup::LogDeduper;
use crate::enrich::{Enriched, Enricher};
use crate::entry_meta::EntryMetaResolver;
use crate::onchain::ChainProber;
use crate::outcome::{GammaMetrics, OutcomeFetcher};
use crate::polymarket::Gateway;
use crate::position::{PortfolioSnapshot, Position, RawCounts, SnapshotSummary};
use crate::runtime_config::EngineConfig;
use crate::types::{now_ms, PnlClassification, PositionState, ResetLevel, SkipReason};
use crate::validate::{needs_corrective_action, validate, CandidateStats, ValidationFlags, Verdict};

// ---------------------------------------------------------------------------
// Status types served by the query surface
// ---------------------------------------------------------------------------

/// Recovery-mode view for operators and strategies.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryStatus {
    pub recovery_mode: bool,
    pub recovery_cycles: u32,
    pub bootstrap_pending: bool,
}

/// Self-heal view: failure streaks, backoff, and reset history.
#[derive(Debug, Clone, Serialize)]
pub struct SelfHealStatus {
    pub consecutive_failures: u32,
    pub degraded_for_ms: Option<u64>,
    pub current_backoff_ms: u64,
    pub soft_resets: u64,
    pub hard_resets: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_reset: Option<ResetLevel>,
}

/// Refresh-loop counters.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshMetrics {
    pub refresh_total: u64,
    pub refresh_failures: u64,
    pub snapshots_rejected: u64,
    pub last_refresh_duration_ms: u64,
    pub last_cycle_id: u64,
    pub gamma: GammaMetrics,
}

struct RecoveryState {
    active: bool,
    cycles: u32,
}

struct TokenSeen {
    first_seen_ms: i64,
    last_seen_ms: i64,
}

/// Exponential backoff after `failures` consecutive failed refreshes.
fn compute_backoff(base_ms: u64, failures: u32, max_ms: u64) -> u64 {
    if base_ms == 0 || failures == 0 {
        return 0;
    }
    let shift = (failures - 1).min(16);
    base_ms.saturating_mul(1u64 << shift).min(max_ms)
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

/// The portfolio state engine. Construct once, share via `Arc`, and spawn
/// [`PortfolioTracker::run`] as a background task.
pub struct PortfolioTracker {
    gateway: Arc<dyn Gateway>,
    config: EngineConfig,

    // Sub-engines.
    dedup: Arc<LogDeduper>,
    breaker: Arc<TokenCircuitBreaker>,
    book_cache: Arc<BookCache>,
    outcome_cache: Arc<OutcomeCache>,
    end_times: Arc<EndTimeCache>,
    missing_books: Arc<RwLock<HashSet<String>>>,
    outcomes: Arc<OutcomeFetcher>,
    chain: Arc<ChainProber>,
    entry_meta: EntryMetaResolver,
    address: AddressResolver,
    enricher: Enricher,

    // Published state.
    published: RwLock<Option<Arc<PortfolioSnapshot>>>,
    positions_by_key: RwLock<Arc<HashMap<(String, String), Position>>>,
    last_good: RwLock<Option<Arc<PortfolioSnapshot>>>,
    cycle_counter: AtomicU64,

    // Refresh controller.
    refresh_gate: tokio::sync::Mutex<()>,
    refresh_generation: AtomicU64,
    last_refresh_started: RwLock<Option<Instant>>,
    consecutive_failures: AtomicU64,
    current_backoff_ms: AtomicU64,
    degraded_since: RwLock<Option<Instant>>,
    recovery: RwLock<RecoveryState>,
    bootstrap_pending: AtomicBool,
    soft_resets: AtomicU64,
    hard_resets: AtomicU64,
    last_reset: RwLock<Option<ResetLevel>>,
    last_health_log: RwLock<Instant>,

    // Metrics.
    refresh_total: AtomicU64,
    refresh_failures_total: AtomicU64,
    snapshots_rejected: AtomicU64,
    last_refresh_duration_ms: AtomicU64,

    // Per-token bookkeeping, garbage-collected on quiet tokens.
    token_seen: RwLock<HashMap<String, TokenSeen>>,
}

impl PortfolioTracker {
    /// Build a tracker for `eoa` over the given gateway.
    pub fn new(gateway: Arc<dyn Gateway>, eoa: impl Into<String>, config: EngineConfig) -> Self {
        let dedup = Arc::new(LogDeduper::new());
        let breaker = Arc::new(TokenCircuitBreaker::new());
        let book_cache = Arc::new(BookCache::new(
            config.order_book_cache_capacity,
            config.order_book_cache_ttl_ms,
        ));
        let outcome_cache = Arc::new(OutcomeCache::new(
            config.outcome_cache_capacity,
            config.outcome_cache_ttl_ms,
        ));
        let end_times = Arc::new(EndTimeCache::new(config.end_time_cache_capacity));
        let missing_books = Arc::new(RwLock::new(HashSet::new()));

        let outcomes = Arc::new(OutcomeFetcher::new(
            gateway.clone(),
            outcome_cache.clone(),
            end_times.clone(),
            config.gamma_batch_size,
        ));
        let chain = Arc::new(ChainProber::new(gateway.clone(), config.onchain_cache_ttl_ms));
        let entry_meta = EntryMetaResolver::new(
            gateway.clone(),
            config.entry_meta_cache_ttl_ms,
            config.trades_per_page,
            config.max_trade_pages,
        );
        let address = AddressResolver::new(
            gateway.clone(),
            dedup.clone(),
            eoa,
            config.sticky_address_ms,
            config.profile_cache_ttl_ms,
        );
        let enricher = Enricher::new(
            gateway.clone(),
            breaker.clone(),
            book_cache.clone(),
            outcomes.clone(),
            chain.clone(),
            dedup.clone(),
            missing_books.clone(),
            end_times.clone(),
            config.book_anomaly_spread,
        );

        Self {
            gateway,
            config,
            dedup,
            breaker,
            book_cache,
            outcome_cache,
            end_times,
            missing_books,
            outcomes,
            chain,
            entry_meta,
            address,
            enricher,
            published: RwLock::new(None),
            positions_by_key: RwLock::new(Arc::new(HashMap::new())),
            last_good: RwLock::new(None),
            cycle_counter: AtomicU64::new(0),
            refresh_gate: tokio::sync::Mutex::new(()),
            refresh_generation: AtomicU64::new(0),
            last_refresh_started: RwLock::new(None),
            consecutive_failures: AtomicU64::new(0),
            current_backoff_ms: AtomicU64::new(0),
            degraded_since: RwLock::new(None),
            recovery: RwLock::new(RecoveryState {
                active: false,
                cycles: 0,
            }),
            bootstrap_pending: AtomicBool::new(false),
            soft_resets: AtomicU64::new(0),
            hard_resets: AtomicU64::new(0),
            last_reset: RwLock::new(None),
            last_health_log: RwLock::new(Instant::now()),
            refresh_total: AtomicU64::new(0),
            refresh_failures_total: AtomicU64::new(0),
            snapshots_rejected: AtomicU64::new(0),
            last_refresh_duration_ms: AtomicU64::new(0),
            token_seen: RwLock::new(HashMap::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Driver loop
    // -------------------------------------------------------------------------

    /// Run the periodic refresh loop forever. Spawn once at startup:
    ///
    ///   tokio::spawn(tracker.clone().run());
    pub async fn run(self: Arc<Self>) {
        info!(
            interval_ms = self.config.refresh_interval_ms,
            "portfolio refresh loop started"
        );
        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.config.refresh_interval_ms.max(1)));
        loop {
            ticker.tick().await;
            self.refresh().await;
        }
    }

    // -------------------------------------------------------------------------
    // Refresh entry points
    // -------------------------------------------------------------------------

    /// Run (or join) a refresh and return the resulting published snapshot.
    pub async fn refresh(&self) -> Option<Arc<PortfolioSnapshot>> {
        let target = self.refresh_generation.load(Ordering::SeqCst) + 1;
        self.refresh_to_generation(target).await
    }

    /// Refresh keyed by generation: if `generation` has already completed,
    /// the current snapshot is returned without running another cycle.
    pub async fn refresh_for_cycle(&self, generation: u64) -> Option<Arc<PortfolioSnapshot>> {
        self.refresh_to_generation(generation).await
    }

    async fn refresh_to_generation(&self, target: u64) -> Option<Arc<PortfolioSnapshot>> {
        let _guard = self.refresh_gate.lock().await;

        // A cycle that completed while this caller waited for the gate
        // satisfies the request; single-flight joins it here.
        if self.refresh_generation.load(Ordering::SeqCst) >= target {
            return self.get_snapshot();
        }

        // Throttle: never refresh faster than the floor plus current backoff.
        let min_gap_ms = self
            .config
            .min_refresh_ms
            .max(self.current_backoff_ms.load(Ordering::Relaxed));
        if let Some(started) = *self.last_refresh_started.read() {
            if (started.elapsed().as_millis() as u64) < min_gap_ms {
                debug!(min_gap_ms, "refresh throttled");
                return self.get_snapshot();
            }
        }
        *self.last_refresh_started.write() = Some(Instant::now());
        self.refresh_total.fetch_add(1, Ordering::Relaxed);

        let started = Instant::now();
        let result = tokio::time::timeout(
            Duration::from_millis(self.config.watchdog_timeout_ms),
            self.run_refresh_cycle(),
        )
        .await;

        let now = now_ms();
        match result {
            Ok(Ok(snapshot)) => self.handle_success(snapshot, now),
            Ok(Err(err)) => {
                warn!(error = %err, "refresh cycle failed");
                self.handle_failure(err.to_string(), now);
            }
            Err(_) => {
                warn!(
                    watchdog_ms = self.config.watchdog_timeout_ms,
                    "refresh watchdog expired — in-flight requests aborted"
                );
                self.handle_failure("WATCHDOG_TIMEOUT".to_string(), now);
            }
        }

        self.last_refresh_duration_ms
            .store(started.elapsed().as_millis() as u64, Ordering::Relaxed);
        self.refresh_generation.fetch_add(1, Ordering::SeqCst);
        self.maybe_log_health(now);
        self.get_snapshot()
    }

    // -------------------------------------------------------------------------
    // One refresh cycle (phase A: build, phase B: validate)
    // -------------------------------------------------------------------------

    async fn run_refresh_cycle(&self) -> anyhow::Result<Arc<PortfolioSnapshot>> {
        let now = now_ms();
        self.outcomes.begin_refresh();

        let last_good_raw = self
            .last_good
            .read()
            .as_ref()
            .map(|s| s.raw_counts.raw_total);
        let address = self.address.resolve(last_good_raw, now).await;

        let raw = self
            .gateway
            .fetch_positions(&address)
            .await
            .context("positions index fetch failed")?;
        self.address.note_fetch_result(&address, raw.len());

        let raw_total = raw.len();
        let raw_redeemable_candidates = raw.iter().filter(|p| p.redeemable).count();
        let raw_counts = RawCounts {
            raw_total,
            raw_active_candidates: raw_total - raw_redeemable_candidates,
            raw_redeemable_candidates,
        };

        // Prime the outcome cache once for the whole cycle.
        let token_ids: Vec<String> = raw.iter().filter_map(|p| p.asset.clone()).collect();
        self.outcomes.prime(&token_ids, now).await;

        // Entry metadata is best-effort; a failed sweep returns empty.
        let entry_stats = self.entry_meta.resolve(&address, now).await;
        let now_sec = now / 1000;

        let mut active_positions: Vec<Position> = Vec::new();
        let mut redeemable_positions: Vec<Position> = Vec::new();
        let mut reasons: HashMap<SkipReason, u32> = HashMap::new();

        let batch_size = self.config.enrich_batch_size.max(1);
        let chunk_count = raw.chunks(batch_size).len();
        for (index, chunk) in raw.chunks(batch_size).enumerate() {
            let futures = chunk.iter().map(|rp| {
                let meta = rp
                    .asset
                    .as_deref()
                    .and_then(|t| entry_stats.get(t))
                    .map(|s| s.to_entry_meta(now_sec, self.config.use_last_acquired_for_time_held));
                self.enricher.enrich(rp, meta, now)
            });

            for enriched in futures_util::future::join_all(futures).await {
                match enriched {
                    Enriched::Kept(position, tags) => {
                        for tag in tags {
                            *reasons.entry(tag).or_insert(0) += 1;
                        }
                        if position.position_state == PositionState::Redeemable {
                            redeemable_positions.push(position);
                        } else {
                            active_positions.push(position);
                        }
                    }
                    Enriched::Skipped(reason) => {
                        *reasons.entry(reason).or_insert(0) += 1;
                    }
                }
            }

            if index + 1 < chunk_count && self.config.enrich_batch_pause_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.config.enrich_batch_pause_ms)).await;
            }
        }

        let summary = PortfolioSnapshot::tally(&active_positions, &redeemable_positions);
        let classification_reasons: HashMap<String, u32> = reasons
            .iter()
            .map(|(k, v)| (k.as_str().to_string(), *v))
            .collect();

        let candidate = PortfolioSnapshot {
            cycle_id: self.next_cycle_id(),
            address_used: address.clone(),
            fetched_at_ms: now,
            active_positions,
            redeemable_positions,
            summary,
            raw_counts,
            classification_reasons,
            stale: false,
            stale_age_ms: None,
            stale_reason: None,
        };

        // Phase B: rejection rules against the last good snapshot.
        let stats = CandidateStats {
            raw_total,
            raw_active_candidates: raw_counts.raw_active_candidates,
            final_active: candidate.active_positions.len(),
            final_redeemable: candidate.redeemable_positions.len(),
            reasons,
            address_used: address,
        };
        let flags = ValidationFlags {
            bootstrap: self.bootstrap_pending.swap(false, Ordering::SeqCst),
            recovery: self.recovery.read().active,
        };
        let last_good = self.last_good.read().clone();

        match validate(&stats, last_good.as_deref(), flags) {
            Verdict::Accept => {}
            Verdict::AcceptWithWarning(note) => {
                warn!(
                    cycle_id = candidate.cycle_id,
                    raw_total, note, "candidate snapshot accepted with degraded data"
                );
            }
            Verdict::Reject(reason) => {
                self.snapshots_rejected.fetch_add(1, Ordering::Relaxed);
                if needs_corrective_action(reason) {
                    self.address.request_probe();
                    self.outcome_cache.clear();
                }
                warn!(
                    cycle_id = candidate.cycle_id,
                    raw_total,
                    prev_raw = last_good.as_ref().map(|s| s.raw_counts.raw_total),
                    reject_reason = %reason,
                    "candidate snapshot rejected"
                );
                anyhow::bail!("snapshot rejected: {reason}");
            }
        }

        Ok(Arc::new(candidate))
    }

    // -------------------------------------------------------------------------
    // Success / failure handling
    // -------------------------------------------------------------------------

    fn handle_success(&self, snapshot: Arc<PortfolioSnapshot>, now: i64) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.current_backoff_ms.store(0, Ordering::Relaxed);
        *self.degraded_since.write() = None;

        self.install(&snapshot);
        *self.last_good.write() = Some(snapshot.clone());

        // Recovery-mode accounting.
        {
            let mut recovery = self.recovery.write();
            if recovery.active {
                recovery.cycles += 1;
                if snapshot.summary.active_total > 0
                    || recovery.cycles >= self.config.recovery_mode_max_cycles
                {
                    info!(
                        cycles = recovery.cycles,
                        active = snapshot.summary.active_total,
                        "recovery mode exited"
                    );
                    recovery.active = false;
                    recovery.cycles = 0;
                }
            }
        }

        self.note_tokens_and_gc(&snapshot, now);

        info!(
            cycle_id = snapshot.cycle_id,
            address = %snapshot.address_used,
            raw_total = snapshot.raw_counts.raw_total,
            active = snapshot.summary.active_total,
            redeemable = snapshot.summary.redeemable_total,
            profitable = snapshot.summary.profitable,
            losing = snapshot.summary.losing,
            unknown = snapshot.summary.unknown,
            "snapshot published"
        );
    }

    fn handle_failure(&self, reason: String, now: i64) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        self.refresh_failures_total.fetch_add(1, Ordering::Relaxed);
        if self.degraded_since.read().is_none() {
            *self.degraded_since.write() = Some(Instant::now());
        }

        // Self-heal first: a recommended reset retries without backoff.
        let performed = self.self_heal_recommendation(now);
        if let Some(level) = performed {
            self.perform_reset(level);
            self.current_backoff_ms.store(0, Ordering::Relaxed);
        } else {
            let backoff = compute_backoff(
                self.config.base_backoff_ms,
                failures as u32,
                self.config.max_backoff_ms,
            );
            self.current_backoff_ms.store(backoff, Ordering::Relaxed);
            debug!(failures, backoff_ms = backoff, "refresh backoff applied");
        }

        let last_good = self.last_good.read().clone();
        match last_good {
            Some(good) => {
                let age = (now - good.fetched_at_ms).max(0);
                let mut stale = (*good).clone();
                stale.cycle_id = self.next_cycle_id();
                stale.stale = true;
                stale.stale_age_ms = Some(age);
                stale.stale_reason = Some(reason);
                let stale = Arc::new(stale);
                self.install(&stale);

                warn!(
                    cycle_id = stale.cycle_id,
                    stale_age_ms = age,
                    failures,
                    "serving stale snapshot"
                );

                // Auto-recovery: a view this old is worse than starting over.
                if age >= self.config.max_stale_age_ms {
                    if performed.is_none() {
                        self.perform_reset(ResetLevel::Soft);
                    }
                    *self.last_good.write() = None;
                    self.bootstrap_pending.store(true, Ordering::SeqCst);
                    warn!(
                        stale_age_ms = age,
                        "stale snapshot exceeded maximum age — cleared for fresh bootstrap"
                    );
                }
            }
            None => {
                // Nothing worth protecting; reset everything.
                if performed != Some(ResetLevel::Hard) {
                    self.perform_reset(ResetLevel::Hard);
                }
            }
        }
    }

    fn self_heal_recommendation(&self, now: i64) -> Option<ResetLevel> {
        if let Some(since) = *self.degraded_since.read() {
            if since.elapsed().as_millis() as u64 >= self.config.hard_reset_degraded_ms {
                return Some(ResetLevel::Hard);
            }
        }

        let failures = self.consecutive_failures.load(Ordering::SeqCst);
        let stale_age = self
            .last_good
            .read()
            .as_ref()
            .map(|s| now - s.fetched_at_ms);

        if failures >= self.config.soft_reset_failure_threshold as u64
            || stale_age.map(|a| a >= self.config.max_stale_age_ms).unwrap_or(false)
        {
            return Some(ResetLevel::Soft);
        }
        None
    }

    fn perform_reset(&self, level: ResetLevel) {
        warn!(level = %level, "self-heal reset");

        // Common (soft) actions: transient caches, throttling, recovery.
        self.book_cache.invalidate_all();
        self.missing_books.write().clear();
        self.dedup.clear();
        self.outcome_cache.expire_active();
        self.address.reset_probe_flag();
        self.current_backoff_ms.store(0, Ordering::Relaxed);
        *self.last_refresh_started.write() = None;
        {
            let mut recovery = self.recovery.write();
            recovery.active = true;
            recovery.cycles = 0;
        }

        match level {
            ResetLevel::Soft => {
                self.soft_resets.fetch_add(1, Ordering::Relaxed);
            }
            ResetLevel::Hard => {
                self.outcome_cache.clear();
                self.end_times.clear();
                self.breaker.clear();
                self.chain.clear();
                self.entry_meta.clear();
                self.address.reset_hard();
                *self.last_good.write() = None;
                self.hard_resets.fetch_add(1, Ordering::Relaxed);
            }
        }

        *self.last_reset.write() = Some(level);
    }

    // -------------------------------------------------------------------------
    // Publication plumbing
    // -------------------------------------------------------------------------

    fn next_cycle_id(&self) -> u64 {
        self.cycle_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Atomically install a snapshot and its lookup map as the published
    /// view.
    fn install(&self, snapshot: &Arc<PortfolioSnapshot>) {
        let mut map: HashMap<(String, String), Position> = HashMap::new();
        for position in snapshot
            .active_positions
            .iter()
            .chain(snapshot.redeemable_positions.iter())
        {
            map.insert(
                (position.market_id.clone(), position.token_id.clone()),
                position.clone(),
            );
        }
        *self.positions_by_key.write() = Arc::new(map);
        *self.published.write() = Some(snapshot.clone());
    }

    fn note_tokens_and_gc(&self, snapshot: &PortfolioSnapshot, now: i64) {
        let mut seen = self.token_seen.write();
        for position in snapshot
            .active_positions
            .iter()
            .chain(snapshot.redeemable_positions.iter())
        {
            seen.entry(position.token_id.clone())
                .and_modify(|t| t.last_seen_ms = now)
                .or_insert(TokenSeen {
                    first_seen_ms: now,
                    last_seen_ms: now,
                });
        }

        let horizon = 2 * self.config.refresh_interval_ms as i64;
        let stale_tokens: Vec<(String, i64)> = seen
            .iter()
            .filter(|(_, t)| now - t.last_seen_ms > horizon)
            .map(|(token, t)| (token.clone(), t.first_seen_ms))
            .collect();

        for (token, first_seen_ms) in stale_tokens {
            seen.remove(&token);
            self.breaker.forget(&token);
            self.outcome_cache.remove(&token);
            self.missing_books.write().remove(&token);
            debug!(
                token_id = %token,
                tracked_for_ms = now - first_seen_ms,
                "token bookkeeping garbage-collected"
            );
        }
    }

    fn maybe_log_health(&self, now: i64) {
        let mut last = self.last_health_log.write();
        if (last.elapsed().as_millis() as i64) < self.config.health_log_interval_ms {
            return;
        }
        *last = Instant::now();
        drop(last);

        let snapshot_age_ms = self
            .published
            .read()
            .as_ref()
            .map(|s| now - s.fetched_at_ms);
        let recovery = self.recovery.read();
        info!(
            snapshot_age_ms = ?snapshot_age_ms,
            consecutive_failures = self.consecutive_failures.load(Ordering::SeqCst),
            recovery_mode = recovery.active,
            soft_resets = self.soft_resets.load(Ordering::Relaxed),
            hard_resets = self.hard_resets.load(Ordering::Relaxed),
            "portfolio engine health"
        );
    }

    // -------------------------------------------------------------------------
    // Query surface
    // -------------------------------------------------------------------------

    /// The currently published snapshot (fresh or stale), if any.
    pub fn get_snapshot(&self) -> Option<Arc<PortfolioSnapshot>> {
        self.published.read().clone()
    }

    /// The last snapshot that passed validation, if any.
    pub fn get_last_good_snapshot(&self) -> Option<Arc<PortfolioSnapshot>> {
        self.last_good.read().clone()
    }

    /// Every position in the published snapshot (active then redeemable).
    pub fn get_positions(&self) -> Vec<Position> {
        match self.get_snapshot() {
            Some(snapshot) => snapshot
                .active_positions
                .iter()
                .chain(snapshot.redeemable_positions.iter())
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn get_position(&self, market_id: &str, token_id: &str) -> Option<Position> {
        self.positions_by_key
            .read()
            .get(&(market_id.to_string(), token_id.to_string()))
            .cloned()
    }

    pub fn get_position_by_token_id(&self, token_id: &str) -> Option<Position> {
        let map = self.positions_by_key.read();
        map.values().find(|p| p.token_id == token_id).cloned()
    }

    /// Positions whose market is still tradable (state ACTIVE).
    pub fn get_active_positions(&self) -> Vec<Position> {
        match self.get_snapshot() {
            Some(snapshot) => snapshot
                .active_positions
                .iter()
                .filter(|p| p.position_state == PositionState::Active)
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn get_redeemable_positions(&self) -> Vec<Position> {
        match self.get_snapshot() {
            Some(snapshot) => snapshot.redeemable_positions.clone(),
            None => Vec::new(),
        }
    }

    pub fn get_active_trusted_profitable_positions(&self) -> Vec<Position> {
        self.active_trusted_with(PnlClassification::Profitable)
    }

    pub fn get_active_trusted_losing_positions(&self) -> Vec<Position> {
        self.active_trusted_with(PnlClassification::Losing)
    }

    fn active_trusted_with(&self, classification: PnlClassification) -> Vec<Position> {
        self.get_active_positions()
            .into_iter()
            .filter(|p| p.pnl_trusted && p.pnl_classification == classification)
            .collect()
    }

    /// Losing positions eligible for a stop-loss, worst first.
    pub fn get_liquidation_candidates(&self, min_loss_pct: f64, min_hold_sec: i64) -> Vec<Position> {
        let mut candidates: Vec<Position> = self
            .get_active_positions()
            .into_iter()
            .filter(|p| p.pnl_trusted && p.pnl_classification == PnlClassification::Losing)
            .filter(|p| p.pnl_pct <= -min_loss_pct)
            .filter(|p| p.time_held_sec().map(|h| h >= min_hold_sec).unwrap_or(false))
            .collect();
        candidates.sort_by(|a, b| {
            a.pnl_pct
                .partial_cmp(&b.pnl_pct)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates
    }

    /// Profitable positions eligible for a take-profit, smallest gain first.
    /// Positions already near settlement (price ≥ 90 ¢) are excluded; those
    /// are better redeemed than sold.
    pub fn get_profit_liquidation_candidates(
        &self,
        min_profit_pct: f64,
        min_hold_sec: i64,
    ) -> Vec<Position> {
        let mut candidates: Vec<Position> = self
            .get_active_positions()
            .into_iter()
            .filter(|p| p.pnl_trusted && p.pnl_classification == PnlClassification::Profitable)
            .filter(|p| p.current_price < 0.9)
            .filter(|p| p.pnl_pct >= min_profit_pct)
            .filter(|p| p.time_held_sec().map(|h| h >= min_hold_sec).unwrap_or(false))
            .collect();
        candidates.sort_by(|a, b| {
            a.pnl_pct
                .partial_cmp(&b.pnl_pct)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates
    }

    pub fn get_position_summary(&self) -> SnapshotSummary {
        self.get_snapshot()
            .map(|s| s.summary.clone())
            .unwrap_or_default()
    }

    pub fn get_recovery_status(&self) -> RecoveryStatus {
        let recovery = self.recovery.read();
        RecoveryStatus {
            recovery_mode: recovery.active,
            recovery_cycles: recovery.cycles,
            bootstrap_pending: self.bootstrap_pending.load(Ordering::SeqCst),
        }
    }

    pub fn get_self_heal_status(&self) -> SelfHealStatus {
        SelfHealStatus {
            consecutive_failures: self.consecutive_failures.load(Ordering::SeqCst) as u32,
            degraded_for_ms: self
                .degraded_since
                .read()
                .map(|s| s.elapsed().as_millis() as u64),
            current_backoff_ms: self.current_backoff_ms.load(Ordering::Relaxed),
            soft_resets: self.soft_resets.load(Ordering::Relaxed),
            hard_resets: self.hard_resets.load(Ordering::Relaxed),
            last_reset: *self.last_reset.read(),
        }
    }

    pub fn get_refresh_metrics(&self) -> RefreshMetrics {
        RefreshMetrics {
            refresh_total: self.refresh_total.load(Ordering::Relaxed),
            refresh_failures: self.refresh_failures_total.load(Ordering::Relaxed),
            snapshots_rejected: self.snapshots_rejected.load(Ordering::Relaxed),
            last_refresh_duration_ms: self.last_refresh_duration_ms.load(Ordering::Relaxed),
            last_cycle_id: self.cycle_counter.load(Ordering::SeqCst),
            gamma: self.outcomes.metrics(),
        }
    }
}

impl std::fmt::Debug for PortfolioTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortfolioTracker")
            .field("cycle", &self.cycle_counter.load(Ordering::SeqCst))
            .field(
                "failures",
                &self.consecutive_failures.load(Ordering::SeqCst),
            )
            .finish()
    }
}
