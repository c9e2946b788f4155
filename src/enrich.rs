// =============================================================================
// Position Enricher — classify one raw position into a trustworthy view
// =============================================================================
//
// For each raw position: validate fields, fetch the order book (through the
// per-token circuit breaker and the missing-book set), determine the market
// state with strict proof requirements, select a mark price by source
// priority, and classify the P&L with an explicit trust verdict.
//
// The enricher never fails a position for a missing book or price — those
// positions are salvaged with `pnl_trusted = false` — but it records every
// failure category so the snapshot validator can reason about the cycle.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error, warn};

use crate::breaker::TokenCircuitBreaker;
use crate::caches::{BookCache, BookTop, EndTimeCache};
use crate::dedup::LogDeduper;
use crate::onchain::ChainProber;
use crate::outcome::OutcomeFetcher;
use crate::polymarket::types::RawPosition;
use crate::polymarket::{classify_error, Gateway, PriceSide};
use crate::position::{EntryMeta, Position};
use crate::types::{
    BookStatus, ErrorKind, ExecutionStatus, PnlClassification, PnlSource, PositionState,
    RedeemableProofSource, SkipReason,
};

/// Mark prices at or above this are in the winning resolution zone.
const NEAR_RESOLUTION_HIGH: f64 = 0.995;
/// Mark prices at or below this are in the losing resolution zone.
const NEAR_RESOLUTION_LOW: f64 = 0.005;
/// Safety floor: a near-resolution call is never made below 50 ¢, so broken
/// book data reporting a collapsed price cannot flag a healthy position.
const NEAR_RESOLUTION_FLOOR: f64 = 0.5;

/// Result of enriching one raw position.
#[derive(Debug)]
pub enum Enriched {
    /// Position kept, with any soft failure tags recorded along the way.
    Kept(Position, Vec<SkipReason>),
    /// Position dropped for a hard reason.
    Skipped(SkipReason),
}

/// Shared context for enriching the positions of one refresh cycle.
pub struct Enricher {
    gateway: Arc<dyn Gateway>,
    breaker: Arc<TokenCircuitBreaker>,
    book_cache: Arc<BookCache>,
    outcomes: Arc<OutcomeFetcher>,
    chain: Arc<ChainProber>,
    dedup: Arc<LogDeduper>,
    missing_books: Arc<RwLock<HashSet<String>>>,
    end_times: Arc<EndTimeCache>,
    anomaly_spread: f64,
}

impl Enricher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gateway: Arc<dyn Gateway>,
        breaker: Arc<TokenCircuitBreaker>,
        book_cache: Arc<BookCache>,
        outcomes: Arc<OutcomeFetcher>,
        chain: Arc<ChainProber>,
        dedup: Arc<LogDeduper>,
        missing_books: Arc<RwLock<HashSet<String>>>,
        end_times: Arc<EndTimeCache>,
        anomaly_spread: f64,
    ) -> Self {
        Self {
            gateway,
            breaker,
            book_cache,
            outcomes,
            chain,
            dedup,
            missing_books,
            end_times,
            anomaly_spread,
        }
    }

    // -------------------------------------------------------------------------
    // Entry point
    // -------------------------------------------------------------------------

    /// Enrich one raw position. Never returns an error: failures either drop
    /// the position with a hard reason or degrade it to untrusted P&L.
    pub async fn enrich(
        &self,
        raw: &RawPosition,
        entry_meta: Option<EntryMeta>,
        now_ms: i64,
    ) -> Enriched {
        // ── 1. Field validation ─────────────────────────────────────────
        let (token, market) = match (raw.asset.as_deref(), raw.condition_id.as_deref()) {
            (Some(t), Some(m)) if !t.is_empty() && !m.is_empty() => (t, m),
            _ => return Enriched::Skipped(SkipReason::MissingFields),
        };
        let side = match raw.outcome.as_deref() {
            Some(s) if !s.is_empty() => s,
            _ => return Enriched::Skipped(SkipReason::MissingSide),
        };
        let size = raw.size.unwrap_or(0.0);
        let entry_price = raw.avg_price.unwrap_or(0.0);
        if size <= 0.0 || entry_price <= 0.0 || entry_price > 1.0 {
            return Enriched::Skipped(SkipReason::InvalidSizePrice);
        }

        let mut tags: Vec<SkipReason> = Vec::new();

        // ── 2. Order book ───────────────────────────────────────────────
        let (book_status, best_bid, best_ask) = self.fetch_book_top(token, now_ms, &mut tags).await;

        self.book_sanity_diagnostic(token, best_bid, best_ask, now_ms);

        // ── 3. Market state (strict) ────────────────────────────────────
        let outcome = self.outcomes.cached(token, now_ms);
        let winner = outcome.as_ref().and_then(|e| e.winner.clone());
        let (position_state, proof) = self
            .determine_state(raw, token, market, book_status, best_bid, now_ms)
            .await;

        // ── 4. Mark price & P&L ─────────────────────────────────────────
        let pricing = self
            .select_mark(
                raw,
                token,
                position_state,
                proof,
                winner.as_deref(),
                side,
                entry_price,
                size,
                best_bid,
                now_ms,
                &mut tags,
            )
            .await;

        // ── 5. Trust & classification ───────────────────────────────────
        let pnl_trusted = position_state == PositionState::Redeemable
            || pricing.source == PnlSource::DataApi
            || pricing.source == PnlSource::ExecutableBook
            || (pricing.source == PnlSource::Fallback
                && (raw.cur_price.is_some() || raw.current_value.is_some()));

        let pnl_classification = if !pnl_trusted {
            PnlClassification::Unknown
        } else if pricing.pnl_pct > 0.0 {
            PnlClassification::Profitable
        } else if pricing.pnl_pct < 0.0 {
            PnlClassification::Losing
        } else {
            PnlClassification::Neutral
        };

        let pnl_untrusted_reason = if pnl_trusted {
            None
        } else {
            Some(pricing.untrusted_reason.unwrap_or("UNVERIFIED_FALLBACK").to_string())
        };

        // ── 6. Executability ────────────────────────────────────────────
        let execution_status = match book_status {
            BookStatus::Available => ExecutionStatus::Tradable,
            BookStatus::NoBook404 | BookStatus::EmptyBook => ExecutionStatus::NotTradableOnClob,
            BookStatus::BookAnomaly | BookStatus::NotFetched => ExecutionStatus::ExecutionBlocked,
        };
        let exec_price_trusted =
            book_status == BookStatus::Available && best_bid.unwrap_or(0.0) > 0.0;

        // ── 7. Near-resolution flag ─────────────────────────────────────
        let in_resolution_zone = pricing.current_price >= NEAR_RESOLUTION_HIGH
            || pricing.current_price <= NEAR_RESOLUTION_LOW;
        let near_resolution_candidate = position_state != PositionState::Redeemable
            && in_resolution_zone
            && pricing.current_price >= NEAR_RESOLUTION_FLOOR;

        // ── 8. Diagnostics ──────────────────────────────────────────────
        if pricing.current_price > entry_price && pricing.pnl_pct <= 0.0 {
            if self
                .dedup
                .should_log("pnl_anomaly", 300_000, Some(token), now_ms)
            {
                warn!(
                    token_id = %token,
                    current_price = pricing.current_price,
                    entry_price,
                    pnl_pct = pricing.pnl_pct,
                    "P&L calculation anomaly: price above entry but P&L not positive"
                );
            }
        }

        if position_state == PositionState::Redeemable && proof == RedeemableProofSource::None {
            error!(
                token_id = %token,
                market_id = %market,
                "redeemable position without proof source — demoting to UNKNOWN state"
            );
            return Enriched::Kept(
                Position {
                    position_state: PositionState::Unknown,
                    redeemable_proof_source: RedeemableProofSource::None,
                    ..self.assemble(
                        raw, token, market, side, size, entry_price, pricing.clone(),
                        pnl_trusted, pnl_classification, pnl_untrusted_reason.clone(),
                        position_state, proof, book_status, execution_status,
                        exec_price_trusted, best_bid, best_ask,
                        near_resolution_candidate, entry_meta.clone(), &outcome,
                    )
                },
                tags,
            );
        }

        let position = self.assemble(
            raw,
            token,
            market,
            side,
            size,
            entry_price,
            pricing,
            pnl_trusted,
            pnl_classification,
            pnl_untrusted_reason,
            position_state,
            proof,
            book_status,
            execution_status,
            exec_price_trusted,
            best_bid,
            best_ask,
            near_resolution_candidate,
            entry_meta,
            &outcome,
        );

        Enriched::Kept(position, tags)
    }

    // -------------------------------------------------------------------------
    // Order book
    // -------------------------------------------------------------------------

    async fn fetch_book_top(
        &self,
        token: &str,
        now_ms: i64,
        tags: &mut Vec<SkipReason>,
    ) -> (BookStatus, Option<f64>, Option<f64>) {
        if self.missing_books.read().contains(token) {
            tags.push(SkipReason::Book404);
            return (BookStatus::NoBook404, None, None);
        }

        if self.breaker.is_open(token, now_ms) {
            debug!(token_id = %token, "circuit open — skipping book fetch");
            return (BookStatus::NotFetched, None, None);
        }

        if let Some(top) = self.book_cache.get(token, now_ms) {
            let status = self.classify_top(top.best_bid, top.best_ask);
            if matches!(status, BookStatus::EmptyBook | BookStatus::BookAnomaly) {
                tags.push(SkipReason::NoBook);
            }
            return (status, top.best_bid, top.best_ask);
        }

        match self.gateway.fetch_order_book(token).await {
            Ok(book) => {
                self.breaker.record_success(token);
                let best_bid = book.best_bid();
                let best_ask = book.best_ask();
                self.book_cache.set(
                    token,
                    BookTop {
                        best_bid,
                        best_ask,
                        fetched_at_ms: now_ms,
                    },
                );
                let status = self.classify_top(best_bid, best_ask);
                if matches!(status, BookStatus::EmptyBook | BookStatus::BookAnomaly) {
                    tags.push(SkipReason::NoBook);
                }
                (status, best_bid, best_ask)
            }
            Err(err) => {
                let kind = classify_error(&err);
                let last_known = self.breaker.last_known_price(token);
                self.breaker.record_failure(token, kind, last_known, now_ms);

                if kind == ErrorKind::NotFound404 {
                    self.missing_books.write().insert(token.to_string());
                    tags.push(SkipReason::Book404);
                    return (BookStatus::NoBook404, None, None);
                }

                if self
                    .dedup
                    .should_log("book_fetch_failed", 60_000, Some(token), now_ms)
                {
                    warn!(token_id = %token, error = %err, "order book fetch failed");
                }
                tags.push(SkipReason::NoBook);
                (BookStatus::NotFetched, None, None)
            }
        }
    }

    fn classify_top(&self, best_bid: Option<f64>, best_ask: Option<f64>) -> BookStatus {
        match (best_bid, best_ask) {
            (None, None) => BookStatus::EmptyBook,
            (Some(bid), Some(ask)) if bid > ask => BookStatus::BookAnomaly,
            (Some(bid), Some(ask)) if ask - bid > self.anomaly_spread => BookStatus::BookAnomaly,
            _ => BookStatus::Available,
        }
    }

    /// Flag books that are almost certainly the wrong token's: a vanished bid
    /// under a healthy mid with a tight spread.
    fn book_sanity_diagnostic(
        &self,
        token: &str,
        best_bid: Option<f64>,
        best_ask: Option<f64>,
        now_ms: i64,
    ) {
        let (Some(bid), Some(ask)) = (best_bid, best_ask) else {
            return;
        };
        let mid = (bid + ask) / 2.0;
        if bid < 0.001 && mid > 0.10 && (ask - bid) < 0.20 {
            if self
                .dedup
                .should_log("TOKEN_MISMATCH_OR_BOOK_FETCH_BUG", 300_000, Some(token), now_ms)
            {
                warn!(
                    token_id = %token,
                    best_bid = bid,
                    best_ask = ask,
                    mid,
                    "TOKEN_MISMATCH_OR_BOOK_FETCH_BUG: bid collapsed under a healthy mid"
                );
            }
        }
    }

    // -------------------------------------------------------------------------
    // State machine
    // -------------------------------------------------------------------------

    /// Decide the market state, requiring hard proof for redeemability.
    async fn determine_state(
        &self,
        raw: &RawPosition,
        token: &str,
        market: &str,
        book_status: BookStatus,
        best_bid: Option<f64>,
        now_ms: i64,
    ) -> (PositionState, RedeemableProofSource) {
        let outcome = self.outcomes.cached(token, now_ms);
        let book_missing = matches!(book_status, BookStatus::NoBook404 | BookStatus::EmptyBook);

        if raw.redeemable {
            let resolved = outcome.as_ref().map(|e| e.resolved).unwrap_or(false);

            if !resolved && !book_missing {
                // The index claims redeemable while the book is alive and the
                // market unresolved. Believing it would sell nothing and
                // redeem nothing; treat the position as active.
                if self
                    .dedup
                    .should_log("false_redeemable", 300_000, Some(token), now_ms)
                {
                    warn!(
                        token_id = %token,
                        market_id = %market,
                        book_status = %book_status,
                        "redeemable flag contradicts a live unresolved market — overriding to ACTIVE"
                    );
                }
                return (PositionState::Active, RedeemableProofSource::None);
            }

            let closed_unresolved = outcome
                .as_ref()
                .map(|e| e.market_closed && !e.resolved)
                .unwrap_or(false);
            if closed_unresolved {
                // Limbo market: closed per Gamma, settlement unknown. Only
                // the contract can break the tie.
                match self.chain.is_redeemable(market, now_ms).await {
                    Ok(true) => {
                        return (PositionState::Redeemable, RedeemableProofSource::OnchainDenom)
                    }
                    Ok(false) => {
                        return (
                            PositionState::ClosedNotRedeemable,
                            RedeemableProofSource::None,
                        )
                    }
                    Err(err) => {
                        debug!(market_id = %market, error = %err, "denominator probe failed — keeping API flag");
                        return (PositionState::Redeemable, RedeemableProofSource::DataApiFlag);
                    }
                }
            }

            return (PositionState::Redeemable, RedeemableProofSource::DataApiFlag);
        }

        // No API flag: probe the contract only when the price sits at an
        // extreme and there is no bid to sell into.
        let no_bids = best_bid.unwrap_or(0.0) <= 0.0;
        let extreme = raw
            .cur_price
            .map(|p| p >= NEAR_RESOLUTION_HIGH || p <= NEAR_RESOLUTION_LOW)
            .unwrap_or(false);
        if no_bids && extreme {
            match self.chain.is_redeemable(market, now_ms).await {
                Ok(true) => {
                    return (PositionState::Redeemable, RedeemableProofSource::OnchainDenom)
                }
                Ok(false) => {}
                Err(err) => {
                    debug!(market_id = %market, error = %err, "denominator probe failed");
                }
            }
        }

        if outcome.as_ref().map(|e| e.market_closed).unwrap_or(false) {
            return (
                PositionState::ClosedNotRedeemable,
                RedeemableProofSource::None,
            );
        }

        (PositionState::Active, RedeemableProofSource::None)
    }

    // -------------------------------------------------------------------------
    // Mark price selection
    // -------------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    async fn select_mark(
        &self,
        raw: &RawPosition,
        token: &str,
        state: PositionState,
        proof: RedeemableProofSource,
        winner: Option<&str>,
        side: &str,
        entry_price: f64,
        size: f64,
        best_bid: Option<f64>,
        now_ms: i64,
        tags: &mut Vec<SkipReason>,
    ) -> Pricing {
        let compute = |current: f64| {
            (
                (current - entry_price) / entry_price * 100.0,
                (current - entry_price) * size,
            )
        };

        // Settlement snap: an on-chain-proven redemption is worth exactly
        // its payout, whatever the book or index say.
        if state == PositionState::Redeemable && proof == RedeemableProofSource::OnchainDenom {
            let current = settlement_price(winner, side)
                .unwrap_or(if raw.cur_price.unwrap_or(1.0) >= 0.5 { 1.0 } else { 0.0 });
            let (pnl_pct, pnl_usd) = compute(current);
            return Pricing {
                current_price: current,
                source: PnlSource::Fallback,
                pnl_pct,
                pnl_usd,
                untrusted_reason: None,
            };
        }

        // Priority 1: the index supplied a price (and usually the P&L too).
        if let Some(current) = raw.cur_price {
            let (computed_pct, computed_usd) = compute(current);
            return Pricing {
                current_price: current,
                source: PnlSource::DataApi,
                pnl_pct: raw.percent_pnl.unwrap_or(computed_pct),
                pnl_usd: raw.cash_pnl.unwrap_or(computed_usd),
                untrusted_reason: None,
            };
        }

        // Priority 2: an executable best bid.
        if let Some(bid) = best_bid {
            if bid > 0.0 {
                let (pnl_pct, pnl_usd) = compute(bid);
                return Pricing {
                    current_price: bid,
                    source: PnlSource::ExecutableBook,
                    pnl_pct,
                    pnl_usd,
                    untrusted_reason: None,
                };
            }
        }

        // Circuit open: no further API calls; reuse the last known price.
        if self.breaker.is_open(token, now_ms) {
            if let Some(last) = self.breaker.last_known_price(token) {
                let (pnl_pct, pnl_usd) = compute(last);
                return Pricing {
                    current_price: last,
                    source: PnlSource::Fallback,
                    pnl_pct,
                    pnl_usd,
                    untrusted_reason: Some("CIRCUIT_OPEN"),
                };
            }
        } else {
            // Priority 3: the price endpoint, mid of both sides.
            let (buy, sell) = futures_util::join!(
                self.gateway.fetch_price(token, PriceSide::Buy),
                self.gateway.fetch_price(token, PriceSide::Sell)
            );
            match (buy, sell) {
                (Ok(buy), Ok(sell)) => {
                    self.breaker.record_success(token);
                    let mid = (buy + sell) / 2.0;
                    let (pnl_pct, pnl_usd) = compute(mid);
                    return Pricing {
                        current_price: mid,
                        source: PnlSource::Fallback,
                        pnl_pct,
                        pnl_usd,
                        untrusted_reason: None,
                    };
                }
                (buy, sell) => {
                    let err = buy.err().or(sell.err()).expect("one side failed");
                    let kind = classify_error(&err);
                    self.breaker.record_failure(token, kind, None, now_ms);
                    tags.push(SkipReason::PricingFetchFailed);
                    debug!(token_id = %token, error = %err, "price fallback failed");
                }
            }
        }

        // The index's current value still pins a price when present.
        if let Some(current_value) = raw.current_value {
            if size > 0.0 {
                let current = current_value / size;
                let (pnl_pct, pnl_usd) = compute(current);
                return Pricing {
                    current_price: current,
                    source: PnlSource::Fallback,
                    pnl_pct,
                    pnl_usd,
                    untrusted_reason: None,
                };
            }
        }

        // A flagged redemption with a known winner settles at the payout.
        if state == PositionState::Redeemable {
            if let Some(current) = settlement_price(winner, side) {
                let (pnl_pct, pnl_usd) = compute(current);
                return Pricing {
                    current_price: current,
                    source: PnlSource::Fallback,
                    pnl_pct,
                    pnl_usd,
                    untrusted_reason: None,
                };
            }
        }

        // Nothing priced this token: carry the entry price with zero P&L so
        // the position is still visible downstream.
        Pricing {
            current_price: entry_price,
            source: PnlSource::Fallback,
            pnl_pct: 0.0,
            pnl_usd: 0.0,
            untrusted_reason: Some("NO_PRICE_SOURCE"),
        }
    }

    // -------------------------------------------------------------------------
    // Assembly
    // -------------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        &self,
        _raw: &RawPosition,
        token: &str,
        market: &str,
        side: &str,
        size: f64,
        entry_price: f64,
        pricing: Pricing,
        pnl_trusted: bool,
        pnl_classification: PnlClassification,
        pnl_untrusted_reason: Option<String>,
        position_state: PositionState,
        proof: RedeemableProofSource,
        book_status: BookStatus,
        execution_status: ExecutionStatus,
        exec_price_trusted: bool,
        best_bid: Option<f64>,
        best_ask: Option<f64>,
        near_resolution_candidate: bool,
        entry_meta: Option<EntryMeta>,
        outcome: &Option<crate::caches::OutcomeEntry>,
    ) -> Position {
        let market_closed = outcome.as_ref().map(|e| e.market_closed).unwrap_or(false)
            || matches!(
                position_state,
                PositionState::Redeemable | PositionState::ClosedNotRedeemable
            );
        let market_end_time_ms = self
            .end_times
            .get(token)
            .or_else(|| outcome.as_ref().and_then(|e| e.end_time_ms));

        Position {
            market_id: market.to_string(),
            token_id: token.to_string(),
            side: side.to_string(),
            size,
            entry_price,
            current_price: pricing.current_price,
            pnl_pct: pricing.pnl_pct,
            pnl_usd: pricing.pnl_usd,
            pnl_source: pricing.source,
            pnl_trusted,
            pnl_classification,
            pnl_untrusted_reason,
            position_state,
            redeemable_proof_source: proof,
            market_closed,
            book_status,
            execution_status,
            exec_price_trusted,
            current_bid_price: best_bid,
            current_ask_price: best_ask,
            near_resolution_candidate,
            entry_meta,
            market_end_time_ms,
        }
    }
}

/// Settlement value of this side once the winner is known.
fn settlement_price(winner: Option<&str>, side: &str) -> Option<f64> {
    winner.map(|w| if w.eq_ignore_ascii_case(side) { 1.0 } else { 0.0 })
}

/// Selected mark price and the P&L it implies.
#[derive(Debug, Clone)]
struct Pricing {
    current_price: f64,
    source: PnlSource,
    pnl_pct: f64,
    pnl_usd: f64,
    untrusted_reason: Option<&'static str>,
}

impl std::fmt::Debug for Enricher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Enricher")
            .field("anomaly_spread", &self.anomaly_spread)
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::caches::{OutcomeCache, OUTCOME_ACTIVE_TTL_MS};
    use crate::testutil::{raw_position, MockGateway};

    struct Rig {
        gateway: Arc<MockGateway>,
        enricher: Enricher,
        outcome_cache: Arc<OutcomeCache>,
        breaker: Arc<TokenCircuitBreaker>,
        missing_books: Arc<RwLock<HashSet<String>>>,
    }

    fn rig() -> Rig {
        let gateway = Arc::new(MockGateway::new());
        let breaker = Arc::new(TokenCircuitBreaker::new());
        let book_cache = Arc::new(BookCache::new(500, 2_000));
        let outcome_cache = Arc::new(OutcomeCache::new(2000, OUTCOME_ACTIVE_TTL_MS));
        let end_times = Arc::new(EndTimeCache::new(1000));
        let outcomes = Arc::new(OutcomeFetcher::new(
            gateway.clone(),
            outcome_cache.clone(),
            end_times.clone(),
            25,
        ));
        let chain = Arc::new(ChainProber::new(gateway.clone(), 300_000));
        let dedup = Arc::new(LogDeduper::new());
        let missing_books = Arc::new(RwLock::new(HashSet::new()));

        let enricher = Enricher::new(
            gateway.clone(),
            breaker.clone(),
            book_cache,
            outcomes,
            chain,
            dedup,
            missing_books.clone(),
            end_times,
            0.20,
        );

        Rig {
            gateway,
            enricher,
            outcome_cache,
            breaker,
            missing_books,
        }
    }

    fn kept(enriched: Enriched) -> (Position, Vec<SkipReason>) {
        match enriched {
            Enriched::Kept(p, tags) => (p, tags),
            Enriched::Skipped(reason) => panic!("expected kept position, got skip {reason}"),
        }
    }

    const S1_POSITION: &str = r#"{
        "asset": "T1", "conditionId": "M1", "size": "10", "avgPrice": "0.60",
        "outcome": "YES", "redeemable": false,
        "cashPnl": "1.50", "percentPnl": "25", "curPrice": "0.75"
    }"#;

    const S1_BOOK: &str = r#"{
        "bids": [{ "price": "0.74", "size": "100" }],
        "asks": [{ "price": "0.76", "size": "100" }]
    }"#;

    #[tokio::test]
    async fn data_api_price_with_live_book() {
        let r = rig();
        r.gateway.set_book("T1", S1_BOOK);

        let (p, tags) = kept(
            r.enricher
                .enrich(&raw_position(S1_POSITION), None, 1_000)
                .await,
        );

        assert_eq!(p.pnl_source, PnlSource::DataApi);
        assert_eq!(p.pnl_pct, 25.0);
        assert_eq!(p.pnl_usd, 1.5);
        assert_eq!(p.current_price, 0.75);
        assert_eq!(p.book_status, BookStatus::Available);
        assert_eq!(p.execution_status, ExecutionStatus::Tradable);
        assert_eq!(p.pnl_classification, PnlClassification::Profitable);
        assert_eq!(p.position_state, PositionState::Active);
        assert!(p.pnl_trusted);
        assert!(p.exec_price_trusted);
        assert_eq!(p.current_bid_price, Some(0.74));
        assert_eq!(p.current_ask_price, Some(0.76));
        assert!(tags.is_empty());
    }

    #[tokio::test]
    async fn book_404_keeps_data_api_pnl() {
        let r = rig();
        r.gateway.fail_book("T1", 404);

        let (p, tags) = kept(
            r.enricher
                .enrich(&raw_position(S1_POSITION), None, 1_000)
                .await,
        );

        assert_eq!(p.pnl_source, PnlSource::DataApi);
        assert!(p.pnl_trusted);
        assert_eq!(p.pnl_classification, PnlClassification::Profitable);
        assert_eq!(p.book_status, BookStatus::NoBook404);
        assert_eq!(p.execution_status, ExecutionStatus::NotTradableOnClob);
        assert!(!p.exec_price_trusted);
        assert_eq!(tags, vec![SkipReason::Book404]);

        // The 404 is remembered so the next cycle skips the fetch.
        assert!(r.missing_books.read().contains("T1"));
    }

    #[tokio::test]
    async fn no_price_source_salvages_the_position() {
        let r = rig();
        // No book, no fallback price, no data-API P&L.
        let raw = raw_position(
            r#"{ "asset": "T1", "conditionId": "M1", "size": "10",
                 "avgPrice": "0.60", "outcome": "YES" }"#,
        );

        let (p, tags) = kept(r.enricher.enrich(&raw, None, 1_000).await);

        assert_eq!(p.current_price, 0.60);
        assert_eq!(p.pnl_source, PnlSource::Fallback);
        assert!(!p.pnl_trusted);
        assert_eq!(p.pnl_classification, PnlClassification::Unknown);
        assert_eq!(p.pnl_untrusted_reason.as_deref(), Some("NO_PRICE_SOURCE"));
        assert_eq!(p.pnl_pct, 0.0);
        assert!(tags.contains(&SkipReason::Book404));
        assert!(tags.contains(&SkipReason::PricingFetchFailed));
    }

    #[tokio::test]
    async fn false_redeemable_flag_is_overridden_to_active() {
        let r = rig();
        r.gateway.set_book("T1", S1_BOOK);
        // Gamma: market open and unresolved.
        r.outcome_cache.set(
            "T1",
            crate::caches::OutcomeEntry {
                winner: None,
                resolved: false,
                market_closed: false,
                end_time_ms: None,
                resolved_at_ms: None,
                last_checked_ms: 1_000,
            },
        );

        let raw = raw_position(
            r#"{ "asset": "T1", "conditionId": "M1", "size": "10", "avgPrice": "0.60",
                 "outcome": "YES", "redeemable": true, "curPrice": "0.75" }"#,
        );
        let (p, _) = kept(r.enricher.enrich(&raw, None, 1_000).await);

        assert_eq!(p.position_state, PositionState::Active);
        assert_eq!(p.redeemable_proof_source, RedeemableProofSource::None);
        assert!(!p.market_closed);
    }

    #[tokio::test]
    async fn api_flag_with_resolved_market_is_redeemable() {
        let r = rig();
        r.gateway.fail_book("T1", 404);
        r.outcome_cache.set(
            "T1",
            crate::caches::OutcomeEntry {
                winner: Some("YES".to_string()),
                resolved: true,
                market_closed: true,
                end_time_ms: None,
                resolved_at_ms: Some(500),
                last_checked_ms: 1_000,
            },
        );

        let raw = raw_position(
            r#"{ "asset": "T1", "conditionId": "M1", "size": "10", "avgPrice": "0.60",
                 "outcome": "YES", "redeemable": true, "curPrice": "1.0" }"#,
        );
        let (p, _) = kept(r.enricher.enrich(&raw, None, 1_000).await);

        assert_eq!(p.position_state, PositionState::Redeemable);
        assert_eq!(p.redeemable_proof_source, RedeemableProofSource::DataApiFlag);
        assert!(p.pnl_trusted);
        assert!(p.market_closed);
        assert!(!p.near_resolution_candidate);
    }

    #[tokio::test]
    async fn limbo_market_with_zero_denominator_is_closed_not_redeemable() {
        let r = rig();
        r.gateway.fail_book("T1", 404);
        // Closed per Gamma but no winner; contract still reads zero.
        r.outcome_cache.set(
            "T1",
            crate::caches::OutcomeEntry {
                winner: None,
                resolved: false,
                market_closed: true,
                end_time_ms: None,
                resolved_at_ms: None,
                last_checked_ms: 1_000,
            },
        );

        let raw = raw_position(
            r#"{ "asset": "T1", "conditionId": "M1", "size": "10", "avgPrice": "0.60",
                 "outcome": "YES", "redeemable": true }"#,
        );
        let (p, _) = kept(r.enricher.enrich(&raw, None, 1_000).await);

        assert_eq!(p.position_state, PositionState::ClosedNotRedeemable);
        assert_eq!(p.redeemable_proof_source, RedeemableProofSource::None);
    }

    #[tokio::test]
    async fn extreme_price_without_bids_probes_the_contract() {
        let r = rig();
        r.gateway.fail_book("T1", 404);
        r.gateway.set_denominator("M1", 2);
        r.outcome_cache.set(
            "T1",
            crate::caches::OutcomeEntry {
                winner: Some("YES".to_string()),
                resolved: true,
                market_closed: true,
                end_time_ms: None,
                resolved_at_ms: Some(500),
                last_checked_ms: 1_000,
            },
        );

        let raw = raw_position(
            r#"{ "asset": "T1", "conditionId": "M1", "size": "10", "avgPrice": "0.60",
                 "outcome": "YES", "curPrice": "0.999" }"#,
        );
        let (p, _) = kept(r.enricher.enrich(&raw, None, 1_000).await);

        assert_eq!(p.position_state, PositionState::Redeemable);
        assert_eq!(p.redeemable_proof_source, RedeemableProofSource::OnchainDenom);
        // Settlement snap: winning side is worth exactly 1.
        assert_eq!(p.current_price, 1.0);
        assert!(p.pnl_trusted);
    }

    #[tokio::test]
    async fn losing_side_snaps_to_zero() {
        let r = rig();
        r.gateway.fail_book("T1", 404);
        r.gateway.set_denominator("M1", 2);
        r.outcome_cache.set(
            "T1",
            crate::caches::OutcomeEntry {
                winner: Some("YES".to_string()),
                resolved: true,
                market_closed: true,
                end_time_ms: None,
                resolved_at_ms: Some(500),
                last_checked_ms: 1_000,
            },
        );

        let raw = raw_position(
            r#"{ "asset": "T1", "conditionId": "M1", "size": "10", "avgPrice": "0.30",
                 "outcome": "NO", "curPrice": "0.001" }"#,
        );
        let (p, _) = kept(r.enricher.enrich(&raw, None, 1_000).await);

        assert_eq!(p.position_state, PositionState::Redeemable);
        assert_eq!(p.current_price, 0.0);
        assert_eq!(p.pnl_classification, PnlClassification::Losing);
    }

    #[tokio::test]
    async fn executable_book_prices_without_data_api() {
        let r = rig();
        r.gateway.set_book("T1", S1_BOOK);
        let raw = raw_position(
            r#"{ "asset": "T1", "conditionId": "M1", "size": "10",
                 "avgPrice": "0.60", "outcome": "YES" }"#,
        );

        let (p, _) = kept(r.enricher.enrich(&raw, None, 1_000).await);
        assert_eq!(p.pnl_source, PnlSource::ExecutableBook);
        assert_eq!(p.current_price, 0.74);
        assert!(p.pnl_trusted);
        assert_eq!(p.pnl_classification, PnlClassification::Profitable);
    }

    #[tokio::test]
    async fn price_endpoint_mid_is_untrusted_without_index_backing() {
        let r = rig();
        r.gateway.set_book("T1", r#"{ "bids": [], "asks": [] }"#);
        r.gateway.set_price("T1", PriceSide::Buy, 0.60);
        r.gateway.set_price("T1", PriceSide::Sell, 0.70);

        let raw = raw_position(
            r#"{ "asset": "T1", "conditionId": "M1", "size": "10",
                 "avgPrice": "0.60", "outcome": "YES" }"#,
        );
        let (p, tags) = kept(r.enricher.enrich(&raw, None, 1_000).await);

        assert_eq!(p.pnl_source, PnlSource::Fallback);
        assert!((p.current_price - 0.65).abs() < 1e-9);
        assert!(!p.pnl_trusted);
        assert_eq!(p.pnl_classification, PnlClassification::Unknown);
        assert_eq!(p.book_status, BookStatus::EmptyBook);
        assert!(tags.contains(&SkipReason::NoBook));
    }

    #[tokio::test]
    async fn fallback_with_current_value_is_trusted() {
        let r = rig();
        r.gateway.set_book("T1", r#"{ "bids": [], "asks": [] }"#);
        let raw = raw_position(
            r#"{ "asset": "T1", "conditionId": "M1", "size": "10",
                 "avgPrice": "0.60", "outcome": "YES", "currentValue": "7.0" }"#,
        );

        let (p, _) = kept(r.enricher.enrich(&raw, None, 1_000).await);
        assert_eq!(p.pnl_source, PnlSource::Fallback);
        assert!((p.current_price - 0.70).abs() < 1e-9);
        assert!(p.pnl_trusted);
        assert_eq!(p.pnl_classification, PnlClassification::Profitable);
    }

    #[tokio::test]
    async fn near_resolution_boundaries() {
        let r = rig();
        r.gateway.set_book(
            "T1",
            r#"{ "bids": [{ "price": "0.995", "size": "10" }],
                 "asks": [{ "price": "0.999", "size": "10" }] }"#,
        );
        let raw = raw_position(
            r#"{ "asset": "T1", "conditionId": "M1", "size": "10",
                 "avgPrice": "0.60", "outcome": "YES", "curPrice": "0.995" }"#,
        );
        let (p, _) = kept(r.enricher.enrich(&raw, None, 1_000).await);
        assert!(p.near_resolution_candidate);

        // The 50 ¢ floor binds on the selected mark price: a data-API price
        // of 1.0 does not rescue a 0.4 mark.
        let r = rig();
        r.gateway.set_book(
            "T2",
            r#"{ "bids": [{ "price": "0.40", "size": "10" }],
                 "asks": [{ "price": "0.42", "size": "10" }] }"#,
        );
        let raw = raw_position(
            r#"{ "asset": "T2", "conditionId": "M2", "size": "10",
                 "avgPrice": "0.60", "outcome": "YES", "curPrice": "0.4" }"#,
        );
        let (p, _) = kept(r.enricher.enrich(&raw, None, 1_000).await);
        assert!(!p.near_resolution_candidate);

        // A collapsed price below the floor never flags, even in the losing
        // resolution zone.
        let r = rig();
        r.gateway.set_book("T3", r#"{ "bids": [], "asks": [] }"#);
        let raw = raw_position(
            r#"{ "asset": "T3", "conditionId": "M3", "size": "10",
                 "avgPrice": "0.60", "outcome": "YES", "curPrice": "0.001" }"#,
        );
        let (p, _) = kept(r.enricher.enrich(&raw, None, 1_000).await);
        assert!(!p.near_resolution_candidate);
    }

    #[tokio::test]
    async fn crossed_book_is_an_anomaly_and_blocks_execution() {
        let r = rig();
        r.gateway.set_book(
            "T1",
            r#"{ "bids": [{ "price": "0.80", "size": "10" }],
                 "asks": [{ "price": "0.70", "size": "10" }] }"#,
        );
        let raw = raw_position(
            r#"{ "asset": "T1", "conditionId": "M1", "size": "10",
                 "avgPrice": "0.60", "outcome": "YES", "curPrice": "0.75" }"#,
        );

        let (p, tags) = kept(r.enricher.enrich(&raw, None, 1_000).await);
        assert_eq!(p.book_status, BookStatus::BookAnomaly);
        assert_eq!(p.execution_status, ExecutionStatus::ExecutionBlocked);
        assert!(!p.exec_price_trusted);
        // The data-API P&L is unaffected by the broken book.
        assert_eq!(p.pnl_classification, PnlClassification::Profitable);
        assert!(tags.contains(&SkipReason::NoBook));
    }

    #[tokio::test]
    async fn open_circuit_skips_calls_and_reuses_last_price() {
        let r = rig();
        // Trip the breaker for T1.
        for i in 0..3 {
            r.breaker
                .record_failure("T1", ErrorKind::Timeout, Some(0.42), i);
        }
        let raw = raw_position(
            r#"{ "asset": "T1", "conditionId": "M1", "size": "10",
                 "avgPrice": "0.60", "outcome": "YES" }"#,
        );

        let calls_before = r.gateway.positions_calls.load(std::sync::atomic::Ordering::SeqCst);
        let (p, _) = kept(r.enricher.enrich(&raw, None, 1_000).await);
        assert_eq!(
            r.gateway.positions_calls.load(std::sync::atomic::Ordering::SeqCst),
            calls_before
        );

        assert_eq!(p.book_status, BookStatus::NotFetched);
        assert_eq!(p.current_price, 0.42);
        assert!(!p.pnl_trusted);
        assert!(!p.exec_price_trusted);
        assert_eq!(p.pnl_untrusted_reason.as_deref(), Some("CIRCUIT_OPEN"));
    }

    #[tokio::test]
    async fn hard_skips_for_invalid_fields() {
        let r = rig();

        let missing = raw_position(r#"{ "size": "10", "avgPrice": "0.5", "outcome": "YES" }"#);
        assert!(matches!(
            r.enricher.enrich(&missing, None, 0).await,
            Enriched::Skipped(SkipReason::MissingFields)
        ));

        let no_side =
            raw_position(r#"{ "asset": "T", "conditionId": "M", "size": "10", "avgPrice": "0.5" }"#);
        assert!(matches!(
            r.enricher.enrich(&no_side, None, 0).await,
            Enriched::Skipped(SkipReason::MissingSide)
        ));

        let bad_size = raw_position(
            r#"{ "asset": "T", "conditionId": "M", "size": "0", "avgPrice": "0.5", "outcome": "YES" }"#,
        );
        assert!(matches!(
            r.enricher.enrich(&bad_size, None, 0).await,
            Enriched::Skipped(SkipReason::InvalidSizePrice)
        ));

        let bad_price = raw_position(
            r#"{ "asset": "T", "conditionId": "M", "size": "5", "avgPrice": "1.5", "outcome": "YES" }"#,
        );
        assert!(matches!(
            r.enricher.enrich(&bad_price, None, 0).await,
            Enriched::Skipped(SkipReason::InvalidSizePrice)
        ));
    }

    #[tokio::test]
    async fn entry_meta_is_carried_through() {
        let r = rig();
        r.gateway.set_book("T1", S1_BOOK);
        let meta = EntryMeta {
            avg_entry_price_cents: 60.0,
            first_acquired_at: 100,
            last_acquired_at: 200,
            time_held_sec: 900,
        };

        let (p, _) = kept(
            r.enricher
                .enrich(&raw_position(S1_POSITION), Some(meta), 1_000)
                .await,
        );
        assert_eq!(p.time_held_sec(), Some(900));
        assert_eq!(p.entry_meta.unwrap().first_acquired_at, 100);
    }
}
