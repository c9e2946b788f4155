// =============================================================================
// Test support — scripted Gateway for driving the refresh pipeline
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::polymarket::types::{
    GammaMarket, ProfileResponse, RawOrderBook, RawPosition, TradeFill,
};
use crate::polymarket::{Gateway, HttpStatusError, PriceSide};

/// Parse a raw position from a JSON literal (mirrors upstream payloads).
pub fn raw_position(json: &str) -> RawPosition {
    serde_json::from_str(json).expect("test raw position must parse")
}

/// Scripted outcome of one order-book lookup.
#[derive(Clone)]
pub enum BookScript {
    Ok(RawOrderBook),
    Status(u16),
}

/// In-memory Gateway whose responses are scripted by each test.
///
/// Defaults: no positions, no proxy wallet, every book 404s, every price
/// lookup 404s, no trades, every denominator reads 0.
pub struct MockGateway {
    positions_by_address: Mutex<HashMap<String, Vec<RawPosition>>>,
    default_positions: Mutex<Vec<RawPosition>>,
    /// Queued failures consumed by the next `fetch_positions` calls.
    positions_failures: Mutex<VecDeque<u16>>,
    pub positions_calls: AtomicU32,
    positions_delay_ms: AtomicU64,

    proxy_wallet: Mutex<Option<String>>,

    markets: Mutex<Vec<GammaMarket>>,
    /// Market batches with more than N tokens fail with the given status.
    markets_fail_over: Mutex<Option<(usize, u16)>>,
    pub markets_calls: AtomicU32,

    books: Mutex<HashMap<String, BookScript>>,
    prices: Mutex<HashMap<(String, &'static str), f64>>,
    trades: Mutex<Vec<TradeFill>>,
    denominators: Mutex<HashMap<String, u128>>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self {
            positions_by_address: Mutex::new(HashMap::new()),
            default_positions: Mutex::new(Vec::new()),
            positions_failures: Mutex::new(VecDeque::new()),
            positions_calls: AtomicU32::new(0),
            positions_delay_ms: AtomicU64::new(0),
            proxy_wallet: Mutex::new(None),
            markets: Mutex::new(Vec::new()),
            markets_fail_over: Mutex::new(None),
            markets_calls: AtomicU32::new(0),
            books: Mutex::new(HashMap::new()),
            prices: Mutex::new(HashMap::new()),
            trades: Mutex::new(Vec::new()),
            denominators: Mutex::new(HashMap::new()),
        }
    }

    // ── Scripting helpers ───────────────────────────────────────────────

    pub fn set_default_positions(&self, positions: Vec<RawPosition>) {
        *self.default_positions.lock() = positions;
    }

    pub fn set_positions_for(&self, address: &str, positions: Vec<RawPosition>) {
        self.positions_by_address
            .lock()
            .insert(address.to_string(), positions);
    }

    /// Queue `count` upcoming `fetch_positions` failures with `status`.
    pub fn queue_positions_failures(&self, status: u16, count: usize) {
        let mut q = self.positions_failures.lock();
        for _ in 0..count {
            q.push_back(status);
        }
    }

    pub fn set_positions_delay_ms(&self, delay_ms: u64) {
        self.positions_delay_ms.store(delay_ms, Ordering::Relaxed);
    }

    pub fn set_proxy_wallet(&self, proxy: Option<&str>) {
        *self.proxy_wallet.lock() = proxy.map(|s| s.to_string());
    }

    pub fn push_market(&self, json: &str) {
        let market: GammaMarket = serde_json::from_str(json).expect("test market must parse");
        self.markets.lock().push(market);
    }

    /// Batches with more than `max_ok` token ids fail with `status`.
    pub fn fail_markets_batches_over(&self, max_ok: usize, status: u16) {
        *self.markets_fail_over.lock() = Some((max_ok, status));
    }

    pub fn set_book(&self, token_id: &str, json: &str) {
        let book: RawOrderBook = serde_json::from_str(json).expect("test book must parse");
        self.books
            .lock()
            .insert(token_id.to_string(), BookScript::Ok(book));
    }

    pub fn fail_book(&self, token_id: &str, status: u16) {
        self.books
            .lock()
            .insert(token_id.to_string(), BookScript::Status(status));
    }

    pub fn set_price(&self, token_id: &str, side: PriceSide, price: f64) {
        self.prices
            .lock()
            .insert((token_id.to_string(), side.as_str()), price);
    }

    pub fn set_trades(&self, trades: Vec<TradeFill>) {
        *self.trades.lock() = trades;
    }

    pub fn push_trade(&self, json: &str) {
        let fill: TradeFill = serde_json::from_str(json).expect("test trade must parse");
        self.trades.lock().push(fill);
    }

    pub fn set_denominator(&self, condition_id: &str, denominator: u128) {
        self.denominators
            .lock()
            .insert(condition_id.to_string(), denominator);
    }
}

impl Default for MockGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Gateway for MockGateway {
    async fn fetch_positions(&self, address: &str) -> Result<Vec<RawPosition>> {
        self.positions_calls.fetch_add(1, Ordering::SeqCst);

        let delay = self.positions_delay_ms.load(Ordering::Relaxed);
        if delay > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
        }

        if let Some(status) = self.positions_failures.lock().pop_front() {
            return Err(anyhow::Error::new(HttpStatusError(status))
                .context("scripted positions failure"));
        }

        if let Some(positions) = self.positions_by_address.lock().get(address) {
            return Ok(positions.clone());
        }
        Ok(self.default_positions.lock().clone())
    }

    async fn fetch_profile(&self, _address: &str) -> Result<ProfileResponse> {
        Ok(ProfileResponse {
            proxy_wallet: self.proxy_wallet.lock().clone(),
        })
    }

    async fn fetch_markets_by_token_ids(&self, token_ids: &[String]) -> Result<Vec<GammaMarket>> {
        self.markets_calls.fetch_add(1, Ordering::SeqCst);

        if let Some((max_ok, status)) = *self.markets_fail_over.lock() {
            if token_ids.len() > max_ok {
                return Err(anyhow::Error::new(HttpStatusError(status))
                    .context("scripted batch failure"));
            }
        }

        let markets = self.markets.lock();
        Ok(markets
            .iter()
            .filter(|m| m.token_ids().iter().any(|t| token_ids.contains(t)))
            .cloned()
            .collect())
    }

    async fn fetch_price(&self, token_id: &str, side: PriceSide) -> Result<f64> {
        match self
            .prices
            .lock()
            .get(&(token_id.to_string(), side.as_str()))
        {
            Some(&price) => Ok(price),
            None => Err(anyhow::Error::new(HttpStatusError(404))
                .context("scripted price miss")),
        }
    }

    async fn fetch_order_book(&self, token_id: &str) -> Result<RawOrderBook> {
        match self.books.lock().get(token_id) {
            Some(BookScript::Ok(book)) => Ok(book.clone()),
            Some(BookScript::Status(status)) => Err(anyhow::Error::new(HttpStatusError(*status))
                .context("scripted book failure")),
            None => Err(anyhow::Error::new(HttpStatusError(404))
                .context("no book scripted for token")),
        }
    }

    async fn fetch_trades(
        &self,
        _address: &str,
        side: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<TradeFill>> {
        let trades = self.trades.lock();
        Ok(trades
            .iter()
            .filter(|t| t.side.as_deref() == Some(side))
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn payout_denominator(&self, condition_id: &str) -> Result<u128> {
        Ok(self
            .denominators
            .lock()
            .get(condition_id)
            .copied()
            .unwrap_or(0))
    }
}
