// =============================================================================
// Upstream gateway — every outbound call behind one seam
// =============================================================================
//
// The engine consumes five HTTP services and one on-chain view call. All of
// them sit behind the `Gateway` trait so the refresh pipeline can be driven
// against scripted fixtures in tests. `PolymarketClient` is the production
// implementation.
// =============================================================================

pub mod chain;
pub mod client;
pub mod types;

use anyhow::Result;
use async_trait::async_trait;

use crate::types::ErrorKind;
use self::types::{GammaMarket, ProfileResponse, RawOrderBook, RawPosition, TradeFill};

// ---------------------------------------------------------------------------
// Typed HTTP status error
// ---------------------------------------------------------------------------

/// Non-success HTTP status carried inside an `anyhow::Error` so callers can
/// recover the status code for fallback decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpStatusError(pub u16);

impl std::fmt::Display for HttpStatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "upstream returned HTTP {}", self.0)
    }
}

impl std::error::Error for HttpStatusError {}

/// Extract the HTTP status from an error chain, if one is there.
pub fn http_status(err: &anyhow::Error) -> Option<u16> {
    err.downcast_ref::<HttpStatusError>().map(|e| e.0)
}

/// Classify an upstream failure for the circuit breaker.
pub fn classify_error(err: &anyhow::Error) -> ErrorKind {
    if let Some(status) = http_status(err) {
        return match status {
            404 => ErrorKind::NotFound404,
            422 => ErrorKind::Unprocessable422,
            _ => ErrorKind::Other,
        };
    }
    if let Some(rerr) = err.downcast_ref::<reqwest::Error>() {
        if rerr.is_timeout() {
            return ErrorKind::Timeout;
        }
        if rerr.is_connect() {
            return ErrorKind::Network;
        }
    }
    ErrorKind::Other
}

/// Whether a batch failure warrants retrying tokens one at a time.
pub fn batch_should_fall_back(err: &anyhow::Error) -> bool {
    match http_status(err) {
        Some(422) | Some(429) => true,
        Some(s) if s >= 500 => true,
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Gateway trait
// ---------------------------------------------------------------------------

/// Side parameter of the price fallback endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceSide {
    Buy,
    Sell,
}

impl PriceSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }
}

/// All upstream I/O the portfolio engine performs.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Positions index: raw positions held by `address`.
    async fn fetch_positions(&self, address: &str) -> Result<Vec<RawPosition>>;

    /// Gamma profile for `address` (carries the proxy wallet, if any).
    async fn fetch_profile(&self, address: &str) -> Result<ProfileResponse>;

    /// Gamma markets matching the given CLOB token ids (one batch).
    async fn fetch_markets_by_token_ids(&self, token_ids: &[String]) -> Result<Vec<GammaMarket>>;

    /// CLOB price endpoint for one token and side.
    async fn fetch_price(&self, token_id: &str, side: PriceSide) -> Result<f64>;

    /// CLOB order book for one token. A missing book surfaces as an error
    /// whose chain carries `HttpStatusError(404)`.
    async fn fetch_order_book(&self, token_id: &str) -> Result<RawOrderBook>;

    /// One page of the wallet's trade history, filtered by side.
    async fn fetch_trades(
        &self,
        address: &str,
        side: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<TradeFill>>;

    /// `payoutDenominator(conditionId)` on the settlement contract.
    async fn payout_denominator(&self, condition_id: &str) -> Result<u128>;
}
