// =============================================================================
// Polymarket REST / RPC client — production Gateway implementation
// =============================================================================
//
// All endpoints are unauthenticated reads. Every request carries the shared
// client timeout; non-success statuses surface as `HttpStatusError` inside
// the error chain so callers can route 404 / 422 / 429 / 5xx differently.
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::debug;

use super::chain::{parse_denominator, payout_denominator_calldata};
use super::types::{
    GammaMarket, PriceResponse, ProfileResponse, RawOrderBook, RawPosition, TradeFill,
};
use super::{Gateway, HttpStatusError, PriceSide};

/// Read-only client over the positions index, Gamma, the CLOB, and the
/// settlement contract.
#[derive(Clone)]
pub struct PolymarketClient {
    http: reqwest::Client,
    positions_base: String,
    gamma_base: String,
    clob_base: String,
    rpc_url: String,
    ctf_address: String,
}

impl PolymarketClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Create a new client.
    ///
    /// # Arguments
    /// * `positions_base` — data API base, e.g. `https://data-api.polymarket.com`
    /// * `gamma_base`     — Gamma API base, e.g. `https://gamma-api.polymarket.com`
    /// * `clob_base`      — CLOB REST base, e.g. `https://clob.polymarket.com`
    /// * `rpc_url`        — read-only JSON-RPC endpoint for the view call
    /// * `ctf_address`    — Conditional-Tokens contract address
    /// * `timeout_ms`     — per-request deadline applied to every call
    pub fn new(
        positions_base: impl Into<String>,
        gamma_base: impl Into<String>,
        clob_base: impl Into<String>,
        rpc_url: impl Into<String>,
        ctf_address: impl Into<String>,
        timeout_ms: u64,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .build()
            .expect("failed to build reqwest client");

        Self {
            http,
            positions_base: positions_base.into(),
            gamma_base: gamma_base.into(),
            clob_base: clob_base.into(),
            rpc_url: rpc_url.into(),
            ctf_address: ctf_address.into(),
        }
    }

    // -------------------------------------------------------------------------
    // Internal helpers
    // -------------------------------------------------------------------------

    /// GET `url` and decode the JSON body, converting non-success statuses
    /// into `HttpStatusError`.
    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .with_context(|| format!("GET {url} request failed"))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow::Error::new(HttpStatusError(status.as_u16()))
                .context(format!("GET {url} returned {status}")));
        }

        resp.json::<T>()
            .await
            .with_context(|| format!("failed to parse response from {url}"))
    }
}

#[async_trait]
impl Gateway for PolymarketClient {
    async fn fetch_positions(&self, address: &str) -> Result<Vec<RawPosition>> {
        let url = format!("{}/positions?user={}", self.positions_base, address);
        let positions: Vec<RawPosition> = self.get_json(&url).await?;
        debug!(address, count = positions.len(), "positions fetched");
        Ok(positions)
    }

    async fn fetch_profile(&self, address: &str) -> Result<ProfileResponse> {
        let url = format!("{}/profile/{}", self.gamma_base, address);
        self.get_json(&url).await
    }

    async fn fetch_markets_by_token_ids(&self, token_ids: &[String]) -> Result<Vec<GammaMarket>> {
        let joined = token_ids.join(",");
        let url = format!("{}/markets?clob_token_ids={}", self.gamma_base, joined);
        let markets: Vec<GammaMarket> = self.get_json(&url).await?;
        debug!(
            requested = token_ids.len(),
            returned = markets.len(),
            "gamma markets fetched"
        );
        Ok(markets)
    }

    async fn fetch_price(&self, token_id: &str, side: PriceSide) -> Result<f64> {
        let url = format!(
            "{}/price?token_id={}&side={}",
            self.clob_base,
            token_id,
            side.as_str()
        );
        let resp: PriceResponse = self.get_json(&url).await?;
        resp.price
            .with_context(|| format!("price endpoint returned no price for {token_id}"))
    }

    async fn fetch_order_book(&self, token_id: &str) -> Result<RawOrderBook> {
        let url = format!("{}/book?token_id={}", self.clob_base, token_id);
        self.get_json(&url).await
    }

    async fn fetch_trades(
        &self,
        address: &str,
        side: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<TradeFill>> {
        let url = format!(
            "{}/trades?user={}&side={}&limit={}&offset={}",
            self.positions_base, address, side, limit, offset
        );
        self.get_json(&url).await
    }

    async fn payout_denominator(&self, condition_id: &str) -> Result<u128> {
        let data = payout_denominator_calldata(condition_id)?;
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "eth_call",
            "params": [
                { "to": self.ctf_address, "data": data },
                "latest"
            ]
        });

        let resp = self
            .http
            .post(&self.rpc_url)
            .json(&body)
            .send()
            .await
            .context("eth_call request failed")?;

        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow::Error::new(HttpStatusError(status.as_u16()))
                .context(format!("eth_call returned {status}")));
        }

        let payload: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse eth_call response")?;

        if let Some(err) = payload.get("error") {
            anyhow::bail!("eth_call RPC error: {err}");
        }

        let result = payload
            .get("result")
            .and_then(|v| v.as_str())
            .context("eth_call response missing 'result'")?;

        let denominator = parse_denominator(result)?;
        debug!(condition_id, denominator, "payout denominator read");
        Ok(denominator)
    }
}

impl std::fmt::Debug for PolymarketClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolymarketClient")
            .field("positions_base", &self.positions_base)
            .field("gamma_base", &self.gamma_base)
            .field("clob_base", &self.clob_base)
            .field("ctf_address", &self.ctf_address)
            .finish()
    }
}
