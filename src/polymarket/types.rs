// =============================================================================
// Upstream wire types — alias-tolerant parsing at the edge
// =============================================================================
//
// The positions index and Gamma use multiple field names for the same concept
// ("new" vs "legacy"), return numbers as strings, and sometimes return JSON
// arrays encoded inside strings. Everything is normalised here, once, so that
// downstream code never branches on an alias.
// =============================================================================

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Flexible scalar deserializers
// ---------------------------------------------------------------------------

/// Accept a JSON number or a numeric string; empty string and null are None.
pub fn de_f64_opt<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Value::deserialize(deserializer)?;
    match v {
        Value::Null => Ok(None),
        Value::Number(n) => Ok(n.as_f64()),
        Value::String(s) => {
            if s.is_empty() {
                Ok(None)
            } else {
                s.parse::<f64>().map(Some).map_err(serde::de::Error::custom)
            }
        }
        _ => Ok(None),
    }
}

/// Accept a JSON integer or a numeric string.
pub fn de_i64<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Value::deserialize(deserializer)?;
    match v {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .ok_or_else(|| serde::de::Error::custom("number out of i64 range")),
        Value::String(s) => s
            .parse::<i64>()
            .or_else(|_| s.parse::<f64>().map(|f| f as i64))
            .map_err(serde::de::Error::custom),
        _ => Err(serde::de::Error::custom("expected number or numeric string")),
    }
}

/// Accept an array of strings/numbers, or the same array JSON-encoded inside
/// a string (Gamma does both).
pub fn de_string_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Value::deserialize(deserializer)?;
    match v {
        Value::Array(arr) => Ok(arr
            .into_iter()
            .filter_map(|x| match x {
                Value::String(s) => Some(s),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect()),
        Value::String(s) => {
            if s.is_empty() {
                return Ok(Vec::new());
            }
            serde_json::from_str::<Vec<String>>(&s).map_err(serde::de::Error::custom)
        }
        _ => Ok(Vec::new()),
    }
}

/// Like [`de_string_vec`] but parses each element as a float.
pub fn de_f64_vec<'de, D>(deserializer: D) -> Result<Vec<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let strings = de_string_vec(deserializer)?;
    Ok(strings.iter().filter_map(|s| s.parse::<f64>().ok()).collect())
}

// ---------------------------------------------------------------------------
// Positions index
// ---------------------------------------------------------------------------

/// One raw position as returned by the positions index, normalised across
/// new and legacy field names. Validation happens in the enricher, not here.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawPosition {
    /// Outcome token id.
    #[serde(default, alias = "token_id", alias = "asset_id")]
    pub asset: Option<String>,

    /// Market condition id.
    #[serde(
        default,
        rename = "conditionId",
        alias = "condition_id",
        alias = "market",
        alias = "id"
    )]
    pub condition_id: Option<String>,

    #[serde(default, deserialize_with = "de_f64_opt")]
    pub size: Option<f64>,

    /// Average entry price (0..1).
    #[serde(
        default,
        rename = "avgPrice",
        alias = "avg_price",
        alias = "initial_average_price",
        deserialize_with = "de_f64_opt"
    )]
    pub avg_price: Option<f64>,

    /// Outcome name, e.g. "Yes".
    #[serde(default, alias = "side")]
    pub outcome: Option<String>,

    /// Upstream's redeemability claim; verified before being believed.
    #[serde(default)]
    pub redeemable: bool,

    #[serde(
        default,
        rename = "cashPnl",
        alias = "cash_pnl",
        deserialize_with = "de_f64_opt"
    )]
    pub cash_pnl: Option<f64>,

    #[serde(
        default,
        rename = "percentPnl",
        alias = "percent_pnl",
        deserialize_with = "de_f64_opt"
    )]
    pub percent_pnl: Option<f64>,

    #[serde(
        default,
        rename = "curPrice",
        alias = "cur_price",
        deserialize_with = "de_f64_opt"
    )]
    pub cur_price: Option<f64>,

    #[serde(
        default,
        rename = "currentValue",
        alias = "current_value",
        deserialize_with = "de_f64_opt"
    )]
    pub current_value: Option<f64>,

    #[serde(
        default,
        rename = "initialValue",
        alias = "initial_value",
        deserialize_with = "de_f64_opt"
    )]
    pub initial_value: Option<f64>,
}

// ---------------------------------------------------------------------------
// Gamma profile
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfileResponse {
    #[serde(default, rename = "proxyWallet", alias = "proxy_wallet")]
    pub proxy_wallet: Option<String>,
}

// ---------------------------------------------------------------------------
// Gamma markets
// ---------------------------------------------------------------------------

/// One token entry inside a Gamma market payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GammaToken {
    #[serde(default)]
    pub outcome: Option<String>,
    #[serde(default)]
    pub winner: bool,
    #[serde(default, alias = "tokenId")]
    pub token_id: Option<String>,
}

/// One market as returned by `GET /markets?clob_token_ids=...`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GammaMarket {
    #[serde(default, rename = "conditionId", alias = "condition_id")]
    pub condition_id: Option<String>,

    /// Outcome names; Gamma may JSON-encode the array inside a string.
    #[serde(default, deserialize_with = "de_string_vec")]
    pub outcomes: Vec<String>,

    /// Outcome prices aligned with `outcomes`; same string-encoding caveat.
    #[serde(
        default,
        rename = "outcomePrices",
        alias = "outcome_prices",
        deserialize_with = "de_f64_vec"
    )]
    pub outcome_prices: Vec<f64>,

    #[serde(default)]
    pub tokens: Vec<GammaToken>,

    /// Explicit winner, under any of its historical names.
    #[serde(
        default,
        rename = "resolvedOutcome",
        alias = "resolved_outcome",
        alias = "winningOutcome",
        alias = "winning_outcome"
    )]
    pub resolved_outcome: Option<String>,

    #[serde(default)]
    pub closed: Option<bool>,

    #[serde(default)]
    pub resolved: Option<bool>,

    /// End timestamp under any of its historical names (ISO-8601 string).
    #[serde(
        default,
        rename = "endDate",
        alias = "end_date",
        alias = "endTime",
        alias = "end_time"
    )]
    pub end_date: Option<String>,

    #[serde(
        default,
        rename = "clobTokenIds",
        alias = "clob_token_ids",
        deserialize_with = "de_string_vec"
    )]
    pub clob_token_ids: Vec<String>,
}

impl GammaMarket {
    /// All token ids this market maps back to: the dedicated field when
    /// populated, else the ids embedded in `tokens`.
    pub fn token_ids(&self) -> Vec<String> {
        if !self.clob_token_ids.is_empty() {
            return self.clob_token_ids.clone();
        }
        self.tokens
            .iter()
            .filter_map(|t| t.token_id.clone())
            .collect()
    }

    /// Market end time parsed to epoch milliseconds, when present.
    pub fn end_time_ms(&self) -> Option<i64> {
        let raw = self.end_date.as_deref()?;
        chrono::DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.timestamp_millis())
            .ok()
    }
}

// ---------------------------------------------------------------------------
// CLOB order book & price
// ---------------------------------------------------------------------------

/// One price level; the CLOB returns both fields as strings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawLevel {
    #[serde(default, deserialize_with = "de_f64_opt")]
    pub price: Option<f64>,
    #[serde(default, deserialize_with = "de_f64_opt")]
    pub size: Option<f64>,
}

/// Raw order book for one token. Sort order is not trusted; consumers
/// recompute the top of book defensively.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawOrderBook {
    #[serde(default)]
    pub bids: Vec<RawLevel>,
    #[serde(default)]
    pub asks: Vec<RawLevel>,
}

impl RawOrderBook {
    /// Highest bid with positive size, regardless of upstream sort order.
    pub fn best_bid(&self) -> Option<f64> {
        self.bids
            .iter()
            .filter(|l| l.size.unwrap_or(0.0) > 0.0)
            .filter_map(|l| l.price)
            .fold(None, |best, p| match best {
                Some(b) if b >= p => Some(b),
                _ => Some(p),
            })
    }

    /// Lowest ask with positive size, regardless of upstream sort order.
    pub fn best_ask(&self) -> Option<f64> {
        self.asks
            .iter()
            .filter(|l| l.size.unwrap_or(0.0) > 0.0)
            .filter_map(|l| l.price)
            .fold(None, |best, p| match best {
                Some(b) if b <= p => Some(b),
                _ => Some(p),
            })
    }

    pub fn is_empty(&self) -> bool {
        self.best_bid().is_none() && self.best_ask().is_none()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PriceResponse {
    #[serde(default, deserialize_with = "de_f64_opt")]
    pub price: Option<f64>,
}

// ---------------------------------------------------------------------------
// Trade history
// ---------------------------------------------------------------------------

/// One fill from the trade-history endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct TradeFill {
    /// Epoch seconds.
    #[serde(default, deserialize_with = "de_i64")]
    pub timestamp: i64,

    #[serde(default, rename = "conditionId", alias = "condition_id")]
    pub condition_id: Option<String>,

    /// Outcome token id.
    #[serde(default, alias = "token_id", alias = "asset_id")]
    pub asset: Option<String>,

    #[serde(default)]
    pub side: Option<String>,

    #[serde(default, deserialize_with = "de_f64_opt")]
    pub size: Option<f64>,

    #[serde(default, deserialize_with = "de_f64_opt")]
    pub price: Option<f64>,
}
