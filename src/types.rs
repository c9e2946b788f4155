// =============================================================================
// Shared types used across the Polaris portfolio engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Where the mark price (and therefore the P&L) of a position came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PnlSource {
    /// The positions index supplied `curPrice` / `cashPnl` directly.
    DataApi,
    /// Best bid of a live order book — a price a sale could actually fill at.
    ExecutableBook,
    /// Price endpoint midpoint, settlement snap, or entry-price placeholder.
    Fallback,
}

impl std::fmt::Display for PnlSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DataApi => write!(f, "DATA_API"),
            Self::ExecutableBook => write!(f, "EXECUTABLE_BOOK"),
            Self::Fallback => write!(f, "FALLBACK"),
        }
    }
}

/// Sign of a position's trusted P&L. `Unknown` iff the P&L is untrusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PnlClassification {
    Profitable,
    Losing,
    Neutral,
    Unknown,
}

impl std::fmt::Display for PnlClassification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Profitable => write!(f, "PROFITABLE"),
            Self::Losing => write!(f, "LOSING"),
            Self::Neutral => write!(f, "NEUTRAL"),
            Self::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Lifecycle state of a position's market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionState {
    /// Market is open; shares trade on the book.
    Active,
    /// Market resolved on-chain; shares exchange 1-for-1 for settlement.
    Redeemable,
    /// Market closed per Gamma but settlement not yet published on-chain.
    ClosedNotRedeemable,
    Unknown,
}

impl std::fmt::Display for PositionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "ACTIVE"),
            Self::Redeemable => write!(f, "REDEEMABLE"),
            Self::ClosedNotRedeemable => write!(f, "CLOSED_NOT_REDEEMABLE"),
            Self::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Evidence backing a `Redeemable` state. A redeemable position must carry
/// one; `None` on a redeemable position is an internal invariant violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RedeemableProofSource {
    /// The positions index flagged it and the flag survived verification.
    DataApiFlag,
    /// `payoutDenominator(conditionId) > 0` read from the settlement contract.
    OnchainDenom,
    None,
}

impl std::fmt::Display for RedeemableProofSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DataApiFlag => write!(f, "DATA_API_FLAG"),
            Self::OnchainDenom => write!(f, "ONCHAIN_DENOM"),
            Self::None => write!(f, "NONE"),
        }
    }
}

/// Outcome of the order-book fetch for one token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookStatus {
    Available,
    EmptyBook,
    NoBook404,
    /// Crossed book or spread wider than the sanity threshold.
    BookAnomaly,
    NotFetched,
}

impl std::fmt::Display for BookStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Available => write!(f, "AVAILABLE"),
            Self::EmptyBook => write!(f, "EMPTY_BOOK"),
            Self::NoBook404 => write!(f, "NO_BOOK_404"),
            Self::BookAnomaly => write!(f, "BOOK_ANOMALY"),
            Self::NotFetched => write!(f, "NOT_FETCHED"),
        }
    }
}

/// Whether a position could actually be traded through the CLOB right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Tradable,
    NotTradableOnClob,
    ExecutionBlocked,
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tradable => write!(f, "TRADABLE"),
            Self::NotTradableOnClob => write!(f, "NOT_TRADABLE_ON_CLOB"),
            Self::ExecutionBlocked => write!(f, "EXECUTION_BLOCKED"),
        }
    }
}

/// Categorised reason an enrichment step failed for one raw position.
///
/// Hard reasons drop the position from the snapshot; soft reasons are
/// recorded for the validator but the position is salvaged with untrusted
/// P&L.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SkipReason {
    MissingFields,
    InvalidSizePrice,
    MissingSide,
    EnrichFailed,
    NoBook,
    Book404,
    PricingFetchFailed,
}

impl SkipReason {
    /// Hard reasons remove the position; soft reasons only tag it.
    pub fn is_hard(&self) -> bool {
        matches!(
            self,
            Self::MissingFields | Self::InvalidSizePrice | Self::MissingSide | Self::EnrichFailed
        )
    }

    /// Order-book failure categories relax the active-collapse rejection.
    pub fn is_book_failure(&self) -> bool {
        matches!(self, Self::NoBook | Self::Book404 | Self::PricingFetchFailed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingFields => "MISSING_FIELDS",
            Self::InvalidSizePrice => "INVALID_SIZE_PRICE",
            Self::MissingSide => "MISSING_SIDE",
            Self::EnrichFailed => "ENRICH_FAILED",
            Self::NoBook => "NO_BOOK",
            Self::Book404 => "BOOK_404",
            Self::PricingFetchFailed => "PRICING_FETCH_FAILED",
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Broad classification of an upstream failure, used by the circuit breaker
/// to decide whether a token's price fetches should be suspended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    NotFound404,
    Unprocessable422,
    Timeout,
    Network,
    Other,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound404 => write!(f, "404"),
            Self::Unprocessable422 => write!(f, "422"),
            Self::Timeout => write!(f, "TIMEOUT"),
            Self::Network => write!(f, "NETWORK"),
            Self::Other => write!(f, "OTHER"),
        }
    }
}

/// Escalation level recommended by the self-heal check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResetLevel {
    /// Clear transient caches and throttling; enter recovery mode.
    Soft,
    /// Soft plus all mapping caches, the cached holding address, and the
    /// last-good snapshot.
    Hard,
}

impl std::fmt::Display for ResetLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Soft => write!(f, "SOFT_RESET"),
            Self::Hard => write!(f, "HARD_RESET"),
        }
    }
}

/// Why a candidate snapshot was rejected by the validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectReason {
    ActiveCollapseBug,
    FetchRegression,
    AddressFlipCollapse,
    SuspiciousShrink,
    ActiveWipeout,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ActiveCollapseBug => write!(f, "ACTIVE_COLLAPSE_BUG"),
            Self::FetchRegression => write!(f, "FETCH_REGRESSION"),
            Self::AddressFlipCollapse => write!(f, "ADDRESS_FLIP_COLLAPSE"),
            Self::SuspiciousShrink => write!(f, "SUSPICIOUS_SHRINK"),
            Self::ActiveWipeout => write!(f, "ACTIVE_WIPEOUT"),
        }
    }
}

/// Current UNIX timestamp in milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skip_reason_hardness() {
        assert!(SkipReason::MissingFields.is_hard());
        assert!(SkipReason::InvalidSizePrice.is_hard());
        assert!(SkipReason::MissingSide.is_hard());
        assert!(SkipReason::EnrichFailed.is_hard());
        assert!(!SkipReason::NoBook.is_hard());
        assert!(!SkipReason::Book404.is_hard());
        assert!(!SkipReason::PricingFetchFailed.is_hard());
    }

    #[test]
    fn book_failure_categories() {
        assert!(SkipReason::NoBook.is_book_failure());
        assert!(SkipReason::Book404.is_book_failure());
        assert!(SkipReason::PricingFetchFailed.is_book_failure());
        assert!(!SkipReason::MissingFields.is_book_failure());
    }

    #[test]
    fn enum_wire_names_are_screaming_snake() {
        assert_eq!(
            serde_json::to_string(&PnlSource::ExecutableBook).unwrap(),
            "\"EXECUTABLE_BOOK\""
        );
        assert_eq!(
            serde_json::to_string(&PositionState::ClosedNotRedeemable).unwrap(),
            "\"CLOSED_NOT_REDEEMABLE\""
        );
        assert_eq!(
            serde_json::to_string(&BookStatus::NoBook404).unwrap(),
            "\"NO_BOOK_404\""
        );
        assert_eq!(
            serde_json::to_string(&RedeemableProofSource::OnchainDenom).unwrap(),
            "\"ONCHAIN_DENOM\""
        );
    }

    #[test]
    fn display_matches_wire_tags() {
        assert_eq!(PnlClassification::Profitable.to_string(), "PROFITABLE");
        assert_eq!(ExecutionStatus::NotTradableOnClob.to_string(), "NOT_TRADABLE_ON_CLOB");
        assert_eq!(RejectReason::SuspiciousShrink.to_string(), "SUSPICIOUS_SHRINK");
        assert_eq!(ResetLevel::Hard.to_string(), "HARD_RESET");
    }
}
