// =============================================================================
// Portfolio data model — positions and the published snapshot
// =============================================================================
//
// A `Position` is a value object rebuilt from scratch on every refresh; it
// lives inside exactly one `PortfolioSnapshot`. Snapshots are immutable once
// published: the tracker hands out `Arc` clones and defensive copies, never a
// mutable view.
// =============================================================================

use std::collections::HashMap;

use serde::Serialize;

use crate::types::{
    BookStatus, ExecutionStatus, PnlClassification, PnlSource, PositionState,
    RedeemableProofSource,
};

// ---------------------------------------------------------------------------
// Entry metadata
// ---------------------------------------------------------------------------

/// Acquisition history derived from the wallet's BUY fills for one token.
#[derive(Debug, Clone, Serialize)]
pub struct EntryMeta {
    /// Size-weighted mean BUY price, in cents.
    pub avg_entry_price_cents: f64,
    /// Epoch seconds of the earliest contributing BUY.
    pub first_acquired_at: i64,
    /// Epoch seconds of the latest contributing BUY.
    pub last_acquired_at: i64,
    pub time_held_sec: i64,
}

// ---------------------------------------------------------------------------
// Position
// ---------------------------------------------------------------------------

/// One held outcome token, fully classified.
#[derive(Debug, Clone, Serialize)]
pub struct Position {
    pub market_id: String,
    pub token_id: String,
    /// Outcome name, e.g. "Yes".
    pub side: String,
    /// Share count.
    pub size: f64,
    pub entry_price: f64,
    /// Mark price selected by source priority; settlement price when
    /// redeemable.
    pub current_price: f64,
    pub pnl_pct: f64,
    pub pnl_usd: f64,
    pub pnl_source: PnlSource,
    pub pnl_trusted: bool,
    pub pnl_classification: PnlClassification,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pnl_untrusted_reason: Option<String>,
    pub position_state: PositionState,
    pub redeemable_proof_source: RedeemableProofSource,
    pub market_closed: bool,
    pub book_status: BookStatus,
    pub execution_status: ExecutionStatus,
    pub exec_price_trusted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_bid_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_ask_price: Option<f64>,
    /// Price pinned to an extreme while the market is still open — a strong
    /// hint that resolution is imminent.
    pub near_resolution_candidate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_meta: Option<EntryMeta>,
    /// Market end time (epoch ms), when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub market_end_time_ms: Option<i64>,
}

impl Position {
    /// Seconds this position has been held, when entry metadata is present.
    pub fn time_held_sec(&self) -> Option<i64> {
        self.entry_meta.as_ref().map(|m| m.time_held_sec)
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Classification tallies over the active list.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SnapshotSummary {
    pub active_total: usize,
    pub profitable: usize,
    pub losing: usize,
    pub neutral: usize,
    pub unknown: usize,
    pub redeemable_total: usize,
}

/// Counts observed before enrichment, used by the snapshot validator.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RawCounts {
    pub raw_total: usize,
    pub raw_active_candidates: usize,
    pub raw_redeemable_candidates: usize,
}

/// One refresh cycle's consistent view of the portfolio.
///
/// Published behind an `Arc`; never mutated after publication. A stale
/// snapshot is a copy of the last good one re-published under a fresh cycle
/// id with the staleness trio filled in.
#[derive(Debug, Clone, Serialize)]
pub struct PortfolioSnapshot {
    /// Strictly increasing across published snapshots.
    pub cycle_id: u64,
    pub address_used: String,
    pub fetched_at_ms: i64,
    pub active_positions: Vec<Position>,
    pub redeemable_positions: Vec<Position>,
    pub summary: SnapshotSummary,
    pub raw_counts: RawCounts,
    /// Enrichment failure tag → occurrence count for this cycle.
    pub classification_reasons: HashMap<String, u32>,
    pub stale: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stale_age_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stale_reason: Option<String>,
}

impl PortfolioSnapshot {
    /// Build the summary tallies from the position lists.
    pub fn tally(active: &[Position], redeemable: &[Position]) -> SnapshotSummary {
        let mut summary = SnapshotSummary {
            active_total: active.len(),
            redeemable_total: redeemable.len(),
            ..Default::default()
        };
        for p in active {
            match p.pnl_classification {
                PnlClassification::Profitable => summary.profitable += 1,
                PnlClassification::Losing => summary.losing += 1,
                PnlClassification::Neutral => summary.neutral += 1,
                PnlClassification::Unknown => summary.unknown += 1,
            }
        }
        summary
    }

    /// An empty, non-stale snapshot (used when the address holds nothing).
    pub fn empty(cycle_id: u64, address_used: String, fetched_at_ms: i64) -> Self {
        Self {
            cycle_id,
            address_used,
            fetched_at_ms,
            active_positions: Vec::new(),
            redeemable_positions: Vec::new(),
            summary: SnapshotSummary::default(),
            raw_counts: RawCounts::default(),
            classification_reasons: HashMap::new(),
            stale: false,
            stale_age_ms: None,
            stale_reason: None,
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn position(token: &str, classification: PnlClassification) -> Position {
        Position {
            market_id: format!("m-{token}"),
            token_id: token.to_string(),
            side: "Yes".to_string(),
            size: 10.0,
            entry_price: 0.5,
            current_price: 0.6,
            pnl_pct: 20.0,
            pnl_usd: 1.0,
            pnl_source: PnlSource::DataApi,
            pnl_trusted: classification != PnlClassification::Unknown,
            pnl_classification: classification,
            pnl_untrusted_reason: None,
            position_state: PositionState::Active,
            redeemable_proof_source: RedeemableProofSource::None,
            market_closed: false,
            book_status: BookStatus::Available,
            execution_status: ExecutionStatus::Tradable,
            exec_price_trusted: true,
            current_bid_price: Some(0.59),
            current_ask_price: Some(0.61),
            near_resolution_candidate: false,
            entry_meta: None,
            market_end_time_ms: None,
        }
    }

    #[test]
    fn tally_counts_each_classification() {
        let active = vec![
            position("a", PnlClassification::Profitable),
            position("b", PnlClassification::Profitable),
            position("c", PnlClassification::Losing),
            position("d", PnlClassification::Neutral),
            position("e", PnlClassification::Unknown),
        ];
        let redeemable = vec![position("f", PnlClassification::Profitable)];

        let summary = PortfolioSnapshot::tally(&active, &redeemable);
        assert_eq!(summary.active_total, 5);
        assert_eq!(summary.profitable, 2);
        assert_eq!(summary.losing, 1);
        assert_eq!(summary.neutral, 1);
        assert_eq!(summary.unknown, 1);
        assert_eq!(summary.redeemable_total, 1);
    }

    #[test]
    fn empty_snapshot_has_zero_everything() {
        let snap = PortfolioSnapshot::empty(7, "0xabc".to_string(), 123);
        assert_eq!(snap.cycle_id, 7);
        assert!(snap.active_positions.is_empty());
        assert!(snap.redeemable_positions.is_empty());
        assert_eq!(snap.summary.active_total, 0);
        assert_eq!(snap.raw_counts.raw_total, 0);
        assert!(!snap.stale);
    }

    #[test]
    fn snapshot_serialises_with_wire_tags() {
        let snap = PortfolioSnapshot::empty(1, "0xabc".to_string(), 0);
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["cycle_id"], 1);
        assert_eq!(json["stale"], false);
        // Optional staleness fields are omitted when unset.
        assert!(json.get("stale_age_ms").is_none());
    }
}
