// =============================================================================
// Snapshot Validator — five rejection rules against the last good snapshot
// =============================================================================
//
// Phase B of the two-phase publish. A candidate snapshot that looks like an
// upstream glitch (sudden collapse, shrink, or wipe-out) is rejected so the
// engine keeps serving the last known-good view instead of briefly telling
// every strategy that the portfolio is empty.
// =============================================================================

use std::collections::HashMap;

use tracing::warn;

use crate::position::PortfolioSnapshot;
use crate::types::{RejectReason, SkipReason};

/// Fraction of the previous raw total below which a fetch is a regression.
const FETCH_REGRESSION_FRACTION: f64 = 0.2;
/// Fraction of the previous raw total below which a shrink is suspicious.
const SUSPICIOUS_SHRINK_FRACTION: f64 = 0.25;
/// Previous raw totals at or above this arm the suspicious-shrink rule.
const SUSPICIOUS_SHRINK_MIN_PREV: usize = 20;
/// Previous active counts at or above this arm the wipe-out rule.
const ACTIVE_WIPEOUT_MIN_PREV: usize = 10;
/// Raw totals at or below this qualify for minimal acceptance.
const MINIMAL_ACCEPTANCE_MAX_RAW: usize = 5;

/// Everything the rules need to know about the candidate cycle.
#[derive(Debug, Clone)]
pub struct CandidateStats {
    pub raw_total: usize,
    pub raw_active_candidates: usize,
    pub final_active: usize,
    pub final_redeemable: usize,
    /// Every failure tag recorded during enrichment (hard and soft).
    pub reasons: HashMap<SkipReason, u32>,
    pub address_used: String,
}

impl CandidateStats {
    fn has_hard_reasons(&self) -> bool {
        self.reasons.iter().any(|(r, &n)| r.is_hard() && n > 0)
    }

    fn all_reasons_are_book_failures(&self) -> bool {
        !self.reasons.is_empty() && self.reasons.keys().all(|r| r.is_book_failure())
    }
}

/// Controller state that relaxes individual rules.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidationFlags {
    /// One-shot bypass of the active-collapse rule after auto-recovery.
    pub bootstrap: bool,
    /// Recovery mode relaxes collapse and regression checks.
    pub recovery: bool,
}

/// Outcome of validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    /// Accepted, but the cycle carries degraded data worth logging.
    AcceptWithWarning(&'static str),
    Reject(RejectReason),
}

/// Run the rejection rules for a candidate against the last good snapshot.
pub fn validate(
    candidate: &CandidateStats,
    last_good: Option<&PortfolioSnapshot>,
    flags: ValidationFlags,
) -> Verdict {
    // ── 1. ACTIVE_COLLAPSE_BUG ──────────────────────────────────────────
    // Raw positions exist, active candidates exist, yet nothing survived
    // enrichment. Almost always an enrichment-side outage, not a real
    // portfolio change.
    if candidate.raw_total > 0
        && candidate.raw_active_candidates > 0
        && candidate.final_active == 0
    {
        if flags.bootstrap {
            warn!("active list collapsed — accepted once under bootstrap");
        } else if flags.recovery {
            warn!("active list collapsed — accepted in recovery mode");
        } else if candidate.raw_total <= MINIMAL_ACCEPTANCE_MAX_RAW
            && !candidate.has_hard_reasons()
        {
            // Tiny portfolios can legitimately end up all-redeemable; without
            // concrete failures there is nothing to retry forever.
            return Verdict::AcceptWithWarning("minimal acceptance for a small portfolio");
        } else if candidate.all_reasons_are_book_failures() {
            return Verdict::AcceptWithWarning(
                "all skips are order-book failures — positions carry UNKNOWN P&L",
            );
        } else {
            return Verdict::Reject(RejectReason::ActiveCollapseBug);
        }
    }

    let Some(prev) = last_good else {
        return Verdict::Accept;
    };
    let prev_raw = prev.raw_counts.raw_total;
    let prev_active = prev.summary.active_total;
    let prev_positions = prev_active + prev.summary.redeemable_total;

    // ── 2. SUSPICIOUS_SHRINK ────────────────────────────────────────────
    // Checked ahead of the generic regression rule: a shrink on a sizeable
    // portfolio carries corrective actions (address re-probe, outcome cache
    // flush) that a plain regression does not.
    if prev_raw >= SUSPICIOUS_SHRINK_MIN_PREV
        && (candidate.raw_total as f64) <= SUSPICIOUS_SHRINK_FRACTION * prev_raw as f64
    {
        return Verdict::Reject(RejectReason::SuspiciousShrink);
    }

    // ── 3. FETCH_REGRESSION ─────────────────────────────────────────────
    if !flags.recovery
        && prev_raw > 0
        && (candidate.raw_total as f64) < FETCH_REGRESSION_FRACTION * prev_raw as f64
    {
        return Verdict::Reject(RejectReason::FetchRegression);
    }

    // ── 4. ADDRESS_FLIP_COLLAPSE ────────────────────────────────────────
    if candidate.address_used != prev.address_used
        && prev_positions > 0
        && candidate.final_active == 0
        && candidate.final_redeemable == 0
    {
        return Verdict::Reject(RejectReason::AddressFlipCollapse);
    }

    // ── 5. ACTIVE_WIPEOUT ───────────────────────────────────────────────
    if prev_active >= ACTIVE_WIPEOUT_MIN_PREV
        && candidate.final_active == 0
        && candidate.raw_total > 0
    {
        return Verdict::Reject(RejectReason::ActiveWipeout);
    }

    Verdict::Accept
}

/// Whether a rejection should force an address re-probe and clear outcome
/// caches for the next cycle.
pub fn needs_corrective_action(reason: RejectReason) -> bool {
    matches!(
        reason,
        RejectReason::SuspiciousShrink | RejectReason::ActiveWipeout
    )
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::{PortfolioSnapshot, RawCounts, SnapshotSummary};

    fn candidate(raw: usize, raw_active: usize, active: usize, redeemable: usize) -> CandidateStats {
        CandidateStats {
            raw_total: raw,
            raw_active_candidates: raw_active,
            final_active: active,
            final_redeemable: redeemable,
            reasons: HashMap::new(),
            address_used: "0xaaa".to_string(),
        }
    }

    fn prev(raw: usize, active: usize) -> PortfolioSnapshot {
        let mut snap = PortfolioSnapshot::empty(1, "0xaaa".to_string(), 0);
        snap.raw_counts = RawCounts {
            raw_total: raw,
            raw_active_candidates: raw,
            raw_redeemable_candidates: 0,
        };
        snap.summary = SnapshotSummary {
            active_total: active,
            ..Default::default()
        };
        snap
    }

    #[test]
    fn healthy_candidate_is_accepted() {
        let v = validate(
            &candidate(10, 10, 9, 1),
            Some(&prev(10, 9)),
            ValidationFlags::default(),
        );
        assert_eq!(v, Verdict::Accept);
    }

    #[test]
    fn first_snapshot_is_accepted_without_history() {
        let v = validate(&candidate(5, 5, 5, 0), None, ValidationFlags::default());
        assert_eq!(v, Verdict::Accept);
    }

    #[test]
    fn active_collapse_is_rejected() {
        let mut c = candidate(10, 10, 0, 0);
        c.reasons.insert(SkipReason::EnrichFailed, 10);
        let v = validate(&c, Some(&prev(10, 9)), ValidationFlags::default());
        assert_eq!(v, Verdict::Reject(RejectReason::ActiveCollapseBug));
    }

    #[test]
    fn active_collapse_bypassed_by_bootstrap() {
        let mut c = candidate(10, 10, 0, 0);
        c.reasons.insert(SkipReason::EnrichFailed, 10);
        let flags = ValidationFlags {
            bootstrap: true,
            recovery: false,
        };
        // Falls through to the remaining rules; with no prior snapshot the
        // candidate is accepted.
        assert_eq!(validate(&c, None, flags), Verdict::Accept);
    }

    #[test]
    fn active_collapse_relaxed_in_recovery() {
        let mut c = candidate(10, 10, 0, 0);
        c.reasons.insert(SkipReason::EnrichFailed, 10);
        let flags = ValidationFlags {
            bootstrap: false,
            recovery: true,
        };
        assert_eq!(validate(&c, None, flags), Verdict::Accept);
    }

    #[test]
    fn minimal_acceptance_for_small_portfolios() {
        // Five raw positions, none survived as active, but no hard skip
        // reasons: all went redeemable.
        let c = candidate(5, 5, 0, 5);
        let v = validate(&c, None, ValidationFlags::default());
        assert!(matches!(v, Verdict::AcceptWithWarning(_)));
    }

    #[test]
    fn minimal_acceptance_denied_with_hard_reasons() {
        let mut c = candidate(5, 5, 0, 0);
        c.reasons.insert(SkipReason::MissingFields, 5);
        let v = validate(&c, None, ValidationFlags::default());
        assert_eq!(v, Verdict::Reject(RejectReason::ActiveCollapseBug));
    }

    #[test]
    fn collapse_accepted_when_only_book_failures() {
        let mut c = candidate(30, 30, 0, 0);
        c.reasons.insert(SkipReason::Book404, 20);
        c.reasons.insert(SkipReason::NoBook, 10);
        let v = validate(&c, None, ValidationFlags::default());
        assert!(matches!(v, Verdict::AcceptWithWarning(_)));
    }

    #[test]
    fn collapse_rejected_when_mixed_reasons() {
        let mut c = candidate(30, 30, 0, 0);
        c.reasons.insert(SkipReason::Book404, 20);
        c.reasons.insert(SkipReason::MissingFields, 1);
        let v = validate(&c, None, ValidationFlags::default());
        assert_eq!(v, Verdict::Reject(RejectReason::ActiveCollapseBug));
    }

    #[test]
    fn fetch_regression_is_rejected() {
        // Previous portfolio below the shrink threshold: the plain
        // regression rule owns this case.
        let v = validate(
            &candidate(2, 2, 2, 0),
            Some(&prev(15, 12)),
            ValidationFlags::default(),
        );
        assert_eq!(v, Verdict::Reject(RejectReason::FetchRegression));
    }

    #[test]
    fn large_portfolio_collapse_is_a_suspicious_shrink() {
        // Both the shrink and regression predicates hold; the shrink rule
        // wins so corrective actions fire.
        let v = validate(
            &candidate(5, 5, 5, 0),
            Some(&prev(50, 40)),
            ValidationFlags::default(),
        );
        assert_eq!(v, Verdict::Reject(RejectReason::SuspiciousShrink));
    }

    #[test]
    fn fetch_regression_skipped_in_recovery() {
        let flags = ValidationFlags {
            bootstrap: false,
            recovery: true,
        };
        let v = validate(&candidate(3, 3, 3, 0), Some(&prev(10, 8)), flags);
        assert_eq!(v, Verdict::Accept);
    }

    #[test]
    fn address_flip_collapse_is_rejected() {
        let mut c = candidate(10, 10, 0, 0);
        c.reasons.insert(SkipReason::Book404, 10);
        c.address_used = "0xbbb".to_string();
        // Book-failure acceptance would normally fire, but the address flip
        // with both lists empty is checked on the way through.
        let v = validate(&c, Some(&prev(12, 11)), ValidationFlags::default());
        assert!(matches!(v, Verdict::AcceptWithWarning(_)));

        // Without the book-failure escape the flip collapse rejects.
        let mut c = candidate(10, 0, 0, 0);
        c.address_used = "0xbbb".to_string();
        let v = validate(&c, Some(&prev(12, 11)), ValidationFlags::default());
        assert_eq!(v, Verdict::Reject(RejectReason::AddressFlipCollapse));
    }

    #[test]
    fn suspicious_shrink_is_rejected() {
        let v = validate(
            &candidate(5, 5, 5, 0),
            Some(&prev(20, 15)),
            ValidationFlags::default(),
        );
        assert_eq!(v, Verdict::Reject(RejectReason::SuspiciousShrink));
        assert!(needs_corrective_action(RejectReason::SuspiciousShrink));
    }

    #[test]
    fn shrink_below_twenty_prev_is_tolerated() {
        let v = validate(
            &candidate(4, 4, 4, 0),
            Some(&prev(16, 10)),
            ValidationFlags::default(),
        );
        assert_eq!(v, Verdict::Accept);
    }

    #[test]
    fn active_wipeout_is_rejected() {
        let v = validate(
            &candidate(12, 0, 0, 12),
            Some(&prev(12, 11)),
            ValidationFlags::default(),
        );
        assert_eq!(v, Verdict::Reject(RejectReason::ActiveWipeout));
        assert!(needs_corrective_action(RejectReason::ActiveWipeout));
    }

    #[test]
    fn wipeout_with_small_previous_active_is_tolerated() {
        let v = validate(
            &candidate(8, 0, 0, 8),
            Some(&prev(8, 7)),
            ValidationFlags::default(),
        );
        assert_eq!(v, Verdict::Accept);
    }
}
