// =============================================================================
// Address Resolver — which address actually holds the positions
// =============================================================================
//
// Positions may sit under the trader's EOA or under the proxy wallet the
// exchange deploys for it. The resolver prefers the proxy wallet (fetched
// from the Gamma profile and cached), but once a choice is made it is
// "sticky": it only flips inside the sticky window on strong evidence —
// repeated empty fetches, or a parallel probe showing the alternate address
// holding several times more positions. This resists flip-flopping when one
// index endpoint lags the other.
// =============================================================================

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::dedup::LogDeduper;
use crate::polymarket::Gateway;

/// Consecutive empty fetches on the selected address that justify a flip.
const ZERO_STREAK_THRESHOLD: u32 = 2;
/// The alternate must hold at least this multiple of the current count.
const PROBE_SWITCH_FACTOR: usize = 3;
/// Fetch counts at or below this are "suspiciously low" and arm a probe.
const SUSPICIOUS_LOW_COUNT: usize = 2;
/// Address changes are logged at most once per this interval.
const ADDRESS_CHANGE_LOG_TTL_MS: i64 = 300_000;

struct AddrState {
    /// `None` until the profile has been fetched; then the proxy, if any.
    cached_proxy: Option<Option<String>>,
    profile_fetched_at_ms: i64,
    selected: Option<String>,
    selected_at_ms: i64,
    /// Consecutive refreshes in which the selected address held nothing.
    zero_streak: u32,
    /// A probe has already run this lifetime (re-armed by resets).
    probe_completed: bool,
    /// Next resolve must probe regardless (validator corrective action).
    probe_requested: bool,
    /// Raw count of the most recent positions fetch on the selection.
    last_fetch_count: Option<usize>,
}

/// Resolves and pins the holding address.
pub struct AddressResolver {
    gateway: Arc<dyn Gateway>,
    dedup: Arc<LogDeduper>,
    eoa: String,
    sticky_ms: i64,
    profile_ttl_ms: i64,
    state: RwLock<AddrState>,
}

impl AddressResolver {
    pub fn new(
        gateway: Arc<dyn Gateway>,
        dedup: Arc<LogDeduper>,
        eoa: impl Into<String>,
        sticky_ms: i64,
        profile_ttl_ms: i64,
    ) -> Self {
        Self {
            gateway,
            dedup,
            eoa: eoa.into(),
            sticky_ms,
            profile_ttl_ms,
            state: RwLock::new(AddrState {
                cached_proxy: None,
                profile_fetched_at_ms: 0,
                selected: None,
                selected_at_ms: 0,
                zero_streak: 0,
                probe_completed: false,
                probe_requested: false,
                last_fetch_count: None,
            }),
        }
    }

    // -------------------------------------------------------------------------
    // Resolution
    // -------------------------------------------------------------------------

    /// Pick the holding address for this refresh cycle.
    ///
    /// `last_good_raw_total` is the raw position count of the last good
    /// snapshot, used to detect a suspicious drop that warrants a probe.
    pub async fn resolve(&self, last_good_raw_total: Option<usize>, now_ms: i64) -> String {
        self.ensure_proxy(now_ms).await;

        let (preferred, selected, selected_at, zero_streak, probe_needed) = {
            let s = self.state.read();
            let proxy = s.cached_proxy.clone().flatten();
            let preferred = proxy.unwrap_or_else(|| self.eoa.clone());

            let suspicious_low = s
                .last_fetch_count
                .map(|c| c <= SUSPICIOUS_LOW_COUNT && !s.probe_completed)
                .unwrap_or(false);
            let collapsed_vs_last_good = match (last_good_raw_total, s.last_fetch_count) {
                (Some(prev), Some(cur)) if prev >= 20 => cur * 4 < prev,
                _ => false,
            };
            let probe_needed = s.probe_requested || suspicious_low || collapsed_vs_last_good;

            (
                preferred,
                s.selected.clone(),
                s.selected_at_ms,
                s.zero_streak,
                probe_needed,
            )
        };

        // First resolution of this lifetime.
        let Some(current) = selected else {
            self.select(preferred.clone(), now_ms, "initial selection");
            return preferred;
        };

        let alternate = self.alternate_of(&current);

        // Probe both addresses in parallel when the selection looks wrong.
        if probe_needed {
            if let Some(alt) = alternate.clone() {
                if let Some(better) = self.probe(&current, &alt, now_ms).await {
                    self.select(better.clone(), now_ms, "probe found more positions");
                    return better;
                }
            } else {
                // Nothing to compare against; mark the probe done anyway so
                // a small portfolio doesn't re-probe every cycle.
                let mut s = self.state.write();
                s.probe_completed = true;
                s.probe_requested = false;
            }
        }

        let within_sticky = now_ms - selected_at < self.sticky_ms;

        if within_sticky {
            // Inside the sticky window only a persistent empty streak moves
            // the selection.
            if zero_streak >= ZERO_STREAK_THRESHOLD {
                if let Some(alt) = alternate {
                    self.select(
                        alt.clone(),
                        now_ms,
                        "selected address returned no positions repeatedly",
                    );
                    return alt;
                }
            }
            return current;
        }

        // Sticky window expired: fall back to the preferred address.
        if current != preferred {
            self.select(preferred.clone(), now_ms, "sticky window expired");
            return preferred;
        }
        current
    }

    /// Report the outcome of the positions fetch done with `address`.
    pub fn note_fetch_result(&self, address: &str, raw_count: usize) {
        let mut s = self.state.write();
        if s.selected.as_deref() != Some(address) {
            return;
        }
        s.last_fetch_count = Some(raw_count);
        if raw_count == 0 {
            s.zero_streak += 1;
            debug!(address, streak = s.zero_streak, "empty positions fetch on selected address");
        } else {
            s.zero_streak = 0;
        }
    }

    /// Force a probe on the next resolve (snapshot-validator corrective).
    pub fn request_probe(&self) {
        let mut s = self.state.write();
        s.probe_requested = true;
        s.probe_completed = false;
    }

    /// Re-arm the one-shot probe (soft reset).
    pub fn reset_probe_flag(&self) {
        self.state.write().probe_completed = false;
    }

    /// Forget everything: cached proxy, selection, stickiness (hard reset).
    pub fn reset_hard(&self) {
        let mut s = self.state.write();
        s.cached_proxy = None;
        s.profile_fetched_at_ms = 0;
        s.selected = None;
        s.selected_at_ms = 0;
        s.zero_streak = 0;
        s.probe_completed = false;
        s.probe_requested = false;
        s.last_fetch_count = None;
        warn!("address resolver state cleared");
    }

    /// The currently pinned address, if any.
    pub fn current(&self) -> Option<String> {
        self.state.read().selected.clone()
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    async fn ensure_proxy(&self, now_ms: i64) {
        {
            let s = self.state.read();
            if s.cached_proxy.is_some() && now_ms - s.profile_fetched_at_ms < self.profile_ttl_ms {
                return;
            }
        }

        match self.gateway.fetch_profile(&self.eoa).await {
            Ok(profile) => {
                let proxy = profile
                    .proxy_wallet
                    .filter(|p| !p.is_empty() && !p.eq_ignore_ascii_case(&self.eoa));
                debug!(proxy = ?proxy, "profile fetched");
                let mut s = self.state.write();
                s.cached_proxy = Some(proxy);
                s.profile_fetched_at_ms = now_ms;
            }
            Err(err) => {
                debug!(error = %err, "profile fetch failed — keeping cached proxy");
                // Leave the cache as-is; an empty cache means EOA-only.
                let mut s = self.state.write();
                if s.cached_proxy.is_none() {
                    s.cached_proxy = Some(None);
                    s.profile_fetched_at_ms = now_ms;
                }
            }
        }
    }

    fn alternate_of(&self, current: &str) -> Option<String> {
        let s = self.state.read();
        let proxy = s.cached_proxy.clone().flatten()?;
        if current.eq_ignore_ascii_case(&proxy) {
            Some(self.eoa.clone())
        } else {
            Some(proxy)
        }
    }

    /// Fetch position counts for both addresses in parallel. Returns the
    /// alternate iff it holds at least [`PROBE_SWITCH_FACTOR`]× more.
    async fn probe(&self, current: &str, alternate: &str, _now_ms: i64) -> Option<String> {
        let (current_res, alternate_res) = futures_util::join!(
            self.gateway.fetch_positions(current),
            self.gateway.fetch_positions(alternate)
        );

        {
            let mut s = self.state.write();
            s.probe_completed = true;
            s.probe_requested = false;
        }

        let current_count = current_res.map(|p| p.len()).unwrap_or(0);
        let alternate_count = match alternate_res {
            Ok(p) => p.len(),
            Err(err) => {
                debug!(alternate, error = %err, "probe of alternate address failed");
                return None;
            }
        };

        info!(
            current,
            alternate, current_count, alternate_count, "address probe completed"
        );

        if alternate_count > 0 && alternate_count >= current_count.saturating_mul(PROBE_SWITCH_FACTOR).max(1)
        {
            Some(alternate.to_string())
        } else {
            None
        }
    }

    fn select(&self, address: String, now_ms: i64, why: &str) {
        let mut s = self.state.write();
        let changed = s.selected.as_deref() != Some(address.as_str());
        if changed {
            if self
                .dedup
                .should_log("address_selection", ADDRESS_CHANGE_LOG_TTL_MS, Some(&address), now_ms)
            {
                info!(
                    from = ?s.selected,
                    to = %address,
                    reason = why,
                    "holding address changed"
                );
            }
            s.selected = Some(address);
            s.selected_at_ms = now_ms;
            s.zero_streak = 0;
            s.last_fetch_count = None;
        }
    }
}

impl std::fmt::Debug for AddressResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.state.read();
        f.debug_struct("AddressResolver")
            .field("eoa", &self.eoa)
            .field("selected", &s.selected)
            .field("zero_streak", &s.zero_streak)
            .finish()
    }
}
