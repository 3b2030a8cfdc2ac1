//! Per-token mutable record and the engine-wide singleton state
//! (spec.md §3).

use std::collections::HashMap;

use crate::gbm::Features;
use crate::indicators::{Atr, EmaPair};
use crate::rolling::RollingWindow;
use crate::types::{TokenId, WalletId};

/// Per-token mutable record holding features, position, and timers.
pub struct TokenState {
    // Identity
    pub symbol: Option<String>,
    pub dev_wallet: Option<WalletId>,
    pub created_at: i64,
    pub dev_first_token: bool,

    // Lifecycle flags
    pub risk_checked: bool,
    pub is_bundler: bool,
    pub transfer_fee_bps: Option<u32>,
    pub dev_sold: bool,
    pub has_bought: bool,
    pub is_exceptional: bool,

    // Price stats
    pub highest_price: f64,
    pub lowest_price: f64,
    pub peak_since_entry: Option<f64>,
    pub last_price: Option<f64>,

    // Liquidity stats
    pub liquidity: f64,
    pub peak_liquidity: f64,

    // Volume
    pub volume_sol: f64,

    // Rolling aggregates
    pub window: RollingWindow,

    // Indicators
    pub ema: EmaPair,
    pub atr: Atr,

    // Position
    pub entry_price: Option<f64>,
    pub entry_sol: Option<f64>,
    pub entry_features: Option<Features>,

    // Curve
    pub initial_tokens: Option<f64>,

    // Timers: generation counters that let a scheduled task detect it has
    // been superseded/untracked by the time it fires.
    pub no_buy_timer_generation: u64,
    pub next_dev_check: Option<i64>,
    pub dev_probe_in_flight: bool,
}

impl TokenState {
    pub fn new(
        created_at: i64,
        symbol: Option<String>,
        dev_wallet: Option<WalletId>,
        dev_first_token: bool,
        initial_mcap: f64,
        tps_window_ms: u64,
        ema_short_ms: u64,
        ema_long_ms: u64,
        atr_window_sec: u64,
    ) -> Self {
        Self {
            symbol,
            dev_wallet,
            created_at,
            dev_first_token,
            risk_checked: false,
            is_bundler: false,
            transfer_fee_bps: None,
            dev_sold: false,
            has_bought: false,
            is_exceptional: false,
            highest_price: 0.0,
            lowest_price: f64::INFINITY,
            peak_since_entry: None,
            last_price: None,
            liquidity: initial_mcap,
            peak_liquidity: initial_mcap,
            volume_sol: 0.0,
            window: RollingWindow::new(tps_window_ms),
            ema: EmaPair::new(ema_short_ms, ema_long_ms),
            atr: Atr::new(atr_window_sec),
            entry_price: None,
            entry_sol: None,
            entry_features: None,
            initial_tokens: None,
            no_buy_timer_generation: 0,
            next_dev_check: None,
            dev_probe_in_flight: false,
        }
    }

    /// `price/lowestPrice - 1`, or 0 before `lowestPrice` is defined.
    pub fn rise_from_low(&self, price: f64) -> f64 {
        if self.lowest_price.is_finite() {
            price / self.lowest_price - 1.0
        } else {
            0.0
        }
    }
}

/// Engine-wide singleton state (spec.md §3).
#[derive(Default)]
pub struct EngineState {
    pub states: HashMap<TokenId, TokenState>,
    pub dev_token_count: HashMap<WalletId, u64>,
    pub dev_last_ticker: HashMap<WalletId, String>,
    pub dev_blacklist: HashMap<WalletId, i64>,
    pub profit_sol: f64,
    pub invested_sol: f64,
    pub total_invested_sol: f64,
}

impl EngineState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_dev_blacklisted(&self, wallet: &str, now: i64) -> bool {
        self.dev_blacklist
            .get(wallet)
            .map(|expiry| *expiry > now)
            .unwrap_or(false)
    }

    pub fn blacklist_dev(&mut self, wallet: WalletId, now: i64, ttl_sec: u64) {
        self.dev_blacklist.insert(wallet, now + ttl_sec as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state() -> TokenState {
        TokenState::new(0, Some("AAA".into()), Some("dev1".into()), true, 10.0, 4000, 1000, 5000, 20)
    }

    #[test]
    fn new_state_matches_spec_invariants() {
        let s = sample_state();
        assert_eq!(s.highest_price, 0.0);
        assert_eq!(s.lowest_price, f64::INFINITY);
        assert!(!s.has_bought);
        assert_eq!(s.liquidity, 10.0);
    }

    #[test]
    fn rise_from_low_is_zero_before_any_price() {
        let s = sample_state();
        assert_eq!(s.rise_from_low(5.0), 0.0);
    }

    #[test]
    fn dev_blacklist_expires() {
        let mut e = EngineState::new();
        e.blacklist_dev("dev1".into(), 100, 3600);
        assert!(e.is_dev_blacklisted("dev1", 200));
        assert!(!e.is_dev_blacklisted("dev1", 100 + 3600 + 1));
    }
}
