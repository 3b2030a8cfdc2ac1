//! Fixed time-window aggregation of trades and wallet observations.
//!
//! Mirrors the `RollingWindow` shape used throughout the teacher's delta
//! tracker, scoped to the fields spec'd in spec.md §4.1: trade count, TPS,
//! window volume, unique-wallet count, and average trade size.

use std::collections::HashSet;
use std::time::Duration;

/// A single trade observation retained inside the rolling window.
#[derive(Debug, Clone, Copy)]
struct TradeEntry {
    ts_ms: i64,
    sol: f64,
}

/// A single wallet observation retained inside the rolling window.
#[derive(Debug, Clone)]
struct WalletEntry {
    ts_ms: i64,
    addr: String,
}

/// Time-windowed aggregation over trades and distinct wallets (spec.md §4.1).
#[derive(Debug, Clone)]
pub struct RollingWindow {
    window: Duration,
    trades: Vec<TradeEntry>,
    wallets: Vec<WalletEntry>,
}

impl RollingWindow {
    pub fn new(window_ms: u64) -> Self {
        Self {
            window: Duration::from_millis(window_ms),
            trades: Vec::new(),
            wallets: Vec::new(),
        }
    }

    /// Record one trade/wallet observation at wall-clock `ts_ms`, then prune.
    pub fn record(&mut self, ts_ms: i64, sol: f64, wallet: &str) {
        self.trades.push(TradeEntry { ts_ms, sol });
        self.wallets.push(WalletEntry {
            ts_ms,
            addr: wallet.to_string(),
        });
        self.prune(ts_ms);
    }

    /// Drop entries older than `ts - window`.
    pub fn prune(&mut self, ts_ms: i64) {
        let window_ms = self.window.as_millis() as i64;
        self.trades.retain(|t| ts_ms - t.ts_ms <= window_ms);
        self.wallets.retain(|w| ts_ms - w.ts_ms <= window_ms);
    }

    pub fn trade_count(&self) -> usize {
        self.trades.len()
    }

    /// Trades per second over the configured window.
    pub fn tps(&self) -> f64 {
        self.trade_count() as f64 / (self.window.as_millis() as f64 / 1000.0)
    }

    pub fn window_volume(&self) -> f64 {
        self.trades.iter().map(|t| t.sol).sum()
    }

    pub fn unique_wallets(&self) -> usize {
        self.wallets
            .iter()
            .map(|w| w.addr.as_str())
            .collect::<HashSet<_>>()
            .len()
    }

    pub fn avg_sol(&self) -> f64 {
        self.window_volume() / (self.trade_count().max(1) as f64)
    }

    /// Mean inter-trade gap estimate used to adapt EMA smoothing (spec.md §4.2).
    pub fn mean_gap_ms(&self) -> f64 {
        self.window.as_millis() as f64 / (self.trade_count().max(1) as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_and_prune() {
        let mut w = RollingWindow::new(4000);
        w.record(0, 1.0, "a");
        w.record(1000, 2.0, "b");
        w.record(2000, 3.0, "a");
        assert_eq!(w.trade_count(), 3);
        assert_eq!(w.unique_wallets(), 2);
        assert_eq!(w.window_volume(), 6.0);

        // A trade far beyond the window prunes the earlier three.
        w.record(10_000, 4.0, "c");
        assert_eq!(w.trade_count(), 1);
        assert_eq!(w.unique_wallets(), 1);
    }

    #[test]
    fn tps_matches_spec_formula() {
        let mut w = RollingWindow::new(4000);
        for i in 0..12 {
            w.record(i * 300, 0.1, "w");
        }
        // 12 trades within ~3.3s, all inside a 4s window.
        assert_eq!(w.trade_count(), 12);
        assert!((w.tps() - 3.0).abs() < 0.01);
    }

    #[test]
    fn avg_sol_uses_max_one_denominator() {
        let w = RollingWindow::new(4000);
        assert_eq!(w.avg_sol(), 0.0);
    }

    #[test]
    fn retained_entries_respect_window_bound() {
        let mut w = RollingWindow::new(1000);
        for i in 0..50 {
            w.record(i * 50, 1.0, "w");
        }
        let cutoff = 49 * 50;
        for t in &w.trades {
            assert!(cutoff - t.ts_ms <= 1000);
        }
    }
}
