//! Shared wire and signal types
//!
//! These mirror the narrow contracts the strategy engine consumes and
//! produces (spec.md §3, §6). The event sources, execution adapter, and
//! dashboard bus that surround these types are out of scope for this crate.

use serde::{Deserialize, Serialize};

/// Token mint identifier.
pub type TokenId = String;
/// Wallet address.
pub type WalletId = String;
/// Transaction signature.
pub type TxId = String;

/// Notification that a new bonding-curve market has been created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolEvent {
    pub mint: TokenId,
    /// Unix seconds.
    pub created_at: i64,
    pub initial_mcap: f64,
    pub symbol: Option<String>,
    pub dev_wallet: Option<WalletId>,
    pub signature: Option<TxId>,
}

/// Side of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

/// A single price/trade observation on a tracked mint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceEvent {
    pub mint: TokenId,
    /// Positive rational price, in SOL per token.
    pub price: f64,
    pub liquidity: f64,
    /// Signed trade notional in SOL (feeds `RollingWindow`'s `windowVolume`/
    /// `avgSol` as-is, per spec.md §4.1).
    pub sol: f64,
    pub wallet: WalletId,
    pub tokens_curve: f64,
    pub side: Side,
    /// Unix seconds.
    pub timestamp: i64,
}

/// Action requested of the execution adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Buy,
    Sell,
}

/// Reason a SELL was emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SellReason {
    /// Hard or adaptive take-profit.
    Tp,
    /// Hard or adaptive stop-loss (including rug detection).
    Sl,
    /// Bonding-curve migration fill.
    Migr,
    /// Rug detected (liquidity collapse).
    Rug,
    /// Operator-initiated.
    Manual,
}

/// Signal published to the execution adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeSignal {
    pub mint: TokenId,
    pub action: Action,
    pub reason: Option<SellReason>,
    pub symbol: Option<String>,
    pub price: Option<f64>,
    pub time: Option<i64>,
}

impl TradeSignal {
    pub fn buy(mint: TokenId, symbol: Option<String>, price: f64, time: i64) -> Self {
        Self {
            mint,
            action: Action::Buy,
            reason: None,
            symbol,
            price: Some(price),
            time: Some(time),
        }
    }

    pub fn sell(
        mint: TokenId,
        reason: SellReason,
        symbol: Option<String>,
        price: f64,
        time: i64,
    ) -> Self {
        Self {
            mint,
            action: Action::Sell,
            reason: Some(reason),
            symbol,
            price: Some(price),
            time: Some(time),
        }
    }
}
