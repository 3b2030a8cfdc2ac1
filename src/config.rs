//! Layered configuration for the strategy engine
//!
//! Defaults -> TOML file -> `STRATEGY__`-prefixed environment variables,
//! the same three-layer precedence the teacher's config loader uses.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};

fn default_token_max_age() -> u64 {
    600
}
fn default_min_initial_mcap() -> f64 {
    0.0
}
fn default_no_trade_timeout_sec() -> u64 {
    60
}
fn default_false() -> bool {
    false
}
fn default_true() -> bool {
    true
}
fn default_max_transfer_fee_bps() -> u32 {
    0
}
fn default_min_runtime_mcap_sol() -> f64 {
    30.0
}
fn default_tps_window_ms() -> u64 {
    4000
}
fn default_atr_window_sec() -> u64 {
    20
}
fn default_min_tps() -> f64 {
    5.0
}
fn default_min_unique_wallets() -> u32 {
    0
}
fn default_max_avg_sol_per_tx() -> f64 {
    2.0
}
fn default_exceptional_momentum_pct() -> f64 {
    2.0
}
fn default_trade_size_sol() -> f64 {
    0.5
}
fn default_dev_blacklist_sec() -> u64 {
    3600
}
fn default_rug_liquidity_drop_pct() -> f64 {
    0.4
}
fn default_migrate_fill_pct() -> f64 {
    0.97
}
fn default_base_trail_dd() -> f64 {
    0.2
}
fn default_tps_trail_scale() -> f64 {
    0.04
}
fn default_atr_mult() -> f64 {
    3.0
}
fn default_disable_ema_tps_gain_pct() -> f64 {
    0.3
}
fn default_lgbm_model_dir() -> String {
    "models".to_string()
}
fn default_lgbm_threshold() -> f64 {
    0.5
}
fn default_feature_log_path() -> String {
    "data/features.log".to_string()
}
fn default_pred_log_path() -> String {
    "data/predictions.log".to_string()
}
fn default_bundler_programs() -> Vec<String> {
    vec!["TXN1BUNDLERxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxx".to_string()]
}
fn default_max_risk_concurrency() -> usize {
    6
}

/// Complete recognized configuration surface (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    // admission
    #[serde(default = "default_token_max_age")]
    pub token_max_age: u64,
    #[serde(default = "default_min_initial_mcap")]
    pub min_initial_mcap: f64,
    /// `None` means unbounded (spec.md default `+∞`).
    pub max_initial_liquidity_sol: Option<f64>,
    #[serde(default = "default_no_trade_timeout_sec")]
    pub no_trade_timeout_sec: u64,
    #[serde(default = "default_false")]
    pub skip_dev_same_ticker: bool,
    #[serde(default = "default_true")]
    pub enable_tax_bundler_filter: bool,
    #[serde(default = "default_max_transfer_fee_bps")]
    pub max_transfer_fee_bps: u32,
    #[serde(default = "default_false")]
    pub allow_bundler: bool,

    // runtime liquidity / rolling window
    #[serde(default = "default_min_runtime_mcap_sol")]
    pub min_runtime_mcap_sol: f64,
    #[serde(default = "default_tps_window_ms")]
    pub tps_window_ms: u64,
    pub ema_short_ms: Option<u64>,
    pub ema_long_ms: Option<u64>,
    #[serde(default = "default_atr_window_sec")]
    pub atr_window_sec: u64,

    // heuristic entry
    #[serde(default = "default_min_tps")]
    pub min_tps: f64,
    #[serde(default = "default_min_unique_wallets")]
    pub min_unique_wallets: u32,
    #[serde(default = "default_max_avg_sol_per_tx")]
    pub max_avg_sol_per_tx: f64,
    #[serde(default = "default_exceptional_momentum_pct")]
    pub exceptional_momentum_pct: f64,
    pub min_liquidity_sol: Option<f64>,
    pub min_volume_sol: Option<f64>,

    // position sizing / dev gating
    #[serde(default = "default_trade_size_sol")]
    pub trade_size_sol: f64,
    #[serde(default = "default_dev_blacklist_sec")]
    pub dev_blacklist_sec: u64,
    #[serde(default = "default_true")]
    pub require_dev_sold: bool,
    #[serde(default = "default_true")]
    pub skip_dev_first_token: bool,

    // exits
    #[serde(default = "default_rug_liquidity_drop_pct")]
    pub rug_liquidity_drop_pct: f64,
    #[serde(default = "default_migrate_fill_pct")]
    pub migrate_fill_pct: f64,
    pub take_profit: Option<f64>,
    #[serde(default = "default_base_trail_dd")]
    pub base_trail_dd: f64,
    #[serde(default = "default_tps_trail_scale")]
    pub tps_trail_scale: f64,
    #[serde(default = "default_atr_mult")]
    pub atr_mult: f64,
    #[serde(default = "default_disable_ema_tps_gain_pct")]
    pub disable_ema_tps_gain_pct: f64,
    pub exit_tps: Option<f64>,

    // ML wiring
    #[serde(default = "default_false")]
    pub lgbm_enabled: bool,
    #[serde(default = "default_lgbm_model_dir")]
    pub lgbm_model_dir: String,
    #[serde(default = "default_lgbm_threshold")]
    pub lgbm_threshold_buy: f64,
    #[serde(default = "default_lgbm_threshold")]
    pub lgbm_threshold_sell: f64,
    #[serde(default = "default_false")]
    pub pure_ml: bool,

    // logging
    #[serde(default = "default_false")]
    pub feature_logging: bool,
    #[serde(default = "default_feature_log_path")]
    pub feature_log_path: String,
    #[serde(default = "default_false")]
    pub pred_logging: bool,
    #[serde(default = "default_pred_log_path")]
    pub pred_log_path: String,

    #[serde(default = "default_bundler_programs")]
    pub bundler_programs: Vec<String>,
    #[serde(default = "default_false")]
    pub debug_filters: bool,

    // ambient (not in spec.md's table, but required to run the process)
    #[serde(default = "default_max_risk_concurrency")]
    pub max_risk_concurrency: usize,
    pub rpc_url: Option<String>,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            token_max_age: default_token_max_age(),
            min_initial_mcap: default_min_initial_mcap(),
            max_initial_liquidity_sol: None,
            no_trade_timeout_sec: default_no_trade_timeout_sec(),
            skip_dev_same_ticker: false,
            enable_tax_bundler_filter: true,
            max_transfer_fee_bps: default_max_transfer_fee_bps(),
            allow_bundler: false,
            min_runtime_mcap_sol: default_min_runtime_mcap_sol(),
            tps_window_ms: default_tps_window_ms(),
            ema_short_ms: None,
            ema_long_ms: None,
            atr_window_sec: default_atr_window_sec(),
            min_tps: default_min_tps(),
            min_unique_wallets: default_min_unique_wallets(),
            max_avg_sol_per_tx: default_max_avg_sol_per_tx(),
            exceptional_momentum_pct: default_exceptional_momentum_pct(),
            min_liquidity_sol: None,
            min_volume_sol: None,
            trade_size_sol: default_trade_size_sol(),
            dev_blacklist_sec: default_dev_blacklist_sec(),
            require_dev_sold: true,
            skip_dev_first_token: true,
            rug_liquidity_drop_pct: default_rug_liquidity_drop_pct(),
            migrate_fill_pct: default_migrate_fill_pct(),
            take_profit: None,
            base_trail_dd: default_base_trail_dd(),
            tps_trail_scale: default_tps_trail_scale(),
            atr_mult: default_atr_mult(),
            disable_ema_tps_gain_pct: default_disable_ema_tps_gain_pct(),
            exit_tps: None,
            lgbm_enabled: false,
            lgbm_model_dir: default_lgbm_model_dir(),
            lgbm_threshold_buy: default_lgbm_threshold(),
            lgbm_threshold_sell: default_lgbm_threshold(),
            pure_ml: false,
            feature_logging: false,
            feature_log_path: default_feature_log_path(),
            pred_logging: false,
            pred_log_path: default_pred_log_path(),
            bundler_programs: default_bundler_programs(),
            debug_filters: false,
            max_risk_concurrency: default_max_risk_concurrency(),
            rpc_url: None,
        }
    }
}

impl StrategyConfig {
    /// Load config with defaults -> TOML file -> env var (`STRATEGY__` prefix,
    /// `__` separator) precedence, then validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let defaults = Self::default();
        let defaults_json = serde_json::to_value(&defaults)
            .map_err(|e| Error::Config(format!("failed to serialize defaults: {e}")))?;

        let mut builder = config::Config::builder();
        if let serde_json::Value::Object(map) = defaults_json {
            for (k, v) in map {
                builder = builder
                    .set_default(&k, config_value_from_json(&v))
                    .map_err(|e| Error::Config(e.to_string()))?;
            }
        }
        if let Some(p) = path {
            builder = builder.add_source(config::File::from(p).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("STRATEGY")
                .separator("__")
                .try_parsing(true),
        );

        let raw = builder
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;
        let cfg: StrategyConfig = raw
            .try_deserialize()
            .map_err(|e| Error::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Fatal sanity checks (spec.md §7: `ConfigInvalid` is fatal at startup).
    pub fn validate(&self) -> Result<()> {
        if let Some(tp) = self.take_profit {
            if tp <= 0.0 {
                return Err(Error::Config("take_profit must be > 0 when set".into()));
            }
        }
        if !(0.0 < self.migrate_fill_pct && self.migrate_fill_pct <= 1.0) {
            return Err(Error::Config("migrate_fill_pct must be in (0, 1]".into()));
        }
        if self.max_transfer_fee_bps > 10_000 {
            return Err(Error::Config(
                "max_transfer_fee_bps must be <= 10000".into(),
            ));
        }
        if self.trade_size_sol <= 0.0 {
            return Err(Error::Config("trade_size_sol must be > 0".into()));
        }
        if self.max_risk_concurrency == 0 {
            return Err(Error::Config("max_risk_concurrency must be > 0".into()));
        }
        if self.bundler_programs.is_empty() && self.enable_tax_bundler_filter {
            return Err(Error::Config(
                "bundler_programs must not be empty when the bundler filter is enabled".into(),
            ));
        }
        Ok(())
    }

    /// Resolved exit-collapse TPS threshold (`max(1, min_tps/2)` unless overridden).
    pub fn exit_tps(&self) -> f64 {
        self.exit_tps.unwrap_or((self.min_tps / 2.0).max(1.0))
    }

    /// Secret-free representation suitable for logging (`config` CLI command).
    pub fn masked_display(&self) -> String {
        let mut v = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        if let serde_json::Value::Object(ref mut map) = v {
            if let Some(url) = map.get_mut("rpc_url") {
                if let serde_json::Value::String(s) = url {
                    *s = mask_url(s);
                }
            }
        }
        serde_json::to_string_pretty(&v).unwrap_or_default()
    }
}

fn mask_url(url: &str) -> String {
    match url.find("://") {
        Some(idx) => {
            let (scheme, rest) = url.split_at(idx + 3);
            let host_start = rest.find('/').unwrap_or(rest.len());
            format!("{scheme}{}***", &rest[..host_start.min(4)])
        }
        None => "***".to_string(),
    }
}

fn config_value_from_json(v: &serde_json::Value) -> config::Value {
    use config::ValueKind;
    let kind = match v {
        serde_json::Value::Null => ValueKind::Nil,
        serde_json::Value::Bool(b) => ValueKind::Boolean(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                ValueKind::I64(i)
            } else {
                ValueKind::Float(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => ValueKind::String(s.clone()),
        serde_json::Value::Array(arr) => {
            ValueKind::Array(arr.iter().map(config_value_from_json).collect())
        }
        serde_json::Value::Object(map) => ValueKind::Table(
            map.iter()
                .map(|(k, v)| (k.clone(), config_value_from_json(v)))
                .collect(),
        ),
    };
    config::Value::new(None, kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let c = StrategyConfig::default();
        assert_eq!(c.token_max_age, 600);
        assert_eq!(c.no_trade_timeout_sec, 60);
        assert_eq!(c.min_runtime_mcap_sol, 30.0);
        assert_eq!(c.tps_window_ms, 4000);
        assert_eq!(c.atr_window_sec, 20);
        assert_eq!(c.min_tps, 5.0);
        assert_eq!(c.max_avg_sol_per_tx, 2.0);
        assert_eq!(c.exceptional_momentum_pct, 2.0);
        assert_eq!(c.trade_size_sol, 0.5);
        assert_eq!(c.dev_blacklist_sec, 3600);
        assert_eq!(c.rug_liquidity_drop_pct, 0.4);
        assert_eq!(c.migrate_fill_pct, 0.97);
        assert_eq!(c.base_trail_dd, 0.2);
        assert_eq!(c.tps_trail_scale, 0.04);
        assert_eq!(c.atr_mult, 3.0);
        assert_eq!(c.disable_ema_tps_gain_pct, 0.3);
        assert_eq!(c.max_risk_concurrency, 6);
        assert!(c.require_dev_sold);
        assert!(c.skip_dev_first_token);
        assert!(c.enable_tax_bundler_filter);
        assert!(!c.allow_bundler);
    }

    #[test]
    fn exit_tps_falls_back_to_half_min_tps() {
        let mut c = StrategyConfig::default();
        c.min_tps = 5.0;
        assert_eq!(c.exit_tps(), 2.5);
        c.min_tps = 1.0;
        assert_eq!(c.exit_tps(), 1.0);
        c.exit_tps = Some(9.0);
        assert_eq!(c.exit_tps(), 9.0);
    }

    #[test]
    fn validate_rejects_bad_take_profit() {
        let mut c = StrategyConfig::default();
        c.take_profit = Some(0.0);
        assert!(c.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_fill_pct() {
        let mut c = StrategyConfig::default();
        c.migrate_fill_pct = 0.0;
        assert!(c.validate().is_err());
        c.migrate_fill_pct = 1.5;
        assert!(c.validate().is_err());
    }

    #[test]
    fn validate_accepts_defaults() {
        assert!(StrategyConfig::default().validate().is_ok());
    }

    #[test]
    fn masked_display_hides_rpc_url() {
        let mut c = StrategyConfig::default();
        c.rpc_url = Some("https://secret-rpc.example.com/abc123".to_string());
        let masked = c.masked_display();
        assert!(!masked.contains("secret-rpc"));
    }
}
