//! The per-token momentum strategy engine (spec.md §4.6–§4.8).
//!
//! Single-threaded cooperative state machine: one task owns `EngineState`
//! and drives it from a `tokio::select!` loop over the pool-event source,
//! the price-event source, and a self-addressed channel carrying the
//! results of risk probes, dev-exit probes, and timer fires (spec.md §5,
//! §9's "message passing into a single strategy task" guidance). This
//! mirrors the shape of the teacher's `StrategyEngine`, generalized from a
//! fan-out of subsystem structs into one cohesive state machine per the
//! spec's component list.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::config::StrategyConfig;
use crate::dev_exit::DevExitProbe;
use crate::error::Result;
use crate::feature_store::FeatureStore;
use crate::gbm::{Features, GbmPredictor, FEATURE_COUNT};
use crate::risk::{RiskAssessment, RiskAssessor};
use crate::state::{EngineState, TokenState};
use crate::types::{Action, PoolEvent, PriceEvent, Side, TokenId, TradeSignal};

/// Abstracts over the upstream pool/price event transports (spec.md §6):
/// the engine never assumes websocket vs. channel vs. replay file.
#[async_trait]
pub trait EventSource<T>: Send {
    async fn recv(&mut self) -> Option<T>;
}

/// A channel-backed `EventSource`, the common case when the transport is
/// wired up elsewhere and simply forwarded in.
pub struct ChannelSource<T> {
    rx: mpsc::Receiver<T>,
}

impl<T> ChannelSource<T> {
    pub fn new(rx: mpsc::Receiver<T>) -> Self {
        Self { rx }
    }
}

#[async_trait]
impl<T: Send> EventSource<T> for ChannelSource<T> {
    async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }
}

enum InternalMessage {
    RiskResult {
        mint: TokenId,
        assessment: RiskAssessment,
    },
    DevExitResult {
        mint: TokenId,
        exited: bool,
    },
    NoBuyTimeout {
        mint: TokenId,
        generation: u64,
    },
}

/// The momentum strategy engine.
pub struct StrategyEngine {
    config: StrategyConfig,
    state: EngineState,
    risk_assessor: Option<Arc<RiskAssessor>>,
    dev_exit_probe: Option<Arc<DevExitProbe>>,
    buy_model: Option<Arc<GbmPredictor>>,
    sell_model: Option<Arc<GbmPredictor>>,
    feature_store: Option<FeatureStore>,
    pred_store: Option<FeatureStore>,
    signal_tx: broadcast::Sender<TradeSignal>,
    pnl_tx: broadcast::Sender<f64>,
    internal_tx: mpsc::Sender<InternalMessage>,
    internal_rx: mpsc::Receiver<InternalMessage>,
}

const INTERNAL_CHANNEL_CAPACITY: usize = 1024;
const DEV_PROBE_COOLDOWN_SEC: i64 = 15;

impl StrategyEngine {
    pub fn new(
        config: StrategyConfig,
        risk_assessor: Option<Arc<RiskAssessor>>,
        dev_exit_probe: Option<Arc<DevExitProbe>>,
    ) -> Self {
        let (signal_tx, _) = broadcast::channel(1024);
        let (pnl_tx, _) = broadcast::channel(1024);
        let (internal_tx, internal_rx) = mpsc::channel(INTERNAL_CHANNEL_CAPACITY);

        let buy_model = if config.lgbm_enabled {
            let path = format!("{}/buy.json", config.lgbm_model_dir);
            match GbmPredictor::load(&path) {
                Ok(m) => Some(Arc::new(m)),
                Err(e) => {
                    warn!(error = %e, "buy model failed to load, downgrading to heuristic-only");
                    None
                }
            }
        } else {
            None
        };
        let sell_model = if config.lgbm_enabled {
            let path = format!("{}/sell.json", config.lgbm_model_dir);
            match GbmPredictor::load(&path) {
                Ok(m) => Some(Arc::new(m)),
                Err(e) => {
                    warn!(error = %e, "sell model failed to load, downgrading to heuristic-only");
                    None
                }
            }
        } else {
            None
        };

        let feature_store = if config.feature_logging {
            Some(FeatureStore::new(&config.feature_log_path))
        } else {
            None
        };
        let pred_store = if config.pred_logging {
            Some(FeatureStore::new(&config.pred_log_path))
        } else {
            None
        };

        Self {
            config,
            state: EngineState::new(),
            risk_assessor,
            dev_exit_probe,
            buy_model,
            sell_model,
            feature_store,
            pred_store,
            signal_tx,
            pnl_tx,
            internal_tx,
            internal_rx,
        }
    }

    pub fn subscribe_signals(&self) -> broadcast::Receiver<TradeSignal> {
        self.signal_tx.subscribe()
    }

    pub fn subscribe_pnl(&self) -> broadcast::Receiver<f64> {
        self.pnl_tx.subscribe()
    }

    pub fn profit_sol(&self) -> f64 {
        self.state.profit_sol
    }

    pub fn invested_sol(&self) -> f64 {
        self.state.invested_sol
    }

    pub fn risk_in_flight(&self) -> usize {
        self.risk_assessor
            .as_ref()
            .map(|r| r.gate_in_flight())
            .unwrap_or(0)
    }

    pub fn is_tracked(&self, mint: &str) -> bool {
        self.state.states.contains_key(mint)
    }

    /// Drive the engine until both event sources are exhausted.
    pub async fn run<P, Q>(mut self, mut pool_source: P, mut price_source: Q)
    where
        P: EventSource<PoolEvent>,
        Q: EventSource<PriceEvent>,
    {
        let mut pool_done = false;
        let mut price_done = false;
        loop {
            if pool_done && price_done {
                break;
            }
            tokio::select! {
                maybe_pool = pool_source.recv(), if !pool_done => {
                    match maybe_pool {
                        Some(ev) => self.handle_pool_event(ev, now_secs()).await,
                        None => { pool_done = true; }
                    }
                }
                maybe_price = price_source.recv(), if !price_done => {
                    match maybe_price {
                        Some(ev) => self.handle_price_event(ev).await,
                        None => { price_done = true; }
                    }
                }
                Some(msg) = self.internal_rx.recv() => {
                    self.handle_internal(msg).await;
                }
            }
        }
    }

    async fn handle_internal(&mut self, msg: InternalMessage) {
        match msg {
            InternalMessage::RiskResult { mint, assessment } => {
                self.on_risk_result(mint, assessment).await;
            }
            InternalMessage::DevExitResult { mint, exited } => {
                self.on_dev_exit_result(mint, exited);
            }
            InternalMessage::NoBuyTimeout { mint, generation } => {
                self.on_no_buy_timeout(mint, generation);
            }
        }
    }

    // ---- §4.6 Admission ------------------------------------------------

    async fn handle_pool_event(&mut self, ev: PoolEvent, now: i64) {
        if let Some(dev) = &ev.dev_wallet {
            if self.config.skip_dev_same_ticker {
                if let (Some(prev), Some(ticker)) =
                    (self.state.dev_last_ticker.get(dev), &ev.symbol)
                {
                    if prev.eq_ignore_ascii_case(ticker) {
                        self.state
                            .dev_last_ticker
                            .insert(dev.clone(), ticker.clone());
                        debug!(mint = %ev.mint, dev = %dev, "admission reject: same ticker as dev's prior launch");
                        return;
                    }
                }
                if let Some(ticker) = &ev.symbol {
                    self.state
                        .dev_last_ticker
                        .insert(dev.clone(), ticker.clone());
                }
            }
        }

        if now - ev.created_at > self.config.token_max_age as i64 {
            debug!(mint = %ev.mint, "admission reject: stale pool event");
            return;
        }
        let over_ceiling = self
            .config
            .max_initial_liquidity_sol
            .map(|max| ev.initial_mcap > max)
            .unwrap_or(false);
        if ev.initial_mcap < self.config.min_initial_mcap || over_ceiling {
            debug!(mint = %ev.mint, mcap = ev.initial_mcap, "admission reject: mcap out of band");
            return;
        }
        if self.state.states.contains_key(&ev.mint) {
            // spec.md §8 property 9: idempotent on an already-tracked mint.
            return;
        }

        let dev_first_token = ev
            .dev_wallet
            .as_ref()
            .map(|d| self.state.dev_token_count.get(d).copied().unwrap_or(0) == 0)
            .unwrap_or(true);
        if let Some(dev) = &ev.dev_wallet {
            *self.state.dev_token_count.entry(dev.clone()).or_insert(0) += 1;
        }

        let ema_short_ms = self.config.ema_short_ms.unwrap_or(self.config.tps_window_ms / 4);
        let ema_long_ms = self.config.ema_long_ms.unwrap_or(self.config.tps_window_ms * 2);

        let mut token_state = TokenState::new(
            now,
            ev.symbol.clone(),
            ev.dev_wallet.clone(),
            dev_first_token,
            ev.initial_mcap,
            self.config.tps_window_ms,
            ema_short_ms,
            ema_long_ms,
            self.config.atr_window_sec,
        );

        let generation = token_state.no_buy_timer_generation;
        self.schedule_no_buy_timer(ev.mint.clone(), generation);

        if !self.config.enable_tax_bundler_filter || self.risk_assessor.is_none() {
            token_state.risk_checked = true;
        } else if let Some(assessor) = self.risk_assessor.clone() {
            let mint = ev.mint.clone();
            let create_tx = ev.signature.clone();
            let tx = self.internal_tx.clone();
            tokio::spawn(async move {
                let assessment = assessor.assess(&mint, create_tx.as_deref()).await;
                let _ = tx
                    .send(InternalMessage::RiskResult { mint, assessment })
                    .await;
            });
        } else {
            token_state.risk_checked = true;
        }

        info!(mint = %ev.mint, dev_first_token, "admitted pool event");
        self.state.states.insert(ev.mint, token_state);
    }

    async fn on_risk_result(&mut self, mint: TokenId, assessment: RiskAssessment) {
        let Some(state) = self.state.states.get_mut(&mint) else {
            return; // untracked between await and resumption; discard.
        };
        state.transfer_fee_bps = assessment.fee_bps;
        state.is_bundler = assessment.bundler;
        state.risk_checked = true;

        let fee_over = assessment
            .fee_bps
            .map(|f| f > self.config.max_transfer_fee_bps)
            .unwrap_or(false);
        let bundler_blocked = assessment.bundler && !self.config.allow_bundler;
        if fee_over || bundler_blocked {
            info!(mint = %mint, fee_over, bundler_blocked, "risk result rejects token");
            self.untrack(&mint);
        }
    }

    fn schedule_no_buy_timer(&self, mint: TokenId, generation: u64) {
        let tx = self.internal_tx.clone();
        let delay = Duration::from_secs(self.config.no_trade_timeout_sec);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx
                .send(InternalMessage::NoBuyTimeout { mint, generation })
                .await;
        });
    }

    fn on_no_buy_timeout(&mut self, mint: TokenId, generation: u64) {
        let Some(state) = self.state.states.get(&mint) else {
            return;
        };
        if state.no_buy_timer_generation != generation {
            return; // superseded by a later admission of the same mint.
        }
        if !state.has_bought {
            debug!(mint = %mint, "no-buy timeout, untracking");
            self.untrack(&mint);
        }
    }

    fn untrack(&mut self, mint: &str) {
        self.state.states.remove(mint);
    }

    // ---- §4.7 Per-price update ------------------------------------------

    async fn handle_price_event(&mut self, ev: PriceEvent) {
        if !self.state.states.contains_key(&ev.mint) {
            return;
        }

        // (a) record curve size on first observation
        {
            let state = self.state.states.get_mut(&ev.mint).unwrap();
            if state.initial_tokens.is_none() && ev.tokens_curve > 0.0 {
                state.initial_tokens = Some(ev.tokens_curve);
            }
        }

        // (b) liquidity floor
        if ev.liquidity < self.config.min_runtime_mcap_sol {
            debug!(mint = %ev.mint, liquidity = ev.liquidity, "liquidity floor breached, untracking");
            self.untrack(&ev.mint);
            return;
        }
        {
            let state = self.state.states.get_mut(&ev.mint).unwrap();
            state.liquidity = ev.liquidity;
            state.peak_liquidity = state.peak_liquidity.max(ev.liquidity);
            state.volume_sol += ev.sol.abs();
        }

        // (c) dev exit tracking
        self.maybe_probe_dev_exit(&ev);

        // (d) rolling update + indicators
        let (tps, rise_from_low, unique_wallets) = {
            let state = self.state.states.get_mut(&ev.mint).unwrap();
            state.window.record(ev.timestamp * 1000, ev.sol, &ev.wallet);
            let dt_eff = state.window.mean_gap_ms();
            state.ema.update(ev.price, dt_eff);
            state.atr.update(ev.price);
            (
                state.window.tps(),
                state.rise_from_low(ev.price),
                state.window.unique_wallets(),
            )
        };

        // (e) feature vector
        let feats = {
            let state = self.state.states.get(&ev.mint).unwrap();
            build_features(state, ev.price, ev.timestamp, tps, rise_from_low, unique_wallets as u32)
        };

        // (f) pre-entry gates
        let risk_checked = self.state.states.get(&ev.mint).unwrap().risk_checked;
        let gates_open = self.pre_entry_gates_open(&ev.mint, risk_checked);
        if !self.state.states.contains_key(&ev.mint) {
            // pre_entry_gates_open may have untracked (e.g. devFirstToken reject).
            return;
        }

        // (g) ML entry
        if gates_open {
            if let Some(model) = self.buy_model.clone() {
                let already_bought = self.state.states.get(&ev.mint).unwrap().has_bought;
                if !already_bought {
                    let score = model.predict(&feats);
                    self.log_prediction(&ev.mint, ev.timestamp, "buy", score).await;
                    if score >= self.config.lgbm_threshold_buy {
                        self.open_position(&ev.mint, ev.price, ev.timestamp, feats, false)
                            .await;
                    }
                }
            }
        }

        // (h) feature logging
        self.log_features(&ev, &feats).await;

        // (i) rug detection (post-buy)
        if self.maybe_detect_rug(&ev).await {
            return;
        }

        // (j) extrema update
        {
            let state = self.state.states.get_mut(&ev.mint).unwrap();
            state.highest_price = state.highest_price.max(ev.price);
            state.lowest_price = state.lowest_price.min(ev.price);
            state.last_price = Some(ev.price);
        }

        // (k) heuristic entry
        if !self.config.pure_ml {
            if self.maybe_heuristic_entry(&ev).await {
                return;
            }
        }

        // (l) ML exit
        if self.maybe_ml_exit(&ev, &feats).await {
            return;
        }

        // (m) migration-fill exit
        if self.maybe_migration_exit(&ev).await {
            return;
        }

        // (n) adaptive exit
        if !self.config.pure_ml {
            self.maybe_adaptive_exit(&ev).await;
        }
    }

    fn maybe_probe_dev_exit(&mut self, ev: &PriceEvent) {
        let Some(state) = self.state.states.get_mut(&ev.mint) else {
            return;
        };
        if state.dev_sold {
            return;
        }
        let is_dev_sell = state
            .dev_wallet
            .as_deref()
            .map(|d| d == ev.wallet)
            .unwrap_or(false)
            && ev.side == Side::Sell;
        if !is_dev_sell {
            return;
        }
        if state.dev_probe_in_flight {
            return;
        }
        if let Some(next) = state.next_dev_check {
            if ev.timestamp < next {
                return;
            }
        }
        state.dev_probe_in_flight = true;
        state.next_dev_check = Some(ev.timestamp + DEV_PROBE_COOLDOWN_SEC);

        let Some(probe) = self.dev_exit_probe.clone() else {
            state.dev_probe_in_flight = false;
            return;
        };
        let Some(dev_wallet) = state.dev_wallet.clone() else {
            state.dev_probe_in_flight = false;
            return;
        };
        let mint = ev.mint.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let exited = probe.has_exited(&mint, &dev_wallet).await;
            let _ = tx.send(InternalMessage::DevExitResult { mint, exited }).await;
        });
    }

    fn on_dev_exit_result(&mut self, mint: TokenId, exited: bool) {
        let Some(state) = self.state.states.get_mut(&mint) else {
            return;
        };
        state.dev_probe_in_flight = false;
        if exited {
            state.dev_sold = true;
        }
    }

    fn pre_entry_gates_open(&mut self, mint: &str, risk_checked: bool) -> bool {
        if !risk_checked {
            return false;
        }
        let state = self.state.states.get(mint).unwrap();
        if self.config.skip_dev_first_token && state.dev_first_token {
            self.untrack(mint);
            return false;
        }
        let state = self.state.states.get(mint).unwrap();
        if self.config.require_dev_sold && !state.dev_sold {
            return false;
        }
        true
    }

    async fn maybe_detect_rug(&mut self, ev: &PriceEvent) -> bool {
        let state = self.state.states.get(&ev.mint).unwrap();
        if !state.has_bought {
            return false;
        }
        let threshold = state.peak_liquidity * (1.0 - self.config.rug_liquidity_drop_pct);
        if ev.liquidity >= threshold {
            return false;
        }
        info!(mint = %ev.mint, liquidity = ev.liquidity, peak = state.peak_liquidity, "rug detected");
        self.settle_and_emit(&ev.mint, ev.price, ev.timestamp, crate::types::SellReason::Sl)
            .await;
        true
    }

    async fn maybe_heuristic_entry(&mut self, ev: &PriceEvent) -> bool {
        let now = ev.timestamp;
        let Some(state) = self.state.states.get(&ev.mint) else {
            return false;
        };
        if !state.risk_checked {
            return false;
        }
        if state.has_bought {
            return false;
        }
        if now - state.created_at > self.config.token_max_age as i64 {
            self.untrack(&ev.mint);
            return true;
        }
        let min_liquidity = self.config.min_liquidity_sol.unwrap_or(0.0);
        let min_volume = self.config.min_volume_sol.unwrap_or(0.0);
        if state.liquidity < min_liquidity || state.volume_sol < min_volume {
            return false;
        }
        if let Some(dev) = &state.dev_wallet {
            if self.state.is_dev_blacklisted(dev, now) {
                return false;
            }
        }
        let tps = state.window.tps();
        let unique_wallets = state.window.unique_wallets() as u32;
        let avg_sol = state.window.avg_sol();
        if tps < self.config.min_tps
            || unique_wallets < self.config.min_unique_wallets
            || avg_sol > self.config.max_avg_sol_per_tx
        {
            return false;
        }

        let rise = state.rise_from_low(ev.price);
        if rise >= self.config.exceptional_momentum_pct {
            let feats = build_features(state, ev.price, ev.timestamp, tps, rise, unique_wallets);
            self.open_position(&ev.mint, ev.price, ev.timestamp, feats, true)
                .await;
            return true;
        }
        false
    }

    async fn maybe_ml_exit(&mut self, ev: &PriceEvent, feats: &Features) -> bool {
        let Some(model) = self.sell_model.clone() else {
            return false;
        };
        let state = self.state.states.get(&ev.mint).unwrap();
        if !state.has_bought {
            return false;
        }
        let score = model.predict(feats);
        self.log_prediction(&ev.mint, ev.timestamp, "sell", score).await;
        if score >= self.config.lgbm_threshold_sell {
            self.settle_and_emit(&ev.mint, ev.price, ev.timestamp, crate::types::SellReason::Tp)
                .await;
            return true;
        }
        false
    }

    async fn maybe_migration_exit(&mut self, ev: &PriceEvent) -> bool {
        let state = self.state.states.get(&ev.mint).unwrap();
        if !state.has_bought {
            return false;
        }
        let Some(initial) = state.initial_tokens else {
            return false;
        };
        if initial <= 0.0 {
            return false;
        }
        let fill = 1.0 - ev.tokens_curve / initial;
        if fill >= self.config.migrate_fill_pct {
            // spec.md §9: emits reason=TP despite the "MIGR" name in comments.
            self.settle_and_emit(&ev.mint, ev.price, ev.timestamp, crate::types::SellReason::Tp)
                .await;
            true
        } else {
            false
        }
    }

    async fn maybe_adaptive_exit(&mut self, ev: &PriceEvent) {
        let state = self.state.states.get_mut(&ev.mint).unwrap();
        if !state.has_bought {
            return;
        }
        let entry_price = state.entry_price.unwrap();
        state.peak_since_entry = Some(state.peak_since_entry.unwrap_or(entry_price).max(ev.price));
        let peak_since_entry = state.peak_since_entry.unwrap();

        let pnl = ev.price / entry_price - 1.0;
        if let Some(tp) = self.config.take_profit {
            if pnl >= tp {
                drop(state);
                self.settle_and_emit(&ev.mint, ev.price, ev.timestamp, crate::types::SellReason::Tp)
                    .await;
                return;
            }
        }

        let tps = state.window.tps();
        let ema_short = state.ema.short;
        let ema_long = state.ema.long;
        let atr = state.atr.value.unwrap_or(0.0);
        let is_exceptional = state.is_exceptional;

        let extra_trail = ((tps / self.config.min_tps - 1.0) * self.config.tps_trail_scale)
            .clamp(0.0, 0.3);
        let gain_pct = peak_since_entry / entry_price - 1.0;
        let gain_trail = (0.1 + gain_pct * 0.1).min(0.5);
        let dyn_trail = self.config.base_trail_dd
            + extra_trail
            + gain_trail
            + if is_exceptional { 0.1 } else { 0.0 };
        let abs_trail = atr * self.config.atr_mult;
        let allowed_drop = abs_trail.max(peak_since_entry * dyn_trail);

        let exit_tps = self.config.exit_tps();
        let weak_signal = gain_pct < self.config.disable_ema_tps_gain_pct
            && matches!((ema_short, ema_long), (Some(s), Some(l)) if s < l);
        let collapse = gain_pct < 0.3 && tps < exit_tps;
        let trailing_stop = ev.price <= peak_since_entry - allowed_drop;

        if weak_signal || collapse || trailing_stop {
            self.settle_and_emit(&ev.mint, ev.price, ev.timestamp, crate::types::SellReason::Sl)
                .await;
        }
    }

    // ---- §4.8 position open / settle -----------------------------------

    async fn open_position(
        &mut self,
        mint: &str,
        price: f64,
        time: i64,
        feats: Features,
        is_exceptional: bool,
    ) {
        let entry_sol = self.config.trade_size_sol;
        let dev_wallet = {
            let state = self.state.states.get_mut(mint).unwrap();
            state.entry_price = Some(price);
            state.entry_sol = Some(entry_sol);
            state.peak_since_entry = Some(price);
            state.has_bought = true;
            state.is_exceptional = is_exceptional;
            state.entry_features = Some(feats);
            state.no_buy_timer_generation += 1;
            state.dev_wallet.clone()
        };
        self.state.invested_sol += entry_sol;
        self.state.total_invested_sol += entry_sol;
        if let Some(dev) = dev_wallet {
            self.state
                .blacklist_dev(dev, time, self.config.dev_blacklist_sec);
        }
        let symbol = self.state.states.get(mint).unwrap().symbol.clone();
        info!(mint = %mint, price, "BUY");
        let _ = self
            .signal_tx
            .send(TradeSignal::buy(mint.to_string(), symbol, price, time));
    }

    async fn settle_and_emit(
        &mut self,
        mint: &str,
        exit_price: f64,
        time: i64,
        reason: crate::types::SellReason,
    ) {
        let Some(state) = self.state.states.get(mint) else {
            return;
        };
        let entry_price = state.entry_price.unwrap_or(exit_price);
        let entry_sol = state.entry_sol.unwrap_or(0.0);
        let symbol = state.symbol.clone();

        let pnl_sol = entry_sol * (exit_price - entry_price) / entry_price;
        self.state.profit_sol += pnl_sol;
        self.state.invested_sol = (self.state.invested_sol - entry_sol).max(0.0);

        info!(mint = %mint, exit_price, pnl_sol, reason = ?reason, "SELL");
        let _ = self.signal_tx.send(TradeSignal::sell(
            mint.to_string(),
            reason,
            symbol,
            exit_price,
            time,
        ));
        let _ = self.pnl_tx.send(self.state.profit_sol);
        self.untrack(mint);
    }

    // ---- logging ---------------------------------------------------------

    async fn log_features(&self, ev: &PriceEvent, feats: &Features) {
        let Some(store) = &self.feature_store else {
            return;
        };
        let state = self.state.states.get(&ev.mint).unwrap();
        let record = serde_json::json!({
            "ts": ev.timestamp,
            "mint": ev.mint,
            "features": feats,
            "has_bought": state.has_bought,
            "risk_checked": state.risk_checked,
            "transfer_fee_bps": state.transfer_fee_bps,
            "is_bundler": state.is_bundler,
        });
        if let Err(e) = store.append(&record).await {
            warn!(mint = %ev.mint, error = %e, "feature log write failed");
        }
    }

    async fn log_prediction(&self, mint: &str, ts: i64, kind: &str, score: f64) {
        let Some(store) = &self.pred_store else {
            return;
        };
        let record = serde_json::json!({ "ts": ts, "mint": mint, "kind": kind, "score": score });
        if let Err(e) = store.append(&record).await {
            warn!(mint = %mint, error = %e, "prediction log write failed");
        }
    }
}

fn build_features(
    state: &TokenState,
    price: f64,
    now: i64,
    tps: f64,
    rise_from_low: f64,
    unique_wallets: u32,
) -> Features {
    let mut feats = [0.0; FEATURE_COUNT];
    feats[0] = (price + 1e-12).ln();
    feats[1] = (state.liquidity + 1.0).ln();
    feats[2] = tps / 10.0;
    feats[3] = rise_from_low;
    feats[4] = unique_wallets as f64 / 10.0;
    feats[5] = match (state.ema.short, state.ema.long) {
        (Some(s), Some(l)) => (s - l) / price,
        _ => 0.0,
    };
    feats[6] = match state.atr.value {
        Some(atr) => atr / price,
        None => 0.0,
    };
    feats[7] = (now - state.created_at) as f64 / 60.0;
    feats[8] = match state.peak_since_entry {
        Some(peak) => peak / price - 1.0,
        None => 0.0,
    };
    feats[9] = match state.entry_price {
        Some(entry) => price / entry - 1.0,
        None => 0.0,
    };
    feats
}

fn now_secs() -> i64 {
    // Wall-clock source for admission's `now - createdAt` comparison; the
    // strategy task itself never calls this again after admission since
    // subsequent comparisons use the price event's own `timestamp`.
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StrategyConfig;

    fn engine() -> StrategyEngine {
        StrategyEngine::new(StrategyConfig::default(), None, None)
    }

    fn pool(mint: &str, now: i64, mcap: f64) -> PoolEvent {
        PoolEvent {
            mint: mint.to_string(),
            created_at: now,
            initial_mcap: mcap,
            symbol: Some("AAA".to_string()),
            dev_wallet: Some("dev1".to_string()),
            signature: None,
        }
    }

    #[tokio::test]
    async fn admitted_pool_event_creates_tracked_state() {
        let mut e = engine();
        e.handle_pool_event(pool("m1", 1000, 10.0), 1000).await;
        assert!(e.is_tracked("m1"));
        let s = e.state.states.get("m1").unwrap();
        assert_eq!(s.created_at, 1000);
        assert_eq!(s.liquidity, 10.0);
        assert_eq!(s.lowest_price, f64::INFINITY);
        assert!(!s.has_bought);
    }

    #[tokio::test]
    async fn stale_pool_event_is_rejected() {
        let mut e = engine();
        e.handle_pool_event(pool("m1", 0, 10.0), 10_000).await;
        assert!(!e.is_tracked("m1"));
    }

    #[tokio::test]
    async fn duplicate_pool_event_is_idempotent() {
        let mut e = engine();
        e.handle_pool_event(pool("m1", 1000, 10.0), 1000).await;
        e.handle_pool_event(pool("m1", 1000, 999.0), 1000).await;
        assert_eq!(e.state.states.get("m1").unwrap().liquidity, 10.0);
    }

    #[tokio::test]
    async fn liquidity_floor_untracks() {
        let mut e = engine();
        e.handle_pool_event(pool("m1", 0, 10.0), 0).await;
        e.handle_price_event(PriceEvent {
            mint: "m1".to_string(),
            price: 1.0,
            liquidity: 1.0,
            sol: 0.1,
            wallet: "w1".to_string(),
            tokens_curve: 1_000_000.0,
            side: Side::Buy,
            timestamp: 1,
        })
        .await;
        assert!(!e.is_tracked("m1"));
    }

    #[tokio::test]
    async fn settle_updates_profit_and_untracks() {
        let mut e = engine();
        e.handle_pool_event(pool("m1", 0, 10.0), 0).await;
        {
            let s = e.state.states.get_mut("m1").unwrap();
            s.risk_checked = true;
            s.dev_sold = true;
        }
        e.open_position("m1", 3.5, 9, [0.0; FEATURE_COUNT], true).await;
        assert!(e.state.states.get("m1").unwrap().has_bought);
        assert_eq!(e.state.invested_sol, 0.5);

        e.settle_and_emit("m1", 6.65, 20, crate::types::SellReason::Tp).await;
        assert!(!e.is_tracked("m1"));
        assert!((e.profit_sol() - 0.45).abs() < 1e-9);
        assert_eq!(e.invested_sol(), 0.0);
    }

    #[tokio::test]
    async fn action_enum_round_trips() {
        let sig = TradeSignal::buy("m1".to_string(), None, 1.0, 0);
        assert_eq!(sig.action, Action::Buy);
    }

    fn price(mint: &str, price: f64, liquidity: f64, ts: i64) -> PriceEvent {
        PriceEvent {
            mint: mint.to_string(),
            price,
            liquidity,
            sol: 0.1,
            wallet: "w1".to_string(),
            tokens_curve: 1_000_000.0,
            side: Side::Buy,
            timestamp: ts,
        }
    }

    async fn entered_position(e: &mut StrategyEngine) {
        e.handle_pool_event(pool("m1", 0, 10.0), 0).await;
        {
            let s = e.state.states.get_mut("m1").unwrap();
            s.risk_checked = true;
            s.dev_sold = true;
            s.peak_liquidity = 10.0;
            s.liquidity = 10.0;
        }
        e.open_position("m1", 3.5, 9, [0.0; FEATURE_COUNT], true).await;
    }

    // S2 — Rug SL: liquidity collapses below peakLiquidity * (1 - drop_pct),
    // SELL uses the triggering event's own price, not a liquidity-derived one.
    #[tokio::test]
    async fn s2_rug_sl_uses_trigger_price_and_default_drop_pct() {
        let mut e = engine();
        entered_position(&mut e).await;

        let ev = price("m1", 5.9, 5.9, 20);
        let rugged = e.maybe_detect_rug(&ev).await;
        assert!(rugged);
        assert!(!e.is_tracked("m1"));
        let expected = 0.5 * (5.9 / 3.5 - 1.0);
        assert!((e.profit_sol() - expected).abs() < 1e-9);
    }

    // S3 — Admission rejection by fee: RiskAssessor reports a fee above the
    // configured ceiling, so the token is untracked and no BUY is possible.
    #[tokio::test]
    async fn s3_fee_over_ceiling_untracks_on_risk_result() {
        let mut e = engine();
        e.handle_pool_event(pool("m1", 0, 10.0), 0).await;
        e.on_risk_result(
            "m1".to_string(),
            RiskAssessment {
                fee_bps: Some(100),
                bundler: false,
            },
        )
        .await;
        assert!(!e.is_tracked("m1"));
    }

    // S4 — No-buy timeout: a token that never buys within the configured
    // window is untracked when its timer fires, emitting no signal.
    #[tokio::test]
    async fn s4_no_buy_timeout_untracks_unbought_token() {
        let mut e = engine();
        e.handle_pool_event(pool("m1", 0, 10.0), 0).await;
        let generation = e.state.states.get("m1").unwrap().no_buy_timer_generation;
        e.on_no_buy_timeout("m1".to_string(), generation);
        assert!(!e.is_tracked("m1"));
    }

    #[tokio::test]
    async fn no_buy_timeout_ignored_if_superseded_by_later_generation() {
        let mut e = engine();
        e.handle_pool_event(pool("m1", 0, 10.0), 0).await;
        e.state.states.get_mut("m1").unwrap().no_buy_timer_generation = 1;
        e.on_no_buy_timeout("m1".to_string(), 0);
        assert!(e.is_tracked("m1"));
    }

    // S5 — Migration exit: curve nearly depleted relative to its initial
    // size emits SELL(TP), not a distinct MIGR reason.
    #[tokio::test]
    async fn s5_migration_fill_emits_tp() {
        let mut e = engine();
        entered_position(&mut e).await;
        e.state.states.get_mut("m1").unwrap().initial_tokens = Some(1_000_000.0);

        let mut ev = price("m1", 4.0, 10.0, 30);
        ev.tokens_curve = 20_000.0;
        let exited = e.maybe_migration_exit(&ev).await;
        assert!(exited);
        assert!(!e.is_tracked("m1"));
    }

    #[tokio::test]
    async fn migration_exit_does_not_fire_below_fill_threshold() {
        let mut e = engine();
        entered_position(&mut e).await;
        e.state.states.get_mut("m1").unwrap().initial_tokens = Some(1_000_000.0);

        let mut ev = price("m1", 4.0, 10.0, 30);
        ev.tokens_curve = 500_000.0;
        let exited = e.maybe_migration_exit(&ev).await;
        assert!(!exited);
        assert!(e.is_tracked("m1"));
    }

    // A tracked-but-never-bought token (e.g. still waiting on dev-sold)
    // must never produce a spurious SELL just because its curve drained.
    #[tokio::test]
    async fn migration_exit_does_not_fire_for_a_token_never_bought() {
        let mut e = engine();
        e.handle_pool_event(pool("m1", 0, 10.0), 0).await;
        e.state.states.get_mut("m1").unwrap().initial_tokens = Some(1_000_000.0);

        let mut ev = price("m1", 4.0, 10.0, 30);
        ev.tokens_curve = 20_000.0;
        let exited = e.maybe_migration_exit(&ev).await;
        assert!(!exited);
        assert!(e.is_tracked("m1"));
        assert_eq!(e.profit_sol(), 0.0);
    }

    // A risk probe that hasn't resolved yet must not let the heuristic path
    // buy ahead of it, even when every other entry condition is satisfied.
    #[tokio::test]
    async fn heuristic_entry_blocked_until_risk_checked() {
        let mut e = engine();
        e.handle_pool_event(pool("m1", 0, 10.0), 0).await;
        {
            let s = e.state.states.get_mut("m1").unwrap();
            s.risk_checked = false;
            s.dev_sold = true;
            s.liquidity = 100.0;
            s.volume_sol = 100.0;
            s.lowest_price = 1.0;
            for _ in 0..20 {
                s.window.record(900, 0.01, "w1");
            }
        }
        let ev = price("m1", 100.0, 100.0, 1);
        let entered = e.maybe_heuristic_entry(&ev).await;
        assert!(!entered);
        assert!(!e.state.states.get("m1").unwrap().has_bought);

        // Once risk clears, the same conditions do let it through.
        e.state.states.get_mut("m1").unwrap().risk_checked = true;
        let entered = e.maybe_heuristic_entry(&ev).await;
        assert!(entered);
        assert!(e.state.states.get("m1").unwrap().has_bought);
    }

    // S6 — ML replaces heuristic: pure_ml bypasses heuristic/adaptive exits
    // entirely; buy/sell models gate entry and exit directly.
    #[tokio::test]
    async fn s6_pure_ml_buy_then_sell_bypasses_heuristic_paths() {
        let mut config = StrategyConfig::default();
        config.lgbm_enabled = true;
        config.pure_ml = true;
        config.lgbm_threshold_buy = 0.5;
        config.lgbm_threshold_sell = 0.5;
        let mut e = StrategyEngine::new(config, None, None);
        e.buy_model = Some(Arc::new(GbmPredictor::constant(0.8)));

        // pre-seed so this dev's token isn't flagged devFirstToken (spec.md
        // S1/S6 assume a dev that has already launched once before).
        e.state.dev_token_count.insert("dev1".to_string(), 1);
        e.handle_pool_event(pool("m1", 0, 10.0), 0).await;
        {
            let s = e.state.states.get_mut("m1").unwrap();
            s.risk_checked = true;
            s.dev_sold = true;
        }

        let mut signals = e.subscribe_signals();

        // no sell model loaded yet: the first qualifying price only buys.
        e.handle_price_event(price("m1", 1.0, 10.0, 5)).await;
        assert!(e.state.states.get("m1").unwrap().has_bought);

        // sell model now available for the next tick, as the spec's
        // scenario separates "first qualifying price" from "next price".
        e.sell_model = Some(Arc::new(GbmPredictor::constant(0.9)));
        e.handle_price_event(price("m1", 1.2, 10.0, 6)).await;
        assert!(!e.is_tracked("m1"));

        let buy = signals.try_recv().unwrap();
        assert_eq!(buy.action, Action::Buy);
        let sell = signals.try_recv().unwrap();
        assert_eq!(sell.action, Action::Sell);
        assert_eq!(sell.reason, Some(crate::types::SellReason::Tp));
    }

    // Property 1: admitted pool events produce a state matching the spec's
    // initial invariants (covered further by `admitted_pool_event_creates_tracked_state`).
    #[tokio::test]
    async fn property1_admission_sets_exact_initial_invariants() {
        let mut e = engine();
        e.handle_pool_event(pool("m1", 42, 7.0), 42).await;
        let s = e.state.states.get("m1").unwrap();
        assert_eq!(s.created_at, 42);
        assert_eq!(s.liquidity, 7.0);
        assert_eq!(s.lowest_price, f64::INFINITY);
        assert!(!s.has_bought);
    }

    // Property 2: at most one BUY and one SELL are ever emitted per token.
    #[tokio::test]
    async fn property2_at_most_one_buy_and_one_sell_signal() {
        let mut e = engine();
        let mut signals = e.subscribe_signals();
        entered_position(&mut e).await;
        e.settle_and_emit("m1", 6.65, 20, crate::types::SellReason::Tp)
            .await;

        let mut buys = 0;
        let mut sells = 0;
        while let Ok(sig) = signals.try_recv() {
            match sig.action {
                Action::Buy => buys += 1,
                Action::Sell => sells += 1,
            }
        }
        assert_eq!(buys, 1);
        assert_eq!(sells, 1);
    }

    // Property 3: after SELL, the token's state is absent.
    #[tokio::test]
    async fn property3_state_absent_after_sell() {
        let mut e = engine();
        entered_position(&mut e).await;
        e.settle_and_emit("m1", 6.65, 20, crate::types::SellReason::Tp)
            .await;
        assert!(!e.is_tracked("m1"));
    }

    // Property 4: highestPrice is non-decreasing, lowestPrice non-increasing.
    #[tokio::test]
    async fn property4_extrema_are_monotone() {
        let mut e = engine();
        e.state.dev_token_count.insert("dev1".to_string(), 1);
        e.handle_pool_event(pool("m1", 0, 10.0), 0).await;
        {
            let s = e.state.states.get_mut("m1").unwrap();
            s.risk_checked = true;
        }
        e.handle_price_event(price("m1", 2.0, 10.0, 1)).await;
        let (h1, l1) = {
            let s = e.state.states.get("m1").unwrap();
            (s.highest_price, s.lowest_price)
        };
        e.handle_price_event(price("m1", 1.0, 10.0, 2)).await;
        let (h2, l2) = {
            let s = e.state.states.get("m1").unwrap();
            (s.highest_price, s.lowest_price)
        };
        assert!(h2 >= h1);
        assert!(l2 <= l1);
    }

    // Property 5: settle delta equals entrySol * (exit/entry - 1).
    #[tokio::test]
    async fn property5_settle_delta_matches_formula() {
        let mut e = engine();
        entered_position(&mut e).await;
        let before = e.profit_sol();
        e.settle_and_emit("m1", 6.65, 20, crate::types::SellReason::Tp)
            .await;
        let after = e.profit_sol();
        let expected_delta = 0.5 * (6.65 / 3.5 - 1.0);
        assert!((after - before - expected_delta).abs() < 1e-9);
    }

    // Property 9: idempotence on an already-tracked mint (duplicate covered
    // above too, this restates the invariant on `states` directly).
    #[tokio::test]
    async fn property9_duplicate_pool_event_leaves_state_unchanged() {
        let mut e = engine();
        e.handle_pool_event(pool("m1", 1000, 10.0), 1000).await;
        let before = e.state.states.get("m1").unwrap().created_at;
        e.handle_pool_event(pool("m1", 2000, 999.0), 2000).await;
        let after = e.state.states.get("m1").unwrap().created_at;
        assert_eq!(before, after);
    }
}
