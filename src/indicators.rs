//! EMA pair and ATR smoothing (spec.md §4.2).
//!
//! Smoothing is adaptive: the effective alpha is derived from the mean
//! inter-trade gap reported by the `RollingWindow`, so a quiet token's EMA
//! reacts as fast (in wall-clock terms) as a busy one's.

/// Adaptive EMA pair (short/long horizon, in milliseconds).
#[derive(Debug, Clone, Copy, Default)]
pub struct EmaPair {
    short_ms: u64,
    long_ms: u64,
    pub short: Option<f64>,
    pub long: Option<f64>,
}

impl EmaPair {
    pub fn new(short_ms: u64, long_ms: u64) -> Self {
        Self {
            short_ms,
            long_ms,
            short: None,
            long: None,
        }
    }

    /// Update both EMAs with a new price, given the mean inter-trade gap
    /// estimate `dt_eff_ms` from the rolling window.
    pub fn update(&mut self, price: f64, dt_eff_ms: f64) {
        let dt_eff = dt_eff_ms.max(1.0);
        self.short = Some(update_one(self.short, price, self.short_ms as f64, dt_eff));
        self.long = Some(update_one(self.long, price, self.long_ms as f64, dt_eff));
    }
}

fn update_one(current: Option<f64>, price: f64, horizon_ms: f64, dt_eff: f64) -> f64 {
    match current {
        None => price,
        Some(ema) => {
            let alpha = 2.0 / (horizon_ms / dt_eff + 1.0);
            alpha * price + (1.0 - alpha) * ema
        }
    }
}

/// Smoothed true range (mean absolute price change).
#[derive(Debug, Clone, Copy, Default)]
pub struct Atr {
    window_sec: u64,
    last_price: Option<f64>,
    pub value: Option<f64>,
}

impl Atr {
    pub fn new(window_sec: u64) -> Self {
        Self {
            window_sec,
            last_price: None,
            value: None,
        }
    }

    pub fn update(&mut self, price: f64) {
        if let Some(last) = self.last_price {
            let true_range = (price - last).abs();
            let alpha = 2.0 / (self.window_sec as f64 + 1.0);
            self.value = Some(match self.value {
                None => true_range,
                Some(atr) => alpha * true_range + (1.0 - alpha) * atr,
            });
        }
        self.last_price = Some(price);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ema_seeds_on_first_price() {
        let mut ema = EmaPair::new(1000, 5000);
        ema.update(10.0, 500.0);
        assert_eq!(ema.short, Some(10.0));
        assert_eq!(ema.long, Some(10.0));
    }

    #[test]
    fn ema_short_reacts_faster_than_long() {
        let mut ema = EmaPair::new(1000, 10_000);
        ema.update(10.0, 500.0);
        ema.update(20.0, 500.0);
        let short_move = ema.short.unwrap() - 10.0;
        let long_move = ema.long.unwrap() - 10.0;
        assert!(short_move > long_move);
    }

    #[test]
    fn atr_is_none_until_second_price() {
        let mut atr = Atr::new(20);
        atr.update(10.0);
        assert_eq!(atr.value, None);
        atr.update(11.0);
        assert_eq!(atr.value, Some(1.0));
    }

    #[test]
    fn atr_smooths_toward_true_range() {
        let mut atr = Atr::new(20);
        atr.update(10.0);
        atr.update(11.0);
        atr.update(10.0);
        // Second true range is 1.0 too, so the smoothed value stays at 1.0.
        assert!((atr.value.unwrap() - 1.0).abs() < 1e-9);
    }
}
