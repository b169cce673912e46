//! Signal-generation strategies.
//!
//! A strategy turns the historical price map into a full-range table of
//! signal records; the simulation loop does the date filtering. The set
//! of strategies is closed: `build` is the only constructor surface and
//! rejects unknown names.

mod ema;
mod rsi;

pub use ema::EmaStrategy;
pub use rsi::RsiStrategy;

use anyhow::{bail, Result};

use crate::models::{DailyBar, PriceHistory, SignalRecord};

/// Output contract shared by all strategies: rows with a non-HOLD
/// signal carry a positive price and a positive ATR.
pub trait Strategy {
    fn name(&self) -> &str;

    fn compute(&self, history: &PriceHistory) -> Vec<SignalRecord>;
}

/// Instantiate a configured strategy by name.
pub fn build(name: &str, params: &serde_json::Value) -> Result<Box<dyn Strategy>> {
    match name {
        "rsi" => Ok(Box::new(RsiStrategy::from_params(params)?)),
        "ema" => Ok(Box::new(EmaStrategy::from_params(params)?)),
        other => bail!("unknown strategy: '{other}'"),
    }
}

/// Exponentially weighted mean with a warm-up: entries before
/// `min_periods - 1` observations are None. Matches the recursive form
/// y[i] = alpha * x[i] + (1 - alpha) * y[i-1], seeded with x[0].
pub(crate) fn ewm_mean(values: &[f64], alpha: f64, min_periods: usize) -> Vec<Option<f64>> {
    let mut out = Vec::with_capacity(values.len());
    let mut state = f64::NAN;

    for (i, &x) in values.iter().enumerate() {
        state = if i == 0 { x } else { alpha * x + (1.0 - alpha) * state };
        if i + 1 >= min_periods.max(1) {
            out.push(Some(state));
        } else {
            out.push(None);
        }
    }
    out
}

/// True range per bar: max(high-low, |high-prev_close|, |low-prev_close|).
pub(crate) fn true_ranges(bars: &[DailyBar]) -> Vec<f64> {
    use rust_decimal::prelude::ToPrimitive;

    bars.iter()
        .enumerate()
        .map(|(i, bar)| {
            let high = bar.high.to_f64().unwrap_or(0.0);
            let low = bar.low.to_f64().unwrap_or(0.0);
            let range = high - low;
            if i == 0 {
                return range;
            }
            let prev_close = bars[i - 1].close.to_f64().unwrap_or(0.0);
            range
                .max((high - prev_close).abs())
                .max((low - prev_close).abs())
        })
        .collect()
}

/// Wilder-smoothed ATR (EWM with alpha = 1/period).
pub(crate) fn atr_series(bars: &[DailyBar], period: usize) -> Vec<Option<f64>> {
    let tr = true_ranges(bars);
    ewm_mean(&tr, 1.0 / period as f64, period)
}

/// Round an indicator value for metadata output.
pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use chrono::{Datelike, NaiveDate, Weekday};
    use rust_decimal::prelude::FromPrimitive;
    use rust_decimal::Decimal;

    /// Synthetic bars from a close series: one bar per weekday starting
    /// at `start`, high/low one unit around the close.
    pub fn bars_from_closes(start: &str, closes: &[f64]) -> Vec<DailyBar> {
        let mut date: NaiveDate = start.parse().unwrap();
        let mut bars = Vec::with_capacity(closes.len());
        for &close in closes {
            while matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
                date = date.succ_opt().unwrap();
            }
            let c = Decimal::from_f64(close).unwrap();
            bars.push(DailyBar {
                date,
                open: c,
                high: c + Decimal::ONE,
                low: c - Decimal::ONE,
                close: c,
                volume: 1_000,
            });
            date = date.succ_opt().unwrap();
        }
        bars
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ewm_warm_up_and_recursion() {
        let values = [1.0, 2.0, 3.0, 4.0];
        let out = ewm_mean(&values, 0.5, 2);

        assert_eq!(out[0], None);
        // Seeded with 1.0: 0.5*2 + 0.5*1 = 1.5, then 2.25, then 3.125.
        assert_eq!(out[1], Some(1.5));
        assert_eq!(out[2], Some(2.25));
        assert_eq!(out[3], Some(3.125));
    }

    #[test]
    fn test_true_range_uses_previous_close() {
        use rust_decimal_macros::dec;
        let mut bars = test_support::bars_from_closes("2024-01-02", &[100.0, 100.0]);
        // Second bar gaps: high 103, low 102, prev close 100.
        bars[1].high = dec!(103);
        bars[1].low = dec!(102);

        let tr = true_ranges(&bars);
        assert_eq!(tr[0], 2.0); // high - low
        assert_eq!(tr[1], 3.0); // |high - prev_close|
    }

    #[test]
    fn test_registry_rejects_unknown_names() {
        let params = serde_json::json!({});
        assert!(build("macd", &params).is_err());
    }
}
