//! EMA crossover trend-following strategy.
//!
//! BUY while the short EMA is above the long EMA, SELL while it is
//! below, HOLD on an exact tie.

use std::collections::HashMap;

use anyhow::{Context, Result};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::models::{PriceHistory, Signal, SignalRecord};

use super::{atr_series, ewm_mean, round2, Strategy};

/// Parameters for the EMA crossover strategy; all keys are required.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmaParams {
    pub short_window: usize,
    pub long_window: usize,
    pub atr_period: usize,
}

pub struct EmaStrategy {
    params: EmaParams,
}

impl EmaStrategy {
    pub fn new(params: EmaParams) -> Self {
        Self { params }
    }

    pub fn from_params(value: &serde_json::Value) -> Result<Self> {
        let params: EmaParams = serde_json::from_value(value.clone())
            .context("invalid or incomplete 'ema' strategy parameters")?;
        Ok(Self::new(params))
    }
}

/// Span-parameterized EWM, the usual EMA convention.
fn ema(values: &[f64], span: usize) -> Vec<Option<f64>> {
    ewm_mean(values, 2.0 / (span as f64 + 1.0), 1)
}

impl Strategy for EmaStrategy {
    fn name(&self) -> &str {
        "ema"
    }

    fn compute(&self, history: &PriceHistory) -> Vec<SignalRecord> {
        let mut records = Vec::new();

        info!(
            short = self.params.short_window,
            long = self.params.long_window,
            tickers = history.len(),
            "Computing EMA crossover signals"
        );

        let mut tickers: Vec<&String> = history.keys().collect();
        tickers.sort();

        for ticker in tickers {
            let bars = &history[ticker];
            if bars.len() < self.params.long_window {
                continue;
            }

            let closes: Vec<f64> = bars
                .iter()
                .map(|b| b.close.to_f64().unwrap_or(0.0))
                .collect();
            let ema_short = ema(&closes, self.params.short_window);
            let ema_long = ema(&closes, self.params.long_window);
            let atr = atr_series(bars, self.params.atr_period);

            // Skip the long window entirely: before that the long EMA is
            // still dominated by its seed value.
            for (i, bar) in bars
                .iter()
                .enumerate()
                .skip(self.params.long_window.saturating_sub(1))
            {
                let (Some(short), Some(long), Some(atr_value)) = (ema_short[i], ema_long[i], atr[i])
                else {
                    continue;
                };
                let Some(atr_dec) = Decimal::from_f64(atr_value) else {
                    continue;
                };

                let signal = if short > long {
                    Signal::Buy
                } else if short < long {
                    Signal::Sell
                } else {
                    Signal::Hold
                };

                let mut meta = HashMap::new();
                meta.insert("ema_short".to_string(), serde_json::json!(round2(short)));
                meta.insert("ema_long".to_string(), serde_json::json!(round2(long)));
                meta.insert("diff".to_string(), serde_json::json!(round2(short - long)));

                records.push(SignalRecord {
                    ticker: ticker.clone(),
                    date: bar.date,
                    signal,
                    price: bar.close,
                    atr: Some(atr_dec),
                    meta,
                });
            }
        }

        records.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.ticker.cmp(&b.ticker)));
        records
    }
}
