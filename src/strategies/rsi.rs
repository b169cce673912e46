//! RSI mean-reversion strategy.
//!
//! BUY when the Wilder RSI dips below the oversold threshold, SELL when
//! it rises above the overbought threshold, HOLD in between.

use std::collections::HashMap;

use anyhow::{Context, Result};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::models::{PriceHistory, Signal, SignalRecord};

use super::{atr_series, ewm_mean, round2, Strategy};

/// Parameters for the RSI strategy; all keys are required in settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RsiParams {
    pub rsi_period: usize,
    pub rsi_lower: f64,
    pub rsi_upper: f64,
    pub atr_period: usize,
}

pub struct RsiStrategy {
    params: RsiParams,
}

impl RsiStrategy {
    pub fn new(params: RsiParams) -> Self {
        Self { params }
    }

    pub fn from_params(value: &serde_json::Value) -> Result<Self> {
        let params: RsiParams = serde_json::from_value(value.clone())
            .context("invalid or incomplete 'rsi' strategy parameters")?;
        Ok(Self::new(params))
    }

    /// Wilder RSI over a close series. A flat-loss market reads as 100.
    fn rsi(&self, closes: &[f64]) -> Vec<Option<f64>> {
        let period = self.params.rsi_period;
        let mut gains = vec![0.0; closes.len()];
        let mut losses = vec![0.0; closes.len()];

        for i in 1..closes.len() {
            let delta = closes[i] - closes[i - 1];
            if delta > 0.0 {
                gains[i] = delta;
            } else {
                losses[i] = -delta;
            }
        }

        let alpha = 1.0 / period as f64;
        let avg_gain = ewm_mean(&gains, alpha, period);
        let avg_loss = ewm_mean(&losses, alpha, period);

        avg_gain
            .iter()
            .zip(avg_loss.iter())
            .map(|(gain, loss)| match (gain, loss) {
                (Some(g), Some(l)) => {
                    if *l == 0.0 {
                        Some(100.0)
                    } else {
                        Some(100.0 - 100.0 / (1.0 + g / l))
                    }
                }
                _ => None,
            })
            .collect()
    }
}

impl Strategy for RsiStrategy {
    fn name(&self) -> &str {
        "rsi"
    }

    fn compute(&self, history: &PriceHistory) -> Vec<SignalRecord> {
        let mut records = Vec::new();

        info!(
            period = self.params.rsi_period,
            lower = self.params.rsi_lower,
            upper = self.params.rsi_upper,
            "Computing RSI signals"
        );

        let mut tickers: Vec<&String> = history.keys().collect();
        tickers.sort();

        for ticker in tickers {
            let bars = &history[ticker];
            if bars.len() < self.params.rsi_period + 5 {
                continue;
            }

            let closes: Vec<f64> = bars
                .iter()
                .map(|b| b.close.to_f64().unwrap_or(0.0))
                .collect();
            let rsi = self.rsi(&closes);
            let atr = atr_series(bars, self.params.atr_period);

            for (i, bar) in bars.iter().enumerate() {
                let (Some(rsi_value), Some(atr_value)) = (rsi[i], atr[i]) else {
                    continue;
                };
                let Some(atr_dec) = Decimal::from_f64(atr_value) else {
                    continue;
                };

                let signal = if rsi_value < self.params.rsi_lower {
                    Signal::Buy
                } else if rsi_value > self.params.rsi_upper {
                    Signal::Sell
                } else {
                    Signal::Hold
                };

                let mut meta = HashMap::new();
                meta.insert("rsi".to_string(), serde_json::json!(round2(rsi_value)));

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
