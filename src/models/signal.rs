//! Signal record: the standardized output contract of every strategy.

use std::collections::HashMap;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Strategy verdict for one ticker on one day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Signal {
    Buy,
    Sell,
    Hold,
}

/// One row of a strategy's signal table.
///
/// Contract: every row with `signal != Hold` must carry `atr > 0` and
/// `price > 0`. The risk manager skips rows that violate this rather
/// than erroring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalRecord {
    /// Ticker symbol
    pub ticker: String,

    /// Signal date (the bar the indicators were computed on)
    pub date: NaiveDate,

    /// BUY, SELL or HOLD
    pub signal: Signal,

    /// Reference price for sizing and execution (the bar's close)
    pub price: Decimal,

    /// Average true range at the signal date; required for sizing
    pub atr: Option<Decimal>,

    /// Strategy-specific extras (indicator values, notes)
    #[serde(default)]
    pub meta: HashMap<String, serde_json::Value>,
}

impl SignalRecord {
    /// Whether this row satisfies the sizing contract for non-HOLD signals.
    pub fn is_sizable(&self) -> bool {
        self.price > Decimal::ZERO && self.atr.map(|a| a > Decimal::ZERO).unwrap_or(false)
    }
}
