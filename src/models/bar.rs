//! Daily OHLCV bar and the in-memory price history map.

use std::collections::HashMap;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One daily candle for a ticker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyBar {
    /// Trading day
    pub date: NaiveDate,

    /// Opening price
    pub open: Decimal,

    /// Daily high
    pub high: Decimal,

    /// Daily low
    pub low: Decimal,

    /// Closing price
    pub close: Decimal,

    /// Traded volume (shares)
    pub volume: i64,
}

/// Historical bars per ticker, ascending by date.
pub type PriceHistory = HashMap<String, Vec<DailyBar>>;

/// The current day's bar per ticker, as seen by the simulation loop
/// or the live daily run. Tickers without data that day are absent.
pub type MarketSnapshot = HashMap<String, DailyBar>;

/// Extract a ticker -> close map from a day's snapshot, for mark-to-market.
pub fn closes(market: &MarketSnapshot) -> HashMap<String, Decimal> {
    market
        .iter()
        .map(|(ticker, bar)| (ticker.clone(), bar.close))
        .collect()
}
