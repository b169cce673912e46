//! Trade record model: the append-only execution log.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Direction of an executed order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeAction {
    Buy,
    Sell,
}

impl TradeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeAction::Buy => "BUY",
            TradeAction::Sell => "SELL",
        }
    }
}

impl std::str::FromStr for TradeAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "BUY" => Ok(TradeAction::Buy),
            "SELL" => Ok(TradeAction::Sell),
            other => Err(format!("unknown trade action: {other}")),
        }
    }
}

/// One executed order, recorded exactly once. Trade records are never
/// mutated or deleted after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    /// Ticker symbol
    pub ticker: String,

    /// Shares traded (magnitude; direction is in `action`)
    pub quantity: i64,

    /// Execution price per share
    pub price: Decimal,

    /// BUY or SELL
    pub action: TradeAction,

    /// Execution timestamp
    pub executed_at: DateTime<Utc>,
}

impl TradeRecord {
    pub fn new(ticker: String, quantity: i64, price: Decimal, action: TradeAction) -> Self {
        Self {
            ticker,
            quantity,
            price,
            action,
            executed_at: Utc::now(),
        }
    }

    /// Gross value exchanged (price x quantity), always positive.
    pub fn value(&self) -> Decimal {
        Decimal::from(self.quantity) * self.price
    }
}
