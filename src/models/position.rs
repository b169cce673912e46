//! Position model representing one open holding in the portfolio.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One open holding. The ledger never stores a position with
/// `quantity <= 0`; a fully sold position is deleted instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    /// Ticker symbol (position identity)
    pub ticker: String,

    /// Shares held, always positive (the system holds no shorts)
    pub quantity: i64,

    /// Mark price: last execution or mark-to-market price
    pub price: Decimal,

    /// Protective stop level, if one was set at entry
    pub stop_loss: Option<Decimal>,

    /// Profit target level, if one was set at entry
    pub take_profit: Option<Decimal>,

    /// Last time this position was touched
    pub updated_at: DateTime<Utc>,
}

impl Position {
    /// Create a new position from an executed entry.
    pub fn new(
        ticker: String,
        quantity: i64,
        price: Decimal,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> Self {
        Self {
            ticker,
            quantity,
            price,
            stop_loss,
            take_profit,
            updated_at: Utc::now(),
        }
    }

    /// Current market value at the mark price.
    pub fn market_value(&self) -> Decimal {
        Decimal::from(self.quantity) * self.price
    }

    /// Update the mark price without closing the position.
    pub fn mark(&mut self, price: Decimal) {
        self.price = price;
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_market_value() {
        let pos = Position::new("AAPL".to_string(), 10, dec!(150), Some(dec!(140)), None);
        assert_eq!(pos.market_value(), dec!(1500));
    }

    #[test]
    fn test_mark_updates_price() {
        let mut pos = Position::new("AAPL".to_string(), 10, dec!(150), None, None);
        pos.mark(dec!(155.50));
        assert_eq!(pos.price, dec!(155.50));
        assert_eq!(pos.market_value(), dec!(1555));
    }
}
