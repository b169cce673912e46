//! Order model: the ephemeral instruction passed from the risk manager
//! to the portfolio ledger.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::trade::TradeAction;

/// Why an exit order was generated by the intraday stop/target scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Low breached the stop, open was still above it: fill at the stop
    StopLoss,
    /// Open already gapped below the stop: fill at the open (worse)
    StopLossGap,
    /// High reached the target, open was still below it: fill at the target
    TakeProfit,
    /// Open already gapped above the target: fill at the open (better)
    TakeProfitGap,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::StopLoss => "STOP_LOSS",
            ExitReason::StopLossGap => "STOP_LOSS_GAP",
            ExitReason::TakeProfit => "TAKE_PROFIT",
            ExitReason::TakeProfitGap => "TAKE_PROFIT_GAP",
        }
    }
}

/// A sized instruction for the ledger. Orders live only between the
/// risk manager and `Ledger::execute_order`; the trade record they
/// produce is the persistent artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    /// Ticker symbol
    pub ticker: String,

    /// BUY or SELL
    pub action: TradeAction,

    /// Shares, strictly positive
    pub quantity: i64,

    /// Execution reference price
    pub price: Decimal,

    /// Protective stop carried onto the resulting position
    pub stop_loss: Option<Decimal>,

    /// Profit target carried onto the resulting position
    pub take_profit: Option<Decimal>,

    /// Origin of the order (signal exit, stop reason, ...)
    pub reason: Option<String>,
}

impl Order {
    /// A full-size market sell with no stop/target levels of its own.
    pub fn market_sell(ticker: String, quantity: i64, price: Decimal, reason: &str) -> Self {
        Self {
            ticker,
            action: TradeAction::Sell,
            quantity,
            price,
            stop_loss: None,
            take_profit: None,
            reason: Some(reason.to_string()),
        }
    }

    /// Gross order value (price x quantity).
    pub fn value(&self) -> Decimal {
        Decimal::from(self.quantity) * self.price
    }
}
