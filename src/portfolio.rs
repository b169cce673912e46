//! Portfolio ledger: the authoritative in-memory view of cash, open
//! positions and trade history.
//!
//! The ledger applies orders and answers valuation queries; persistence
//! is the caller's concern via `export_snapshot` / `load`. It does not
//! re-validate affordability: a BUY is trusted to have been sized within
//! available cash by the risk manager, and a buggy caller can drive the
//! cash balance negative. `total_equity` tolerates that state.

use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::models::{CashAccount, Order, Position, TradeAction, TradeRecord};

/// Read-only view of one position for the intraday stop/target scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionView {
    pub quantity: i64,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
}

/// Full ledger state for the persistence boundary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub positions: Vec<Position>,
    pub cash: Option<CashAccount>,
    pub trades: Vec<TradeRecord>,
}

/// In-memory portfolio state: one cash account, positions keyed by
/// ticker, and the append-only trade log.
#[derive(Debug, Default)]
pub struct Ledger {
    positions: BTreeMap<String, Position>,
    cash: Option<CashAccount>,
    trades: Vec<TradeRecord>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the cash record. The currency is fixed for the portfolio
    /// lifetime by convention; callers pass the same one every time.
    pub fn set_cash(&mut self, amount: Decimal, currency: &str) {
        self.cash = Some(CashAccount::new(amount, currency));
    }

    /// Current cash balance, zero when no account has been initialized.
    pub fn cash_amount(&self) -> Decimal {
        self.cash.as_ref().map(|c| c.amount).unwrap_or(Decimal::ZERO)
    }

    pub fn currency(&self) -> Option<&str> {
        self.cash.as_ref().map(|c| c.currency.as_str())
    }

    /// Update mark prices for every ticker present in both the position
    /// set and the price map. Tickers without a price today keep their
    /// last known mark; that is "unknown today", not an error.
    pub fn mark_to_market(&mut self, prices: &HashMap<String, Decimal>) {
        for (ticker, position) in self.positions.iter_mut() {
            if let Some(price) = prices.get(ticker) {
                position.mark(*price);
            }
        }
    }

    /// Cash plus the marked value of all open positions. Never fails;
    /// a missing cash account counts as zero.
    pub fn total_equity(&self) -> Decimal {
        let assets: Decimal = self.positions.values().map(|p| p.market_value()).sum();
        self.cash_amount() + assets
    }

    /// Apply a BUY or SELL order. Returns false (and changes nothing)
    /// for orders with `quantity <= 0`, sells of tickers the ledger does
    /// not hold, or when no cash account exists yet. Every applied order
    /// appends exactly one trade record.
    pub fn execute_order(&mut self, order: &Order) -> bool {
        if order.quantity <= 0 {
            warn!(ticker = %order.ticker, quantity = order.quantity, "Rejected order with non-positive quantity");
            return false;
        }
        if self.cash.is_none() {
            warn!(ticker = %order.ticker, "Rejected order: cash account not initialized");
            return false;
        }

        match order.action {
            TradeAction::Buy => self.apply_buy(order),
            TradeAction::Sell => {
                if !self.apply_sell(order) {
                    return false;
                }
            }
        }

        self.trades.push(TradeRecord::new(
            order.ticker.clone(),
            order.quantity,
            order.price,
            order.action,
        ));

        debug!(
            ticker = %order.ticker,
            action = order.action.as_str(),
            quantity = order.quantity,
            price = %order.price,
            "Order applied"
        );
        true
    }

    fn apply_buy(&mut self, order: &Order) {
        self.adjust_cash(-order.value());

        match self.positions.get_mut(&order.ticker) {
            Some(position) => {
                position.quantity += order.quantity;
                position.price = order.price;
                if order.stop_loss.is_some() {
                    position.stop_loss = order.stop_loss;
                }
                if order.take_profit.is_some() {
                    position.take_profit = order.take_profit;
                }
                position.updated_at = Utc::now();
            }
            None => {
                self.positions.insert(
                    order.ticker.clone(),
                    Position::new(
                        order.ticker.clone(),
                        order.quantity,
                        order.price,
                        order.stop_loss,
                        order.take_profit,
                    ),
                );
            }
        }
    }

    /// Reduce or close a position. A sell for more shares than held
    /// closes the position rather than opening a short. Stop and target
    /// are preserved on a partial sell unless the order supplies new ones.
    fn apply_sell(&mut self, order: &Order) -> bool {
        let Some(position) = self.positions.get_mut(&order.ticker) else {
            warn!(ticker = %order.ticker, "Rejected sell: no open position");
            return false;
        };

        if let Some(cash) = self.cash.as_mut() {
            cash.amount += order.value();
            cash.updated_at = Utc::now();
        }

        let remaining = position.quantity - order.quantity;
        if remaining <= 0 {
            self.positions.remove(&order.ticker);
        } else {
            position.quantity = remaining;
            if order.stop_loss.is_some() {
                position.stop_loss = order.stop_loss;
            }
            if order.take_profit.is_some() {
                position.take_profit = order.take_profit;
            }
            position.updated_at = Utc::now();
        }
        true
    }

    /// Debit a commission from cash, separately from any trade price.
    pub fn debit_fee(&mut self, amount: Decimal) {
        if self.cash.is_none() {
            warn!(fee = %amount, "Ignored fee: cash account not initialized");
            return;
        }
        self.adjust_cash(-amount);
    }

    fn adjust_cash(&mut self, delta: Decimal) {
        if let Some(cash) = self.cash.as_mut() {
            cash.amount += delta;
            cash.updated_at = Utc::now();
        }
    }

    /// Read-only view for the intraday stop/target scan.
    pub fn positions_snapshot(&self) -> BTreeMap<String, PositionView> {
        self.positions
            .iter()
            .map(|(ticker, p)| {
                (
                    ticker.clone(),
                    PositionView {
                        quantity: p.quantity,
                        stop_loss: p.stop_loss,
                        take_profit: p.take_profit,
                    },
                )
            })
            .collect()
    }

    /// Lighter view for sizing decisions: what do I already hold.
    pub fn positions_counts(&self) -> HashMap<String, i64> {
        self.positions
            .iter()
            .map(|(ticker, p)| (ticker.clone(), p.quantity))
            .collect()
    }

    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    pub fn position_count(&self) -> usize {
        self.positions.len()
    }

    pub fn trades(&self) -> &[TradeRecord] {
        &self.trades
    }

    /// Last `limit` trades, newest first.
    pub fn trades_history(&self, limit: usize) -> Vec<&TradeRecord> {
        self.trades.iter().rev().take(limit).collect()
    }

    /// Bulk hydrate from a persisted snapshot, replacing current state.
    pub fn load(&mut self, snapshot: LedgerSnapshot) {
        self.positions = snapshot
            .positions
            .into_iter()
            .map(|p| (p.ticker.clone(), p))
            .collect();
        self.cash = snapshot.cash;
        self.trades = snapshot.trades;
    }

    /// Bulk dehydrate for the persistence boundary.
    pub fn export_snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            positions: self.positions.values().cloned().collect(),
            cash: self.cash.clone(),
            trades: self.trades.clone(),
        }
    }
}
