//! Risk manager: fixed fractional-risk position sizing and intraday
//! stop/target exit detection.
//!
//! The risk manager is pure per call: it reads a snapshot of portfolio
//! state and returns proposed orders. It never mutates the ledger; the
//! simulated cash it tracks during a pass only forecasts availability
//! so later buys in the same batch stay affordable.

use std::collections::{BTreeMap, HashMap};

use anyhow::{bail, Result};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::models::{ExitReason, MarketSnapshot, Order, Signal, SignalRecord, TradeAction};
use crate::portfolio::PositionView;

/// Reason string attached to weekly signal-driven exits.
pub const SIGNAL_EXIT: &str = "SIGNAL_EXIT";

/// Sizing parameters. Externally supplied and never defaulted: both
/// values must be present and strictly positive before a run starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Fraction of total equity risked per new position (e.g. 0.02)
    pub risk_per_trade: Decimal,

    /// Stop distance as a multiple of ATR (e.g. 2.0)
    pub stop_atr_multiplier: Decimal,
}

impl RiskConfig {
    pub fn validate(&self) -> Result<()> {
        if self.risk_per_trade <= Decimal::ZERO {
            bail!("risk_per_trade must be positive, got {}", self.risk_per_trade);
        }
        if self.stop_atr_multiplier <= Decimal::ZERO {
            bail!(
                "stop_atr_multiplier must be positive, got {}",
                self.stop_atr_multiplier
            );
        }
        Ok(())
    }
}

/// Translates a day's signal batch plus portfolio metrics into sized
/// orders, and scans open positions for stop/target hits.
pub struct RiskManager {
    config: RiskConfig,
}

impl RiskManager {
    pub fn new(config: RiskConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// Evaluate a signal batch against current portfolio metrics.
    ///
    /// Sells are processed first so their proceeds fund the buy pass
    /// within the same call; all sells precede all buys in the output,
    /// and within each pass the input row order is preserved.
    pub fn evaluate(
        &self,
        signals: &[SignalRecord],
        total_equity: Decimal,
        available_cash: Decimal,
        current_positions: &HashMap<String, i64>,
    ) -> Vec<Order> {
        let mut orders = Vec::new();
        if signals.is_empty() {
            return orders;
        }

        // Working copies: the real ledger is untouched until the caller
        // applies the returned orders.
        let mut holdings = current_positions.clone();
        let mut simulated_cash = available_cash;

        info!(
            equity = %total_equity,
            cash = %available_cash,
            signals = signals.len(),
            "Risk evaluation start"
        );

        for row in signals.iter().filter(|r| r.signal == Signal::Sell) {
            let Some(&held) = holdings.get(&row.ticker) else {
                continue;
            };
            if held <= 0 {
                continue;
            }

            orders.push(Order::market_sell(
                row.ticker.clone(),
                held,
                row.price,
                SIGNAL_EXIT,
            ));

            simulated_cash += Decimal::from(held) * row.price;
            holdings.remove(&row.ticker);
        }

        for row in signals.iter().filter(|r| r.signal == Signal::Buy) {
            // No pyramiding: skip anything still held after the sell pass.
            if holdings.contains_key(&row.ticker) {
                continue;
            }
            if !row.is_sizable() {
                debug!(ticker = %row.ticker, "Skipped buy signal: missing or non-positive ATR/price");
                continue;
            }
            let atr = row.atr.unwrap_or(Decimal::ZERO);

            let risk_budget = total_equity * self.config.risk_per_trade;
            let stop_distance = atr * self.config.stop_atr_multiplier;
            let stop_loss_price = row.price - stop_distance;

            if stop_loss_price <= Decimal::ZERO {
                continue;
            }

            // Shares so that the loss at the stop approximates the risk
            // budget: higher-ATR names get smaller sizes.
            let mut shares = (risk_budget / stop_distance)
                .floor()
                .to_i64()
                .unwrap_or(0);

            let mut cost = Decimal::from(shares) * row.price;
            if cost > simulated_cash {
                shares = (simulated_cash / row.price).floor().to_i64().unwrap_or(0);
                cost = Decimal::from(shares) * row.price;
            }

            if shares < 1 {
                continue;
            }

            orders.push(Order {
                ticker: row.ticker.clone(),
                action: TradeAction::Buy,
                quantity: shares,
                price: row.price,
                stop_loss: Some(stop_loss_price),
                take_profit: Some(row.price + stop_distance * Decimal::from(2)),
                reason: None,
            });

            simulated_cash -= cost;
        }

        orders
    }

    /// Daily-bar approximation of stop/target hits with gap handling.
    ///
    /// Stops take priority: a position whose stop triggers is not also
    /// checked against its target that day. A position whose ticker has
    /// no bar today is skipped entirely.
    pub fn check_intraday_stops(
        &self,
        positions: &BTreeMap<String, PositionView>,
        market: &MarketSnapshot,
    ) -> Vec<Order> {
        let mut orders = Vec::new();

        for (ticker, position) in positions {
            if position.quantity <= 0 {
                continue;
            }
            let Some(bar) = market.get(ticker) else {
                continue;
            };

            if let Some(stop) = position.stop_loss {
                if bar.low <= stop {
                    let (price, reason) = if bar.open < stop {
                        (bar.open, ExitReason::StopLossGap)
                    } else {
                        (stop, ExitReason::StopLoss)
                    };
                    info!(ticker = %ticker, price = %price, reason = reason.as_str(), "Exit triggered");
                    orders.push(Order::market_sell(
                        ticker.clone(),
                        position.quantity,
                        price,
                        reason.as_str(),
                    ));
                    continue;
                }
            }

            if let Some(target) = position.take_profit {
                if bar.high >= target {
                    let (price, reason) = if bar.open > target {
                        (bar.open, ExitReason::TakeProfitGap)
                    } else {
                        (target, ExitReason::TakeProfit)
                    };
                    info!(ticker = %ticker, price = %price, reason = reason.as_str(), "Exit triggered");
                    orders.push(Order::market_sell(
                        ticker.clone(),
                        position.quantity,
                        price,
                        reason.as_str(),
                    ));
                }
            }
        }

        orders
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DailyBar;
    use rust_decimal_macros::dec;

    fn manager() -> RiskManager {
        RiskManager::new(RiskConfig {
            risk_per_trade: dec!(0.02),
            stop_atr_multiplier: dec!(2.0),
        })
        .unwrap()
    }

    fn signal(ticker: &str, kind: Signal, price: Decimal, atr: Option<Decimal>) -> SignalRecord {
        SignalRecord {
            ticker: ticker.to_string(),
            date: "2024-03-01".parse().unwrap(),
            signal: kind,
            price,
            atr,
            meta: Default::default(),
        }
    }

    fn bar(open: Decimal, high: Decimal, low: Decimal) -> DailyBar {
        DailyBar {
            date: "2024-03-01".parse().unwrap(),
            open,
            high,
            low,
            close: open,
            volume: 1_000,
        }
    }

    fn view(quantity: i64, stop: Option<Decimal>, target: Option<Decimal>) -> PositionView {
        PositionView {
            quantity,
            stop_loss: stop,
            take_profit: target,
        }
    }

    #[test]
    fn test_config_rejects_non_positive_values() {
        assert!(RiskManager::new(RiskConfig {
            risk_per_trade: dec!(0),
            stop_atr_multiplier: dec!(2),
        })
        .is_err());
        assert!(RiskManager::new(RiskConfig {
            risk_per_trade: dec!(0.02),
            stop_atr_multiplier: dec!(-1),
        })
        .is_err());
    }

    #[test]
    fn test_buy_sizing_math() {
        let rm = manager();
        let signals = vec![signal("TEST", Signal::Buy, dec!(100), Some(dec!(5)))];

        let orders = rm.evaluate(&signals, dec!(10000), dec!(10000), &HashMap::new());

        assert_eq!(orders.len(), 1);
        let order = &orders[0];
        // Risk budget 200, stop distance 10: 20 shares.
        assert_eq!(order.action, TradeAction::Buy);
        assert_eq!(order.quantity, 20);
        assert_eq!(order.stop_loss, Some(dec!(90)));
        assert_eq!(order.take_profit, Some(dec!(120)));
        assert_eq!(order.value(), dec!(2000));
    }

    #[test]
    fn test_buy_capped_by_available_cash() {
        let rm = RiskManager::new(RiskConfig {
            risk_per_trade: dec!(0.02),
            stop_atr_multiplier: dec!(1.0),
        })
        .unwrap();
        // Uncapped size would be 100000 * 0.02 / 1 = 2000 shares.
        let signals = vec![signal("TEST", Signal::Buy, dec!(100), Some(dec!(1)))];

        let orders = rm.evaluate(&signals, dec!(100000), dec!(5000), &HashMap::new());

        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].quantity, 50); // floor(5000 / 100)
        assert!(orders[0].quantity <= 2000);
    }

    #[test]
    fn test_buy_pass_decrements_simulated_cash() {
        let rm = RiskManager::new(RiskConfig {
            risk_per_trade: dec!(0.02),
            stop_atr_multiplier: dec!(2.0),
        })
        .unwrap();
        let signals = vec![
            // 200 / 10 = 20 shares, cost 2000, leaving 8000 simulated.
            signal("A", Signal::Buy, dec!(100), Some(dec!(5))),
            // Uncapped 200 / 2 = 100 shares would cost 40000: capped to
            // floor(8000 / 400) = 20.
            signal("B", Signal::Buy, dec!(400), Some(dec!(1))),
        ];

        let orders = rm.evaluate(&signals, dec!(10000), dec!(10000), &HashMap::new());

        assert_eq!(orders.len(), 2);
        assert_eq!(orders[0].quantity, 20);
        assert_eq!(orders[1].quantity, 20);
    }

    #[test]
    fn test_no_pyramiding_on_held_ticker() {
        let rm = manager();
        let signals = vec![signal("HELD", Signal::Buy, dec!(100), Some(dec!(5)))];
        let positions = HashMap::from([("HELD".to_string(), 10)]);

        let orders = rm.evaluate(&signals, dec!(10000), dec!(10000), &positions);
        assert!(orders.is_empty());
    }

    #[test]
    fn test_sell_frees_cash_for_same_call_buys() {
        let rm = manager();
        let signals = vec![
            signal("NEW", Signal::Buy, dec!(100), Some(dec!(5))),
            signal("OLD", Signal::Sell, dec!(100), Some(dec!(2))),
        ];
        let positions = HashMap::from([("OLD".to_string(), 50)]);

        // No free cash: the buy is only affordable with the sell proceeds.
        let orders = rm.evaluate(&signals, dec!(10000), dec!(0), &positions);

        assert_eq!(orders.len(), 2);
        // All sells precede all buys.
        assert_eq!(orders[0].action, TradeAction::Sell);
        assert_eq!(orders[0].ticker, "OLD");
        assert_eq!(orders[0].quantity, 50);
        assert_eq!(orders[1].action, TradeAction::Buy);
        assert_eq!(orders[1].ticker, "NEW");
        assert_eq!(orders[1].quantity, 20);
    }

    #[test]
    fn test_sell_and_rebuy_same_ticker_is_allowed() {
        let rm = manager();
        let signals = vec![
            signal("X", Signal::Sell, dec!(100), Some(dec!(5))),
            signal("X", Signal::Buy, dec!(100), Some(dec!(5))),
        ];
        let positions = HashMap::from([("X".to_string(), 30)]);

        let orders = rm.evaluate(&signals, dec!(10000), dec!(1000), &positions);

        // Sell pass removed X from the working set, so the buy is sized.
        assert_eq!(orders.len(), 2);
        assert_eq!(orders[0].action, TradeAction::Sell);
        assert_eq!(orders[1].action, TradeAction::Buy);
    }

    #[test]
    fn test_skips_unsizable_and_degenerate_signals() {
        let rm = manager();
        let signals = vec![
            signal("NOATR", Signal::Buy, dec!(100), None),
            signal("ZEROATR", Signal::Buy, dec!(100), Some(dec!(0))),
            // Stop would be 10 - 2*10 = -10.
            signal("DEGEN", Signal::Buy, dec!(10), Some(dec!(10))),
            signal("HOLD", Signal::Hold, dec!(100), Some(dec!(5))),
        ];

        let orders = rm.evaluate(&signals, dec!(10000), dec!(10000), &HashMap::new());
        assert!(orders.is_empty());
    }

    #[test]
    fn test_skips_sub_share_sizes() {
        let rm = manager();
        // Risk budget 200, stop distance 600: floor(0.33) = 0 shares.
        let signals = vec![signal("PRICY", Signal::Buy, dec!(5000), Some(dec!(300)))];

        let orders = rm.evaluate(&signals, dec!(10000), dec!(10000), &HashMap::new());
        assert!(orders.is_empty());
    }

    #[test]
    fn test_sell_without_position_is_ignored() {
        let rm = manager();
        let signals = vec![signal("GHOST", Signal::Sell, dec!(100), Some(dec!(5)))];

        let orders = rm.evaluate(&signals, dec!(10000), dec!(10000), &HashMap::new());
        assert!(orders.is_empty());
    }

    #[test]
    fn test_stop_priority_over_target() {
        let rm = manager();
        let positions = BTreeMap::from([(
            "X".to_string(),
            view(50, Some(dec!(90)), Some(dec!(110))),
        )]);
        // Both levels breached the same day.
        let market = MarketSnapshot::from([("X".to_string(), bar(dec!(95), dec!(112), dec!(88)))]);

        let orders = rm.check_intraday_stops(&positions, &market);

        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].price, dec!(90));
        assert_eq!(orders[0].quantity, 50);
        assert_eq!(orders[0].reason.as_deref(), Some("STOP_LOSS"));
    }

    #[test]
    fn test_gap_down_fills_at_open() {
        let rm = manager();
        let positions =
            BTreeMap::from([("X".to_string(), view(10, Some(dec!(90)), None))]);
        let market = MarketSnapshot::from([("X".to_string(), bar(dec!(85), dec!(87), dec!(80)))]);

        let orders = rm.check_intraday_stops(&positions, &market);

        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].price, dec!(85));
        assert_eq!(orders[0].reason.as_deref(), Some("STOP_LOSS_GAP"));
    }

    #[test]
    fn test_take_profit_fill_and_gap_up() {
        let rm = manager();
        let positions = BTreeMap::from([
            ("A".to_string(), view(10, None, Some(dec!(120)))),
            ("B".to_string(), view(10, None, Some(dec!(120)))),
        ]);
        let market = MarketSnapshot::from([
            // High reaches the target from below: fill at the target.
            ("A".to_string(), bar(dec!(115), dec!(121), dec!(114))),
            // Open already above the target: fill at the open.
            ("B".to_string(), bar(dec!(125), dec!(130), dec!(124))),
        ]);

        let orders = rm.check_intraday_stops(&positions, &market);

        assert_eq!(orders.len(), 2);
        assert_eq!(orders[0].ticker, "A");
        assert_eq!(orders[0].price, dec!(120));
        assert_eq!(orders[0].reason.as_deref(), Some("TAKE_PROFIT"));
        assert_eq!(orders[1].ticker, "B");
        assert_eq!(orders[1].price, dec!(125));
        assert_eq!(orders[1].reason.as_deref(), Some("TAKE_PROFIT_GAP"));
    }

    #[test]
    fn test_missing_bar_skips_position() {
        let rm = manager();
        let positions =
            BTreeMap::from([("X".to_string(), view(10, Some(dec!(90)), Some(dec!(110))))]);

        let orders = rm.check_intraday_stops(&positions, &MarketSnapshot::new());
        assert!(orders.is_empty());
    }
}
