//! Event-driven simulation loop.
//!
//! Drives a portfolio through a historical date range on a fixed daily
//! cadence, composing risk-manager decisions with ledger state changes
//! and modeling the lag between signal computation and fill: entries
//! decided on the weekly decision day execute at the NEXT session's
//! open, while exits always execute at the earliest opportunity.

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use chrono::{Datelike, Duration, NaiveDate, Weekday};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::models::{closes, MarketSnapshot, Order, PriceHistory, SignalRecord, TradeAction, TradeRecord};
use crate::portfolio::Ledger;
use crate::risk::{RiskConfig, RiskManager};
use crate::settings::FeeConfig;
use crate::strategies::{self, Strategy};

/// Extra bars fetched before the simulation window so indicators are
/// warmed up by the first simulated day.
pub const WARM_UP_DAYS: i64 = 100;

/// One equity curve sample, taken after all of a day's activity.
#[derive(Debug, Clone, Serialize)]
pub struct EquityPoint {
    pub date: NaiveDate,
    pub equity: Decimal,
}

/// Completed run of one strategy over the simulation window.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub strategy: String,
    pub params: serde_json::Value,
    pub initial_capital: Decimal,
    pub final_equity: Decimal,
    pub total_fees: Decimal,
    pub equity_curve: Vec<EquityPoint>,
    pub trades: Vec<TradeRecord>,
}

/// Fixed inputs shared by every strategy in a batch run.
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub initial_capital: Decimal,
    pub currency: String,
    pub years: u32,
    pub decision_day: Weekday,
    pub risk: RiskConfig,
    pub fees: FeeConfig,
}

/// Per-day state machine: mark-to-market, pending fills, exit scan,
/// weekly evaluation, fees. Holds the pending-entry queue between days.
pub struct Simulator {
    risk: RiskManager,
    fees: FeeConfig,
    decision_day: Weekday,
    pending_entries: Vec<Order>,
    total_fees: Decimal,
}

impl Simulator {
    pub fn new(risk: RiskManager, fees: FeeConfig, decision_day: Weekday) -> Self {
        Self {
            risk,
            fees,
            decision_day,
            pending_entries: Vec::new(),
            total_fees: Decimal::ZERO,
        }
    }

    pub fn total_fees(&self) -> Decimal {
        self.total_fees
    }

    pub fn pending_entries(&self) -> &[Order] {
        &self.pending_entries
    }

    /// Queue entries for execution at the next session's open.
    pub fn queue_entries(&mut self, orders: impl IntoIterator<Item = Order>) {
        self.pending_entries.extend(orders);
    }

    /// Advance one simulated trading day. Returns end-of-day equity.
    pub fn step_day(
        &mut self,
        ledger: &mut Ledger,
        date: NaiveDate,
        market: &MarketSnapshot,
        signals: &[SignalRecord],
    ) -> Decimal {
        // 1. Mark all held positions to today's close.
        ledger.mark_to_market(&closes(market));

        // 2. Fill entries queued on the prior signal day at today's open.
        //    The queue is cleared regardless of individual outcomes; an
        //    order whose ticker has no bar today is dropped, not retried.
        let queued = std::mem::take(&mut self.pending_entries);
        for mut order in queued {
            let Some(bar) = market.get(&order.ticker) else {
                debug!(ticker = %order.ticker, %date, "Dropped pending entry: no bar today");
                continue;
            };
            order.price = bar.open;
            self.execute_with_fee(ledger, &order);
        }

        // 3. Scan open positions (including ones just entered) against
        //    today's high/low and exit at the stop/target-derived price.
        let exits = self
            .risk
            .check_intraday_stops(&ledger.positions_snapshot(), market);
        for order in &exits {
            self.execute_with_fee(ledger, order);
        }

        // 4. Weekly signal evaluation. Sells are risk-reducing and run
        //    same-day; buys are risk-adding and wait for the next open.
        if date.weekday() == self.decision_day {
            let todays: Vec<SignalRecord> = signals
                .iter()
                .filter(|s| s.date == date)
                .cloned()
                .collect();

            if !todays.is_empty() {
                let orders = self.risk.evaluate(
                    &todays,
                    ledger.total_equity(),
                    ledger.cash_amount(),
                    &ledger.positions_counts(),
                );

                for order in orders {
                    match order.action {
                        TradeAction::Sell => {
                            self.execute_with_fee(ledger, &order);
                        }
                        TradeAction::Buy => self.pending_entries.push(order),
                    }
                }
            }
        }

        ledger.total_equity()
    }

    /// 5. Apply the order and charge commission on success. The fee is
    ///    debited from cash separately from the trade price.
    fn execute_with_fee(&mut self, ledger: &mut Ledger, order: &Order) -> bool {
        if !ledger.execute_order(order) {
            return false;
        }
        let commission = self.fees.commission(order.value());
        ledger.debit_fee(commission);
        self.total_fees += commission;
        true
    }
}

/// Live-path entry fill. Unlike the backtest's fire-and-clear
/// market-on-open fill, a pending BUY here behaves as a resting limit
/// order: it fills when the day traded through the limit, at the better
/// of open and limit, and carries forward otherwise. Returns the
/// unfilled remainder and the commission charged.
pub fn fill_resting_entries(
    ledger: &mut Ledger,
    pending: Vec<Order>,
    market: &MarketSnapshot,
    fees: &FeeConfig,
) -> (Vec<Order>, Decimal) {
    let mut remaining = Vec::new();
    let mut fees_paid = Decimal::ZERO;

    for mut order in pending {
        let Some(bar) = market.get(&order.ticker) else {
            remaining.push(order);
            continue;
        };

        if order.action == TradeAction::Buy && bar.low <= order.price {
            let exec_price = bar.open.min(order.price);
            info!(
                ticker = %order.ticker,
                limit = %order.price,
                exec = %exec_price,
                "Pending entry filled"
            );
            order.price = exec_price;
            if ledger.execute_order(&order) {
                let commission = fees.commission(order.value());
                ledger.debit_fee(commission);
                fees_paid += commission;
            }
        } else {
            remaining.push(order);
        }
    }

    (remaining, fees_paid)
}

/// Run one strategy over the historical window.
///
/// The simulation window is anchored to the LAST bar date in the data
/// (end minus `years * 365` days), so runs are reproducible against a
/// fixed data set. Earlier bars serve as indicator warm-up only.
pub fn run_backtest(
    strategy: &dyn Strategy,
    params: serde_json::Value,
    history: &PriceHistory,
    config: &SimConfig,
) -> Result<RunResult> {
    if history.is_empty() {
        bail!("no historical data loaded");
    }

    let signals = strategy.compute(history);
    if signals.is_empty() {
        bail!("strategy '{}' produced no signals", strategy.name());
    }

    // Timeline: every date with at least one bar, with its market snapshot.
    let mut by_date: BTreeMap<NaiveDate, MarketSnapshot> = BTreeMap::new();
    for (ticker, bars) in history {
        for bar in bars {
            by_date
                .entry(bar.date)
                .or_default()
                .insert(ticker.clone(), bar.clone());
        }
    }

    let Some(end) = by_date.keys().next_back().copied() else {
        bail!("no historical bars loaded");
    };
    let start = end - Duration::days(config.years as i64 * 365);

    let mut ledger = Ledger::new();
    ledger.set_cash(config.initial_capital, &config.currency);

    let mut simulator = Simulator::new(
        RiskManager::new(config.risk.clone())?,
        config.fees.clone(),
        config.decision_day,
    );

    info!(
        strategy = strategy.name(),
        %start,
        %end,
        capital = %config.initial_capital,
        "Simulation start"
    );

    let mut equity_curve = Vec::new();
    for (date, market) in by_date.range(start..) {
        let equity = simulator.step_day(&mut ledger, *date, market, &signals);
        equity_curve.push(EquityPoint {
            date: *date,
            equity,
        });
    }

    let final_equity = equity_curve
        .last()
        .map(|p| p.equity)
        .unwrap_or(config.initial_capital);

    info!(
        strategy = strategy.name(),
        final_equity = %final_equity,
        trades = ledger.trades().len(),
        fees = %simulator.total_fees(),
        "Simulation complete"
    );

    Ok(RunResult {
        strategy: strategy.name().to_string(),
        params,
        initial_capital: config.initial_capital,
        final_equity,
        total_fees: simulator.total_fees(),
        equity_curve,
        trades: ledger.trades().to_vec(),
    })
}

/// Run several strategy configurations against the same data. Each gets
/// an independent ledger and risk manager; a failing strategy is logged
/// and skipped without aborting its siblings.
pub fn run_batch(
    jobs: &[(String, serde_json::Value)],
    history: &PriceHistory,
    config: &SimConfig,
) -> Vec<RunResult> {
    let mut results = Vec::new();

    for (name, params) in jobs {
        let strategy = match strategies::build(name, params) {
            Ok(s) => s,
            Err(e) => {
                warn!(strategy = %name, error = %e, "Strategy skipped: configuration error");
                continue;
            }
        };

        match run_backtest(strategy.as_ref(), params.clone(), history, config) {
            Ok(result) => results.push(result),
            Err(e) => warn!(strategy = %name, error = %e, "Strategy skipped"),
        }
    }

    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DailyBar, Signal};
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    fn fees() -> FeeConfig {
        FeeConfig {
            fixed: dec!(1.0),
            percentage: dec!(0.001),
        }
    }

    fn simulator() -> Simulator {
        let risk = RiskManager::new(RiskConfig {
            risk_per_trade: dec!(0.02),
            stop_atr_multiplier: dec!(2.0),
        })
        .unwrap();
        Simulator::new(risk, fees(), Weekday::Fri)
    }

    fn funded_ledger() -> Ledger {
        let mut ledger = Ledger::new();
        ledger.set_cash(dec!(10000), "EUR");
        ledger
    }

    fn bar(date: &str, open: Decimal, high: Decimal, low: Decimal, close: Decimal) -> DailyBar {
        DailyBar {
            date: date.parse().unwrap(),
            open,
            high,
            low,
            close,
            volume: 1_000,
        }
    }

    fn buy_signal(ticker: &str, date: &str, price: Decimal, atr: Decimal) -> SignalRecord {
        SignalRecord {
            ticker: ticker.to_string(),
            date: date.parse().unwrap(),
            signal: Signal::Buy,
            price,
            atr: Some(atr),
            meta: HashMap::new(),
        }
    }

    fn sell_signal(ticker: &str, date: &str, price: Decimal) -> SignalRecord {
        SignalRecord {
            ticker: ticker.to_string(),
            date: date.parse().unwrap(),
            signal: Signal::Sell,
            price,
            atr: Some(dec!(1)),
            meta: HashMap::new(),
        }
    }

    #[test]
    fn test_fee_applied_on_queued_entry_fill() {
        let mut sim = simulator();
        let mut ledger = funded_ledger();

        sim.queue_entries([Order {
            ticker: "X".to_string(),
            action: TradeAction::Buy,
            quantity: 20,
            price: dec!(99), // sizing-time price, replaced by the open
            stop_loss: Some(dec!(90)),
            take_profit: Some(dec!(120)),
            reason: None,
        }]);

        // Monday session: open 100.
        let market = MarketSnapshot::from([(
            "X".to_string(),
            bar("2024-03-04", dec!(100), dec!(101), dec!(99), dec!(100)),
        )]);
        sim.step_day(&mut ledger, "2024-03-04".parse().unwrap(), &market, &[]);

        // Filled at the open, not the sizing price: 20 * 100 = 2000,
        // commission 1 + 2 = 3, total debit 2003.
        assert_eq!(ledger.cash_amount(), dec!(7997));
        assert_eq!(ledger.positions_counts().get("X"), Some(&20));
        assert_eq!(sim.total_fees(), dec!(3));
        assert_eq!(ledger.trades()[0].price, dec!(100));
        assert!(sim.pending_entries().is_empty());
    }

    #[test]
    fn test_pending_queue_cleared_when_bar_missing() {
        let mut sim = simulator();
        let mut ledger = funded_ledger();

        sim.queue_entries([Order {
            ticker: "GONE".to_string(),
            action: TradeAction::Buy,
            quantity: 10,
            price: dec!(50),
            stop_loss: None,
            take_profit: None,
            reason: None,
        }]);

        sim.step_day(
            &mut ledger,
            "2024-03-04".parse().unwrap(),
            &MarketSnapshot::new(),
            &[],
        );

        // No retry, no carry-forward.
        assert!(sim.pending_entries().is_empty());
        assert_eq!(ledger.position_count(), 0);
        assert_eq!(ledger.cash_amount(), dec!(10000));
    }

    #[test]
    fn test_decision_day_queues_buys_and_sells_same_day() {
        let mut sim = simulator();
        let mut ledger = funded_ledger();

        // Existing holding to be exited by the weekly signal.
        ledger.execute_order(&Order {
            ticker: "OLD".to_string(),
            action: TradeAction::Buy,
            quantity: 10,
            price: dec!(100),
            stop_loss: None,
            take_profit: None,
            reason: None,
        });

        // Friday 2024-03-01.
        let market = MarketSnapshot::from([
            (
                "OLD".to_string(),
                bar("2024-03-01", dec!(104), dec!(106), dec!(103), dec!(105)),
            ),
            (
                "NEW".to_string(),
                bar("2024-03-01", dec!(99), dec!(101), dec!(98), dec!(100)),
            ),
        ]);
        let signals = vec![
            sell_signal("OLD", "2024-03-01", dec!(105)),
            buy_signal("NEW", "2024-03-01", dec!(100), dec!(5)),
        ];

        sim.step_day(&mut ledger, "2024-03-01".parse().unwrap(), &market, &signals);

        // The sell executed today; the buy is queued for the next open.
        assert_eq!(ledger.position_count(), 0);
        assert_eq!(sim.pending_entries().len(), 1);
        assert_eq!(sim.pending_entries()[0].ticker, "NEW");

        // 9000 + 1050 proceeds - (1 + 1.05) commission.
        assert_eq!(ledger.cash_amount(), dec!(10047.95));
    }

    #[test]
    fn test_signals_ignored_off_decision_day() {
        let mut sim = simulator();
        let mut ledger = funded_ledger();

        // Thursday 2024-02-29.
        let market = MarketSnapshot::from([(
            "X".to_string(),
            bar("2024-02-29", dec!(99), dec!(101), dec!(98), dec!(100)),
        )]);
        let signals = vec![buy_signal("X", "2024-02-29", dec!(100), dec!(5))];

        sim.step_day(&mut ledger, "2024-02-29".parse().unwrap(), &market, &signals);

        assert!(sim.pending_entries().is_empty());
        assert!(ledger.trades().is_empty());
    }

    #[test]
    fn test_stop_exit_executes_at_stop_price() {
        let mut sim = simulator();
        let mut ledger = funded_ledger();

        ledger.execute_order(&Order {
            ticker: "X".to_string(),
            action: TradeAction::Buy,
            quantity: 10,
            price: dec!(100),
            stop_loss: Some(dec!(90)),
            take_profit: Some(dec!(120)),
            reason: None,
        });

        let market = MarketSnapshot::from([(
            "X".to_string(),
            bar("2024-03-04", dec!(95), dec!(96), dec!(88), dec!(89)),
        )]);
        sim.step_day(&mut ledger, "2024-03-04".parse().unwrap(), &market, &[]);

        assert_eq!(ledger.position_count(), 0);
        // 9000 + 10 * 90 - (1 + 0.9) commission.
        assert_eq!(ledger.cash_amount(), dec!(9898.10));
        let exit = ledger.trades().last().unwrap();
        assert_eq!(exit.action, TradeAction::Sell);
        assert_eq!(exit.price, dec!(90));
    }

    #[test]
    fn test_resting_entry_fills_at_better_of_open_and_limit() {
        let mut ledger = funded_ledger();

        let pending = vec![
            Order {
                ticker: "A".to_string(),
                action: TradeAction::Buy,
                quantity: 10,
                price: dec!(100), // limit
                stop_loss: Some(dec!(90)),
                take_profit: None,
                reason: None,
            },
            Order {
                ticker: "B".to_string(),
                action: TradeAction::Buy,
                quantity: 10,
                price: dec!(50),
                stop_loss: None,
                take_profit: None,
                reason: None,
            },
        ];

        let market = MarketSnapshot::from([
            // Opened below the limit: fill at the open.
            ("A".to_string(), bar("2024-03-04", dec!(98), dec!(99), dec!(97), dec!(98))),
            // Never traded down to the limit: carried forward.
            ("B".to_string(), bar("2024-03-04", dec!(60), dec!(62), dec!(55), dec!(61))),
        ]);

        let (remaining, fees_paid) =
            fill_resting_entries(&mut ledger, pending, &market, &fees());

        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].ticker, "B");
        assert_eq!(ledger.trades().len(), 1);
        assert_eq!(ledger.trades()[0].price, dec!(98));
        // 10 * 98 = 980, commission 1 + 0.98.
        assert_eq!(fees_paid, dec!(1.98));
        assert_eq!(ledger.cash_amount(), dec!(10000) - dec!(980) - dec!(1.98));
    }

    #[test]
    fn test_resting_entry_without_bar_is_carried() {
        let mut ledger = funded_ledger();
        let pending = vec![Order {
            ticker: "GONE".to_string(),
            action: TradeAction::Buy,
            quantity: 10,
            price: dec!(50),
            stop_loss: None,
            take_profit: None,
            reason: None,
        }];

        let (remaining, fees_paid) =
            fill_resting_entries(&mut ledger, pending, &MarketSnapshot::new(), &fees());

        assert_eq!(remaining.len(), 1);
        assert_eq!(fees_paid, Decimal::ZERO);
    }

    struct FixedStrategy {
        signals: Vec<SignalRecord>,
    }

    impl Strategy for FixedStrategy {
        fn name(&self) -> &str {
            "fixed"
        }

        fn compute(&self, _history: &PriceHistory) -> Vec<SignalRecord> {
            self.signals.clone()
        }
    }

    #[test]
    fn test_run_backtest_produces_full_equity_curve() {
        // Friday signal, Monday fill, flat prices afterwards.
        let bars = vec![
            bar("2024-03-01", dec!(100), dec!(101), dec!(99), dec!(100)),
            bar("2024-03-04", dec!(102), dec!(103), dec!(101), dec!(102)),
            bar("2024-03-05", dec!(102), dec!(103), dec!(101), dec!(102)),
        ];
        let history = PriceHistory::from([("X".to_string(), bars)]);
        let strategy = FixedStrategy {
            signals: vec![buy_signal("X", "2024-03-01", dec!(100), dec!(5))],
        };

        let config = SimConfig {
            initial_capital: dec!(10000),
            currency: "EUR".to_string(),
            years: 1,
            decision_day: Weekday::Fri,
            risk: RiskConfig {
                risk_per_trade: dec!(0.02),
                stop_atr_multiplier: dec!(2.0),
            },
            fees: fees(),
        };

        let result =
            run_backtest(&strategy, serde_json::Value::Null, &history, &config).unwrap();

        assert_eq!(result.equity_curve.len(), 3);
        assert_eq!(result.trades.len(), 1);
        // 20 shares filled at Monday's open of 102.
        assert_eq!(result.trades[0].price, dec!(102));
        assert_eq!(result.trades[0].quantity, 20);
        // Commission: 1 + 2040 * 0.001 = 3.04.
        assert_eq!(result.total_fees, dec!(3.040));
        // Final equity: 10000 - 2040 - 3.04 + 20 * 102.
        assert_eq!(result.final_equity, dec!(9996.960));
    }

    #[test]
    fn test_run_backtest_without_signals_fails() {
        let history = PriceHistory::from([(
            "X".to_string(),
            vec![bar("2024-03-01", dec!(100), dec!(101), dec!(99), dec!(100))],
        )]);
        let strategy = FixedStrategy { signals: vec![] };

        let config = SimConfig {
            initial_capital: dec!(10000),
            currency: "EUR".to_string(),
            years: 1,
            decision_day: Weekday::Fri,
            risk: RiskConfig {
                risk_per_trade: dec!(0.02),
                stop_atr_multiplier: dec!(2.0),
            },
            fees: fees(),
        };

        assert!(run_backtest(&strategy, serde_json::Value::Null, &history, &config).is_err());
    }

    #[test]
    fn test_run_batch_skips_failing_strategy() {
        let history = PriceHistory::from([(
            "X".to_string(),
            vec![bar("2024-03-01", dec!(100), dec!(101), dec!(99), dec!(100))],
        )]);

        let config = SimConfig {
            initial_capital: dec!(10000),
            currency: "EUR".to_string(),
            years: 1,
            decision_day: Weekday::Fri,
            risk: RiskConfig {
                risk_per_trade: dec!(0.02),
                stop_atr_multiplier: dec!(2.0),
            },
            fees: fees(),
        };

        // One unknown name, one real strategy without enough history.
        let jobs = vec![
            ("nope".to_string(), serde_json::json!({})),
            (
                "rsi".to_string(),
                serde_json::json!({
                    "rsi_period": 14, "rsi_lower": 30.0, "rsi_upper": 70.0, "atr_period": 14
                }),
            ),
        ];

        let results = run_batch(&jobs, &history, &config);
        assert!(results.is_empty());
    }
}
