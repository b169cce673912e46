//! swingtrader: personal swing-trading automation.
//!
//! Weekly signals (RSI mean-reversion, EMA crossover) sized under a
//! fixed fractional-risk budget, with daily stop/target shadowing and a
//! backtest lab writing per-strategy session directories.

mod api;
mod db;
mod models;
mod portfolio;
mod risk;
mod session;
mod settings;
mod sim;
mod strategies;

use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use crate::api::DataClient;
use crate::db::Database;
use crate::models::TradeAction;
use crate::portfolio::Ledger;
use crate::risk::RiskManager;
use crate::session::{RunSummary, SessionRecorder};
use crate::settings::Settings;
use crate::sim::{run_batch, SimConfig, WARM_UP_DAYS};

/// Swing-trading automation CLI.
#[derive(Parser)]
#[command(name = "swingtrader")]
#[command(about = "Weekly swing-trading signals with risk-sized execution", long_about = None)]
struct Cli {
    /// Database file path
    #[arg(short, long, default_value = "sqlite://./swingtrader.db?mode=rwc", env = "SWINGTRADER_DB")]
    database: String,

    /// Settings file path
    #[arg(short, long, default_value = "config/settings.json", env = "SWINGTRADER_SETTINGS")]
    settings: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database schema
    Init,

    /// Download historical bars for the configured universe
    Fetch {
        /// Years of history to download
        #[arg(short, long, default_value = "3")]
        years: u32,
    },

    /// Run backtests and record a session directory
    Backtest {
        /// Strategy name (defaults to all configured strategies)
        #[arg(short = 'S', long)]
        strategy: Option<String>,

        /// JSON parameter override for the selected strategy
        #[arg(short, long, requires = "strategy")]
        params: Option<String>,

        /// Initial capital for the simulation
        #[arg(short, long, default_value = "10000")]
        capital: f64,

        /// Simulation horizon in years
        #[arg(short, long, default_value = "2")]
        years: u32,

        /// Base directory for session output
        #[arg(short, long, default_value = "data/backtests")]
        output: PathBuf,
    },

    /// Weekly run: evaluate signals, exit same-day, queue entries
    Weekly,

    /// Daily run: stop/target scan and pending-entry fills
    Daily,

    /// Show portfolio state and recent trades
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Fail fast: no run starts with missing risk or fee parameters.
    let settings = Settings::load(&cli.settings)?;

    let db = Database::new(&cli.database).await?;

    match cli.command {
        Commands::Init => {
            // Migrations already ran on connect.
            println!("Database schema ready at {}", cli.database);
        }

        Commands::Fetch { years } => {
            let client = DataClient::new()?;
            let days = years as i64 * 365 + WARM_UP_DAYS;

            info!(tickers = settings.universe.len(), days = days, "Fetching universe history");

            let history = client.fetch_history(&settings.universe, days).await?;
            if history.is_empty() {
                println!("No data fetched. Check the ticker universe in settings.");
                return Ok(());
            }

            let mut total = 0usize;
            for (ticker, bars) in &history {
                db.upsert_bars(ticker, bars).await?;
                total += bars.len();
            }

            println!("Stored {} bars for {} tickers.", total, history.len());
        }

        Commands::Backtest {
            strategy,
            params,
            capital,
            years,
            output,
        } => {
            let history = db.load_history(years as i64 * 365 + WARM_UP_DAYS).await?;
            if history.is_empty() {
                println!("No historical data in the database. Run 'swingtrader fetch' first.");
                return Ok(());
            }

            // One strategy by name (optionally with overridden params),
            // or every configured one.
            let jobs: Vec<(String, serde_json::Value)> = match strategy {
                Some(name) => {
                    let block = match params {
                        Some(raw) => serde_json::from_str(&raw)
                            .context("--params is not valid JSON")?,
                        None => settings.strategy_params(&name)?.clone(),
                    };
                    vec![(name, block)]
                }
                None => {
                    let names: BTreeSet<&String> = settings.strategies.keys().collect();
                    names
                        .into_iter()
                        .map(|n| (n.clone(), settings.strategies[n].clone()))
                        .collect()
                }
            };

            let config = SimConfig {
                initial_capital: Decimal::try_from(capital)?,
                currency: settings.currency.clone(),
                years,
                decision_day: settings.decision_day()?,
                risk: settings.risk_params.clone(),
                fees: settings.fees_config.clone(),
            };

            println!("\n=== Backtest ===");
            println!("Capital:    {}", capital);
            println!("Years:      {}", years);
            println!("Strategies: {}", jobs.len());
            println!("Tickers:    {}", history.len());

            let results = run_batch(&jobs, &history, &config);
            if results.is_empty() {
                println!("\nNo strategy produced a result. See the log for details.");
                return Ok(());
            }

            let recorder = SessionRecorder::new(&output);
            let session = recorder.create_session()?;

            for result in &results {
                let summary =
                    RunSummary::from_result(result, &settings.risk_params, &settings.fees_config);
                println!("{summary}");

                // A failed write loses the artifact, not the batch.
                if let Err(e) = recorder.record(&session, &summary, result) {
                    error!(strategy = %result.strategy, error = %e, "Failed to record results");
                }
            }

            println!("Session saved: {}", session.display());
        }

        Commands::Weekly => {
            run_weekly(&db, &settings).await?;
        }

        Commands::Daily => {
            run_daily(&db, &settings).await?;
        }

        Commands::Status => {
            let mut ledger = Ledger::new();
            ledger.load(db.load_snapshot().await?);

            println!("\n=== Portfolio ===");
            println!(
                "Cash:       {:.2} {}",
                ledger.cash_amount(),
                ledger.currency().unwrap_or("-")
            );
            println!("Equity:     {:.2}", ledger.total_equity());
            println!("Positions:  {}", ledger.position_count());

            if ledger.position_count() > 0 {
                println!("\n{:<8} {:>8} {:>10} {:>10} {:>10}", "TICKER", "QTY", "PRICE", "STOP", "TARGET");
                println!("{}", "-".repeat(50));
                for pos in ledger.positions() {
                    println!(
                        "{:<8} {:>8} {:>10.2} {:>10} {:>10}",
                        pos.ticker,
                        pos.quantity,
                        pos.price,
                        pos.stop_loss.map(|d| format!("{d:.2}")).unwrap_or_else(|| "-".into()),
                        pos.take_profit.map(|d| format!("{d:.2}")).unwrap_or_else(|| "-".into()),
                    );
                }
            }

            let pending = db.load_pending_orders().await?;
            if !pending.is_empty() {
                println!("\n=== Pending Orders ===");
                for order in &pending {
                    println!(
                        "  {} {} x{} @ {:.2}",
                        order.action.as_str(),
                        order.ticker,
                        order.quantity,
                        order.price
                    );
                }
            }

            let recent = ledger.trades_history(10);
            if !recent.is_empty() {
                println!("\n=== Recent Trades ===");
                for trade in recent {
                    println!(
                        "  {} {} {} x{} @ {:.2}",
                        trade.executed_at.format("%Y-%m-%d"),
                        trade.action.as_str(),
                        trade.ticker,
                        trade.quantity,
                        trade.price
                    );
                }
            }
        }
    }

    Ok(())
}

/// Weekly run: refresh data, compute the active strategy's signals for
/// the latest date, exit sold names same-day and queue sized entries
/// for the next session.
async fn run_weekly(db: &Database, settings: &Settings) -> Result<()> {
    info!("Weekly run start");

    let mut ledger = Ledger::new();
    ledger.load(db.load_snapshot().await?);
    if ledger.currency().is_none() {
        ledger.set_cash(Decimal::ZERO, &settings.currency);
    }
    info!(equity = %ledger.total_equity(), "Portfolio loaded");

    // Universe plus anything we hold.
    let mut tickers: BTreeSet<String> = settings.universe.iter().cloned().collect();
    tickers.extend(ledger.positions_counts().into_keys());
    let tickers: Vec<String> = tickers.into_iter().collect();

    let client = DataClient::new()?;
    let fresh = client.fetch_history(&tickers, 7).await?;
    for (ticker, bars) in &fresh {
        db.upsert_bars(ticker, bars).await?;
    }

    let history = db.load_history(365 + WARM_UP_DAYS).await?;
    if history.is_empty() {
        warn!("No historical data available; weekly run aborted");
        return Ok(());
    }

    let params = settings.strategy_params(&settings.active_strategy)?;
    let strategy = strategies::build(&settings.active_strategy, params)?;
    let signals = strategy.compute(&history);
    if signals.is_empty() {
        warn!(strategy = %strategy.name(), "Strategy produced no signals");
        return Ok(());
    }

    // Latest signal date only (the decision day's batch).
    let last_date = signals.iter().map(|s| s.date).max().context("no signal dates")?;
    let latest: Vec<_> = signals.into_iter().filter(|s| s.date == last_date).collect();
    info!(date = %last_date, rows = latest.len(), "Evaluating latest signals");

    let risk = RiskManager::new(settings.risk_params.clone())?;
    let orders = risk.evaluate(
        &latest,
        ledger.total_equity(),
        ledger.cash_amount(),
        &ledger.positions_counts(),
    );

    if orders.is_empty() {
        info!("No orders generated");
        db.save_pending_orders(&[]).await?;
        return Ok(());
    }

    // Exits are risk-reducing: apply them now. Entries wait for the
    // next session's open and go to the pending queue.
    let mut pending = Vec::new();
    for order in orders {
        info!(
            action = order.action.as_str(),
            ticker = %order.ticker,
            quantity = order.quantity,
            price = %order.price,
            "Order"
        );
        match order.action {
            TradeAction::Sell => {
                if ledger.execute_order(&order) {
                    let fee = settings.fees_config.commission(order.value());
                    ledger.debit_fee(fee);
                }
            }
            TradeAction::Buy => pending.push(order),
        }
    }

    db.save_pending_orders(&pending).await?;
    db.save_snapshot(&ledger.export_snapshot()).await?;

    info!(
        pending = pending.len(),
        equity = %ledger.total_equity(),
        "Weekly run complete"
    );
    Ok(())
}

/// Daily run: refresh bars, scan stops/targets, fill pending entries
/// with resting-limit semantics, persist the ledger.
async fn run_daily(db: &Database, settings: &Settings) -> Result<()> {
    info!("Daily run start");

    let mut ledger = Ledger::new();
    ledger.load(db.load_snapshot().await?);
    info!(equity = %ledger.total_equity(), "Portfolio loaded");

    let pending = db.load_pending_orders().await?;

    // Universe, holdings and tickers with resting orders.
    let mut tickers: BTreeSet<String> = settings.universe.iter().cloned().collect();
    tickers.extend(ledger.positions_counts().into_keys());
    tickers.extend(pending.iter().map(|o| o.ticker.clone()));
    let tickers: Vec<String> = tickers.into_iter().collect();

    let client = DataClient::new()?;
    let fresh = client.fetch_history(&tickers, 5).await?;
    if fresh.is_empty() {
        warn!("No market data downloaded; daily run aborted");
        return Ok(());
    }
    for (ticker, bars) in &fresh {
        db.upsert_bars(ticker, bars).await?;
    }

    let market = db.latest_bars().await?;

    // Mark-to-market at the latest close.
    ledger.mark_to_market(&models::closes(&market));

    // Stop/target exits at the derived price, fees on execution.
    let risk = RiskManager::new(settings.risk_params.clone())?;
    let exits = risk.check_intraday_stops(&ledger.positions_snapshot(), &market);
    for order in &exits {
        if ledger.execute_order(order) {
            let fee = settings.fees_config.commission(order.value());
            ledger.debit_fee(fee);
        }
    }

    let queued = pending.len();
    let (remaining, _fees_paid) =
        sim::fill_resting_entries(&mut ledger, pending, &market, &settings.fees_config);

    let filled = queued - remaining.len();
    if filled > 0 || !exits.is_empty() {
        info!(filled = filled, exits = exits.len(), "Executions applied");
    }

    db.save_pending_orders(&remaining).await?;
    db.save_snapshot(&ledger.export_snapshot()).await?;

    info!(equity = %ledger.total_equity(), "Daily run complete");
    Ok(())
}
