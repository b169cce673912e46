//! Session recorder: persists one batch run's results to disk.
//!
//! A session is a timestamped directory holding one subdirectory per
//! strategy evaluated in that invocation: `equity_curve.csv`,
//! `trades.csv` and a `config.json` with the parameters used and the
//! derived metrics. Sessions are never mutated after the run.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use statrs::statistics::Statistics;
use tracing::info;

use crate::risk::RiskConfig;
use crate::settings::FeeConfig;
use crate::sim::{EquityPoint, RunResult};

/// Percent return over the run.
pub fn roi_pct(initial_capital: Decimal, final_equity: Decimal) -> f64 {
    if initial_capital == Decimal::ZERO {
        return 0.0;
    }
    ((final_equity - initial_capital) / initial_capital)
        .to_f64()
        .unwrap_or(0.0)
        * 100.0
}

/// Deepest peak-to-trough drop: min over time of
/// (equity - running_peak) / running_peak * 100. Zero or negative.
pub fn max_drawdown_pct(curve: &[EquityPoint]) -> f64 {
    let mut peak = Decimal::ZERO;
    let mut worst = 0.0f64;

    for point in curve {
        if point.equity > peak {
            peak = point.equity;
        }
        if peak > Decimal::ZERO {
            let dd = ((point.equity - peak) / peak).to_f64().unwrap_or(0.0) * 100.0;
            if dd < worst {
                worst = dd;
            }
        }
    }
    worst
}

/// Annualized Sharpe ratio from daily equity samples, 0% risk-free.
pub fn sharpe_ratio(curve: &[EquityPoint]) -> f64 {
    if curve.len() < 2 {
        return 0.0;
    }

    let returns: Vec<f64> = curve
        .windows(2)
        .filter_map(|w| {
            let prev = w[0].equity.to_f64()?;
            let curr = w[1].equity.to_f64()?;
            (prev > 0.0).then(|| (curr - prev) / prev)
        })
        .collect();

    if returns.is_empty() {
        return 0.0;
    }

    let mean = returns.clone().mean();
    let std_dev = returns.clone().std_dev();

    if std_dev > 0.0 {
        (mean / std_dev) * (252.0_f64).sqrt()
    } else {
        0.0
    }
}

/// Everything written to a strategy's `config.json`, and the body of
/// the CLI report.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub strategy: String,
    pub params: serde_json::Value,
    pub risk_params: RiskConfig,
    pub fees_config: FeeConfig,
    pub initial_capital: Decimal,
    pub final_equity: Decimal,
    pub total_trades: usize,
    pub total_fees: Decimal,
    pub roi_pct: f64,
    pub max_drawdown_pct: f64,
    pub sharpe_ratio: f64,
}

impl RunSummary {
    pub fn from_result(result: &RunResult, risk: &RiskConfig, fees: &FeeConfig) -> Self {
        Self {
            strategy: result.strategy.clone(),
            params: result.params.clone(),
            risk_params: risk.clone(),
            fees_config: fees.clone(),
            initial_capital: result.initial_capital,
            final_equity: result.final_equity,
            total_trades: result.trades.len(),
            total_fees: result.total_fees,
            roi_pct: roi_pct(result.initial_capital, result.final_equity),
            max_drawdown_pct: max_drawdown_pct(&result.equity_curve),
            sharpe_ratio: sharpe_ratio(&result.equity_curve),
        }
    }
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "\n{:=^50}", format!(" {} ", self.strategy.to_uppercase()))?;
        writeln!(f, "Initial Capital:  {:.2}", self.initial_capital)?;
        writeln!(f, "Final Equity:     {:.2}", self.final_equity)?;
        writeln!(f, "ROI:              {:+.2}%", self.roi_pct)?;
        writeln!(f, "Max Drawdown:     {:.2}%", self.max_drawdown_pct)?;
        writeln!(f, "Sharpe Ratio:     {:.2}", self.sharpe_ratio)?;
        writeln!(f, "Total Trades:     {}", self.total_trades)?;
        writeln!(f, "Total Fees:       {:.2}", self.total_fees)?;
        writeln!(f, "{:=^50}", "")?;
        Ok(())
    }
}

/// Materializes run results under a uniquely named session directory.
pub struct SessionRecorder {
    base_dir: PathBuf,
}

impl SessionRecorder {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Create a fresh session directory named by the current timestamp.
    /// A name collision gets an incrementing numeric suffix.
    pub fn create_session(&self) -> Result<PathBuf> {
        let stamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
        self.create_session_named(&stamp)
    }

    fn create_session_named(&self, stamp: &str) -> Result<PathBuf> {
        fs::create_dir_all(&self.base_dir)
            .with_context(|| format!("Failed to create {}", self.base_dir.display()))?;

        let mut candidate = self.base_dir.join(stamp);
        let mut suffix = 0u32;
        while candidate.exists() {
            suffix += 1;
            candidate = self.base_dir.join(format!("{stamp}-{suffix}"));
        }

        fs::create_dir(&candidate)
            .with_context(|| format!("Failed to create session {}", candidate.display()))?;
        info!(session = %candidate.display(), "Session created");
        Ok(candidate)
    }

    /// Write one strategy's results into its session subdirectory.
    pub fn record(&self, session: &Path, summary: &RunSummary, result: &RunResult) -> Result<()> {
        let dir = session.join(&result.strategy);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        write_equity_csv(&dir.join("equity_curve.csv"), &result.equity_curve)?;
        write_trades_csv(&dir.join("trades.csv"), result)?;

        let config = serde_json::to_string_pretty(summary).context("Failed to serialize summary")?;
        fs::write(dir.join("config.json"), config)
            .with_context(|| format!("Failed to write config.json in {}", dir.display()))?;

        info!(strategy = %result.strategy, dir = %dir.display(), "Results recorded");
        Ok(())
    }
}

fn write_equity_csv(path: &Path, curve: &[EquityPoint]) -> Result<()> {
    let mut file = File::create(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    writeln!(file, "date,equity")?;
    for point in curve {
        writeln!(file, "{},{}", point.date, point.equity)?;
    }
    Ok(())
}

fn write_trades_csv(path: &Path, result: &RunResult) -> Result<()> {
    let mut file = File::create(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    writeln!(file, "ticker,quantity,price,action,executed_at")?;
    for trade in &result.trades {
        writeln!(
            file,
            "{},{},{},{},{}",
            trade.ticker,
            trade.quantity,
            trade.price,
            trade.action.as_str(),
            trade.executed_at.to_rfc3339()
        )?;
    }
    Ok(())
}
