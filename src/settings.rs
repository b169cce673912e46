//! Settings file: risk, fee, universe and strategy configuration.
//!
//! Policy: FAIL FAST. Risk and fee parameters have no defaults — a
//! missing or invalid settings file aborts before any simulation work.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use chrono::Weekday;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::risk::RiskConfig;

/// Commission model: a fixed amount plus a fraction of trade value,
/// charged on every executed order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeConfig {
    /// Flat amount per order
    pub fixed: Decimal,

    /// Fraction of trade value (e.g. 0.001 for 0.1%)
    pub percentage: Decimal,
}

impl FeeConfig {
    pub fn commission(&self, trade_value: Decimal) -> Decimal {
        self.fixed + trade_value * self.percentage
    }

    pub fn validate(&self) -> Result<()> {
        if self.fixed < Decimal::ZERO || self.percentage < Decimal::ZERO {
            bail!(
                "fee parameters must be non-negative (fixed={}, percentage={})",
                self.fixed,
                self.percentage
            );
        }
        Ok(())
    }
}

/// Full application settings, loaded from a JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Portfolio currency, fixed for the portfolio lifetime
    #[serde(default = "default_currency")]
    pub currency: String,

    /// Ticker universe scanned by the strategies
    pub universe: Vec<String>,

    /// Strategy used by the live weekly run
    pub active_strategy: String,

    /// Weekday of the weekly signal evaluation (e.g. "FRI")
    #[serde(default = "default_decision_weekday")]
    pub decision_weekday: String,

    /// Sizing parameters, required and strictly positive
    pub risk_params: RiskConfig,

    /// Commission parameters, required
    pub fees_config: FeeConfig,

    /// Per-strategy parameter blocks, keyed by strategy name
    pub strategies: HashMap<String, serde_json::Value>,
}

fn default_currency() -> String {
    "EUR".to_string()
}

fn default_decision_weekday() -> String {
    "FRI".to_string()
}

impl Settings {
    /// Read and validate the settings file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Settings file not found: {}", path.display()))?;
        let settings: Settings = serde_json::from_str(&raw)
            .with_context(|| format!("Settings file is not valid JSON: {}", path.display()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        self.risk_params.validate()?;
        self.fees_config.validate()?;
        self.decision_day()?;
        if !self.strategies.contains_key(&self.active_strategy) {
            bail!(
                "active_strategy '{}' has no parameter block in 'strategies'",
                self.active_strategy
            );
        }
        Ok(())
    }

    /// Parsed weekly decision day.
    pub fn decision_day(&self) -> Result<Weekday> {
        self.decision_weekday
            .parse::<Weekday>()
            .map_err(|_| anyhow!("invalid decision_weekday: '{}'", self.decision_weekday))
    }

    /// Parameter block for one configured strategy.
    pub fn strategy_params(&self, name: &str) -> Result<&serde_json::Value> {
        self.strategies
            .get(name)
            .ok_or_else(|| anyhow!("strategy '{name}' is not configured"))
    }
}
