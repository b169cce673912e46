//! Cash account model: a single scalar per portfolio.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// The portfolio's cash balance. Exactly one record per portfolio;
/// the currency is fixed for the portfolio's lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CashAccount {
    /// Available cash. Negative values are possible transiently and
    /// signal an accounting anomaly upstream, not a hard error here.
    pub amount: Decimal,

    /// ISO currency code (e.g. "EUR")
    pub currency: String,

    /// Last time the balance changed
    pub updated_at: DateTime<Utc>,
}

impl CashAccount {
    pub fn new(amount: Decimal, currency: impl Into<String>) -> Self {
        Self {
            amount,
            currency: currency.into(),
            updated_at: Utc::now(),
        }
    }
}
