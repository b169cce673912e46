//! Stooq daily-bar client: the historical price provider.
//!
//! Stooq serves end-of-day OHLCV as plain CSV with no API key, which is
//! plenty for a weekly swing system. Transient HTTP failures are
//! retried with exponential backoff; a ticker that still fails is
//! skipped with a warning so the rest of the batch proceeds.

use std::str::FromStr;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use backoff::ExponentialBackoff;
use chrono::{Duration, NaiveDate, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::models::{DailyBar, PriceHistory};

const STOOQ_BASE: &str = "https://stooq.com";
const DEFAULT_TIMEOUT: StdDuration = StdDuration::from_secs(30);

/// Client for the Stooq end-of-day data endpoint (read-only).
pub struct DataClient {
    client: Client,
    base_url: String,
}

impl DataClient {
    /// Create a new data client with default settings.
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: STOOQ_BASE.to_string(),
        })
    }

    /// Create with custom base URL (for testing).
    pub fn with_base_url(base_url: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client, base_url })
    }

    /// Fetch daily bars for one ticker over a date range.
    pub async fn fetch_daily(
        &self,
        ticker: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyBar>> {
        let url = format!(
            "{}/q/d/l/?s={}&d1={}&d2={}&i=d",
            self.base_url,
            ticker.to_lowercase(),
            start.format("%Y%m%d"),
            end.format("%Y%m%d"),
        );

        debug!(url = %url, "Fetching daily bars");

        let body = backoff::future::retry(ExponentialBackoff::default(), || async {
            let response = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(|e| backoff::Error::transient(anyhow::Error::from(e)))?;

            let status = response.status();
            if status.is_server_error() {
                return Err(backoff::Error::transient(anyhow::anyhow!(
                    "Stooq returned {status}"
                )));
            }
            if !status.is_success() {
                return Err(backoff::Error::permanent(anyhow::anyhow!(
                    "Stooq request failed: {status}"
                )));
            }

            response
                .text()
                .await
                .map_err(|e| backoff::Error::transient(anyhow::Error::from(e)))
        })
        .await
        .with_context(|| format!("Failed to fetch bars for {ticker}"))?;

        parse_csv(&body)
    }

    /// Fetch the last `days` days for a batch of tickers. Tickers that
    /// fail or return nothing are skipped, not fatal.
    pub async fn fetch_history(&self, tickers: &[String], days: i64) -> Result<PriceHistory> {
        let end = Utc::now().date_naive();
        let start = end - Duration::days(days);

        let fetches = tickers.iter().map(|ticker| async move {
            (ticker.clone(), self.fetch_daily(ticker, start, end).await)
        });

        let mut history = PriceHistory::new();
        for (ticker, result) in futures::future::join_all(fetches).await {
            match result {
                Ok(bars) if bars.is_empty() => {
                    warn!(ticker = %ticker, "No bars returned");
                }
                Ok(bars) => {
                    debug!(ticker = %ticker, count = bars.len(), "Fetched bars");
                    history.insert(ticker, bars);
                }
                Err(e) => {
                    warn!(ticker = %ticker, error = %e, "Fetch failed, skipping ticker");
                }
            }
        }

        Ok(history)
    }
}

/// Parse Stooq's `Date,Open,High,Low,Close,Volume` CSV. Unknown tickers
/// answer with a "No data" body, which parses to an empty list.
fn parse_csv(body: &str) -> Result<Vec<DailyBar>> {
    let mut bars = Vec::new();

    for line in body.lines().skip(1) {
        let fields: Vec<&str> = line.split(',').collect();
        if fields.len() < 5 {
            continue;
        }

        let Ok(date) = fields[0].parse::<NaiveDate>() else {
            debug!(line = %line, "Skipping unparseable CSV line");
            continue;
        };
        let (Ok(open), Ok(high), Ok(low), Ok(close)) = (
            Decimal::from_str(fields[1]),
            Decimal::from_str(fields[2]),
            Decimal::from_str(fields[3]),
            Decimal::from_str(fields[4]),
        ) else {
            debug!(line = %line, "Skipping CSV line with bad prices");
            continue;
        };

        // Volume is absent for some instruments (indices).
        let volume = fields
            .get(5)
            .and_then(|v| v.parse::<f64>().ok())
            .map(|v| v as i64)
            .unwrap_or(0);

        bars.push(DailyBar {
            date,
            open,
            high,
            low,
            close,
            volume,
        });
    }

    bars.sort_by_key(|b| b.date);
    Ok(bars)
}
