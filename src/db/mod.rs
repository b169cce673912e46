//! SQLite persistence for everything that outlives a process:
//! - OHLC bar cache (the price history provider's local store)
//! - Portfolio ledger snapshot (positions, cash, trades)
//! - Pending orders produced by the weekly run, consumed by the daily run
//!
//! Monetary values are stored as TEXT so decimal exactness survives the
//! round trip.

use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use tracing::info;

use crate::models::{CashAccount, DailyBar, MarketSnapshot, Order, Position, PriceHistory, TradeAction, TradeRecord};
use crate::portfolio::LedgerSnapshot;

/// Database connection pool with schema management.
pub struct Database {
    pool: SqlitePool,
}

#[derive(Debug, sqlx::FromRow)]
struct BarRow {
    ticker: String,
    date: String,
    open: String,
    high: String,
    low: String,
    close: String,
    volume: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct PositionRow {
    ticker: String,
    quantity: i64,
    price: String,
    stop_loss: Option<String>,
    take_profit: Option<String>,
    updated_at: String,
}

#[derive(Debug, sqlx::FromRow)]
struct CashRow {
    amount: String,
    currency: String,
    updated_at: String,
}

#[derive(Debug, sqlx::FromRow)]
struct TradeRow {
    ticker: String,
    quantity: i64,
    price: String,
    action: String,
    executed_at: String,
}

#[derive(Debug, sqlx::FromRow)]
struct OrderRow {
    ticker: String,
    action: String,
    quantity: i64,
    price: String,
    stop_loss: Option<String>,
    take_profit: Option<String>,
    reason: Option<String>,
}

fn parse_decimal(value: &str, field: &str) -> Result<Decimal> {
    Decimal::from_str(value).with_context(|| format!("Invalid decimal in column {field}: {value}"))
}

fn parse_decimal_opt(value: Option<&str>, field: &str) -> Result<Option<Decimal>> {
    value.map(|v| parse_decimal(v, field)).transpose()
}

fn parse_timestamp(value: &str, field: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .with_context(|| format!("Invalid timestamp in column {field}: {value}"))
}

impl BarRow {
    fn into_bar(self) -> Result<DailyBar> {
        Ok(DailyBar {
            date: self
                .date
                .parse::<NaiveDate>()
                .with_context(|| format!("Invalid date: {}", self.date))?,
            open: parse_decimal(&self.open, "open")?,
            high: parse_decimal(&self.high, "high")?,
            low: parse_decimal(&self.low, "low")?,
            close: parse_decimal(&self.close, "close")?,
            volume: self.volume,
        })
    }
}

impl PositionRow {
    fn into_position(self) -> Result<Position> {
        Ok(Position {
            ticker: self.ticker,
            quantity: self.quantity,
            price: parse_decimal(&self.price, "price")?,
            stop_loss: parse_decimal_opt(self.stop_loss.as_deref(), "stop_loss")?,
            take_profit: parse_decimal_opt(self.take_profit.as_deref(), "take_profit")?,
            updated_at: parse_timestamp(&self.updated_at, "updated_at")?,
        })
    }
}

impl Database {
    /// Open (or create) the database and run migrations.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Create all tables if missing. Safe to run on every start.
    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ohlc_bars (
                ticker TEXT NOT NULL,
                date TEXT NOT NULL,
                open TEXT NOT NULL,
                high TEXT NOT NULL,
                low TEXT NOT NULL,
                close TEXT NOT NULL,
                volume INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (ticker, date)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                ticker TEXT PRIMARY KEY,
                quantity INTEGER NOT NULL,
                price TEXT NOT NULL,
                stop_loss TEXT,
                take_profit TEXT,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cash (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                amount TEXT NOT NULL,
                currency TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ticker TEXT NOT NULL,
                quantity INTEGER NOT NULL,
                price TEXT NOT NULL,
                action TEXT NOT NULL,
                executed_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pending_orders (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ticker TEXT NOT NULL,
                action TEXT NOT NULL,
                quantity INTEGER NOT NULL,
                price TEXT NOT NULL,
                stop_loss TEXT,
                take_profit TEXT,
                reason TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ===== OHLC cache =====

    /// Insert or refresh bars for one ticker.
    pub async fn upsert_bars(&self, ticker: &str, bars: &[DailyBar]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for bar in bars {
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO ohlc_bars (ticker, date, open, high, low, close, volume)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(ticker)
            .bind(bar.date.to_string())
            .bind(bar.open.to_string())
            .bind(bar.high.to_string())
            .bind(bar.low.to_string())
            .bind(bar.close.to_string())
            .bind(bar.volume)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// All tickers' bars covering the last `days` days, ascending by date.
    pub async fn load_history(&self, days: i64) -> Result<PriceHistory> {
        let cutoff = (Utc::now().date_naive() - Duration::days(days)).to_string();

        let rows: Vec<BarRow> = sqlx::query_as(
            "SELECT ticker, date, open, high, low, close, volume
             FROM ohlc_bars WHERE date >= ? ORDER BY ticker, date",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .context("Failed to load OHLC history")?;

        let mut history = PriceHistory::new();
        for row in rows {
            let ticker = row.ticker.clone();
            history.entry(ticker).or_default().push(row.into_bar()?);
        }
        Ok(history)
    }

    /// The most recent bar per ticker: the daily run's market snapshot.
    pub async fn latest_bars(&self) -> Result<MarketSnapshot> {
        let rows: Vec<BarRow> = sqlx::query_as(
            "SELECT b.ticker, b.date, b.open, b.high, b.low, b.close, b.volume
             FROM ohlc_bars b
             JOIN (SELECT ticker, MAX(date) AS max_date FROM ohlc_bars GROUP BY ticker) m
               ON b.ticker = m.ticker AND b.date = m.max_date",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to load latest bars")?;

        let mut snapshot = MarketSnapshot::new();
        for row in rows {
            let ticker = row.ticker.clone();
            snapshot.insert(ticker, row.into_bar()?);
        }
        Ok(snapshot)
    }

    // ===== Ledger snapshot =====

    /// Persist the full ledger state, replacing the previous snapshot.
    pub async fn save_snapshot(&self, snapshot: &LedgerSnapshot) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM positions").execute(&mut *tx).await?;
        for position in &snapshot.positions {
            sqlx::query(
                "INSERT INTO positions (ticker, quantity, price, stop_loss, take_profit, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&position.ticker)
            .bind(position.quantity)
            .bind(position.price.to_string())
            .bind(position.stop_loss.map(|d| d.to_string()))
            .bind(position.take_profit.map(|d| d.to_string()))
            .bind(position.updated_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("DELETE FROM cash").execute(&mut *tx).await?;
        if let Some(cash) = &snapshot.cash {
            sqlx::query("INSERT INTO cash (id, amount, currency, updated_at) VALUES (1, ?, ?, ?)")
                .bind(cash.amount.to_string())
                .bind(&cash.currency)
                .bind(cash.updated_at.to_rfc3339())
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query("DELETE FROM trades").execute(&mut *tx).await?;
        for trade in &snapshot.trades {
            sqlx::query(
                "INSERT INTO trades (ticker, quantity, price, action, executed_at)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&trade.ticker)
            .bind(trade.quantity)
            .bind(trade.price.to_string())
            .bind(trade.action.as_str())
            .bind(trade.executed_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        info!(
            positions = snapshot.positions.len(),
            trades = snapshot.trades.len(),
            "Ledger snapshot saved"
        );
        Ok(())
    }

    /// Load the persisted ledger state.
    pub async fn load_snapshot(&self) -> Result<LedgerSnapshot> {
        let position_rows: Vec<PositionRow> = sqlx::query_as(
            "SELECT ticker, quantity, price, stop_loss, take_profit, updated_at FROM positions",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to load positions")?;

        let positions = position_rows
            .into_iter()
            .map(PositionRow::into_position)
            .collect::<Result<Vec<_>>>()?;

        let cash_row: Option<CashRow> =
            sqlx::query_as("SELECT amount, currency, updated_at FROM cash WHERE id = 1")
                .fetch_optional(&self.pool)
                .await
                .context("Failed to load cash")?;

        let cash = cash_row
            .map(|row| -> Result<CashAccount> {
                Ok(CashAccount {
                    amount: parse_decimal(&row.amount, "amount")?,
                    currency: row.currency,
                    updated_at: parse_timestamp(&row.updated_at, "updated_at")?,
                })
            })
            .transpose()?;

        let trade_rows: Vec<TradeRow> = sqlx::query_as(
            "SELECT ticker, quantity, price, action, executed_at FROM trades ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to load trades")?;

        let trades = trade_rows
            .into_iter()
            .map(|row| -> Result<TradeRecord> {
                Ok(TradeRecord {
                    ticker: row.ticker,
                    quantity: row.quantity,
                    price: parse_decimal(&row.price, "price")?,
                    action: row
                        .action
                        .parse::<TradeAction>()
                        .map_err(|e| anyhow::anyhow!(e))?,
                    executed_at: parse_timestamp(&row.executed_at, "executed_at")?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(LedgerSnapshot {
            positions,
            cash,
            trades,
        })
    }

    // ===== Pending orders =====

    /// Replace the pending-order set with the given one (the weekly run
    /// overwrites; the daily run writes back the unfilled remainder).
    pub async fn save_pending_orders(&self, orders: &[Order]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM pending_orders")
            .execute(&mut *tx)
            .await?;
        for order in orders {
            sqlx::query(
                "INSERT INTO pending_orders (ticker, action, quantity, price, stop_loss, take_profit, reason)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&order.ticker)
            .bind(order.action.as_str())
            .bind(order.quantity)
            .bind(order.price.to_string())
            .bind(order.stop_loss.map(|d| d.to_string()))
            .bind(order.take_profit.map(|d| d.to_string()))
            .bind(&order.reason)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn load_pending_orders(&self) -> Result<Vec<Order>> {
        let rows: Vec<OrderRow> = sqlx::query_as(
            "SELECT ticker, action, quantity, price, stop_loss, take_profit, reason
             FROM pending_orders ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to load pending orders")?;

        rows.into_iter()
            .map(|row| -> Result<Order> {
                Ok(Order {
                    ticker: row.ticker,
                    action: row
                        .action
                        .parse::<TradeAction>()
                        .map_err(|e| anyhow::anyhow!(e))?,
                    quantity: row.quantity,
                    price: parse_decimal(&row.price, "price")?,
                    stop_loss: parse_decimal_opt(row.stop_loss.as_deref(), "stop_loss")?,
                    take_profit: parse_decimal_opt(row.take_profit.as_deref(), "take_profit")?,
                    reason: row.reason,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    async fn temp_db(tag: &str) -> (Database, std::path::PathBuf) {
        let path = std::env::temp_dir().join(format!(
            "swingtrader-db-test-{}-{}.db",
            tag,
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);
        let url = format!("sqlite://{}?mode=rwc", path.display());
        (Database::new(&url).await.unwrap(), path)
    }

    fn bar(date: &str) -> DailyBar {
        DailyBar {
            date: date.parse().unwrap(),
            open: dec!(100),
            high: dec!(101.5),
            low: dec!(99),
            close: dec!(100.25),
            volume: 1_000,
        }
    }

    #[tokio::test]
    async fn test_bar_round_trip_and_latest() {
        let (db, path) = temp_db("bars").await;
        let today = Utc::now().date_naive();
        let bars = vec![
            bar(&(today - Duration::days(2)).to_string()),
            bar(&(today - Duration::days(1)).to_string()),
        ];

        db.upsert_bars("AAPL", &bars).await.unwrap();
        // Idempotent refresh.
        db.upsert_bars("AAPL", &bars).await.unwrap();

        let history = db.load_history(30).await.unwrap();
        assert_eq!(history["AAPL"].len(), 2);
        assert_eq!(history["AAPL"][0].close, dec!(100.25));

        let latest = db.latest_bars().await.unwrap();
        assert_eq!(latest["AAPL"].date, today - Duration::days(1));

        std::fs::remove_file(path).unwrap();
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let (db, path) = temp_db("snapshot").await;

        let snapshot = LedgerSnapshot {
            positions: vec![Position::new(
                "AAPL".to_string(),
                10,
                dec!(150.50),
                Some(dec!(140)),
                None,
            )],
            cash: Some(CashAccount::new(dec!(8495.25), "EUR")),
            trades: vec![TradeRecord::new(
                "AAPL".to_string(),
                10,
                dec!(150.50),
                TradeAction::Buy,
            )],
        };

        db.save_snapshot(&snapshot).await.unwrap();
        let restored = db.load_snapshot().await.unwrap();

        assert_eq!(restored.positions.len(), 1);
        assert_eq!(restored.positions[0].price, dec!(150.50));
        assert_eq!(restored.positions[0].stop_loss, Some(dec!(140)));
        assert_eq!(restored.positions[0].take_profit, None);
        assert_eq!(restored.cash.as_ref().unwrap().amount, dec!(8495.25));
        assert_eq!(restored.trades.len(), 1);
        assert_eq!(restored.trades[0].action, TradeAction::Buy);

        // A second save replaces, not appends.
        db.save_snapshot(&restored).await.unwrap();
        let again = db.load_snapshot().await.unwrap();
        assert_eq!(again.trades.len(), 1);

        std::fs::remove_file(path).unwrap();
    }

    #[tokio::test]
    async fn test_pending_orders_replace_semantics() {
        let (db, path) = temp_db("pending").await;

        let order = Order {
            ticker: "MSFT".to_string(),
            action: TradeAction::Buy,
            quantity: 5,
            price: dec!(400),
            stop_loss: Some(dec!(380)),
            take_profit: Some(dec!(440)),
            reason: None,
        };

        db.save_pending_orders(&[order.clone()]).await.unwrap();
        let loaded = db.load_pending_orders().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].stop_loss, Some(dec!(380)));

        db.save_pending_orders(&[]).await.unwrap();
        assert!(db.load_pending_orders().await.unwrap().is_empty());

        std::fs::remove_file(path).unwrap();
    }
}
