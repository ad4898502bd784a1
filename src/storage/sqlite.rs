use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use tracing::info;

use super::{parse_date, parse_decimal, PriceStore};
use crate::types::PriceBar;

pub struct SqlitePriceStore {
    pool: SqlitePool,
}

impl SqlitePriceStore {
    /// Opens (or creates) the database and ensures the schema exists.
    pub async fn new(db_url: &str) -> Result<Self> {
        info!("Initializing SQLite price store at: {}", db_url);

        let options = SqliteConnectOptions::from_str(db_url)?.create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.create_schema().await?;

        info!("Price store initialized successfully");
        Ok(store)
    }

    async fn create_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS stock_prices (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ticker TEXT NOT NULL,
                datetime TEXT NOT NULL,
                open TEXT NOT NULL,
                high TEXT NOT NULL,
                low TEXT NOT NULL,
                close TEXT NOT NULL,
                volume TEXT NOT NULL,
                UNIQUE (ticker, datetime)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_stock_prices_ticker ON stock_prices(ticker)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn row_count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM stock_prices")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }
}

#[async_trait]
impl PriceStore for SqlitePriceStore {
    async fn last_date(&self, ticker: &str) -> Result<Option<NaiveDate>> {
        let row = sqlx::query("SELECT MAX(datetime) AS last FROM stock_prices WHERE ticker = ?")
            .bind(ticker)
            .fetch_one(&self.pool)
            .await?;

        let last: Option<String> = row.get("last");
        last.map(|s| parse_date(&s)).transpose()
    }

    async fn append(&self, bars: &[PriceBar]) -> Result<usize> {
        let mut inserted = 0usize;
        for bar in bars {
            let result = sqlx::query(
                r#"
                INSERT INTO stock_prices (ticker, datetime, open, high, low, close, volume)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (ticker, datetime) DO NOTHING
                "#,
            )
            .bind(&bar.ticker)
            .bind(bar.date.format("%Y-%m-%d").to_string())
            .bind(bar.open.to_string())
            .bind(bar.high.to_string())
            .bind(bar.low.to_string())
            .bind(bar.close.to_string())
            .bind(bar.volume.to_string())
            .execute(&self.pool)
            .await?;

            inserted += result.rows_affected() as usize;
        }

        if inserted > 0 {
            info!("Inserted {} rows into stock_prices", inserted);
        }
        Ok(inserted)
    }

    async fn load_bars(&self, ticker: &str) -> Result<Vec<PriceBar>> {
        let rows = sqlx::query(
            r#"
            SELECT ticker, datetime, open, high, low, close, volume
            FROM stock_prices
            WHERE ticker = ?
            ORDER BY datetime ASC
            "#,
        )
        .bind(ticker)
        .fetch_all(&self.pool)
        .await?;

        let mut bars = Vec::with_capacity(rows.len());
        for row in rows {
            bars.push(PriceBar {
                ticker: row.get("ticker"),
                date: parse_date(row.get::<&str, _>("datetime"))?,
                open: parse_decimal("open", row.get::<&str, _>("open"))?,
                high: parse_decimal("high", row.get::<&str, _>("high"))?,
                low: parse_decimal("low", row.get::<&str, _>("low"))?,
                close: parse_decimal("close", row.get::<&str, _>("close"))?,
                volume: parse_decimal("volume", row.get::<&str, _>("volume"))?,
            });
        }
        Ok(bars)
    }

    async fn tickers(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT DISTINCT ticker FROM stock_prices ORDER BY ticker")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get("ticker")).collect())
    }
}
