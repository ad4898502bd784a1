pub mod csv_store;
pub mod sqlite;

pub use csv_store::*;
pub use sqlite::*;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;

use crate::config::{DataSettings, StorageBackend};
use crate::types::{PriceBar, PriceSeries};

/// Append-only price history keyed by (ticker, date).
#[async_trait]
pub trait PriceStore: Send + Sync {
    /// Most recent stored date for the ticker.
    async fn last_date(&self, ticker: &str) -> Result<Option<NaiveDate>>;

    /// Appends bars, skipping any (ticker, date) already stored. Returns rows inserted.
    async fn append(&self, bars: &[PriceBar]) -> Result<usize>;

    /// All bars for the ticker in ascending date order.
    async fn load_bars(&self, ticker: &str) -> Result<Vec<PriceBar>>;

    async fn tickers(&self) -> Result<Vec<String>>;

    async fn load_series(&self, ticker: &str) -> Result<PriceSeries> {
        let bars = self.load_bars(ticker).await?;
        Ok(PriceSeries::from_bars(ticker, &bars))
    }
}

pub async fn open_store(settings: &DataSettings) -> Result<Arc<dyn PriceStore>> {
    let store: Arc<dyn PriceStore> = match settings.backend {
        StorageBackend::Csv => Arc::new(CsvPriceStore::new(&settings.csv_path)),
        StorageBackend::Sqlite => Arc::new(SqlitePriceStore::new(&settings.database_url).await?),
    };
    Ok(store)
}

/// Parses a price field, accepting plain and scientific notation.
pub(crate) fn parse_decimal(field: &str, raw: &str) -> Result<Decimal> {
    let raw = raw.trim();
    Decimal::from_str(raw)
        .or_else(|_| Decimal::from_scientific(raw))
        .map_err(|_| anyhow!("Invalid {} value: {:?}", field, raw))
}

/// Parses `YYYY-MM-DD`, ignoring any trailing time component.
pub(crate) fn parse_date(raw: &str) -> Result<NaiveDate> {
    let raw = raw.trim();
    let day = raw.get(..10).unwrap_or(raw);
    NaiveDate::parse_from_str(day, "%Y-%m-%d").map_err(|_| anyhow!("Invalid date: {:?}", raw))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_helpers() {
        assert_eq!(parse_decimal("close", "123.45").unwrap().to_string(), "123.45");
        assert_eq!(parse_decimal("volume", "1.5e3").unwrap(), Decimal::from(1500));
        assert!(parse_decimal("close", "abc").is_err());

        let expected = NaiveDate::from_ymd_opt(2025, 8, 12).unwrap();
        assert_eq!(parse_date("2025-08-12").unwrap(), expected);
        assert_eq!(parse_date("2025-08-12 00:00:00").unwrap(), expected);
        assert!(parse_date("08/12/2025").is_err());
    }
}
