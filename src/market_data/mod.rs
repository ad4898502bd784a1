pub mod twelve_data;

pub use twelve_data::*;

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;

use crate::types::PriceBar;

/// Source of daily OHLCV bars.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Daily bars for `ticker` with `start <= date <= end`, ascending.
    async fn daily_bars(&self, ticker: &str, start: NaiveDate, end: NaiveDate) -> Result<Vec<PriceBar>>;
}
