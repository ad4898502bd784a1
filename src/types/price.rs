use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One daily OHLCV bar for a ticker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceBar {
    pub ticker: String,
    pub date: NaiveDate,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl PriceBar {
    pub fn key(&self) -> (String, NaiveDate) {
        (self.ticker.clone(), self.date)
    }

    pub fn close_f64(&self) -> f64 {
        self.close.to_f64().unwrap_or(0.0)
    }
}

/// Normalizes a user-supplied ticker symbol.
///
/// Symbols are upper-cased and may only contain ASCII alphanumerics, `.` and `-`.
pub fn normalize_ticker(raw: &str) -> Result<String> {
    let ticker = raw.trim().to_uppercase();
    if ticker.is_empty() {
        return Err(anyhow!("Ticker must not be empty"));
    }
    if ticker.len() > 10 {
        return Err(anyhow!("Ticker too long: {}", ticker));
    }
    if !ticker
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
    {
        return Err(anyhow!("Invalid ticker symbol: {}", raw));
    }
    Ok(ticker)
}

/// Closing-price series for a single ticker, sorted by date with unique dates.
#[derive(Debug, Clone, Default)]
pub struct PriceSeries {
    pub ticker: String,
    points: Vec<(NaiveDate, f64)>,
}

impl PriceSeries {
    /// Builds a series from bars of one ticker. Later duplicates of a date are dropped.
    pub fn from_bars(ticker: &str, bars: &[PriceBar]) -> Self {
        let mut points: Vec<(NaiveDate, f64)> = bars
            .iter()
            .filter(|b| b.ticker == ticker)
            .map(|b| (b.date, b.close_f64()))
            .collect();
        points.sort_by_key(|(d, _)| *d);
        points.dedup_by_key(|(d, _)| *d);

        Self {
            ticker: ticker.to_string(),
            points,
        }
    }

    pub fn from_points(ticker: &str, mut points: Vec<(NaiveDate, f64)>) -> Self {
        points.sort_by_key(|(d, _)| *d);
        points.dedup_by_key(|(d, _)| *d);
        Self {
            ticker: ticker.to_string(),
            points,
        }
    }

    pub fn points(&self) -> &[(NaiveDate, f64)] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn last_date(&self) -> Option<NaiveDate> {
        self.points.last().map(|(d, _)| *d)
    }

    pub fn dates(&self) -> Vec<NaiveDate> {
        self.points.iter().map(|(d, _)| *d).collect()
    }

    pub fn values(&self) -> Vec<f64> {
        self.points.iter().map(|(_, v)| *v).collect()
    }

    /// Splits into (all but the last `n`, last `n`).
    pub fn split_tail(&self, n: usize) -> Result<(PriceSeries, PriceSeries)> {
        if self.points.len() <= n {
            return Err(anyhow!(
                "Not enough history for {}: {} rows, need more than {}",
                self.ticker,
                self.points.len(),
                n
            ));
        }
        let split = self.points.len() - n;
        Ok((
            Self {
                ticker: self.ticker.clone(),
                points: self.points[..split].to_vec(),
            },
            Self {
                ticker: self.ticker.clone(),
                points: self.points[split..].to_vec(),
            },
        ))
    }

    /// Last `n` points, or all of them when the series is shorter.
    pub fn tail(&self, n: usize) -> &[(NaiveDate, f64)] {
        let start = self.points.len().saturating_sub(n);
        &self.points[start..]
    }
}
