use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use csv::StringRecord;
use std::collections::{BTreeSet, HashSet};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{parse_date, parse_decimal, PriceStore};
use crate::types::PriceBar;

const HEADER: [&str; 7] = ["date", "open", "high", "low", "close", "volume", "ticker"];

/// Price history kept in a single flat CSV file.
pub struct CsvPriceStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl CsvPriceStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn read_all(&self) -> Result<Vec<PriceBar>> {
        if !self.path.exists() || std::fs::metadata(&self.path)?.len() == 0 {
            return Ok(Vec::new());
        }
        read_bars_from_csv(&self.path, None)
    }
}

#[async_trait]
impl PriceStore for CsvPriceStore {
    async fn last_date(&self, ticker: &str) -> Result<Option<NaiveDate>> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|b| b.ticker == ticker)
            .map(|b| b.date)
            .max())
    }

    async fn append(&self, bars: &[PriceBar]) -> Result<usize> {
        if bars.is_empty() {
            return Ok(0);
        }
        let _guard = self.write_lock.lock().await;

        let mut seen: HashSet<(String, NaiveDate)> =
            self.read_all()?.iter().map(PriceBar::key).collect();
        let fresh: Vec<&PriceBar> = bars.iter().filter(|b| seen.insert(b.key())).collect();

        let skipped = bars.len() - fresh.len();
        if skipped > 0 {
            debug!("Skipping {} already-stored rows", skipped);
        }
        if fresh.is_empty() {
            return Ok(0);
        }

        let columns = existing_header(&self.path)?;
        let write_header = columns.is_none();
        let columns = columns.unwrap_or_else(|| HEADER.iter().map(|s| s.to_string()).collect());
        let order = column_order(&columns)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);

        if write_header {
            writer.write_record(&columns)?;
        }
        for bar in &fresh {
            writer.write_record(order.iter().map(|field| field.render(bar)))?;
        }
        writer.flush()?;

        info!("Appended {} rows to {}", fresh.len(), self.path.display());
        Ok(fresh.len())
    }

    async fn load_bars(&self, ticker: &str) -> Result<Vec<PriceBar>> {
        let mut bars: Vec<PriceBar> = self
            .read_all()?
            .into_iter()
            .filter(|b| b.ticker == ticker)
            .collect();
        bars.sort_by_key(|b| b.date);
        Ok(bars)
    }

    async fn tickers(&self) -> Result<Vec<String>> {
        let tickers: BTreeSet<String> = self.read_all()?.into_iter().map(|b| b.ticker).collect();
        Ok(tickers.into_iter().collect())
    }
}

#[derive(Debug, Clone, Copy)]
enum Field {
    Date,
    Open,
    High,
    Low,
    Close,
    Volume,
    Ticker,
}

impl Field {
    fn from_header(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "date" | "datetime" => Some(Field::Date),
            "open" => Some(Field::Open),
            "high" => Some(Field::High),
            "low" => Some(Field::Low),
            "close" => Some(Field::Close),
            "volume" => Some(Field::Volume),
            "ticker" => Some(Field::Ticker),
            _ => None,
        }
    }

    fn render(&self, bar: &PriceBar) -> String {
        match self {
            Field::Date => bar.date.format("%Y-%m-%d").to_string(),
            Field::Open => bar.open.to_string(),
            Field::High => bar.high.to_string(),
            Field::Low => bar.low.to_string(),
            Field::Close => bar.close.to_string(),
            Field::Volume => bar.volume.to_string(),
            Field::Ticker => bar.ticker.clone(),
        }
    }
}

fn existing_header(path: &Path) -> Result<Option<Vec<String>>> {
    if !path.exists() || std::fs::metadata(path)?.len() == 0 {
        return Ok(None);
    }
    let mut reader = csv::Reader::from_path(path)?;
    let header = reader.headers()?.iter().map(|s| s.to_string()).collect();
    Ok(Some(header))
}

fn column_order(columns: &[String]) -> Result<Vec<Field>> {
    let order: Vec<Field> = columns
        .iter()
        .map(|c| Field::from_header(c).ok_or_else(|| anyhow!("Unexpected CSV column: {}", c)))
        .collect::<Result<_>>()?;
    if !order.iter().any(|f| matches!(f, Field::Ticker)) {
        return Err(anyhow!("CSV file has no ticker column, cannot append"));
    }
    Ok(order)
}

/// Reads OHLCV rows from a CSV file.
///
/// The date column may be named `date` or `datetime`. When the file has no
/// `ticker` column every row is assigned `default_ticker`. Rows with empty
/// fields are dropped.
pub fn read_bars_from_csv(path: &Path, default_ticker: Option<&str>) -> Result<Vec<PriceBar>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let headers = reader.headers()?.clone();

    let index = |wanted: &[&str]| -> Option<usize> {
        headers
            .iter()
            .position(|h| wanted.contains(&h.trim().to_lowercase().as_str()))
    };
    let required = |wanted: &[&str]| -> Result<usize> {
        index(wanted).ok_or_else(|| anyhow!("{} is missing column {}", path.display(), wanted[0]))
    };

    let date_idx = required(&["date", "datetime"])?;
    let open_idx = required(&["open"])?;
    let high_idx = required(&["high"])?;
    let low_idx = required(&["low"])?;
    let close_idx = required(&["close"])?;
    let volume_idx = required(&["volume"])?;
    let ticker_idx = index(&["ticker"]);

    if ticker_idx.is_none() && default_ticker.is_none() {
        return Err(anyhow!("{} has no ticker column", path.display()));
    }

    let mut bars = Vec::new();
    let mut dropped = 0usize;
    for (line, record) in reader.records().enumerate() {
        let record: StringRecord = record?;
        let get = |i: usize| record.get(i).map(str::trim).unwrap_or("");

        let mut wanted = vec![date_idx, open_idx, high_idx, low_idx, close_idx, volume_idx];
        wanted.extend(ticker_idx);
        if wanted.iter().any(|&i| get(i).is_empty()) {
            dropped += 1;
            continue;
        }

        let ticker = match ticker_idx {
            Some(i) => get(i).to_string(),
            None => default_ticker.unwrap_or_default().to_string(),
        };

        let bar = PriceBar {
            ticker,
            date: parse_date(get(date_idx))
                .with_context(|| format!("{} row {}", path.display(), line + 2))?,
            open: parse_decimal("open", get(open_idx))?,
            high: parse_decimal("high", get(high_idx))?,
            low: parse_decimal("low", get(low_idx))?,
            close: parse_decimal("close", get(close_idx))?,
            volume: parse_decimal("volume", get(volume_idx))?,
        };
        bars.push(bar);
    }

    if dropped > 0 {
        warn!("Dropped {} incomplete rows from {}", dropped, path.display());
    }
    Ok(bars)
}
