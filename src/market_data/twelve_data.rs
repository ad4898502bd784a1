use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use reqwest::Client;
use serde::Deserialize;
use std::num::NonZeroU32;
use std::sync::Arc;
use tracing::{debug, info};

use super::MarketDataSource;
use crate::config::MarketDataSettings;
use crate::storage::{parse_date, parse_decimal};
use crate::types::PriceBar;

const NO_DATA_MESSAGE: &str = "No data is available on the specified dates";

/// Client for the Twelve Data `time_series` endpoint.
#[derive(Clone)]
pub struct TwelveDataClient {
    client: Client,
    api_key: String,
    base_url: String,
    interval: String,
    limiter: Arc<DefaultDirectRateLimiter>,
}

impl std::fmt::Debug for TwelveDataClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TwelveDataClient")
            .field("base_url", &self.base_url)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

impl TwelveDataClient {
    pub fn new(api_key: String, settings: &MarketDataSettings) -> Self {
        let per_minute = NonZeroU32::new(settings.requests_per_minute).unwrap_or(NonZeroU32::MIN);

        Self {
            client: Client::new(),
            api_key,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            interval: settings.interval.clone(),
            limiter: Arc::new(RateLimiter::direct(Quota::per_minute(per_minute))),
        }
    }
}

#[async_trait]
impl MarketDataSource for TwelveDataClient {
    async fn daily_bars(&self, ticker: &str, start: NaiveDate, end: NaiveDate) -> Result<Vec<PriceBar>> {
        self.limiter.until_ready().await;

        let url = format!("{}/time_series", self.base_url);
        let start_str = start.format("%Y-%m-%d").to_string();
        let end_str = end.format("%Y-%m-%d").to_string();
        debug!("GET {} symbol={} {}..{}", url, ticker, start_str, end_str);

        let body: serde_json::Value = self
            .client
            .get(&url)
            .query(&[
                ("symbol", ticker),
                ("interval", self.interval.as_str()),
                ("start_date", start_str.as_str()),
                ("end_date", end_str.as_str()),
                ("apikey", self.api_key.as_str()),
            ])
            .send()
            .await
            .with_context(|| format!("Request for {} failed", ticker))?
            .json()
            .await
            .with_context(|| format!("Invalid JSON in response for {}", ticker))?;

        let bars = parse_time_series(ticker, body, start, end)?;
        info!("Fetched {} daily bars for {}", bars.len(), ticker);
        Ok(bars)
    }
}

#[derive(Debug, Deserialize)]
struct TimeSeriesResponse {
    status: Option<String>,
    message: Option<String>,
    values: Option<Vec<TimeSeriesValue>>,
}

#[derive(Debug, Deserialize)]
struct TimeSeriesValue {
    datetime: String,
    open: String,
    high: String,
    low: String,
    close: String,
    #[serde(default)]
    volume: Option<String>,
}

/// Converts a `time_series` payload into ascending bars within `[start, end]`.
pub fn parse_time_series(
    ticker: &str,
    body: serde_json::Value,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<Vec<PriceBar>> {
    let resp: TimeSeriesResponse = serde_json::from_value(body)?;

    // weekends and holidays between the last stored bar and today
    if resp.status.as_deref() == Some("error")
        && resp
            .message
            .as_deref()
            .map(|m| m.starts_with(NO_DATA_MESSAGE))
            .unwrap_or(false)
    {
        debug!("No new bars for {} between {} and {}", ticker, start, end);
        return Ok(Vec::new());
    }

    if resp.status.as_deref() == Some("error") || resp.values.is_none() {
        return Err(anyhow!(
            "Error fetching data for {}: {}",
            ticker,
            resp.message.unwrap_or_else(|| "Unknown error".to_string())
        ));
    }

    let mut bars = Vec::new();
    for v in resp.values.unwrap_or_default() {
        let date = parse_date(&v.datetime)?;
        if date < start || date > end {
            continue;
        }
        bars.push(PriceBar {
            ticker: ticker.to_string(),
            date,
            open: parse_decimal("open", &v.open)?,
            high: parse_decimal("high", &v.high)?,
            low: parse_decimal("low", &v.low)?,
            close: parse_decimal("close", &v.close)?,
            volume: match v.volume.as_deref() {
                Some(raw) if !raw.is_empty() => parse_decimal("volume", raw)?,
                _ => Default::default(),
            },
        });
    }

    bars.sort_by_key(|b| b.date);
    Ok(bars)
}
