use anyhow::Result;
use chrono::{Duration, NaiveDate};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::market_data::MarketDataSource;
use crate::storage::PriceStore;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExtractOutcome {
    Appended { fetched: usize, inserted: usize },
    UpToDate { last: NaiveDate },
    Failed { reason: String },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExtractReport {
    pub results: Vec<(String, ExtractOutcome)>,
}

impl ExtractReport {
    pub fn inserted(&self) -> usize {
        self.results
            .iter()
            .map(|(_, o)| match o {
                ExtractOutcome::Appended { inserted, .. } => *inserted,
                _ => 0,
            })
            .sum()
    }

    pub fn failures(&self) -> usize {
        self.results
            .iter()
            .filter(|(_, o)| matches!(o, ExtractOutcome::Failed { .. }))
            .count()
    }

    pub fn outcome(&self, ticker: &str) -> Option<&ExtractOutcome> {
        self.results.iter().find(|(t, _)| t == ticker).map(|(_, o)| o)
    }
}

/// Pulls new daily bars for each ticker and appends them to the store.
pub struct Extractor {
    source: Arc<dyn MarketDataSource>,
    store: Arc<dyn PriceStore>,
    initial_lookback_days: u32,
}

impl Extractor {
    pub fn new(source: Arc<dyn MarketDataSource>, store: Arc<dyn PriceStore>, initial_lookback_days: u32) -> Self {
        Self {
            source,
            store,
            initial_lookback_days,
        }
    }

    /// Runs every ticker in order. A failing ticker is recorded and skipped.
    pub async fn run(&self, tickers: &[String], today: NaiveDate) -> ExtractReport {
        let mut report = ExtractReport::default();

        for ticker in tickers {
            let outcome = match self.extract_one(ticker, today).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!("Extraction failed for {}: {:#}", ticker, e);
                    ExtractOutcome::Failed {
                        reason: format!("{:#}", e),
                    }
                }
            };
            report.results.push((ticker.clone(), outcome));
        }

        info!(
            "Extraction finished: {} rows inserted, {} of {} tickers failed",
            report.inserted(),
            report.failures(),
            tickers.len()
        );
        report
    }

    async fn extract_one(&self, ticker: &str, today: NaiveDate) -> Result<ExtractOutcome> {
        let start = match self.store.last_date(ticker).await? {
            Some(last) if last >= today => {
                info!("{} is up to date (last bar {})", ticker, last);
                return Ok(ExtractOutcome::UpToDate { last });
            }
            Some(last) => last + Duration::days(1),
            None => today - Duration::days(i64::from(self.initial_lookback_days)),
        };

        info!("Fetching {} from {} to {}", ticker, start, today);
        let bars = self.source.daily_bars(ticker, start, today).await?;
        let inserted = self.store.append(&bars).await?;
        info!("{}: fetched {} bars, inserted {}", ticker, bars.len(), inserted);

        Ok(ExtractOutcome::Appended {
            fetched: bars.len(),
            inserted,
        })
    }
}
