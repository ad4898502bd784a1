use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::ml::{evaluate_on_tail, BacktestResult, ForecastModel, ModelRegistry, ModelVersion};
use crate::storage::PriceStore;

#[derive(Debug, Clone, Serialize)]
pub struct Evaluation {
    pub ticker: String,
    pub version: ModelVersion,
    pub cutoff: NaiveDate,
    pub result: BacktestResult,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EvaluationReport {
    pub evaluations: Vec<Evaluation>,
    pub missing: Vec<String>,
    pub failures: Vec<(String, String)>,
}

impl EvaluationReport {
    pub fn all_failed(&self) -> bool {
        self.evaluations.is_empty() && !self.failures.is_empty()
    }
}

/// Scores each ticker's prod model on its last `n` stored closes.
pub async fn evaluate_prod(
    store: &Arc<dyn PriceStore>,
    registry: &ModelRegistry,
    tickers: &[String],
    n: usize,
) -> EvaluationReport {
    let mut report = EvaluationReport::default();

    for ticker in tickers {
        let artifact = match registry.load_prod(ticker) {
            Ok(Some(artifact)) => artifact,
            Ok(None) => {
                warn!("No prod model for {}", ticker);
                report.missing.push(ticker.clone());
                continue;
            }
            Err(e) => {
                warn!("Cannot load prod model for {}: {:#}", ticker, e);
                report.failures.push((ticker.clone(), format!("{:#}", e)));
                continue;
            }
        };

        match score(store, &artifact.model, ticker, n).await {
            Ok(result) => {
                info!(
                    "{} v{}: MAE over last {} days = {:.4}",
                    ticker, artifact.meta.version, result.points, result.mae
                );
                report.evaluations.push(Evaluation {
                    ticker: ticker.clone(),
                    version: artifact.meta.version.clone(),
                    cutoff: artifact.meta.cutoff,
                    result,
                });
            }
            Err(e) => {
                warn!("Evaluation failed for {}: {:#}", ticker, e);
                report.failures.push((ticker.clone(), format!("{:#}", e)));
            }
        }
    }

    report
}

async fn score(store: &Arc<dyn PriceStore>, model: &ForecastModel, ticker: &str, n: usize) -> Result<BacktestResult> {
    let series = store.load_series(ticker).await?;
    evaluate_on_tail(model, &series, n).ok_or_else(|| anyhow!("No stored prices for {}", ticker))
}
