use anyhow::Result;
use chrono::NaiveDate;
use serde::Serialize;
use tracing::debug;

use super::model::{ForecastModel, ModelParams};
use crate::types::PriceSeries;

#[derive(Debug, Clone, Serialize)]
pub struct BacktestResult {
    pub mae: f64,
    pub points: usize,
    pub window_start: NaiveDate,
    pub window_end: NaiveDate,
}

pub fn mean_absolute_error(actual: &[f64], predicted: &[f64]) -> Option<f64> {
    if actual.is_empty() || actual.len() != predicted.len() {
        return None;
    }
    let total: f64 = actual
        .iter()
        .zip(predicted)
        .map(|(a, p)| (a - p).abs())
        .sum();
    Some(total / actual.len() as f64)
}

/// MAE of `model` against the last `n` closes of `series`.
pub fn evaluate_on_tail(model: &ForecastModel, series: &PriceSeries, n: usize) -> Option<BacktestResult> {
    let window = series.tail(n);
    let (first, last) = (window.first()?, window.last()?);

    let dates: Vec<NaiveDate> = window.iter().map(|(d, _)| *d).collect();
    let actual: Vec<f64> = window.iter().map(|(_, v)| *v).collect();
    let predicted: Vec<f64> = model.predict(&dates).iter().map(|p| p.value).collect();

    let mae = mean_absolute_error(&actual, &predicted)?;
    debug!("MAE for {} over last {} days: {:.4}", series.ticker, window.len(), mae);

    Some(BacktestResult {
        mae,
        points: window.len(),
        window_start: first.0,
        window_end: last.0,
    })
}

/// (all but the last `n` rows, last `n` rows). Fails when the series has `<= n` rows.
pub fn split_holdout(series: &PriceSeries, n: usize) -> Result<(PriceSeries, PriceSeries)> {
    series.split_tail(n)
}

/// Fits on all but the last `n` rows and scores the model on those `n` rows.
pub fn backtest(series: &PriceSeries, params: &ModelParams, n: usize) -> Result<(ForecastModel, BacktestResult)> {
    let (train, _) = split_holdout(series, n)?;
    let model = ForecastModel::fit(&train, params)?;
    let result = evaluate_on_tail(&model, series, n)
        .ok_or_else(|| anyhow::anyhow!("No holdout rows to evaluate for {}", series.ticker))?;
    Ok((model, result))
}
