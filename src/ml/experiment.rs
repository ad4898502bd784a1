use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

use super::backtest::backtest;
use super::model::ModelParams;
use super::registry::{ModelArtifact, ModelRegistry, ModelVersion};
use crate::types::PriceSeries;

pub const CHANGEPOINT_GRID: [f64; 6] = [0.01, 0.05, 0.1, 0.25, 0.5, 0.8];

#[derive(Debug, Clone, Serialize)]
pub struct ExperimentRun {
    pub run_id: Uuid,
    pub ticker: String,
    pub run_index: usize,
    pub started_at: DateTime<Utc>,
    pub params: ModelParams,
    pub holdout_days: usize,
    pub mae: f64,
    pub artifact_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ExperimentReport {
    pub ticker: String,
    pub runs: Vec<ExperimentRun>,
}

impl ExperimentReport {
    pub fn best(&self) -> Option<&ExperimentRun> {
        self.runs
            .iter()
            .min_by(|a, b| a.mae.total_cmp(&b.mae))
    }
}

/// Changepoint-flexibility sweep with seasonality strength held at 1.0.
pub fn default_grid(base: &ModelParams) -> Vec<ModelParams> {
    CHANGEPOINT_GRID
        .iter()
        .map(|&scale| ModelParams {
            changepoint_prior_scale: scale,
            seasonality_prior_scale: 1.0,
            ..base.clone()
        })
        .collect()
}

/// Backtests every parameter set on the last `holdout_days` rows.
///
/// Each run's model is saved under `<models_dir>/experiments/` and a JSON line
/// is appended to `record_path`. A failing run is logged and skipped.
pub fn run_experiment(
    series: &PriceSeries,
    grid: &[ModelParams],
    holdout_days: usize,
    registry: &ModelRegistry,
    record_path: &Path,
) -> Result<ExperimentReport> {
    let ticker = series.ticker.clone();
    let run_dir = registry.models_dir().join("experiments");
    let mut runs = Vec::with_capacity(grid.len());

    for (i, params) in grid.iter().enumerate() {
        let started_at = Utc::now();
        let (model, result) = match backtest(series, params, holdout_days) {
            Ok(out) => out,
            Err(e) => {
                warn!("Run {} for {} failed: {}", i, ticker, e);
                continue;
            }
        };

        let artifact_path = run_dir.join(format!("{}_run_{}.json", ticker, i));
        let artifact = ModelArtifact::new(&ticker, model, ModelVersion::initial(), Some(result.mae))?;
        registry.save_to(&artifact_path, &artifact)?;

        let run = ExperimentRun {
            run_id: Uuid::new_v4(),
            ticker: ticker.clone(),
            run_index: i,
            started_at,
            params: params.clone(),
            holdout_days,
            mae: result.mae,
            artifact_path,
        };
        append_record(record_path, &run)?;

        info!(
            "Run {} for {}: changepoint_prior_scale={}, seasonality_prior_scale={}, MAE={:.4}",
            i, ticker, params.changepoint_prior_scale, params.seasonality_prior_scale, run.mae
        );
        runs.push(run);
    }

    if runs.is_empty() {
        return Err(anyhow!("All {} experiment runs failed for {}", grid.len(), ticker));
    }

    Ok(ExperimentReport { ticker, runs })
}

fn append_record(path: &Path, run: &ExperimentRun) -> Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", serde_json::to_string(run)?)?;
    Ok(())
}
