use anyhow::{anyhow, Result};
use chrono::{Duration, NaiveDate};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use tracing::{debug, info};

use super::linalg::solve_spd;
use crate::config::ModelSettings;
use crate::types::{ForecastPoint, PriceSeries};

/// Ridge weight on the intercept and base slope; keeps the system definite.
const UNPENALIZED_EPS: f64 = 1e-9;
const WEEKLY_MIN_SPAN_DAYS: i64 = 14;
const YEARLY_MIN_SPAN_DAYS: i64 = 730;

/// Hyperparameters of the decomposition model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    pub changepoint_prior_scale: f64,
    pub seasonality_prior_scale: f64,
    pub n_changepoints: usize,
    pub changepoint_range: f64,
    pub weekly_seasonality: bool,
    pub yearly_seasonality: bool,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self::from(&ModelSettings::default())
    }
}

impl From<&ModelSettings> for ModelParams {
    fn from(s: &ModelSettings) -> Self {
        Self {
            changepoint_prior_scale: s.changepoint_prior_scale,
            seasonality_prior_scale: s.seasonality_prior_scale,
            n_changepoints: s.n_changepoints,
            changepoint_range: s.changepoint_range,
            weekly_seasonality: s.weekly_seasonality,
            yearly_seasonality: s.yearly_seasonality,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Seasonality {
    name: String,
    period_days: f64,
    order: usize,
}

/// Additive trend + seasonality model over daily closes.
///
/// The trend is piecewise linear with hinge terms at fixed changepoints, the
/// seasonal part is a Fourier series per enabled period. Coefficients are the
/// ridge (Gaussian prior) solution on scaled time and scaled target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastModel {
    params: ModelParams,
    history_dates: Vec<NaiveDate>,
    span_days: f64,
    y_scale: f64,
    changepoints: Vec<f64>,
    seasonalities: Vec<Seasonality>,
    coefficients: Vec<f64>,
}

impl ForecastModel {
    pub fn fit(series: &PriceSeries, params: &ModelParams) -> Result<Self> {
        let n = series.len();
        if n < 2 {
            return Err(anyhow!(
                "Cannot fit {}: need at least 2 observations, got {}",
                series.ticker,
                n
            ));
        }
        let dates = series.dates();
        let values = series.values();
        if values.iter().any(|v| !v.is_finite()) {
            return Err(anyhow!("Cannot fit {}: non-finite closing price", series.ticker));
        }

        let start = dates[0];
        let span = (dates[n - 1] - start).num_days();
        let span_days = span.max(1) as f64;

        let y_scale = values.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
        let y_scale = if y_scale > 0.0 { y_scale } else { 1.0 };

        let t: Vec<f64> = dates
            .iter()
            .map(|d| (*d - start).num_days() as f64 / span_days)
            .collect();

        let changepoints = place_changepoints(&t, params.n_changepoints, params.changepoint_range);

        let mut seasonalities = Vec::new();
        if params.weekly_seasonality && span >= WEEKLY_MIN_SPAN_DAYS {
            seasonalities.push(Seasonality {
                name: "weekly".to_string(),
                period_days: 7.0,
                order: 3,
            });
        }
        if params.yearly_seasonality && span >= YEARLY_MIN_SPAN_DAYS {
            seasonalities.push(Seasonality {
                name: "yearly".to_string(),
                period_days: 365.25,
                order: 10,
            });
        }

        let mut model = Self {
            params: params.clone(),
            history_dates: dates.clone(),
            span_days,
            y_scale,
            changepoints,
            seasonalities,
            coefficients: Vec::new(),
        };

        let p = model.num_features();
        let mut x = Array2::<f64>::zeros((n, p));
        for (i, date) in dates.iter().enumerate() {
            for (j, v) in model.feature_row(*date).into_iter().enumerate() {
                x[[i, j]] = v;
            }
        }
        let y = Array1::from_iter(values.iter().map(|v| v / y_scale));

        let mut penalty = vec![UNPENALIZED_EPS, UNPENALIZED_EPS];
        penalty.extend(std::iter::repeat(1.0 / params.changepoint_prior_scale).take(model.changepoints.len()));
        penalty.extend(std::iter::repeat(1.0 / params.seasonality_prior_scale).take(p - 2 - model.changepoints.len()));

        let mut gram = x.t().dot(&x);
        for (j, lambda) in penalty.iter().enumerate() {
            gram[[j, j]] += lambda;
        }
        let rhs = x.t().dot(&y);
        let beta = solve_spd(&gram, &rhs)?;
        model.coefficients = beta.to_vec();

        info!(
            "Fitted model for {}: {} rows, {} changepoints, seasonalities={:?}, cutoff={}",
            series.ticker,
            n,
            model.changepoints.len(),
            model.seasonalities.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            model.cutoff()
        );
        Ok(model)
    }

    fn num_features(&self) -> usize {
        2 + self.changepoints.len() + self.seasonalities.iter().map(|s| 2 * s.order).sum::<usize>()
    }

    fn feature_row(&self, date: NaiveDate) -> Vec<f64> {
        let days = (date - self.history_start()).num_days() as f64;
        let t = days / self.span_days;

        let mut row = Vec::with_capacity(self.num_features());
        row.push(1.0);
        row.push(t);
        for s in &self.changepoints {
            row.push((t - s).max(0.0));
        }
        for season in &self.seasonalities {
            for k in 1..=season.order {
                let angle = 2.0 * PI * k as f64 * days / season.period_days;
                row.push(angle.sin());
                row.push(angle.cos());
            }
        }
        row
    }

    pub fn predict_one(&self, date: NaiveDate) -> f64 {
        let scaled: f64 = self
            .feature_row(date)
            .iter()
            .zip(&self.coefficients)
            .map(|(x, b)| x * b)
            .sum();
        scaled * self.y_scale
    }

    pub fn predict(&self, dates: &[NaiveDate]) -> Vec<ForecastPoint> {
        dates
            .iter()
            .map(|d| ForecastPoint {
                date: *d,
                value: self.predict_one(*d),
            })
            .collect()
    }

    /// History dates followed by `periods` consecutive days after the cutoff.
    pub fn future_dates(&self, periods: usize) -> Vec<NaiveDate> {
        let cutoff = self.cutoff();
        let mut dates = self.history_dates.clone();
        dates.extend((1..=periods as i64).map(|k| cutoff + Duration::days(k)));
        dates
    }

    pub fn forecast_frame(&self, periods: usize) -> Vec<ForecastPoint> {
        let frame = self.predict(&self.future_dates(periods));
        debug!("Forecast frame: {} rows through {:?}", frame.len(), frame.last().map(|p| p.date));
        frame
    }

    pub fn history_start(&self) -> NaiveDate {
        self.history_dates[0]
    }

    /// Last date in the training window.
    pub fn cutoff(&self) -> NaiveDate {
        self.history_dates[self.history_dates.len() - 1]
    }

    pub fn n_observations(&self) -> usize {
        self.history_dates.len()
    }

    pub fn params(&self) -> &ModelParams {
        &self.params
    }

    pub fn seasonality_names(&self) -> Vec<&str> {
        self.seasonalities.iter().map(|s| s.name.as_str()).collect()
    }
}

/// Evenly spaced row quantiles of the first `range` fraction of the history.
fn place_changepoints(t: &[f64], requested: usize, range: f64) -> Vec<f64> {
    let hist_size = (t.len() as f64 * range).floor() as usize;
    let n_cp = requested.min(hist_size.saturating_sub(1));
    if n_cp == 0 {
        return Vec::new();
    }

    let last = (hist_size - 1) as f64;
    let mut points: Vec<f64> = (1..=n_cp)
        .map(|i| {
            let idx = (i as f64 * last / n_cp as f64).round() as usize;
            t[idx]
        })
        .collect();
    points.dedup();
    points
}
