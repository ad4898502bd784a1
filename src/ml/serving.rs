use chrono::NaiveDate;
use thiserror::Error;

use super::model::ForecastModel;
use crate::types::ForecastPoint;

pub const DATE_FORMAT: &str = "%m/%d/%Y";

/// Rejections raised while answering a forecast request.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ForecastError {
    #[error("Invalid date format. Use MM/DD/YYYY.")]
    InvalidDate,

    #[error("Date must be after the last date in the training data: {cutoff}")]
    BeforeCutoff { cutoff: NaiveDate },

    #[error("Forecast for the requested date is not available.")]
    Unavailable,

    #[error("Requested horizon of {requested} days exceeds the maximum of {max} days")]
    HorizonTooLong { requested: i64, max: u32 },

    #[error("Number of days must be at least 1")]
    InvalidDays,

    #[error("Provide exactly one of forecast_date or days")]
    AmbiguousTarget,

    #[error("Invalid ticker: {0}")]
    InvalidTicker(String),

    #[error("No model available for ticker {0}")]
    UnknownTicker(String),
}

pub fn parse_forecast_date(raw: &str) -> Result<NaiveDate, ForecastError> {
    NaiveDate::parse_from_str(raw.trim(), DATE_FORMAT).map_err(|_| ForecastError::InvalidDate)
}

/// Point forecast for `target`, extending the model's frame up to that date.
pub fn forecast_for_date(
    model: &ForecastModel,
    target: NaiveDate,
    max_horizon_days: u32,
) -> Result<ForecastPoint, ForecastError> {
    let cutoff = model.cutoff();
    let days_ahead = (target - cutoff).num_days();
    if days_ahead < 0 {
        return Err(ForecastError::BeforeCutoff { cutoff });
    }
    if days_ahead > i64::from(max_horizon_days) {
        return Err(ForecastError::HorizonTooLong {
            requested: days_ahead,
            max: max_horizon_days,
        });
    }

    // the frame holds every calendar day in cutoff..=target
    model
        .forecast_frame(days_ahead as usize)
        .into_iter()
        .find(|p| p.date == target)
        .ok_or(ForecastError::Unavailable)
}

/// Forecasts for each of the `days` calendar days following the cutoff.
pub fn forecast_next_days(
    model: &ForecastModel,
    days: u32,
    max_horizon_days: u32,
) -> Result<Vec<ForecastPoint>, ForecastError> {
    if days == 0 {
        return Err(ForecastError::InvalidDays);
    }
    if days > max_horizon_days {
        return Err(ForecastError::HorizonTooLong {
            requested: i64::from(days),
            max: max_horizon_days,
        });
    }

    let cutoff = model.cutoff();
    let frame = model.forecast_frame(days as usize);
    Ok(frame.into_iter().filter(|p| p.date > cutoff).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::model::ModelParams;
    use crate::types::PriceSeries;
    use chrono::Duration;

    fn model() -> ForecastModel {
        let start = NaiveDate::from_ymd_opt(2025, 7, 1).unwrap();
        let points = (0..30)
            .map(|i| (start + Duration::days(i), 50.0 + i as f64))
            .collect();
        ForecastModel::fit(&PriceSeries::from_points("NVDA", points), &ModelParams::default()).unwrap()
    }

    #[test]
    fn test_parse_forecast_date() {
        assert_eq!(
            parse_forecast_date("08/15/2025").unwrap(),
            NaiveDate::from_ymd_opt(2025, 8, 15).unwrap()
        );
        assert_eq!(parse_forecast_date("2025-08-15"), Err(ForecastError::InvalidDate));
        assert_eq!(parse_forecast_date("13/01/2025"), Err(ForecastError::InvalidDate));
        assert_eq!(parse_forecast_date("tomorrow"), Err(ForecastError::InvalidDate));
        assert_eq!(
            ForecastError::InvalidDate.to_string(),
            "Invalid date format. Use MM/DD/YYYY."
        );
    }

    #[test]
    fn test_date_before_cutoff_is_rejected() {
        let model = model();
        let before = model.cutoff() - Duration::days(1);
        let err = forecast_for_date(&model, before, 365).unwrap_err();
        assert_eq!(err, ForecastError::BeforeCutoff { cutoff: model.cutoff() });
        assert!(err.to_string().contains("2025-07-30"));
    }

    #[test]
    fn test_forecast_for_future_date() {
        let model = model();
        let target = model.cutoff() + Duration::days(5);
        let point = forecast_for_date(&model, target, 365).unwrap();
        assert_eq!(point.date, target);
        assert!((point.value - 84.0).abs() < 1.0);

        // the cutoff itself is still answerable
        assert!(forecast_for_date(&model, model.cutoff(), 365).is_ok());
    }

    #[test]
    fn test_every_day_within_horizon_is_answerable() {
        let model = model();
        for k in 0..=30 {
            let target = model.cutoff() + Duration::days(k);
            assert_eq!(forecast_for_date(&model, target, 30).unwrap().date, target);
        }
    }

    #[test]
    fn test_horizon_limit() {
        let model = model();
        let far = model.cutoff() + Duration::days(400);
        assert!(matches!(
            forecast_for_date(&model, far, 365),
            Err(ForecastError::HorizonTooLong { requested: 400, max: 365 })
        ));
        assert!(forecast_next_days(&model, 366, 365).is_err());
    }

    #[test]
    fn test_next_days() {
        let model = model();
        let points = forecast_next_days(&model, 3, 365).unwrap();
        assert_eq!(points.len(), 3);
        assert_eq!(points[0].date, model.cutoff() + Duration::days(1));
        assert_eq!(forecast_next_days(&model, 0, 365), Err(ForecastError::InvalidDays));
    }
}
