use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForecastPoint {
    pub date: NaiveDate,
    pub value: f64,
}

/// Wire shape of a single served prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub ticker: String,
    pub date: String,
    pub predicted_value: f64,
}

impl Prediction {
    pub fn new(ticker: &str, point: &ForecastPoint) -> Self {
        Self {
            ticker: ticker.to_string(),
            date: point.date.format("%Y-%m-%d").to_string(),
            predicted_value: point.value,
        }
    }
}
