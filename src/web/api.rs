use askama::Template;
use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, info};

use super::error::{ApiError, ApiResult};
use super::AppState;
use crate::ml::serving::{forecast_for_date, forecast_next_days, parse_forecast_date};
use crate::ml::{ArtifactMeta, ForecastError};
use crate::types::{normalize_ticker, Prediction};

const DEFAULT_CHART_DAYS: u32 = 30;

#[derive(Debug, Clone, Deserialize)]
pub struct ForecastRequest {
    pub ticker: String,
    #[serde(default)]
    pub forecast_date: Option<String>,
    #[serde(default)]
    pub days: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChartQuery {
    pub days: Option<u32>,
}

// === Info endpoints ===

pub async fn root() -> impl IntoResponse {
    Json(json!({ "message": "Stock forecasting model API." }))
}

pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "cached_models": state.cached_tickers().await,
    }))
}

// === Forecast endpoints ===

pub async fn get_forecast(
    State(state): State<AppState>,
    req: Result<Query<ForecastRequest>, QueryRejection>,
) -> ApiResult<Response> {
    let Query(req) = req?;
    answer_forecast(&state, req).await
}

pub async fn post_forecast(
    State(state): State<AppState>,
    req: Result<Json<ForecastRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(req) = req?;
    answer_forecast(&state, req).await
}

async fn answer_forecast(state: &AppState, req: ForecastRequest) -> ApiResult<Response> {
    let ticker = normalize_ticker(&req.ticker).map_err(|_| ForecastError::InvalidTicker(req.ticker.clone()))?;
    debug!("Forecast request for {}: {:?}", ticker, req);

    match (req.forecast_date.as_deref(), req.days) {
        (Some(raw), None) => {
            let target = parse_forecast_date(raw)?;
            let artifact = state.model(&ticker).await?;
            let point = forecast_for_date(&artifact.model, target, state.max_horizon_days)?;
            Ok(Json(Prediction::new(&ticker, &point)).into_response())
        }
        (None, Some(days)) => {
            let artifact = state.model(&ticker).await?;
            let points = forecast_next_days(&artifact.model, days, state.max_horizon_days)?;
            let predictions: Vec<Prediction> = points.iter().map(|p| Prediction::new(&ticker, p)).collect();
            Ok(Json(predictions).into_response())
        }
        _ => Err(ForecastError::AmbiguousTarget.into()),
    }
}

// === Model endpoints ===

pub async fn list_models(State(state): State<AppState>) -> ApiResult<Json<Vec<ArtifactMeta>>> {
    Ok(Json(state.registry.list_prod()?))
}

pub async fn reload_models(State(state): State<AppState>) -> impl IntoResponse {
    let evicted = state.reload().await;
    info!("Model cache cleared ({} evicted)", evicted);
    Json(json!({ "reloaded": true, "evicted": evicted }))
}

// === Chart page ===

#[derive(Template)]
#[template(path = "chart.html")]
pub struct ChartPage {
    pub ticker: String,
    pub version: String,
    pub cutoff: String,
    pub days: u32,
    pub history_json: String,
    pub forecast_json: String,
}

#[derive(Serialize)]
struct ChartPoint {
    x: String,
    y: f64,
}

pub async fn chart(
    State(state): State<AppState>,
    Path(ticker): Path<String>,
    query: Result<Query<ChartQuery>, QueryRejection>,
) -> ApiResult<Response> {
    let Query(query) = query?;
    let ticker = normalize_ticker(&ticker).map_err(|_| ForecastError::InvalidTicker(ticker.clone()))?;
    let days = query.days.unwrap_or(DEFAULT_CHART_DAYS);

    let artifact = state.model(&ticker).await?;
    let forecast = forecast_next_days(&artifact.model, days, state.max_horizon_days)?;
    let series = state.store.load_series(&ticker).await?;

    let history: Vec<ChartPoint> = series
        .points()
        .iter()
        .map(|(d, v)| ChartPoint {
            x: d.format("%Y-%m-%d").to_string(),
            y: *v,
        })
        .collect();
    let forecast: Vec<ChartPoint> = forecast
        .iter()
        .map(|p| ChartPoint {
            x: p.date.format("%Y-%m-%d").to_string(),
            y: p.value,
        })
        .collect();

    let page = ChartPage {
        ticker,
        version: artifact.meta.version.to_string(),
        cutoff: artifact.meta.cutoff.format("%Y-%m-%d").to_string(),
        days,
        history_json: serde_json::to_string(&history).map_err(anyhow::Error::from)?,
        forecast_json: serde_json::to_string(&forecast).map_err(anyhow::Error::from)?,
    };
    Ok(render_template(&page))
}

fn render_template<T: Template>(template: &T) -> Response {
    match template.render() {
        Ok(html) => Html(html).into_response(),
        Err(e) => {
            error!("Template render error: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, format!("Template error: {}", e)).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::server::router;
    use super::*;
    use crate::ml::{ForecastModel, ModelArtifact, ModelParams, ModelRegistry, ModelVersion};
    use crate::storage::test_support::{bar, day};
    use crate::storage::{CsvPriceStore, PriceStore};
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request};
    use chrono::Duration;
    use std::sync::Arc;
    use tower::ServiceExt;

    // NVDA closes run 100..129 over 2025-07-01..=2025-07-30
    async fn test_state(dir: &std::path::Path) -> AppState {
        let csv = CsvPriceStore::new(dir.join("stocks.csv"));
        let bars: Vec<_> = (0..30)
            .map(|i| bar("NVDA", day(2025, 7, 1) + Duration::days(i), 100.0 + i as f64))
            .collect();
        csv.append(&bars).await.unwrap();
        let store: Arc<dyn PriceStore> = Arc::new(csv);

        let registry = ModelRegistry::new(dir.join("models"));
        let series = store.load_series("NVDA").await.unwrap();
        let model = ForecastModel::fit(&series, &ModelParams::default()).unwrap();
        registry
            .promote(&ModelArtifact::new("NVDA", model, ModelVersion::initial(), Some(0.5)).unwrap())
            .unwrap();

        AppState::new(registry, store, 365)
    }

    async fn send(state: AppState, req: Request<Body>) -> (StatusCode, Vec<u8>) {
        let resp = router(state).oneshot(req).await.unwrap();
        let status = resp.status();
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    async fn get(state: AppState, uri: &str) -> (StatusCode, serde_json::Value) {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let (status, body) = send(state, req).await;
        (status, serde_json::from_slice(&body).unwrap())
    }

    async fn post_json(state: AppState, uri: &str, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
        let req = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let (status, body) = send(state, req).await;
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_root_message() {
        let dir = tempfile::tempdir().unwrap();
        let (status, body) = get(test_state(dir.path()).await, "/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Stock forecasting model API.");
    }

    #[tokio::test]
    async fn test_forecast_for_valid_date() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;
        let (status, body) = post_json(
            state,
            "/forecast",
            json!({"ticker": "nvda", "forecast_date": "08/04/2025"}),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ticker"], "NVDA");
        assert_eq!(body["date"], "2025-08-04");
        let value = body["predicted_value"].as_f64().unwrap();
        assert!((value - 134.0).abs() < 2.0);
    }

    #[tokio::test]
    async fn test_malformed_date_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;
        let (status, body) = get(state, "/forecast?ticker=NVDA&forecast_date=2025-08-04").await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Invalid date format. Use MM/DD/YYYY.");
    }

    #[tokio::test]
    async fn test_date_before_cutoff_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;
        let (status, body) = post_json(
            state,
            "/forecast",
            json!({"ticker": "NVDA", "forecast_date": "07/15/2025"}),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("2025-07-30"));
    }

    #[tokio::test]
    async fn test_unknown_ticker_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;
        let (status, body) = get(state, "/forecast?ticker=AAPL&forecast_date=08/04/2025").await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("AAPL"));
    }

    #[tokio::test]
    async fn test_days_returns_one_prediction_per_day() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;
        let (status, body) = post_json(state, "/forecast", json!({"ticker": "NVDA", "days": 3})).await;

        assert_eq!(status, StatusCode::OK);
        let items = body.as_array().unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(items[0]["date"], "2025-07-31");
        assert_eq!(items[2]["date"], "2025-08-02");
    }

    #[tokio::test]
    async fn test_both_or_neither_target_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;

        let (status, _) = post_json(
            state.clone(),
            "/forecast",
            json!({"ticker": "NVDA", "forecast_date": "08/04/2025", "days": 2}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = get(state, "/forecast?ticker=NVDA").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], ForecastError::AmbiguousTarget.to_string());
    }

    #[tokio::test]
    async fn test_non_numeric_days_is_a_json_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;
        let (status, body) = get(state, "/forecast?ticker=NVDA&days=abc").await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("query string"));
    }

    #[tokio::test]
    async fn test_post_without_ticker_is_a_json_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;
        let (status, body) = post_json(state, "/forecast", json!({"forecast_date": "08/04/2025"})).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("ticker"));
    }

    #[tokio::test]
    async fn test_malformed_json_body_is_a_json_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;
        let req = Request::builder()
            .method("POST")
            .uri("/forecast")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{\"ticker\": "))
            .unwrap();
        let (status, body) = send(state, req).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_horizon_limit_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;
        let (status, _) = get(state, "/forecast?ticker=NVDA&forecast_date=12/31/2026").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_models_listing_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;

        let (_, _) = get(state.clone(), "/forecast?ticker=NVDA&days=1").await;
        assert_eq!(state.cached_tickers().await, vec!["NVDA".to_string()]);

        let (status, body) = get(state.clone(), "/models").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["ticker"], "NVDA");
        assert_eq!(body[0]["version"]["major"], 1);

        let (status, body) = post_json(state.clone(), "/models/reload", json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["evicted"], 1);
        assert!(state.cached_tickers().await.is_empty());
    }

    #[tokio::test]
    async fn test_chart_renders_html() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;
        let req = Request::builder().uri("/chart/NVDA?days=5").body(Body::empty()).unwrap();
        let (status, body) = send(state, req).await;

        assert_eq!(status, StatusCode::OK);
        let html = String::from_utf8(body).unwrap();
        assert!(html.contains("NVDA"));
        assert!(html.contains("2025-08-04"));
    }
}
