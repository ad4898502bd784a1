use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const ENV_PREFIX: &str = "FORECASTER";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub tickers: Vec<String>,
    pub secrets_path: PathBuf,
    pub data: DataSettings,
    pub market_data: MarketDataSettings,
    pub model: ModelSettings,
    pub retrain: RetrainSettings,
    pub server: ServerSettings,
    pub publish: PublishSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            tickers: vec!["NVDA".to_string(), "PLTR".to_string(), "MSFT".to_string()],
            secrets_path: PathBuf::from("secrets.txt"),
            data: DataSettings::default(),
            market_data: MarketDataSettings::default(),
            model: ModelSettings::default(),
            retrain: RetrainSettings::default(),
            server: ServerSettings::default(),
            publish: PublishSettings::default(),
        }
    }
}

impl AppConfig {
    /// Loads defaults, then the optional TOML file, then `FORECASTER__*` env vars.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if dotenvy::dotenv().is_ok() {
            debug!("Loaded .env file");
        }

        let settings = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("tickers")
                    .with_list_parse_key("publish.paths")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Failed to read configuration from {}", path.display()))?;

        let config: AppConfig = settings
            .try_deserialize()
            .context("Invalid configuration")?;

        config
            .validate()
            .map_err(|errors| anyhow!("Invalid configuration: {}", errors.join(", ")))?;

        info!(
            "Configuration loaded: {} tickers, storage={}",
            config.tickers.len(),
            config.data.backend
        );
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.tickers.is_empty() {
            errors.push("tickers must not be empty".to_string());
        }
        for ticker in &self.tickers {
            if crate::types::normalize_ticker(ticker).is_err() {
                errors.push(format!("invalid ticker: {}", ticker));
            }
        }

        if self.market_data.requests_per_minute == 0 {
            errors.push("market_data.requests_per_minute must be > 0".to_string());
        }
        if self.market_data.initial_lookback_days == 0 {
            errors.push("market_data.initial_lookback_days must be > 0".to_string());
        }

        if self.model.changepoint_prior_scale <= 0.0 {
            errors.push("model.changepoint_prior_scale must be > 0".to_string());
        }
        if self.model.seasonality_prior_scale <= 0.0 {
            errors.push("model.seasonality_prior_scale must be > 0".to_string());
        }
        if self.model.changepoint_range <= 0.0 || self.model.changepoint_range > 1.0 {
            errors.push("model.changepoint_range must be in (0, 1]".to_string());
        }

        if self.retrain.backtest_days == 0 {
            errors.push("retrain.backtest_days must be > 0".to_string());
        }

        if self.server.max_horizon_days == 0 {
            errors.push("server.max_horizon_days must be > 0".to_string());
        }

        if self.publish.enabled && self.publish.paths.is_empty() {
            errors.push("publish.paths must not be empty when publishing is enabled".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Csv,
    Sqlite,
}

impl std::fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageBackend::Csv => write!(f, "csv"),
            StorageBackend::Sqlite => write!(f, "sqlite"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataSettings {
    pub backend: StorageBackend,
    pub csv_path: PathBuf,
    pub database_url: String,
}

impl Default for DataSettings {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Csv,
            csv_path: PathBuf::from("stocks.csv"),
            database_url: "sqlite:./stock_data.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketDataSettings {
    pub base_url: String,
    pub interval: String,
    pub initial_lookback_days: u32,
    pub requests_per_minute: u32,
    pub api_key_name: String,
}

impl Default for MarketDataSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.twelvedata.com".to_string(),
            interval: "1day".to_string(),
            initial_lookback_days: 120,
            requests_per_minute: 8,
            api_key_name: "TWELVE_DATA_API_KEY".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    pub changepoint_prior_scale: f64,
    pub seasonality_prior_scale: f64,
    pub n_changepoints: usize,
    pub changepoint_range: f64,
    pub weekly_seasonality: bool,
    pub yearly_seasonality: bool,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            changepoint_prior_scale: 0.05,
            seasonality_prior_scale: 10.0,
            n_changepoints: 25,
            changepoint_range: 0.8,
            weekly_seasonality: true,
            yearly_seasonality: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrainSettings {
    pub backtest_days: usize,
    pub models_dir: PathBuf,
    pub log_path: PathBuf,
    pub experiments_path: PathBuf,
}

impl Default for RetrainSettings {
    fn default() -> Self {
        Self {
            backtest_days: 7,
            models_dir: PathBuf::from("models"),
            log_path: PathBuf::from("retrain_log.txt"),
            experiments_path: PathBuf::from("experiments.jsonl"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub max_horizon_days: u32,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            max_horizon_days: 365,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishSettings {
    pub enabled: bool,
    pub remote: String,
    pub branch: String,
    pub paths: Vec<String>,
}

impl Default for PublishSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            remote: "origin".to_string(),
            branch: "main".to_string(),
            paths: vec![
                "models".to_string(),
                "stocks.csv".to_string(),
                "retrain_log.txt".to_string(),
            ],
        }
    }
}
