use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use super::error::ApiError;
use crate::ml::{ForecastError, ModelArtifact, ModelRegistry};
use crate::storage::PriceStore;

/// Shared handler state. Prod artifacts are loaded on first use and cached.
#[derive(Clone)]
pub struct AppState {
    pub registry: ModelRegistry,
    pub store: Arc<dyn PriceStore>,
    pub max_horizon_days: u32,
    cache: Arc<RwLock<HashMap<String, Arc<ModelArtifact>>>>,
}

impl AppState {
    pub fn new(registry: ModelRegistry, store: Arc<dyn PriceStore>, max_horizon_days: u32) -> Self {
        Self {
            registry,
            store,
            max_horizon_days,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn model(&self, ticker: &str) -> Result<Arc<ModelArtifact>, ApiError> {
        if let Some(artifact) = self.cache.read().await.get(ticker) {
            return Ok(artifact.clone());
        }

        let artifact = self
            .registry
            .load_prod(ticker)?
            .ok_or_else(|| ForecastError::UnknownTicker(ticker.to_string()))?;
        let artifact = Arc::new(artifact);

        let mut cache = self.cache.write().await;
        let entry = cache.entry(ticker.to_string()).or_insert(artifact);
        info!("Serving {} model v{}", ticker, entry.meta.version);
        Ok(entry.clone())
    }

    /// Drops every cached model. Returns how many were evicted.
    pub async fn reload(&self) -> usize {
        let mut cache = self.cache.write().await;
        let evicted = cache.len();
        cache.clear();
        evicted
    }

    pub async fn cached_tickers(&self) -> Vec<String> {
        let mut tickers: Vec<String> = self.cache.read().await.keys().cloned().collect();
        tickers.sort();
        tickers
    }
}
