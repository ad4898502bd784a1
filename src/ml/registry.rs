use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::model::{ForecastModel, ModelParams};

const PROD_SUFFIX: &str = "_prod.json";

/// `major.minor.patch` of a prod artifact. Each promotion bumps the patch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ModelVersion {
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }

    pub fn initial() -> Self {
        Self::new(1, 0, 0)
    }

    pub fn bump_patch(&self) -> Self {
        Self {
            patch: self.patch + 1,
            ..self.clone()
        }
    }
}

impl std::fmt::Display for ModelVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Metadata stored next to a fitted model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub ticker: String,
    pub version: ModelVersion,
    pub trained_at: DateTime<Utc>,
    pub cutoff: NaiveDate,
    pub n_observations: usize,
    pub backtest_mae: Option<f64>,
    pub params: ModelParams,
    pub checksum: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub meta: ArtifactMeta,
    pub model: ForecastModel,
}

impl ModelArtifact {
    pub fn new(
        ticker: &str,
        model: ForecastModel,
        version: ModelVersion,
        backtest_mae: Option<f64>,
    ) -> Result<Self> {
        let checksum = model_checksum(&model)?;
        Ok(Self {
            meta: ArtifactMeta {
                ticker: ticker.to_string(),
                version,
                trained_at: Utc::now(),
                cutoff: model.cutoff(),
                n_observations: model.n_observations(),
                backtest_mae,
                params: model.params().clone(),
                checksum,
            },
            model,
        })
    }

    fn verify(&self) -> Result<()> {
        let actual = model_checksum(&self.model)?;
        if actual != self.meta.checksum {
            return Err(anyhow!(
                "Checksum mismatch for {} model v{}: expected {}, got {}",
                self.meta.ticker,
                self.meta.version,
                self.meta.checksum,
                actual
            ));
        }
        Ok(())
    }
}

fn model_checksum(model: &ForecastModel) -> Result<String> {
    let body = serde_json::to_vec(model)?;
    Ok(hex::encode(Sha256::digest(&body)))
}

/// File-backed store of per-ticker model artifacts.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models_dir: PathBuf,
}

impl ModelRegistry {
    pub fn new(models_dir: impl Into<PathBuf>) -> Self {
        Self {
            models_dir: models_dir.into(),
        }
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// Ensure models directory exists
    pub fn ensure_models_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.models_dir)?;
        Ok(())
    }

    pub fn prod_path(&self, ticker: &str) -> PathBuf {
        self.models_dir.join(format!("{}{}", ticker, PROD_SUFFIX))
    }

    pub fn load(&self, path: &Path) -> Result<ModelArtifact> {
        let data = std::fs::read(path)
            .with_context(|| format!("Failed to read model file {}", path.display()))?;
        let artifact: ModelArtifact = serde_json::from_slice(&data)
            .with_context(|| format!("Corrupt model file {}", path.display()))?;
        artifact.verify()?;

        debug!(
            "Loaded {} model v{} from {}",
            artifact.meta.ticker,
            artifact.meta.version,
            path.display()
        );
        Ok(artifact)
    }

    pub fn load_prod(&self, ticker: &str) -> Result<Option<ModelArtifact>> {
        let path = self.prod_path(ticker);
        if !path.exists() {
            return Ok(None);
        }
        self.load(&path).map(Some)
    }

    /// Writes the artifact to `path`, replacing any previous file in one rename.
    pub fn save_to(&self, path: &Path, artifact: &ModelArtifact) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let data = serde_json::to_vec_pretty(artifact)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, &data)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("Failed to move model into {}", path.display()))?;

        info!(
            "Saved {} model v{} to {}",
            artifact.meta.ticker,
            artifact.meta.version,
            path.display()
        );
        Ok(())
    }

    pub fn promote(&self, artifact: &ModelArtifact) -> Result<PathBuf> {
        self.ensure_models_dir()?;
        let path = self.prod_path(&artifact.meta.ticker);
        self.save_to(&path, artifact)?;
        Ok(path)
    }

    pub fn next_version(incumbent: Option<&ModelArtifact>) -> ModelVersion {
        match incumbent {
            Some(current) => current.meta.version.bump_patch(),
            None => ModelVersion::initial(),
        }
    }

    /// Metadata of every prod artifact in the models directory.
    pub fn list_prod(&self) -> Result<Vec<ArtifactMeta>> {
        if !self.models_dir.exists() {
            return Ok(Vec::new());
        }

        let mut metas = Vec::new();
        for entry in std::fs::read_dir(&self.models_dir)? {
            let path = entry?.path();
            let is_prod = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.ends_with(PROD_SUFFIX))
                .unwrap_or(false);
            if !is_prod {
                continue;
            }
            match self.load(&path) {
                Ok(artifact) => metas.push(artifact.meta),
                Err(e) => warn!("Skipping unreadable model {}: {}", path.display(), e),
            }
        }
        metas.sort_by(|a, b| a.ticker.cmp(&b.ticker));
        Ok(metas)
    }
}
