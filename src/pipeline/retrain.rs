use anyhow::{bail, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::ml::{backtest, evaluate_on_tail, ForecastModel, ModelArtifact, ModelParams, ModelRegistry, ModelVersion};
use crate::storage::PriceStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PromotionDecision {
    Promote,
    Keep,
}

/// Promote when there is no incumbent or the candidate is strictly better.
pub fn decide(candidate_mae: f64, incumbent_mae: Option<f64>) -> PromotionDecision {
    match incumbent_mae {
        None => PromotionDecision::Promote,
        Some(incumbent) if candidate_mae < incumbent => PromotionDecision::Promote,
        Some(_) => PromotionDecision::Keep,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RetrainOutcome {
    pub ticker: String,
    pub candidate_mae: f64,
    pub incumbent_mae: Option<f64>,
    pub decision: PromotionDecision,
    /// Version serving after this run.
    pub version: Option<ModelVersion>,
}

impl RetrainOutcome {
    pub fn promoted(&self) -> bool {
        self.decision == PromotionDecision::Promote
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RetrainReport {
    pub outcomes: Vec<RetrainOutcome>,
    pub failures: Vec<(String, String)>,
}

impl RetrainReport {
    pub fn promoted(&self) -> usize {
        self.outcomes.iter().filter(|o| o.promoted()).count()
    }
}

/// Append-only text log of retrain decisions.
#[derive(Debug, Clone)]
pub struct RetrainLog {
    path: PathBuf,
}

impl RetrainLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn format_line(at: DateTime<Utc>, outcome: &RetrainOutcome) -> String {
        let previous = match outcome.incumbent_mae {
            Some(mae) => format!("{:.4}", mae),
            None => "none".to_string(),
        };
        format!(
            "Retrained at {}, ticker: {}, MAE: {:.4}, previous MAE: {}, promoted: {}",
            at.to_rfc3339_opts(SecondsFormat::Secs, false),
            outcome.ticker,
            outcome.candidate_mae,
            previous,
            outcome.promoted()
        )
    }

    pub fn append(&self, at: DateTime<Utc>, outcome: &RetrainOutcome) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{}", Self::format_line(at, outcome))?;
        Ok(())
    }
}

/// Backtests a fresh candidate per ticker and promotes it over the prod model when it wins.
pub struct Retrainer {
    store: Arc<dyn PriceStore>,
    registry: ModelRegistry,
    params: ModelParams,
    backtest_days: usize,
    log: RetrainLog,
}

impl Retrainer {
    pub fn new(
        store: Arc<dyn PriceStore>,
        registry: ModelRegistry,
        params: ModelParams,
        backtest_days: usize,
        log: RetrainLog,
    ) -> Self {
        Self {
            store,
            registry,
            params,
            backtest_days,
            log,
        }
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub async fn retrain_all(&self, tickers: &[String]) -> RetrainReport {
        let mut report = RetrainReport::default();
        for ticker in tickers {
            match self.retrain(ticker).await {
                Ok(outcome) => report.outcomes.push(outcome),
                Err(e) => {
                    warn!("Retrain failed for {}: {:#}", ticker, e);
                    report.failures.push((ticker.clone(), format!("{:#}", e)));
                }
            }
        }
        info!(
            "Retrain finished: {} promoted, {} kept, {} failed",
            report.promoted(),
            report.outcomes.len() - report.promoted(),
            report.failures.len()
        );
        report
    }

    pub async fn retrain(&self, ticker: &str) -> Result<RetrainOutcome> {
        let n = self.backtest_days;
        let series = self.store.load_series(ticker).await?;
        if series.len() <= n {
            bail!(
                "Not enough history for {}: {} rows, need more than {}",
                ticker,
                series.len(),
                n
            );
        }

        // incumbent is scored before anything is written
        let incumbent = match self.registry.load_prod(ticker) {
            Ok(incumbent) => incumbent,
            // a file we cannot read is not the same as a broken one
            Err(e) if is_io_error(&e) => return Err(e),
            Err(e) => {
                warn!("Ignoring corrupt prod model for {}: {:#}", ticker, e);
                None
            }
        };
        let incumbent_mae = incumbent
            .as_ref()
            .and_then(|a| evaluate_on_tail(&a.model, &series, n))
            .map(|r| r.mae);

        let (_, candidate) = backtest(&series, &self.params, n)?;
        let decision = decide(candidate.mae, incumbent_mae);

        let version = match decision {
            PromotionDecision::Promote => {
                let model = ForecastModel::fit(&series, &self.params)?;
                let version = ModelRegistry::next_version(incumbent.as_ref());
                let artifact = ModelArtifact::new(ticker, model, version.clone(), Some(candidate.mae))?;
                self.registry.promote(&artifact)?;
                info!(
                    "Promoted {} v{} (MAE {:.4} vs {})",
                    ticker,
                    version,
                    candidate.mae,
                    fmt_mae(incumbent_mae)
                );
                Some(version)
            }
            PromotionDecision::Keep => {
                info!(
                    "Kept {} prod model (candidate MAE {:.4} vs {})",
                    ticker,
                    candidate.mae,
                    fmt_mae(incumbent_mae)
                );
                incumbent.map(|a| a.meta.version)
            }
        };

        let outcome = RetrainOutcome {
            ticker: ticker.to_string(),
            candidate_mae: candidate.mae,
            incumbent_mae,
            decision,
            version,
        };
        self.log.append(Utc::now(), &outcome)?;
        Ok(outcome)
    }

    /// Fits on every stored row and writes the artifact without a promotion check.
    pub async fn train(&self, ticker: &str, output: Option<&Path>) -> Result<(PathBuf, ModelArtifact)> {
        let series = self.store.load_series(ticker).await?;
        if series.is_empty() {
            bail!("No stored prices for {}", ticker);
        }

        let model = ForecastModel::fit(&series, &self.params)?;
        let previous = self.registry.load_prod(ticker).ok().flatten();
        let version = ModelRegistry::next_version(previous.as_ref());
        let artifact = ModelArtifact::new(ticker, model, version, None)?;

        let path = match output {
            Some(path) => {
                self.registry.save_to(path, &artifact)?;
                path.to_path_buf()
            }
            None => self.registry.promote(&artifact)?,
        };
        Ok((path, artifact))
    }
}

fn is_io_error(e: &anyhow::Error) -> bool {
    e.chain().any(|cause| cause.is::<std::io::Error>())
}

fn fmt_mae(mae: Option<f64>) -> String {
    match mae {
        Some(mae) => format!("{:.4}", mae),
        None => "no incumbent".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support::{bar, day};
    use crate::storage::CsvPriceStore;
    use chrono::{Duration, TimeZone};

    async fn store_with(dir: &Path, ticker: &str, closes: &[f64]) -> Arc<CsvPriceStore> {
        let store = Arc::new(CsvPriceStore::new(dir.join("stocks.csv")));
        let start = day(2025, 1, 1);
        let bars: Vec<_> = closes
            .iter()
            .enumerate()
            .map(|(i, c)| bar(ticker, start + Duration::days(i as i64), *c))
            .collect();
        store.append(&bars).await.unwrap();
        store
    }

    fn retrainer(dir: &Path, store: Arc<CsvPriceStore>) -> Retrainer {
        Retrainer::new(
            store,
            ModelRegistry::new(dir.join("models")),
            ModelParams::default(),
            7,
            RetrainLog::new(dir.join("retrain_log.txt")),
        )
    }

    fn jump_series() -> Vec<f64> {
        let mut closes = vec![100.0; 53];
        closes.extend([200.0; 7]);
        closes
    }

    #[test]
    fn test_decide() {
        assert_eq!(decide(3.0, None), PromotionDecision::Promote);
        assert_eq!(decide(1.0, Some(2.0)), PromotionDecision::Promote);
        assert_eq!(decide(2.0, Some(2.0)), PromotionDecision::Keep);
        assert_eq!(decide(2.5, Some(2.0)), PromotionDecision::Keep);
        assert_eq!(decide(f64::NAN, Some(2.0)), PromotionDecision::Keep);
    }

    #[test]
    fn test_log_line_format() {
        let at = Utc.with_ymd_and_hms(2025, 8, 12, 0, 0, 0).unwrap();
        let outcome = RetrainOutcome {
            ticker: "NVDA".to_string(),
            candidate_mae: 1.23456,
            incumbent_mae: Some(1.5),
            decision: PromotionDecision::Promote,
            version: Some(ModelVersion::new(1, 0, 1)),
        };
        assert_eq!(
            RetrainLog::format_line(at, &outcome),
            "Retrained at 2025-08-12T00:00:00+00:00, ticker: NVDA, MAE: 1.2346, previous MAE: 1.5000, promoted: true"
        );

        let first = RetrainOutcome {
            incumbent_mae: None,
            ..outcome
        };
        assert!(RetrainLog::format_line(at, &first).contains("previous MAE: none"));
    }

    #[tokio::test]
    async fn test_first_run_promotes_initial_version() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(dir.path(), "NVDA", &jump_series()).await;
        let retrainer = retrainer(dir.path(), store);

        let outcome = retrainer.retrain("NVDA").await.unwrap();
        assert!(outcome.promoted());
        assert_eq!(outcome.incumbent_mae, None);
        assert_eq!(outcome.version, Some(ModelVersion::initial()));

        let prod = retrainer.registry().load_prod("NVDA").unwrap().unwrap();
        // the promoted model is refit on every row
        assert_eq!(prod.meta.n_observations, 60);
        assert_eq!(prod.meta.backtest_mae, Some(outcome.candidate_mae));

        let log = std::fs::read_to_string(dir.path().join("retrain_log.txt")).unwrap();
        assert_eq!(log.lines().count(), 1);
        assert!(log.contains("ticker: NVDA") && log.contains("promoted: true"));
    }

    #[tokio::test]
    async fn test_worse_candidate_never_replaces_prod() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(dir.path(), "NVDA", &jump_series()).await;
        let retrainer = retrainer(dir.path(), store);

        retrainer.retrain("NVDA").await.unwrap();
        let prod_path = retrainer.registry().prod_path("NVDA");
        let before = std::fs::read(&prod_path).unwrap();

        let second = retrainer.retrain("NVDA").await.unwrap();
        assert_eq!(second.decision, PromotionDecision::Keep);
        assert!(second.candidate_mae >= second.incumbent_mae.unwrap());
        assert_eq!(second.version, Some(ModelVersion::initial()));
        assert_eq!(std::fs::read(&prod_path).unwrap(), before);

        let log = std::fs::read_to_string(dir.path().join("retrain_log.txt")).unwrap();
        assert_eq!(log.lines().count(), 2);
        assert!(log.lines().last().unwrap().ends_with("promoted: false"));
    }

    #[tokio::test]
    async fn test_better_candidate_replaces_stale_prod() {
        let dir = tempfile::tempdir().unwrap();
        let closes: Vec<f64> = (0..60).map(|i| 100.0 + i as f64).collect();
        let store = store_with(dir.path(), "MSFT", &closes).await;
        let retrainer = retrainer(dir.path(), store);

        // stale incumbent trained on an unrelated flat series
        let flat = crate::types::PriceSeries::from_points(
            "MSFT",
            (0..20).map(|i| (day(2024, 1, 1) + Duration::days(i), 10.0)).collect(),
        );
        let stale = ForecastModel::fit(&flat, &ModelParams::default()).unwrap();
        let artifact = ModelArtifact::new("MSFT", stale, ModelVersion::initial(), Some(0.1)).unwrap();
        retrainer.registry().promote(&artifact).unwrap();

        let outcome = retrainer.retrain("MSFT").await.unwrap();
        assert!(outcome.promoted());
        assert!(outcome.candidate_mae < outcome.incumbent_mae.unwrap());
        assert_eq!(outcome.version, Some(ModelVersion::new(1, 0, 1)));

        let prod = retrainer.registry().load_prod("MSFT").unwrap().unwrap();
        assert_eq!(prod.meta.version, ModelVersion::new(1, 0, 1));
        assert_eq!(prod.meta.cutoff, day(2025, 1, 1) + Duration::days(59));
    }

    #[tokio::test]
    async fn test_short_history_fails_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(dir.path(), "PLTR", &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]).await;
        let retrainer = retrainer(dir.path(), store);

        let err = retrainer.retrain("PLTR").await.unwrap_err();
        assert!(err.to_string().contains("Not enough history"));
        assert!(!retrainer.registry().prod_path("PLTR").exists());
        assert!(!dir.path().join("retrain_log.txt").exists());
    }

    #[tokio::test]
    async fn test_retrain_all_isolates_failures() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(dir.path(), "NVDA", &jump_series()).await;
        let retrainer = retrainer(dir.path(), store);

        let tickers = vec!["NVDA".to_string(), "PLTR".to_string()];
        let report = retrainer.retrain_all(&tickers).await;
        assert_eq!(report.promoted(), 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, "PLTR");
    }

    #[tokio::test]
    async fn test_corrupt_prod_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(dir.path(), "NVDA", &jump_series()).await;
        let retrainer = retrainer(dir.path(), store);

        retrainer.registry().ensure_models_dir().unwrap();
        std::fs::write(retrainer.registry().prod_path("NVDA"), b"{not json").unwrap();

        let outcome = retrainer.retrain("NVDA").await.unwrap();
        assert!(outcome.promoted());
        assert!(retrainer.registry().load_prod("NVDA").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unreadable_prod_file_fails_without_promoting() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(dir.path(), "NVDA", &jump_series()).await;
        let retrainer = retrainer(dir.path(), store);

        // a directory in place of the prod file makes the read itself fail
        let prod_path = retrainer.registry().prod_path("NVDA");
        std::fs::create_dir_all(&prod_path).unwrap();

        let err = retrainer.retrain("NVDA").await.unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to read model file"));
        assert!(prod_path.is_dir());

        let report = retrainer.retrain_all(&["NVDA".to_string()]).await;
        assert!(report.outcomes.is_empty());
        assert_eq!(report.failures.len(), 1);
    }

    #[tokio::test]
    async fn test_train_writes_to_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(dir.path(), "NVDA", &jump_series()).await;
        let retrainer = retrainer(dir.path(), store);

        let output = dir.path().join("out").join("nvda.json");
        let (path, artifact) = retrainer.train("NVDA", Some(&output)).await.unwrap();
        assert_eq!(path, output);
        assert_eq!(artifact.meta.backtest_mae, None);
        assert!(retrainer.registry().load(&output).is_ok());
        assert!(!retrainer.registry().prod_path("NVDA").exists());

        let (prod_path, _) = retrainer.train("NVDA", None).await.unwrap();
        assert_eq!(prod_path, retrainer.registry().prod_path("NVDA"));
    }
}
