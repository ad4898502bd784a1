use chrono::NaiveDate;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info};

use super::evaluate::evaluate_prod;
use super::extract::Extractor;
use super::publish::{GitPublisher, PublishOutcome};
use super::retrain::Retrainer;
use crate::storage::PriceStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Extract,
    Retrain,
    Evaluate,
    Publish,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Extract => write!(f, "extract"),
            Stage::Retrain => write!(f, "retrain"),
            Stage::Evaluate => write!(f, "evaluate"),
            Stage::Publish => write!(f, "publish"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub stage: Stage,
    pub ok: bool,
    pub summary: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub date: NaiveDate,
    pub stages: Vec<StageReport>,
}

impl PipelineReport {
    pub fn succeeded(&self) -> bool {
        self.stages.len() == 4 && self.stages.iter().all(|s| s.ok)
    }

    pub fn stage(&self, stage: Stage) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.stage == stage)
    }
}

/// Daily run: extract, retrain, evaluate, publish. A failed stage stops the later ones.
pub struct DailyPipeline {
    tickers: Vec<String>,
    store: Arc<dyn PriceStore>,
    extractor: Extractor,
    retrainer: Retrainer,
    publisher: GitPublisher,
    backtest_days: usize,
}

impl DailyPipeline {
    pub fn new(
        tickers: Vec<String>,
        store: Arc<dyn PriceStore>,
        extractor: Extractor,
        retrainer: Retrainer,
        publisher: GitPublisher,
        backtest_days: usize,
    ) -> Self {
        Self {
            tickers,
            store,
            extractor,
            retrainer,
            publisher,
            backtest_days,
        }
    }

    pub async fn run(&self, today: NaiveDate) -> PipelineReport {
        let mut report = PipelineReport {
            date: today,
            stages: Vec::with_capacity(4),
        };
        info!("Daily pipeline for {} on {} tickers", today, self.tickers.len());

        let extracted = self.extractor.run(&self.tickers, today).await;
        report.stages.push(StageReport {
            stage: Stage::Extract,
            ok: true,
            summary: format!(
                "{} rows inserted, {} tickers failed",
                extracted.inserted(),
                extracted.failures()
            ),
        });

        let retrained = self.retrainer.retrain_all(&self.tickers).await;
        let retrain_ok = !retrained.outcomes.is_empty();
        report.stages.push(StageReport {
            stage: Stage::Retrain,
            ok: retrain_ok,
            summary: format!(
                "{} promoted, {} kept, {} failed",
                retrained.promoted(),
                retrained.outcomes.len() - retrained.promoted(),
                retrained.failures.len()
            ),
        });
        if !retrain_ok {
            error!("Retrain failed for every ticker, stopping pipeline");
            return report;
        }

        let evaluated = evaluate_prod(
            &self.store,
            self.retrainer.registry(),
            &self.tickers,
            self.backtest_days,
        )
        .await;
        let evaluate_ok = !evaluated.all_failed();
        report.stages.push(StageReport {
            stage: Stage::Evaluate,
            ok: evaluate_ok,
            summary: format!(
                "{} evaluated, {} missing, {} failed",
                evaluated.evaluations.len(),
                evaluated.missing.len(),
                evaluated.failures.len()
            ),
        });
        if !evaluate_ok {
            error!("Evaluation failed for every ticker, stopping pipeline");
            return report;
        }

        let (ok, summary) = match self.publisher.publish(today).await {
            Ok(PublishOutcome::Disabled) => (true, "disabled".to_string()),
            Ok(PublishOutcome::NothingToCommit) => (true, "nothing to commit".to_string()),
            Ok(PublishOutcome::Pushed { message }) => (true, format!("pushed \"{}\"", message)),
            Err(e) => {
                error!("Publish failed: {:#}", e);
                (false, format!("{:#}", e))
            }
        };
        report.stages.push(StageReport {
            stage: Stage::Publish,
            ok,
            summary,
        });

        for stage in &report.stages {
            info!("{}: {}", stage.stage, stage.summary);
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PublishSettings;
    use crate::market_data::MockMarketDataSource;
    use crate::ml::{ModelParams, ModelRegistry};
    use crate::pipeline::retrain::RetrainLog;
    use crate::storage::test_support::{bar, day};
    use crate::storage::CsvPriceStore;
    use anyhow::anyhow;
    use chrono::Duration;
    use std::path::Path;

    fn pipeline(dir: &Path, source: MockMarketDataSource) -> DailyPipeline {
        let store: Arc<dyn PriceStore> = Arc::new(CsvPriceStore::new(dir.join("stocks.csv")));
        let extractor = Extractor::new(Arc::new(source), store.clone(), 60);
        let retrainer = Retrainer::new(
            store.clone(),
            ModelRegistry::new(dir.join("models")),
            ModelParams::default(),
            7,
            RetrainLog::new(dir.join("retrain_log.txt")),
        );
        let publisher = GitPublisher::new(PublishSettings::default(), dir);
        DailyPipeline::new(vec!["NVDA".to_string()], store, extractor, retrainer, publisher, 7)
    }

    #[tokio::test]
    async fn test_full_run_promotes_and_skips_disabled_publish() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = MockMarketDataSource::new();
        source.expect_daily_bars().returning(|t, start, end| {
            let days = (end - start).num_days();
            Ok((0..=days)
                .map(|i| bar(t, start + Duration::days(i), 100.0 + i as f64 * 0.5))
                .collect())
        });

        let report = pipeline(dir.path(), source).run(day(2025, 8, 12)).await;

        assert!(report.succeeded());
        let order: Vec<Stage> = report.stages.iter().map(|s| s.stage).collect();
        assert_eq!(order, vec![Stage::Extract, Stage::Retrain, Stage::Evaluate, Stage::Publish]);
        assert_eq!(report.stage(Stage::Publish).unwrap().summary, "disabled");
        assert!(dir.path().join("models").join("NVDA_prod.json").exists());
    }

    #[tokio::test]
    async fn test_retrain_failure_stops_later_stages() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = MockMarketDataSource::new();
        source
            .expect_daily_bars()
            .returning(|_, _, _| Err(anyhow!("invalid api key")));

        let report = pipeline(dir.path(), source).run(day(2025, 8, 12)).await;

        assert!(!report.succeeded());
        assert_eq!(report.stages.len(), 2);
        assert!(report.stage(Stage::Extract).unwrap().ok);
        assert!(!report.stage(Stage::Retrain).unwrap().ok);
        assert!(report.stage(Stage::Publish).is_none());
    }
}
