use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use std::path::PathBuf;
use std::process::Output;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::PublishSettings;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Disabled,
    NothingToCommit,
    Pushed { message: String },
}

/// Commits and pushes the data and model files with the system `git`.
#[derive(Debug, Clone)]
pub struct GitPublisher {
    settings: PublishSettings,
    repo_dir: PathBuf,
}

impl GitPublisher {
    pub fn new(settings: PublishSettings, repo_dir: impl Into<PathBuf>) -> Self {
        Self {
            settings,
            repo_dir: repo_dir.into(),
        }
    }

    pub fn commit_message(date: NaiveDate) -> String {
        format!("Daily retrain {}", date.format("%Y-%m-%d"))
    }

    pub async fn publish(&self, date: NaiveDate) -> Result<PublishOutcome> {
        if !self.settings.enabled {
            debug!("Publishing disabled");
            return Ok(PublishOutcome::Disabled);
        }

        let paths: Vec<&str> = self
            .settings
            .paths
            .iter()
            .map(String::as_str)
            .filter(|p| self.repo_dir.join(p).exists())
            .collect();
        if paths.is_empty() {
            info!("None of the publish paths exist, nothing to commit");
            return Ok(PublishOutcome::NothingToCommit);
        }

        let mut add = vec!["add", "--"];
        add.extend(&paths);
        self.git(&add).await?;

        // exit status 0 means the index matches HEAD
        let staged = self.run(&["diff", "--cached", "--quiet"]).await?;
        if staged.status.success() {
            info!("No staged changes, skipping commit");
            return Ok(PublishOutcome::NothingToCommit);
        }

        let message = Self::commit_message(date);
        self.git(&["commit", "-m", &message]).await?;
        self.git(&["push", &self.settings.remote, &self.settings.branch]).await?;

        info!(
            "Pushed \"{}\" to {}/{}",
            message, self.settings.remote, self.settings.branch
        );
        Ok(PublishOutcome::Pushed { message })
    }

    async fn run(&self, args: &[&str]) -> Result<Output> {
        debug!("git {}", args.join(" "));
        Command::new("git")
            .args(args)
            .current_dir(&self.repo_dir)
            .output()
            .await
            .with_context(|| format!("Failed to run git {}", args.join(" ")))
    }

    async fn git(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args).await?;
        if !output.status.success() {
            bail!(
                "git {} failed: {}",
                args.first().copied().unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(enabled: bool, paths: &[&str]) -> PublishSettings {
        PublishSettings {
            enabled,
            paths: paths.iter().map(|p| p.to_string()).collect(),
            ..PublishSettings::default()
        }
    }

    #[test]
    fn test_commit_message() {
        let date = NaiveDate::from_ymd_opt(2025, 8, 12).unwrap();
        assert_eq!(GitPublisher::commit_message(date), "Daily retrain 2025-08-12");
    }

    #[tokio::test]
    async fn test_disabled_publisher_does_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let publisher = GitPublisher::new(settings(false, &["models"]), dir.path());
        let date = NaiveDate::from_ymd_opt(2025, 8, 12).unwrap();
        assert_eq!(publisher.publish(date).await.unwrap(), PublishOutcome::Disabled);
    }

    #[tokio::test]
    async fn test_missing_paths_skip_git() {
        let dir = tempfile::tempdir().unwrap();
        let publisher = GitPublisher::new(settings(true, &["models", "stocks.csv"]), dir.path());
        let date = NaiveDate::from_ymd_opt(2025, 8, 12).unwrap();
        assert_eq!(publisher.publish(date).await.unwrap(), PublishOutcome::NothingToCommit);
    }
}
