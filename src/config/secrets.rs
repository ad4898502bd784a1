use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Credentials read from a `key=value` text file.
///
/// Lines without `=` are ignored, values may themselves contain `=`.
/// A process environment variable with the same name takes precedence.
#[derive(Debug, Clone, Default)]
pub struct Secrets {
    values: HashMap<String, String>,
    source: Option<PathBuf>,
}

impl Secrets {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read secrets file {}", path.display()))?;
        let mut secrets = Self::parse(&contents);
        secrets.source = Some(path.to_path_buf());
        debug!("Loaded {} secrets from {}", secrets.values.len(), path.display());
        Ok(secrets)
    }

    /// Like [`Secrets::load`], but a missing file yields an empty set so that
    /// environment variables alone can supply credentials.
    pub fn load_or_env(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            debug!("Secrets file {} not found, using environment only", path.display());
            Ok(Self::default())
        }
    }

    pub fn parse(contents: &str) -> Self {
        let values = contents
            .lines()
            .filter_map(|line| {
                let line = line.trim();
                if line.starts_with('#') {
                    return None;
                }
                let (key, value) = line.split_once('=')?;
                Some((key.trim().to_string(), value.trim().to_string()))
            })
            .collect();

        Self {
            values,
            source: None,
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        std::env::var(key)
            .ok()
            .filter(|v| !v.is_empty())
            .or_else(|| self.values.get(key).cloned())
    }

    pub fn require(&self, key: &str) -> Result<String> {
        self.get(key).ok_or_else(|| match &self.source {
            Some(path) => anyhow!("{} not found in {}", key, path.display()),
            None => anyhow!("{} not found in secrets or environment", key),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_key_values() {
        let secrets = Secrets::parse(
            "FORECASTER_TEST_API_KEY=abc123\n\
             # comment=ignored\n\
             not a pair\n\
             FORECASTER_TEST_URL=sqlite:./db?mode=rwc\n",
        );
        assert_eq!(secrets.get("FORECASTER_TEST_API_KEY").as_deref(), Some("abc123"));
        assert_eq!(
            secrets.get("FORECASTER_TEST_URL").as_deref(),
            Some("sqlite:./db?mode=rwc")
        );
        assert!(secrets.get("# comment").is_none());
    }

    #[test]
    fn test_require_names_the_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "OTHER=1").unwrap();

        let secrets = Secrets::load(file.path()).unwrap();
        let err = secrets.require("FORECASTER_TEST_MISSING_KEY").unwrap_err();
        assert!(err.to_string().contains("FORECASTER_TEST_MISSING_KEY not found"));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets.txt");
        assert!(Secrets::load(&path).is_err());
        assert!(Secrets::load_or_env(&path).is_ok());
    }
}
