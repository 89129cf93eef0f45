//! Process-wide settings, constructed once at startup and shared by reference.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use autoeval_types::{AutoevalError, Result};

use crate::retry::RetryPolicy;

/// Retry knobs for external calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: usize,
    pub base_delay_ms: u64,
    pub jitter: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            jitter: 0.3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Per-run token cap.
    pub max_token_budget: u64,
    /// Concurrency limit for per-case summarizer and judge calls.
    pub run_workers: usize,
    pub retry: RetrySettings,
    /// Similarity at or above which a new case counts as a duplicate.
    pub dedup_threshold: f64,
    pub failure_exemplar_top_k: usize,
    /// Root that document `content_path`s are resolved against.
    pub data_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_token_budget: 300_000,
            run_workers: 4,
            retry: RetrySettings::default(),
            dedup_threshold: 0.90,
            failure_exemplar_top_k: 10,
            data_dir: PathBuf::from("data"),
        }
    }
}

impl Settings {
    /// Load settings from a JSON file. Missing keys take their defaults.
    pub async fn load(path: &Path) -> Result<Self> {
        let json = tokio::fs::read_to_string(path).await.map_err(|e| {
            AutoevalError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let settings: Settings = serde_json::from_str(&json)
            .map_err(|e| AutoevalError::Config(format!("{}: {}", path.display(), e)))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Defaults overridden by `AUTOEVAL_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable name.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut settings = Settings::default();
        if let Some(v) = parse_var(&lookup, "AUTOEVAL_MAX_TOKEN_BUDGET")? {
            settings.max_token_budget = v;
        }
        if let Some(v) = parse_var(&lookup, "AUTOEVAL_RUN_WORKERS")? {
            settings.run_workers = v;
        }
        if let Some(v) = parse_var(&lookup, "AUTOEVAL_RETRY_MAX_ATTEMPTS")? {
            settings.retry.max_attempts = v;
        }
        if let Some(v) = parse_var(&lookup, "AUTOEVAL_RETRY_BASE_DELAY_MS")? {
            settings.retry.base_delay_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "AUTOEVAL_RETRY_JITTER")? {
            settings.retry.jitter = v;
        }
        if let Some(v) = parse_var(&lookup, "AUTOEVAL_DEDUP_THRESHOLD")? {
            settings.dedup_threshold = v;
        }
        if let Some(v) = parse_var(&lookup, "AUTOEVAL_FAILURE_EXEMPLAR_TOP_K")? {
            settings.failure_exemplar_top_k = v;
        }
        if let Some(v) = lookup("AUTOEVAL_DATA_DIR") {
            settings.data_dir = PathBuf::from(v);
        }
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.run_workers == 0 {
            return Err(AutoevalError::Config("run_workers must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(AutoevalError::Config(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if !(self.retry.jitter >= 0.0 && self.retry.jitter.is_finite()) {
            return Err(AutoevalError::Config(
                "retry.jitter must be a non-negative number".into(),
            ));
        }
        if !(self.dedup_threshold > 0.0 && self.dedup_threshold <= 1.0) {
            return Err(AutoevalError::Config(format!(
                "dedup_threshold {} outside (0, 1]",
                self.dedup_threshold
            )));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            jitter: self.retry.jitter,
        }
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| AutoevalError::Config(format!("{key}: cannot parse '{raw}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults() {
        let settings = Settings::default();
        assert_eq!(settings.max_token_budget, 300_000);
        assert_eq!(settings.run_workers, 4);
        assert_eq!(settings.retry.max_attempts, 3);
        assert_eq!(settings.dedup_threshold, 0.90);
        assert!(settings.validate().is_ok());
        assert_eq!(settings.retry_policy().base_delay, Duration::from_secs(1));
    }

    #[test]
    fn partial_json_fills_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{"run_workers": 2, "retry": {"base_delay_ms": 0}}"#).unwrap();
        assert_eq!(settings.run_workers, 2);
        assert_eq!(settings.retry.base_delay_ms, 0);
        assert_eq!(settings.retry.max_attempts, 3);
        assert_eq!(settings.failure_exemplar_top_k, 10);
    }

    #[test]
    fn lookup_overrides_defaults() {
        let vars: HashMap<&str, &str> = [
            ("AUTOEVAL_MAX_TOKEN_BUDGET", "5000"),
            ("AUTOEVAL_RUN_WORKERS", "8"),
            ("AUTOEVAL_DATA_DIR", "/srv/corpus"),
        ]
        .into_iter()
        .collect();
        let settings = Settings::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(settings.max_token_budget, 5_000);
        assert_eq!(settings.run_workers, 8);
        assert_eq!(settings.data_dir, PathBuf::from("/srv/corpus"));
        assert_eq!(settings.dedup_threshold, 0.90);
    }

    #[test]
    fn unparsable_variable_is_config_error() {
        let err = Settings::from_lookup(|k| {
            (k == "AUTOEVAL_RUN_WORKERS").then(|| "many".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, AutoevalError::Config(_)));
        assert!(err.to_string().contains("AUTOEVAL_RUN_WORKERS"));
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut settings = Settings::default();
        settings.run_workers = 0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.dedup_threshold = 1.5;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.retry.max_attempts = 0;
        assert!(settings.validate().is_err());
    }

    #[tokio::test]
    async fn load_reads_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        tokio::fs::write(&path, r#"{"max_token_budget": 1234}"#)
            .await
            .unwrap();
        let settings = Settings::load(&path).await.unwrap();
        assert_eq!(settings.max_token_budget, 1234);

        let missing = Settings::load(&dir.path().join("nope.json")).await;
        assert!(matches!(missing, Err(AutoevalError::Config(_))));
    }
}
