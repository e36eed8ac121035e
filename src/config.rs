use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::cli::{Args, VerifyMode};
use crate::coordinator::CoordinatorConfig;
use crate::transport::http::HttpTransportConfig;

/// Settings read from an optional JSON file. Missing keys keep their defaults.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub update_interval_ms: u64,
    pub concurrency: Option<usize>,
    pub user_agent: String,
    pub connect_timeout_secs: u64,
    pub verify_hash: VerifyMode,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            update_interval_ms: 500,
            concurrency: None,
            user_agent: concat!("batchdl/", env!("CARGO_PKG_VERSION")).to_string(),
            connect_timeout_secs: 10,
            verify_hash: VerifyMode::Auto,
        }
    }
}

impl Settings {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))
    }

    /// Loads the file named by `--config` (if any) and applies the flags on top.
    pub fn load(args: &Args) -> Result<Self> {
        let mut settings = match &args.config {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        if let Some(interval) = args.interval_ms {
            settings.update_interval_ms = interval;
        }
        if args.concurrency.is_some() {
            settings.concurrency = args.concurrency;
        }
        if let Some(mode) = args.verify_hash {
            settings.verify_hash = mode;
        }
        Ok(settings)
    }

    pub fn coordinator(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            update_interval: Duration::from_millis(self.update_interval_ms),
        }
    }

    pub fn transport(&self) -> HttpTransportConfig {
        HttpTransportConfig {
            concurrency: self.concurrency.unwrap_or_else(num_cpus::get),
            user_agent: self.user_agent.clone(),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            verify_mode: self.verify_hash,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn partial_file_keeps_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{ "update_interval_ms": 250, "verify_hash": "off" }"#).unwrap();
        assert_eq!(settings.update_interval_ms, 250);
        assert_eq!(settings.verify_hash, VerifyMode::Off);
        assert_eq!(settings.connect_timeout_secs, 10);
        assert_eq!(settings.concurrency, None);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(serde_json::from_str::<Settings>(r#"{ "rate_limit": 5 }"#).is_err());
    }

    #[test]
    fn flags_override_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batchdl.json");
        std::fs::write(&path, r#"{ "update_interval_ms": 250, "concurrency": 3 }"#).unwrap();

        let args = Args::parse_from([
            "batchdl",
            "--config",
            path.to_str().unwrap(),
            "--interval-ms",
            "100",
            "--verify-hash",
            "on",
        ]);
        let settings = Settings::load(&args).unwrap();

        assert_eq!(settings.update_interval_ms, 100);
        assert_eq!(settings.concurrency, Some(3));
        assert_eq!(settings.verify_hash, VerifyMode::On);
        assert_eq!(settings.coordinator().update_interval, Duration::from_millis(100));
        assert_eq!(settings.transport().concurrency, 3);
    }

    #[test]
    fn missing_file_is_reported() {
        let err = Settings::from_file(Path::new("/nonexistent/batchdl.json")).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to read config file"));
    }
}
