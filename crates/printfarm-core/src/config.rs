// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Application configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FarmError, Result};

/// Persistent controller settings, stored as a JSON file.
///
/// Keys are PascalCase so that existing `appsettings`-style files with
/// `GCodesDirectory`, `JobQueueFile` and `PrintersFile` load unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct FarmConfig {
    /// Local directory holding uploaded G-code files.
    #[serde(rename = "GCodesDirectory")]
    pub gcodes_directory: PathBuf,
    /// File the job queue is persisted to.
    pub job_queue_file: PathBuf,
    /// File the printer registry is persisted to.
    pub printers_file: PathBuf,
    /// HTTP bind address for the dashboard API.
    pub listen: String,
    /// Delay between connection attempts to an unreachable printer.
    pub reconnect_delay_ms: u64,
    /// Delay after a failed print attempt before trying again.
    pub requeue_delay_ms: u64,
    /// How often the remote object model is polled.
    pub poll_interval_ms: u64,
    /// Longest wait for a G-code reply.
    pub reply_timeout_ms: u64,
    /// Board password sent on connect.
    pub password: String,
}

impl FarmConfig {
    /// Defaults rooted at `data_dir`.
    pub fn with_data_dir(data_dir: &Path) -> Self {
        Self {
            gcodes_directory: data_dir.join("gcodes"),
            job_queue_file: data_dir.join("jobs.json"),
            printers_file: data_dir.join("printers.json"),
            ..Self::default()
        }
    }

    /// Load settings from a JSON file.  Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Write settings to a JSON file.
    pub fn persist(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen.trim().is_empty() {
            return Err(FarmError::Config("Listen must not be empty".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(FarmError::Config("PollIntervalMs must be positive".into()));
        }
        Ok(())
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn requeue_delay(&self) -> Duration {
        Duration::from_millis(self.requeue_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }
}

impl Default for FarmConfig {
    fn default() -> Self {
        Self {
            gcodes_directory: PathBuf::from("gcodes"),
            job_queue_file: PathBuf::from("jobs.json"),
            printers_file: PathBuf::from("printers.json"),
            listen: "0.0.0.0:5000".into(),
            reconnect_delay_ms: 2000,
            requeue_delay_ms: 2000,
            poll_interval_ms: 250,
            reply_timeout_ms: 60_000,
            password: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"GCodesDirectory":"/srv/gcodes","Listen":"127.0.0.1:8080"}"#)
            .expect("write");

        let config = FarmConfig::load(&path).expect("load");
        assert_eq!(config.gcodes_directory, PathBuf::from("/srv/gcodes"));
        assert_eq!(config.listen, "127.0.0.1:8080");
        assert_eq!(config.reconnect_delay(), Duration::from_secs(2));
        assert_eq!(config.job_queue_file, PathBuf::from("jobs.json"));
    }

    #[test]
    fn persist_then_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        let mut config = FarmConfig::with_data_dir(dir.path());
        config.password = "secret".into();
        config.persist(&path).expect("persist");

        assert_eq!(FarmConfig::load(&path).expect("load"), config);
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let config = FarmConfig {
            poll_interval_ms: 0,
            ..FarmConfig::default()
        };
        assert!(matches!(config.validate(), Err(FarmError::Config(_))));
    }
}
