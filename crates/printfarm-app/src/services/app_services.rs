// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Central service layer: starts the scheduler and gives the HTTP handlers
// access to the queue, the registry and the G-code directory.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use printfarm_core::error::{FarmError, Result};
use printfarm_core::shared::SharedJob;
use printfarm_core::types::Job;
use printfarm_core::FarmConfig;
use printfarm_print::queue::JobQueue;
use printfarm_print::registry::PrinterRegistry;
use printfarm_print::remote::RemoteConnector;
use printfarm_print::scheduler::SchedulerService;
use tracing::{info, warn};

use super::data_dir;

/// Settings file inside the data directory.
const CONFIG_FILE: &str = "config.json";

/// Shared services handed to every request handler.
///
/// Cheap to clone; all state lives behind the scheduler's `Arc`s.
#[derive(Clone)]
pub struct AppServices {
    scheduler: Arc<SchedulerService>,
    gcodes_dir: PathBuf,
}

impl AppServices {
    /// Create the G-code directory and start scheduling.  Must be called
    /// from within the Tokio runtime.
    pub fn start(config: FarmConfig, connector: Arc<dyn RemoteConnector>) -> Result<Self> {
        std::fs::create_dir_all(&config.gcodes_directory)?;
        let gcodes_dir = std::fs::canonicalize(&config.gcodes_directory)?;
        info!(gcodes = %gcodes_dir.display(), "starting app services");

        let scheduler = SchedulerService::start(config, connector);
        Ok(Self {
            scheduler: Arc::new(scheduler),
            gcodes_dir,
        })
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        self.scheduler.queue()
    }

    pub fn registry(&self) -> &Arc<PrinterRegistry> {
        self.scheduler.registry()
    }

    pub fn gcodes_dir(&self) -> &Path {
        &self.gcodes_dir
    }

    /// Stop all sessions and persist state.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
    }

    // -- G-code files --------------------------------------------------------

    /// Local path for an uploaded job file named `filename`.
    pub fn upload_path(&self, filename: &str) -> Result<PathBuf> {
        Ok(self.gcodes_dir.join(relative_path(filename)?))
    }

    /// Local path for a firmware path such as `0:/gcodes/sub/a.gcode`.
    pub fn resolve_firmware_path(&self, path: &str) -> Result<PathBuf> {
        self.upload_path(strip_firmware_prefix(path))
    }

    /// Write `contents` to `path`, creating parent directories, and queue
    /// it as a new job.
    pub async fn store_job(&self, path: &Path, contents: &[u8]) -> Result<SharedJob> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, contents).await?;
        info!(path = %path.display(), bytes = contents.len(), "job file stored");
        Ok(self.queue().add(Job::new(path.to_string_lossy())))
    }
}

/// Strip a leading drive/slash run (`0:/`, `/`) and a `gcodes/` segment.
fn strip_firmware_prefix(path: &str) -> &str {
    let path = path.trim_start_matches(|c: char| c.is_ascii_digit() || c == ':' || c == '/');
    path.strip_prefix("gcodes/").unwrap_or(path)
}

/// Validate a client supplied path: non-empty, relative and free of `..`.
fn relative_path(raw: &str) -> Result<PathBuf> {
    let path = Path::new(raw.trim());
    let mut parts = path.components().peekable();
    if parts.peek().is_none() {
        return Err(FarmError::Rejected("empty file name".into()));
    }
    if parts.all(|c| matches!(c, Component::Normal(_) | Component::CurDir)) {
        Ok(path.to_path_buf())
    } else {
        Err(FarmError::Rejected(format!("invalid file name {raw}")))
    }
}

// -- Configuration -----------------------------------------------------------

/// Load settings from `explicit`, or from `config.json` in the data
/// directory.  A missing data directory file is created with defaults.
pub fn load_config(explicit: Option<&Path>) -> Result<FarmConfig> {
    if let Some(path) = explicit {
        info!(path = %path.display(), "loading configuration");
        return FarmConfig::load(path);
    }

    let dir = data_dir::data_dir();
    let path = dir.join(CONFIG_FILE);
    if path.exists() {
        info!(path = %path.display(), "loading configuration");
        return FarmConfig::load(&path);
    }

    let config = FarmConfig::with_data_dir(&dir);
    match config.persist(&path) {
        Ok(()) => info!(path = %path.display(), "wrote default configuration"),
        Err(e) => warn!(path = %path.display(), error = %e, "could not write default configuration"),
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn firmware_prefix_is_stripped() {
        assert_eq!(strip_firmware_prefix("0:/gcodes/a.gcode"), "a.gcode");
        assert_eq!(strip_firmware_prefix("/gcodes/sub/a.gcode"), "sub/a.gcode");
        assert_eq!(strip_firmware_prefix("gcodes/a.gcode"), "a.gcode");
        assert_eq!(strip_firmware_prefix("1:/macros/x.g"), "macros/x.g");
        assert_eq!(strip_firmware_prefix("a.gcode"), "a.gcode");
    }

    #[test]
    fn relative_path_rejects_escapes() {
        assert!(relative_path("sub/a.gcode").is_ok());
        assert!(relative_path("").is_err());
        assert!(relative_path("   ").is_err());
        assert!(relative_path("../etc/passwd").is_err());
        assert!(relative_path("/etc/passwd").is_err());
        assert!(relative_path("sub/../../a.gcode").is_err());
    }

    #[test]
    fn explicit_config_is_loaded() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("farm.json");
        std::fs::write(&path, r#"{ "GCodesDirectory": "/srv/gcodes", "Listen": "127.0.0.1:8080" }"#)
            .expect("write config");

        let config = load_config(Some(&path)).expect("load");
        assert_eq!(config.gcodes_directory, PathBuf::from("/srv/gcodes"));
        assert_eq!(config.listen, "127.0.0.1:8080");
        assert_eq!(config.reconnect_delay_ms, FarmConfig::default().reconnect_delay_ms);
    }

    #[test]
    fn broken_config_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("farm.json");
        std::fs::write(&path, "{ not json").expect("write config");
        assert!(load_config(Some(&path)).is_err());
    }
}
