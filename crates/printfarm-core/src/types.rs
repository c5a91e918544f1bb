// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Core domain types for the print farm controller.
//
// `Job` and `Printer` are plain data records.  They are serialised with
// PascalCase keys because the persisted queue/printer files and the
// dashboard JSON share a single wire shape.

use std::path::Path;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Process-local identity of a job record.
///
/// Two `Job` values with equal fields are still different jobs; the queue
/// compares records by this id, never by value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Machine status
// ---------------------------------------------------------------------------

/// Status reported by a remote printer's object model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MachineStatus {
    Starting,
    Updating,
    Off,
    Halted,
    Pausing,
    Paused,
    Resuming,
    Cancelling,
    Processing,
    Simulating,
    Busy,
    ChangingTool,
    Idle,
    #[default]
    Disconnected,
}

impl MachineStatus {
    /// Whether a printer reporting this status counts as online.
    pub fn is_online(self) -> bool {
        !matches!(
            self,
            Self::Starting | Self::Halted | Self::Updating | Self::Disconnected
        )
    }
}

impl std::fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Updating => "updating",
            Self::Off => "off",
            Self::Halted => "halted",
            Self::Pausing => "pausing",
            Self::Paused => "paused",
            Self::Resuming => "resuming",
            Self::Cancelling => "cancelling",
            Self::Processing => "processing",
            Self::Simulating => "simulating",
            Self::Busy => "busy",
            Self::ChangingTool => "changingTool",
            Self::Idle => "idle",
            Self::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A single G-code file to be printed exactly once per enqueue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Job {
    /// Full path of the G-code file on the controller host.
    pub absolute_filename: String,
    /// Last path segment of `absolute_filename`.
    #[serde(default)]
    pub filename: String,
    /// Printer that has claimed this job, if any.
    pub hostname: Option<String>,
    /// Last-write time of the file when the job was created.
    #[serde(default = "Local::now")]
    pub time_created: DateTime<Local>,
    /// Transient status line ("starting", "finishing", ...).
    pub progress_text: Option<String>,
    /// Fraction printed in `[0, 1]`.
    pub progress: Option<f64>,
    pub paused: bool,
    pub cancelled: bool,
    /// Estimated seconds remaining.
    pub time_left: Option<i64>,
    /// Set once the job is terminal.
    pub time_completed: Option<DateTime<Local>>,
}

impl Job {
    /// Create a job for a file on disk.
    ///
    /// `time_created` is the file's last-write time when the file exists,
    /// otherwise the current time.
    pub fn new(absolute_filename: impl Into<String>) -> Self {
        let absolute_filename = absolute_filename.into();
        let time_created = std::fs::metadata(&absolute_filename)
            .and_then(|meta| meta.modified())
            .map(DateTime::<Local>::from)
            .unwrap_or_else(|_| Local::now());

        Self {
            filename: file_name_of(&absolute_filename),
            absolute_filename,
            hostname: None,
            time_created,
            progress_text: None,
            progress: None,
            paused: false,
            cancelled: false,
            time_left: None,
            time_completed: None,
        }
    }

    /// Clear every piece of run state so the job can be printed again.
    pub fn reset(&mut self) {
        self.hostname = None;
        self.progress_text = None;
        self.progress = None;
        self.paused = false;
        self.cancelled = false;
        self.time_left = None;
        self.time_completed = None;
    }

    /// Unclaimed, not paused, not cancelled, not terminal.
    pub fn is_ready_to_print(&self) -> bool {
        self.hostname.is_none() && !self.paused && !self.cancelled && self.time_completed.is_none()
    }

    pub fn is_terminal(&self) -> bool {
        self.time_completed.is_some()
    }

    /// Re-derive `filename` from `absolute_filename` (used after loading
    /// records that predate the `Filename` key).
    pub fn refresh_filename(&mut self) {
        self.filename = file_name_of(&self.absolute_filename);
    }
}

/// Last path segment of `path`, or the whole string if it has none.
pub fn file_name_of(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

// ---------------------------------------------------------------------------
// Printer
// ---------------------------------------------------------------------------

/// Mirror of one remote printer plus its operator-controlled flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Printer {
    /// Display name; the hostname until the printer reports its own.
    pub name: String,
    /// Unique key within the registry.
    pub hostname: String,
    #[serde(default)]
    pub status: MachineStatus,
    #[serde(default)]
    pub online: bool,
    #[serde(default)]
    pub suspended: bool,
    /// Name of the file the printer is currently working on.
    pub job_file: Option<String>,
}

impl Printer {
    pub fn new(hostname: impl Into<String>) -> Self {
        let hostname = hostname.into();
        Self {
            name: hostname.clone(),
            hostname,
            status: MachineStatus::Disconnected,
            online: false,
            suspended: false,
            job_file: None,
        }
    }

    /// Forget everything learnt from the remote side.
    pub fn mark_disconnected(&mut self) {
        self.status = MachineStatus::Disconnected;
        self.online = false;
        self.job_file = None;
    }
}
