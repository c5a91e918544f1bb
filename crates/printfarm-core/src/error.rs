// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Unified error types for the print farm controller.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type for all print farm operations.
#[derive(Debug, Error)]
pub enum FarmError {
    // -- Connectivity errors --
    #[error("could not connect to {hostname}: {detail}")]
    Connect { hostname: String, detail: String },

    #[error("printer has gone offline: {0}")]
    Offline(String),

    // -- Remote printer errors --
    #[error("upload of {path} failed: {detail}")]
    Upload { path: String, detail: String },

    #[error("code {code} failed: {reply}")]
    RemoteCommand { code: String, reply: String },

    #[error("printer HTTP request failed: {0}")]
    Http(String),

    // -- Job errors --
    #[error("job file does not exist: {}", .0.display())]
    JobFileMissing(PathBuf),

    // -- Operator errors --
    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    // -- Lifecycle --
    #[error("operation cancelled by shutdown")]
    Shutdown,

    // -- Storage / persistence --
    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl FarmError {
    /// Whether this error is the result of a deliberate shutdown rather than
    /// a failure.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown)
    }
}

/// Alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, FarmError>;
