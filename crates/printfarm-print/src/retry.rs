// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Error classification and backoff for printer sessions.
//
// Every failure a session sees is sorted into one of four classes.
// Transient and remote failures abort the current attempt, requeue the job
// and retry after a fixed delay.  Job-level failures terminate the job.
// Rejections leave everything unchanged.

use std::time::Duration;

use printfarm_core::error::FarmError;
use printfarm_core::FarmConfig;

/// Fixed delays used by a printer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Wait between connection attempts.
    pub reconnect_delay: Duration,
    /// Wait after a failed print attempt.
    pub requeue_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(2),
            requeue_delay: Duration::from_secs(2),
        }
    }
}

impl From<&FarmConfig> for RetryConfig {
    fn from(config: &FarmConfig) -> Self {
        Self {
            reconnect_delay: config.reconnect_delay(),
            requeue_delay: config.requeue_delay(),
        }
    }
}

/// How a failure affects the job being printed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Connection refused, timeout, printer went away: retry after a backoff
    /// and requeue the job.
    Transient,
    /// The job itself cannot be printed (file vanished); terminate it.
    JobLevel,
    /// An operator request failed a precondition; nothing changes.
    Rejected,
    /// The printer refused a command or an upload; abort the attempt and
    /// requeue the job.
    Remote,
}

/// Classify a `FarmError` for session recovery.
pub fn classify_error(err: &FarmError) -> ErrorClass {
    match err {
        FarmError::Connect { .. } | FarmError::Offline(_) | FarmError::Shutdown => {
            ErrorClass::Transient
        }

        FarmError::Upload { .. } | FarmError::RemoteCommand { .. } | FarmError::Http(_) => {
            ErrorClass::Remote
        }

        FarmError::JobFileMissing(_) => ErrorClass::JobLevel,

        FarmError::Rejected(_) | FarmError::Config(_) => ErrorClass::Rejected,

        FarmError::Serialization(_) => ErrorClass::Remote,

        // IO errors depend on the kind
        FarmError::Io(io_err) => match io_err.kind() {
            std::io::ErrorKind::NotFound => ErrorClass::JobLevel,
            std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof => ErrorClass::Transient,
            _ => ErrorClass::Remote,
        },
    }
}

/// Whether a failure means the printer went away rather than misbehaved.
pub fn is_connectivity_loss(err: &FarmError) -> bool {
    classify_error(err) == ErrorClass::Transient
}
