// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Contract between a printer session and the remote printer it drives.
//
// A connector opens a session to one host and yields the printer's current
// object model plus a stream of field changes.  Sessions only ever talk to
// printers through these traits, so the Duet HTTP client and the in-process
// simulator used by the tests are interchangeable.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use tokio::sync::mpsc;

use printfarm_core::error::Result;
use printfarm_core::types::MachineStatus;

/// The subset of a printer's object model a session cares about.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteModel {
    /// `network.name`.
    pub network_name: String,
    /// `state.status`.
    pub status: MachineStatus,
    /// `job.file.fileName`, a firmware path such as `0:/gcodes/a.gcode`.
    pub file_name: Option<String>,
    /// `job.file.size` in bytes.
    pub file_size: u64,
    /// `job.file.printTime`, seconds.
    pub print_time: Option<i64>,
    /// `job.file.simulatedTime`, seconds.
    pub simulated_time: Option<i64>,
    /// `job.duration`, seconds spent on the current job.
    pub duration: Option<i64>,
    /// `job.filePosition`, bytes read from the current file.
    pub file_position: Option<u64>,
}

impl RemoteModel {
    /// Best available total print time estimate.
    pub fn estimated_print_time(&self) -> Option<i64> {
        self.print_time.or(self.simulated_time)
    }

    /// Fold a change into the model.
    pub fn apply(&mut self, change: &FieldChange) {
        match change {
            FieldChange::Duration(duration) => self.duration = *duration,
            FieldChange::FilePosition(position) => self.file_position = *position,
            FieldChange::File {
                name,
                size,
                print_time,
                simulated_time,
            } => {
                self.file_name = name.clone();
                self.file_size = *size;
                self.print_time = *print_time;
                self.simulated_time = *simulated_time;
            }
            FieldChange::NetworkName(name) => self.network_name = name.clone(),
            FieldChange::Status(status) => self.status = *status,
        }
    }
}

/// A change pushed by the remote printer.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldChange {
    Duration(Option<i64>),
    FilePosition(Option<u64>),
    /// The file being printed changed (or was cleared).
    File {
        name: Option<String>,
        size: u64,
        print_time: Option<i64>,
        simulated_time: Option<i64>,
    },
    NetworkName(String),
    Status(MachineStatus),
}

/// An open connection to one remote printer.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Run one line of G-code and return the printer's reply text.
    async fn send_code(&self, code: &str) -> Result<String>;

    /// Store `contents` at the firmware path `path`, stamped with `modified`.
    async fn upload(&self, path: &str, contents: Vec<u8>, modified: DateTime<Local>) -> Result<()>;

    /// Delete the file at the firmware path `path`.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Stop pushing changes and release the connection.
    async fn close(&self);
}

/// What a successful connect yields.
pub struct Connection {
    pub session: Arc<dyn RemoteSession>,
    /// Object model at the time of connecting.
    pub model: RemoteModel,
    /// Changes after `model`, in the order the printer reported them.
    pub changes: mpsc::UnboundedReceiver<FieldChange>,
}

/// Opens sessions to remote printers.
#[async_trait]
pub trait RemoteConnector: Send + Sync + 'static {
    async fn connect(&self, hostname: &str) -> Result<Connection>;
}
