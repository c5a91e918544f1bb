// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Printfarm Print: the shared job queue, the printer registry, per-printer
// sessions that drive Duet boards through the queue, and the scheduler that
// ties them together.

pub mod duet_client;
pub mod queue;
pub mod registry;
pub mod remote;
pub mod retry;
pub mod scheduler;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use duet_client::DuetConnector;
pub use queue::{JobAction, JobCommand, JobQueue};
pub use registry::{PrinterEvent, PrinterRegistry};
pub use remote::{Connection, FieldChange, RemoteConnector, RemoteModel, RemoteSession};
pub use retry::RetryConfig;
pub use scheduler::SchedulerService;
pub use session::PrinterSession;
