// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Print farm core: domain types, shared record handles, errors and
// configuration used by every other crate.

pub mod config;
pub mod error;
pub mod shared;
pub mod types;

pub use config::FarmConfig;
pub use error::FarmError;
pub use shared::{JobHandle, PrinterHandle, SharedJob, SharedPrinter};
pub use types::*;
