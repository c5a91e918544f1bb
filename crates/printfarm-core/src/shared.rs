// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Shared, individually locked job and printer records.
//
// Every job and printer is owned by one collection (the queue or the
// registry) but read and mutated from several tasks.  Each record carries
// its own short-lived lock; callers never hold two record locks at once and
// never hold one across an `.await`.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::types::{Job, JobId, Printer};

/// Lock a record, recovering the data if a previous holder panicked.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

/// A job record shared between the queue, sessions and the HTTP layer.
#[derive(Debug)]
pub struct JobHandle {
    id: JobId,
    job: Mutex<Job>,
}

/// Reference-counted job record.
pub type SharedJob = Arc<JobHandle>;

impl JobHandle {
    pub fn new(job: Job) -> SharedJob {
        Arc::new(Self {
            id: JobId::new(),
            job: Mutex::new(job),
        })
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    /// Run `f` with exclusive access to the job.
    pub fn update<R>(&self, f: impl FnOnce(&mut Job) -> R) -> R {
        f(&mut lock(&self.job))
    }

    /// Copy of the current job state.
    pub fn snapshot(&self) -> Job {
        lock(&self.job).clone()
    }

    pub fn filename(&self) -> String {
        lock(&self.job).filename.clone()
    }

    pub fn absolute_filename(&self) -> String {
        lock(&self.job).absolute_filename.clone()
    }

    pub fn hostname(&self) -> Option<String> {
        lock(&self.job).hostname.clone()
    }
}

// ---------------------------------------------------------------------------
// Printers
// ---------------------------------------------------------------------------

/// A printer record shared between the registry and its session.
#[derive(Debug)]
pub struct PrinterHandle {
    printer: Mutex<Printer>,
}

/// Reference-counted printer record.
pub type SharedPrinter = Arc<PrinterHandle>;

impl PrinterHandle {
    pub fn new(printer: Printer) -> SharedPrinter {
        Arc::new(Self {
            printer: Mutex::new(printer),
        })
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut Printer) -> R) -> R {
        f(&mut lock(&self.printer))
    }

    pub fn snapshot(&self) -> Printer {
        lock(&self.printer).clone()
    }

    pub fn hostname(&self) -> String {
        lock(&self.printer).hostname.clone()
    }

    pub fn name(&self) -> String {
        lock(&self.printer).name.clone()
    }

    pub fn is_suspended(&self) -> bool {
        lock(&self.printer).suspended
    }
}
