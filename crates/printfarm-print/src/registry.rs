// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Registry of configured printers.
//
// The registry owns the printer records and announces every membership or
// suspension change as a `PrinterEvent` on an mpsc channel.  The scheduler
// consumes those events to start, pause and stop printer sessions.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tracing::{debug, info, instrument};

use printfarm_core::error::Result;
use printfarm_core::shared::{PrinterHandle, SharedPrinter};
use printfarm_core::types::Printer;

/// Change to the set of printers or to a printer's suspension flag.
#[derive(Debug, Clone)]
pub enum PrinterEvent {
    Added(SharedPrinter),
    Suspended(SharedPrinter),
    Resumed(SharedPrinter),
    Removed(SharedPrinter),
}

/// Printers keyed by hostname, in insertion order.
pub struct PrinterRegistry {
    printers: Mutex<Vec<SharedPrinter>>,
    events: mpsc::UnboundedSender<PrinterEvent>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<PrinterEvent>>>,
}

impl Default for PrinterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PrinterRegistry {
    pub fn new() -> Self {
        let (events, event_rx) = mpsc::unbounded_channel();
        Self {
            printers: Mutex::new(Vec::new()),
            events,
            event_rx: Mutex::new(Some(event_rx)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<SharedPrinter>> {
        self.printers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: PrinterEvent) {
        // Nobody listening is only possible once the scheduler has stopped.
        if self.events.send(event).is_err() {
            debug!("printer event dropped, no listener");
        }
    }

    /// Take the receiver for printer events.  Returns `None` after the
    /// first call.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PrinterEvent>> {
        self.event_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn get(&self, hostname: &str) -> Option<SharedPrinter> {
        self.lock()
            .iter()
            .find(|p| p.hostname() == hostname)
            .cloned()
    }

    pub fn snapshot(&self) -> Vec<Printer> {
        self.lock().iter().map(|p| p.snapshot()).collect()
    }

    /// The registry as a JSON array.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.snapshot())?)
    }

    // -- Membership ----------------------------------------------------------

    /// Register a printer.  Adding a known hostname does nothing.
    ///
    /// Returns whether a new printer was added.
    pub fn add(&self, hostname: &str) -> bool {
        let mut printers = self.lock();
        if printers.iter().any(|p| p.hostname() == hostname) {
            return false;
        }
        let printer = PrinterHandle::new(Printer::new(hostname));
        printers.push(Arc::clone(&printer));
        drop(printers);

        self.emit(PrinterEvent::Added(printer));
        info!(%hostname, "printer added");
        true
    }

    /// Stop `hostname` from taking new jobs.  No-op if unknown or already
    /// suspended.
    pub fn suspend(&self, hostname: &str) -> bool {
        let Some(printer) = self.get(hostname) else {
            return false;
        };
        let changed = printer.update(|p| !std::mem::replace(&mut p.suspended, true));
        if changed {
            self.emit(PrinterEvent::Suspended(printer));
            info!(%hostname, "printer suspended");
        }
        changed
    }

    /// Let a suspended printer take jobs again.
    pub fn resume(&self, hostname: &str) -> bool {
        let Some(printer) = self.get(hostname) else {
            return false;
        };
        let changed = printer.update(|p| std::mem::replace(&mut p.suspended, false));
        if changed {
            self.emit(PrinterEvent::Resumed(printer));
            info!(%hostname, "printer resumed");
        }
        changed
    }

    /// Forget `hostname`.
    pub fn remove(&self, hostname: &str) -> bool {
        let mut printers = self.lock();
        let Some(index) = printers.iter().position(|p| p.hostname() == hostname) else {
            return false;
        };
        let printer = printers.remove(index);
        drop(printers);

        self.emit(PrinterEvent::Removed(printer));
        info!(%hostname, "printer removed");
        true
    }

    // -- Persistence ---------------------------------------------------------

    #[instrument(skip(self), fields(path = %path.display()))]
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec(&self.snapshot())?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, json)?;
        debug!("printers saved");
        Ok(())
    }

    /// Replace the registry with the printers stored in `path`.
    ///
    /// Every loaded printer starts disconnected and is announced with
    /// [`PrinterEvent::Added`].
    #[instrument(skip(self), fields(path = %path.display()))]
    pub fn load_from_file(&self, path: &Path) -> Result<()> {
        let data = std::fs::read(path)?;
        let loaded: Vec<Printer> = serde_json::from_slice(&data)?;

        let printers: Vec<SharedPrinter> = loaded
            .into_iter()
            .map(|mut printer| {
                printer.mark_disconnected();
                PrinterHandle::new(printer)
            })
            .collect();

        *self.lock() = printers.clone();
        for printer in printers {
            self.emit(PrinterEvent::Added(printer));
        }
        info!(count = self.len(), "printers loaded");
        Ok(())
    }
}
