// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// In-process printer simulator for session and scheduler tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use tokio::sync::mpsc;

use printfarm_core::error::{FarmError, Result};
use printfarm_core::types::MachineStatus;

use crate::remote::{Connection, FieldChange, RemoteConnector, RemoteModel, RemoteSession};
use crate::retry::RetryConfig;

pub(crate) fn fast_retry() -> RetryConfig {
    RetryConfig {
        reconnect_delay: Duration::from_millis(20),
        requeue_delay: Duration::from_millis(50),
    }
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub(crate) async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// One simulated printer.  Records everything sessions do to it.
pub(crate) struct SimPrinter {
    hostname: String,
    status: MachineStatus,
    log: Mutex<Vec<String>>,
    replies: Mutex<HashMap<String, String>>,
    changes: Mutex<Option<mpsc::UnboundedSender<FieldChange>>>,
    failing_connects: AtomicUsize,
    connects: AtomicUsize,
}

impl SimPrinter {
    pub(crate) fn new(hostname: &str, status: MachineStatus) -> Arc<Self> {
        Arc::new(Self {
            hostname: hostname.to_string(),
            status,
            log: Mutex::new(Vec::new()),
            replies: Mutex::new(HashMap::new()),
            changes: Mutex::new(None),
            failing_connects: AtomicUsize::new(0),
            connects: AtomicUsize::new(0),
        })
    }

    pub(crate) fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Answer `code` with `reply` instead of an empty string.
    pub(crate) fn reply_to(&self, code: &str, reply: &str) {
        self.replies
            .lock()
            .unwrap()
            .insert(code.to_string(), reply.to_string());
    }

    pub(crate) fn fail_next_connects(&self, count: usize) {
        self.failing_connects.store(count, Ordering::SeqCst);
    }

    pub(crate) fn connect_attempts(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Report a change to the connected session.
    pub(crate) fn push(&self, change: FieldChange) {
        let changes = self.changes.lock().unwrap();
        changes
            .as_ref()
            .expect("not connected")
            .send(change)
            .expect("session listening");
    }

    pub(crate) fn entries(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub(crate) fn has_entry(&self, entry: &str) -> bool {
        self.count_entries(entry) > 0
    }

    pub(crate) fn count_entries(&self, entry: &str) -> usize {
        self.log.lock().unwrap().iter().filter(|e| *e == entry).count()
    }

    pub(crate) async fn wait_for_entry(&self, entry: &str) {
        eventually(|| self.has_entry(entry)).await;
    }

    fn record(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }
}

struct SimSession {
    printer: Arc<SimPrinter>,
}

#[async_trait]
impl RemoteSession for SimSession {
    async fn send_code(&self, code: &str) -> Result<String> {
        self.printer.record(format!("code {code}"));
        let reply = self.printer.replies.lock().unwrap().get(code).cloned();
        Ok(reply.unwrap_or_default())
    }

    async fn upload(&self, path: &str, _contents: Vec<u8>, _modified: DateTime<Local>) -> Result<()> {
        self.printer.record(format!("upload {path}"));
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.printer.record(format!("delete {path}"));
        Ok(())
    }

    async fn close(&self) {
        self.printer.record("close".to_string());
    }
}

/// Connector that hands out sessions to registered simulators.
pub(crate) struct SimConnector {
    printers: HashMap<String, Arc<SimPrinter>>,
}

impl SimConnector {
    pub(crate) fn new(printers: impl IntoIterator<Item = Arc<SimPrinter>>) -> Arc<Self> {
        Arc::new(Self {
            printers: printers
                .into_iter()
                .map(|p| (p.hostname.clone(), p))
                .collect(),
        })
    }
}

#[async_trait]
impl RemoteConnector for SimConnector {
    async fn connect(&self, hostname: &str) -> Result<Connection> {
        let printer = self
            .printers
            .get(hostname)
            .cloned()
            .ok_or_else(|| FarmError::Connect {
                hostname: hostname.to_string(),
                detail: "no such host".into(),
            })?;
        printer.connects.fetch_add(1, Ordering::SeqCst);

        let failing = printer.failing_connects.load(Ordering::SeqCst);
        if failing > 0 {
            printer.failing_connects.store(failing - 1, Ordering::SeqCst);
            return Err(FarmError::Connect {
                hostname: hostname.to_string(),
                detail: "connection refused".into(),
            });
        }

        let (tx, changes) = mpsc::unbounded_channel();
        *printer.changes.lock().unwrap() = Some(tx);
        let model = RemoteModel {
            network_name: format!("Sim {hostname}"),
            status: printer.status,
            ..RemoteModel::default()
        };
        Ok(Connection {
            session: Arc::new(SimSession { printer }),
            model,
            changes,
        })
    }
}
