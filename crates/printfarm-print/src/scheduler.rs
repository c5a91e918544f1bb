// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Scheduler service: owns the job queue, the printer registry and one
// `PrinterSession` per registered printer.
//
// A single dispatcher task consumes registry events (start, suspend, resume
// and stop sessions) and job commands (forward pause/resume/cancel to the
// session whose printer claimed the job).  Shutdown stops the dispatcher,
// disposes every session and then writes both state files.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use printfarm_core::FarmConfig;

use crate::queue::{JobAction, JobCommand, JobQueue};
use crate::registry::{PrinterEvent, PrinterRegistry};
use crate::remote::RemoteConnector;
use crate::retry::RetryConfig;
use crate::session::PrinterSession;

/// The running print farm.
pub struct SchedulerService {
    config: FarmConfig,
    queue: Arc<JobQueue>,
    registry: Arc<PrinterRegistry>,
    shutdown: CancellationToken,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl SchedulerService {
    /// Restore persisted state and start scheduling.
    ///
    /// The queue file is loaded before the printers file so that sessions
    /// created for restored printers find the jobs they had claimed.
    /// Unreadable state files are logged and skipped.
    pub fn start(config: FarmConfig, connector: Arc<dyn RemoteConnector>) -> Self {
        let queue = Arc::new(JobQueue::new());
        let registry = Arc::new(PrinterRegistry::new());
        let shutdown = CancellationToken::new();

        if config.job_queue_file.exists() {
            if let Err(e) = queue.load_from_file(&config.job_queue_file) {
                error!(error = %e, "failed to load job queue");
            }
        }

        let dispatcher = Dispatcher {
            queue: Arc::clone(&queue),
            connector,
            retry: RetryConfig::from(&config),
            shutdown: shutdown.clone(),
            sessions: HashMap::new(),
            tasks: JoinSet::new(),
        };
        let handle = match (registry.take_events(), queue.take_commands()) {
            (Some(events), Some(commands)) => Some(tokio::spawn(dispatcher.run(events, commands))),
            _ => None,
        };

        if config.printers_file.exists() {
            if let Err(e) = registry.load_from_file(&config.printers_file) {
                error!(error = %e, "failed to load printers");
            }
        }

        info!(
            jobs = queue.len(),
            printers = registry.len(),
            "scheduler started"
        );
        Self {
            config,
            queue,
            registry,
            shutdown,
            dispatcher: Mutex::new(handle),
        }
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn registry(&self) -> &Arc<PrinterRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &FarmConfig {
        &self.config
    }

    /// Stop every session, then save the registry and the queue.
    /// Save failures are logged.  Idempotent.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let dispatcher = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(dispatcher) = dispatcher else {
            return;
        };
        if let Err(e) = dispatcher.await {
            error!(error = %e, "scheduler dispatcher panicked");
        }

        if let Err(e) = self.registry.save_to_file(&self.config.printers_file) {
            error!(error = %e, "failed to save printers");
        }
        if let Err(e) = self.queue.save_to_file(&self.config.job_queue_file) {
            error!(error = %e, "failed to save job queue");
        }
        info!("scheduler stopped");
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

struct Dispatcher {
    queue: Arc<JobQueue>,
    connector: Arc<dyn RemoteConnector>,
    retry: RetryConfig,
    shutdown: CancellationToken,
    /// Live sessions keyed by hostname.
    sessions: HashMap<String, Arc<PrinterSession>>,
    /// Session disposals and in-flight job commands.
    tasks: JoinSet<()>,
}

enum Step {
    Event(PrinterEvent),
    Command(JobCommand),
}

impl Dispatcher {
    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<PrinterEvent>,
        mut commands: mpsc::UnboundedReceiver<JobCommand>,
    ) {
        loop {
            let step = tokio::select! {
                Some(event) = events.recv() => Step::Event(event),
                Some(command) = commands.recv() => Step::Command(command),
                Some(_) = self.tasks.join_next(), if !self.tasks.is_empty() => continue,
                _ = self.shutdown.cancelled() => break,
            };
            match step {
                Step::Event(event) => self.printer_event(event),
                Step::Command(command) => self.job_command(command),
            }
        }

        for (_, session) in self.sessions.drain() {
            self.tasks.spawn(async move { session.dispose().await });
        }
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "scheduler task failed");
            }
        }
        debug!("dispatcher stopped");
    }

    fn printer_event(&mut self, event: PrinterEvent) {
        match event {
            PrinterEvent::Added(printer) => {
                let hostname = printer.hostname();
                if self.sessions.contains_key(&hostname) {
                    warn!(%hostname, "session already running");
                    return;
                }
                let session = PrinterSession::spawn(
                    printer,
                    Arc::clone(&self.queue),
                    Arc::clone(&self.connector),
                    self.retry,
                    &self.shutdown,
                );
                self.sessions.insert(hostname, Arc::new(session));
            }
            PrinterEvent::Suspended(printer) => {
                if let Some(session) = self.sessions.get(&printer.hostname()) {
                    session.suspend();
                }
            }
            PrinterEvent::Resumed(printer) => {
                if let Some(session) = self.sessions.get(&printer.hostname()) {
                    session.resume();
                }
            }
            PrinterEvent::Removed(printer) => {
                if let Some(session) = self.sessions.remove(&printer.hostname()) {
                    self.tasks.spawn(async move { session.retire().await });
                }
            }
        }
    }

    fn job_command(&mut self, command: JobCommand) {
        let JobCommand { action, job, reply } = command;

        let session = job
            .hostname()
            .and_then(|hostname| self.sessions.get(&hostname).cloned());
        let Some(session) = session else {
            warn!(file = %job.filename(), %action, "no session owns this job");
            let _ = reply.send(false);
            return;
        };

        self.tasks.spawn(async move {
            let accepted = match action {
                JobAction::Pause => session.pause_print().await,
                JobAction::Resume => session.resume_print().await,
                JobAction::Cancel => session.cancel_print().await,
            };
            if accepted {
                job.update(|j| match action {
                    JobAction::Pause => j.paused = true,
                    JobAction::Resume => j.paused = false,
                    JobAction::Cancel => {
                        j.cancelled = true;
                        j.paused = false;
                    }
                });
            }
            info!(file = %job.filename(), %action, accepted, "job command handled");
            // The requester may have stopped waiting.
            let _ = reply.send(accepted);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use printfarm_core::types::{Job, MachineStatus};

    use crate::remote::FieldChange;
    use crate::testing::{SimConnector, SimPrinter, eventually};

    fn test_config(dir: &std::path::Path) -> FarmConfig {
        FarmConfig {
            reconnect_delay_ms: 20,
            requeue_delay_ms: 50,
            ..FarmConfig::with_data_dir(dir)
        }
    }

    fn job_file(dir: &std::path::Path, name: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, b"G28\n").expect("write job file");
        path.to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn added_printer_gets_a_session() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sim = SimPrinter::new("p1", MachineStatus::Idle);
        let service = SchedulerService::start(test_config(dir.path()), SimConnector::new([Arc::clone(&sim)]));

        service.registry().add("p1");
        eventually(|| {
            service
                .registry()
                .get("p1")
                .is_some_and(|p| p.snapshot().online)
        })
        .await;
        assert_eq!(sim.connect_attempts(), 1);

        service.shutdown().await;
        assert!(sim.has_entry("close"));
    }

    #[tokio::test]
    async fn one_job_is_claimed_by_exactly_one_printer() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sims = [
            SimPrinter::new("p1", MachineStatus::Idle),
            SimPrinter::new("p2", MachineStatus::Idle),
        ];
        let service = SchedulerService::start(test_config(dir.path()), SimConnector::new(sims.clone()));
        service.registry().add("p1");
        service.registry().add("p2");

        let job = service.queue().add(Job::new(job_file(dir.path(), "a.gcode")));
        eventually(|| sims.iter().any(|s| s.has_entry("code M32 \"a.gcode\""))).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let starts: usize = sims
            .iter()
            .map(|s| s.count_entries("code M32 \"a.gcode\""))
            .sum();
        assert_eq!(starts, 1);
        assert!(job.hostname().is_some());

        service.shutdown().await;
    }

    #[tokio::test]
    async fn pause_reaches_the_owning_session() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sim = SimPrinter::new("p1", MachineStatus::Idle);
        let service = SchedulerService::start(test_config(dir.path()), SimConnector::new([Arc::clone(&sim)]));
        service.registry().add("p1");

        let job = service.queue().add(Job::new(job_file(dir.path(), "a.gcode")));
        sim.wait_for_entry("code M32 \"a.gcode\"").await;
        sim.push(FieldChange::File {
            name: Some("0:/gcodes/a.gcode".into()),
            size: 100,
            print_time: None,
            simulated_time: None,
        });
        sim.push(FieldChange::Status(MachineStatus::Processing));
        sim.push(FieldChange::FilePosition(Some(10)));
        eventually(|| job.snapshot().progress.is_some()).await;

        let reply = service.queue().pause(0).expect("pause accepted");
        assert!(reply.await.expect("reply"));
        assert!(job.snapshot().paused);
        assert!(sim.has_entry("code M25"));

        sim.push(FieldChange::Status(MachineStatus::Paused));
        let reply = service.queue().cancel(0).expect("cancel accepted");
        assert!(reply.await.expect("reply"));
        let cancelled = job.snapshot();
        assert!(cancelled.cancelled);
        assert!(!cancelled.paused);
        assert!(sim.has_entry("code M0"));

        service.shutdown().await;
    }

    #[tokio::test]
    async fn command_for_unknown_printer_is_refused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let service = SchedulerService::start(test_config(dir.path()), SimConnector::new([]));

        let job = service.queue().add(Job::new("/g/a.gcode"));
        job.update(|j| {
            j.hostname = Some("ghost".into());
            j.progress = Some(0.5);
        });

        let reply = service.queue().pause(0).expect("precondition holds");
        assert!(!reply.await.expect("reply"));
        assert!(!job.snapshot().paused);

        service.shutdown().await;
    }

    #[tokio::test]
    async fn removed_printer_session_is_disposed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sim = SimPrinter::new("p1", MachineStatus::Idle);
        let service = SchedulerService::start(test_config(dir.path()), SimConnector::new([Arc::clone(&sim)]));

        service.registry().add("p1");
        eventually(|| sim.connect_attempts() == 1).await;
        service.registry().remove("p1");
        sim.wait_for_entry("close").await;

        service.shutdown().await;
    }

    #[tokio::test]
    async fn removing_a_busy_printer_returns_its_job() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sim = SimPrinter::new("p1", MachineStatus::Idle);
        let service = SchedulerService::start(test_config(dir.path()), SimConnector::new([Arc::clone(&sim)]));
        service.registry().add("p1");

        let job = service.queue().add(Job::new(job_file(dir.path(), "a.gcode")));
        sim.wait_for_entry("code M32 \"a.gcode\"").await;
        sim.push(FieldChange::Status(MachineStatus::Processing));
        eventually(|| job.snapshot().progress_text.is_none()).await;

        service.registry().remove("p1");
        sim.wait_for_entry("close").await;
        eventually(|| job.hostname().is_none()).await;
        assert!(job.snapshot().is_ready_to_print());

        service.shutdown().await;
    }

    #[tokio::test]
    async fn suspended_printer_takes_no_jobs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sim = SimPrinter::new("p1", MachineStatus::Idle);
        let service = SchedulerService::start(test_config(dir.path()), SimConnector::new([Arc::clone(&sim)]));

        service.registry().add("p1");
        service.registry().suspend("p1");
        let job = service.queue().add(Job::new(job_file(dir.path(), "a.gcode")));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(job.hostname().is_none());

        service.registry().resume("p1");
        sim.wait_for_entry("code M32 \"a.gcode\"").await;

        service.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_persists_and_start_restores() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = test_config(dir.path());

        let service = SchedulerService::start(config.clone(), SimConnector::new([]));
        service.registry().add("p1");
        service.queue().add(Job::new(job_file(dir.path(), "a.gcode")));
        service.shutdown().await;
        service.shutdown().await;

        assert!(config.printers_file.exists());
        assert!(config.job_queue_file.exists());

        let restored = SchedulerService::start(config, SimConnector::new([]));
        assert_eq!(restored.registry().len(), 1);
        assert_eq!(restored.queue().len(), 1);
        let printer = restored.registry().get("p1").expect("restored");
        assert_eq!(printer.snapshot().status, MachineStatus::Disconnected);
        assert!(restored.queue().try_dequeue().is_some());

        restored.shutdown().await;
    }
}
