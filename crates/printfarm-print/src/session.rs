// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Per-printer session: connects to one remote printer, mirrors its state
// into the shared `Printer` record and feeds it jobs from the queue.
//
// # Lifecycle
//
// 1. Connect, retrying with a fixed delay until the session is disposed.
// 2. Copy the remote object model into the printer record and start
//    following field changes.
// 3. Pick up a job this printer had claimed before a restart, if any, and
//    follow it to the end even while the printer is suspended.
// 4. Loop: wait until active and idle, claim a job, upload it, run the
//    queue macro, start the print, wait for it to finish, chain straight
//    into the next job when there is one, otherwise run the end macro.
//
// Any failure while a job is attached puts the job (and an already claimed
// follow-up job) back into the queue and retries after a delay.  Losing the
// printer while a job is attached aborts every pending wait at once.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Local};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use printfarm_core::error::{FarmError, Result};
use printfarm_core::shared::{SharedJob, SharedPrinter};
use printfarm_core::types::{Job, MachineStatus, file_name_of};

use crate::queue::JobQueue;
use crate::remote::{Connection, FieldChange, RemoteConnector, RemoteModel, RemoteSession};
use crate::retry::{RetryConfig, is_connectivity_loss};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Firmware directory jobs are uploaded to.
pub const REMOTE_GCODES_DIR: &str = "0:/gcodes";

/// Macro run before the first job of a chain.
pub const QUEUE_START_MACRO: &str = "queue-start.g";

/// Macro run between two chained jobs.
pub const QUEUE_INTERMEDIATE_MACRO: &str = "queue-intermediate.g";

/// Macro run after the last job of a chain.
pub const QUEUE_END_MACRO: &str = "queue-end.g";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// PrinterSession
// ---------------------------------------------------------------------------

/// Handle to the background task driving one printer.
pub struct PrinterSession {
    state: Arc<SessionState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PrinterSession {
    /// Start a session for `printer`.
    ///
    /// The session stops when `shutdown` is cancelled or [`dispose`] is
    /// called.
    ///
    /// [`dispose`]: Self::dispose
    pub fn spawn(
        printer: SharedPrinter,
        queue: Arc<JobQueue>,
        connector: Arc<dyn RemoteConnector>,
        retry: RetryConfig,
        shutdown: &CancellationToken,
    ) -> Self {
        let active = !printer.is_suspended();
        let state = Arc::new(SessionState {
            printer,
            queue,
            connector,
            retry,
            disposed: shutdown.child_token(),
            active: watch::Sender::new(active),
            status: watch::Sender::new(MachineStatus::Disconnected),
            offline: Mutex::new(CancellationToken::new()),
            current_job: Mutex::new(None),
            remote: Mutex::new(None),
            model: Mutex::new(RemoteModel::default()),
        });

        let task = tokio::spawn(Arc::clone(&state).maintain());
        Self {
            state,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn printer(&self) -> &SharedPrinter {
        &self.state.printer
    }

    pub fn hostname(&self) -> String {
        self.state.printer.hostname()
    }

    /// Job currently attached to this printer.
    pub fn current_job(&self) -> Option<SharedJob> {
        lock(&self.state.current_job).clone()
    }

    /// Stop taking new jobs.  A print in progress carries on.
    pub fn suspend(&self) {
        self.state.active.send_replace(false);
        debug!(hostname = %self.hostname(), "session suspended");
    }

    /// Take new jobs again.
    pub fn resume(&self) {
        self.state.active.send_replace(true);
        debug!(hostname = %self.hostname(), "session resumed");
    }

    /// Pause the running print (`M25`).  Returns whether the printer is now
    /// pausing or paused.
    pub async fn pause_print(&self) -> bool {
        self.state
            .remote_command("M25", &[MachineStatus::Pausing, MachineStatus::Paused])
            .await
    }

    /// Resume a paused print (`M24`).
    pub async fn resume_print(&self) -> bool {
        self.state
            .remote_command("M24", &[MachineStatus::Resuming, MachineStatus::Processing])
            .await
    }

    /// Abort the current print (`M0`).
    pub async fn cancel_print(&self) -> bool {
        self.state
            .remote_command("M0", &[MachineStatus::Cancelling, MachineStatus::Idle])
            .await
    }

    /// Stop the session and wait for its task to finish.  Idempotent.
    pub async fn dispose(&self) {
        self.state.disposed.cancel();
        self.state.offline_token().cancel();

        let task = lock(&self.task).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    error!(hostname = %self.hostname(), error = %e, "session task panicked");
                }
            }
        }
    }

    /// Stop the session of a printer that left the farm.  Unlike a plain
    /// [`dispose`], the job the printer held goes back to the queue.
    ///
    /// [`dispose`]: Self::dispose
    pub async fn retire(&self) {
        self.dispose().await;

        let hostname = self.hostname();
        let attached = lock(&self.state.current_job).take();
        if let Some(job) = attached.or_else(|| self.state.queue.find_job(&hostname)) {
            warn!(%hostname, file = %job.filename(), "printer removed while holding a job, enqueuing it again");
            self.state.queue.enqueue(&job);
        }
    }
}

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

struct SessionState {
    printer: SharedPrinter,
    queue: Arc<JobQueue>,
    connector: Arc<dyn RemoteConnector>,
    retry: RetryConfig,
    /// Cancelled on dispose or process shutdown.
    disposed: CancellationToken,
    /// False while the printer is suspended.
    active: watch::Sender<bool>,
    /// Latest remote machine status.
    status: watch::Sender<MachineStatus>,
    /// Cancelled when the printer drops offline with a job attached.
    /// Replaced after each failed attempt.
    offline: Mutex<CancellationToken>,
    current_job: Mutex<Option<SharedJob>>,
    remote: Mutex<Option<Arc<dyn RemoteSession>>>,
    model: Mutex<RemoteModel>,
}

impl SessionState {
    /// Session task body.
    async fn maintain(self: Arc<Self>) {
        let Some(Connection {
            session,
            model,
            changes,
        }) = self.connect().await
        else {
            return;
        };

        *lock(&self.remote) = Some(Arc::clone(&session));
        self.synchronize(model);
        let follower = tokio::spawn(Arc::clone(&self).follow_changes(changes));

        match self.process_queue(session.as_ref()).await {
            Err(e) if !e.is_shutdown() => {
                error!(printer = %self.printer.name(), error = %e, "printer session failed");
            }
            _ => {}
        }

        follower.abort();
        *lock(&self.remote) = None;
        session.close().await;
        debug!(hostname = %self.printer.hostname(), "printer session stopped");
    }

    // -- Connection ----------------------------------------------------------

    async fn connect(&self) -> Option<Connection> {
        let hostname = self.printer.hostname();
        loop {
            let attempt = tokio::select! {
                attempt = self.connector.connect(&hostname) => attempt,
                _ = self.disposed.cancelled() => return None,
            };
            match attempt {
                Ok(connection) => return Some(connection),
                Err(e) => {
                    warn!(printer = %self.printer.name(), error = %e, "failed to connect to printer");
                    if !self.sleep(self.retry.reconnect_delay).await {
                        return None;
                    }
                }
            }
        }
    }

    /// Copy the freshly connected model into the printer record.
    fn synchronize(&self, model: RemoteModel) {
        let status = model.status;
        let online = status.is_online();
        let job_file = model
            .file_name
            .as_deref()
            .filter(|f| !f.is_empty())
            .map(file_name_of);

        let name = self.printer.update(|p| {
            if !model.network_name.is_empty() {
                p.name = model.network_name.clone();
            }
            p.status = status;
            p.online = online;
            if job_file.is_some() {
                p.job_file = job_file.clone();
            }
            p.name.clone()
        });

        if online {
            info!(printer = %name, "printer is now online");
        }
        if let Some(file) = &job_file {
            info!(printer = %name, %file, "printer is printing");
        }

        *lock(&self.model) = model;
        self.status.send_replace(status);
    }

    async fn follow_changes(self: Arc<Self>, mut changes: mpsc::UnboundedReceiver<FieldChange>) {
        loop {
            let change = tokio::select! {
                change = changes.recv() => change,
                _ = self.disposed.cancelled() => return,
            };
            match change {
                Some(change) => self.apply_change(change),
                None => {
                    // The remote side hung up for good.
                    self.apply_change(FieldChange::Status(MachineStatus::Disconnected));
                    return;
                }
            }
        }
    }

    fn apply_change(&self, change: FieldChange) {
        let model = {
            let mut model = lock(&self.model);
            model.apply(&change);
            model.clone()
        };

        match change {
            FieldChange::Duration(duration) => {
                let time_left = duration
                    .zip(model.estimated_print_time())
                    .map(|(elapsed, estimate)| (estimate - elapsed).max(0));
                self.update_current_job(|job| {
                    if !job.is_terminal() {
                        job.time_left = time_left;
                    }
                });
            }
            FieldChange::FilePosition(position) => {
                let progress = position
                    .filter(|_| model.file_size > 0)
                    .map(|pos| pos as f64 / model.file_size as f64);
                self.update_current_job(|job| {
                    if !job.is_terminal() {
                        job.progress = progress;
                    }
                });
            }
            FieldChange::File { name, .. } => {
                let job_file = name.as_deref().filter(|n| !n.is_empty()).map(file_name_of);
                let printer = self.printer.update(|p| {
                    p.job_file = job_file.clone();
                    p.name.clone()
                });
                match job_file {
                    Some(file) => info!(%printer, %file, "printer is printing"),
                    None => info!(%printer, "printer is no longer printing"),
                }
            }
            FieldChange::NetworkName(name) => {
                let previous = self.printer.update(|p| std::mem::replace(&mut p.name, name.clone()));
                info!(printer = %previous, new_name = %name, "printer has changed its name");
            }
            FieldChange::Status(status) => self.status_changed(status),
        }
    }

    fn status_changed(&self, status: MachineStatus) {
        let online = status.is_online();
        let (name, flipped) = self.printer.update(|p| {
            p.status = status;
            let flipped = p.online != online;
            p.online = online;
            if flipped && !online {
                p.job_file = None;
            }
            (p.name.clone(), flipped)
        });

        if flipped {
            if online {
                info!(printer = %name, "printer is now online");
            } else {
                info!(printer = %name, "printer is now offline");
                let attached = lock(&self.current_job).is_some();
                if attached {
                    self.offline_token().cancel();
                }
            }
        }

        self.status.send_replace(status);
    }

    // -- Queue processing ----------------------------------------------------

    async fn process_queue(&self, remote: &dyn RemoteSession) -> Result<()> {
        let hostname = self.printer.hostname();

        let mut job = self.queue.find_job(&hostname);
        let mut resumed = job.is_some();
        let mut was_printing = resumed;
        if let Some(job) = &job {
            info!(printer = %self.printer.name(), file = %job.filename(), "resuming interrupted print job");
        }

        loop {
            // A recovered job is already running on the printer, so neither
            // the active gate nor the idle wait applies to it.
            let job_resumed = std::mem::replace(&mut resumed, false);
            if !job_resumed {
                self.wait_until_active().await?;
                self.wait_for_status(MachineStatus::Idle, false).await?;
            }

            let current = match job.take() {
                Some(current) => current,
                None => self.queue.dequeue(&hostname, &self.disposed).await?,
            };
            if !job_resumed && !self.accept(&current).await {
                continue;
            }

            self.attach(&current);
            info!(
                printer = %self.printer.name(),
                file = %current.filename(),
                kind = if was_printing { "next" } else { "new" },
                "got print job"
            );

            let mut next_job = None;
            match self
                .print_job(remote, &current, job_resumed, &mut was_printing, &mut next_job)
                .await
            {
                Ok(()) => job = next_job,
                Err(e) if e.is_shutdown() => {
                    if let Some(next) = next_job {
                        self.queue.enqueue(&next);
                    }
                    return Err(e);
                }
                Err(e) => {
                    let printer = self.printer.name();
                    let file = current.filename();
                    if is_connectivity_loss(&e) {
                        error!(%printer, %file, "printer has gone offline unexpectedly, enqueuing job again");
                    } else {
                        error!(%printer, %file, error = %e, "failed to print job, enqueuing it again");
                    }

                    self.detach();
                    if let Some(next) = next_job {
                        self.queue.enqueue(&next);
                    }
                    self.queue.enqueue(&current);
                    was_printing = false;

                    if !self.sleep(self.retry.requeue_delay).await {
                        return Err(FarmError::Shutdown);
                    }
                    self.renew_offline_token();
                }
            }
        }
    }

    /// Check a claimed job before attaching it.  A job whose file is gone is
    /// cancelled, and a job claimed while the printer was being suspended
    /// goes back to the queue.
    async fn accept(&self, job: &SharedJob) -> bool {
        let path = job.absolute_filename();
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            error!(
                printer = %self.printer.name(),
                file = %job.filename(),
                "job file does not exist, marking it as cancelled"
            );
            job.update(|j| j.cancelled = true);
            self.queue.print_finished(job);
            return false;
        }

        if self.printer.is_suspended() {
            debug!(
                printer = %self.printer.name(),
                file = %job.filename(),
                "printer was suspended while waiting, returning job"
            );
            self.queue.enqueue(job);
            return false;
        }
        true
    }

    /// Print one attached job.  On success the job is finished and
    /// `next_job` holds the follow-up job this printer has already claimed.
    async fn print_job(
        &self,
        remote: &dyn RemoteSession,
        job: &SharedJob,
        resumed: bool,
        was_printing: &mut bool,
        next_job: &mut Option<SharedJob>,
    ) -> Result<()> {
        let filename = job.filename();
        let remote_path = format!("{REMOTE_GCODES_DIR}/{filename}");

        if !resumed {
            let path = job.absolute_filename();
            let contents = tokio::fs::read(&path).await?;
            let modified: DateTime<Local> = tokio::fs::metadata(&path).await?.modified()?.into();

            debug!(printer = %self.printer.name(), file = %filename, "uploading job file");
            self.guarded(remote.upload(&remote_path, contents, modified)).await?;

            let chained = *was_printing;
            job.update(|j| {
                j.progress_text = Some(if chained { "starting next" } else { "starting" }.into());
            });
            let macro_file = if chained {
                QUEUE_INTERMEDIATE_MACRO
            } else {
                QUEUE_START_MACRO
            };
            self.send_code(remote, &format!("M98 P\"{macro_file}\"")).await?;
            self.wait_for_status(MachineStatus::Idle, true).await?;

            self.send_code(remote, &format!("M32 \"{filename}\"")).await?;
            *was_printing = true;
        }

        // A recovered print may have ended while nobody was watching.
        if !resumed {
            self.wait_for_status(MachineStatus::Processing, true).await?;
        }
        job.update(|j| j.progress_text = None);
        self.wait_for_status(MachineStatus::Idle, true).await?;

        if !self.printer.is_suspended() {
            *next_job = self.queue.try_claim(&self.printer.hostname());
        }

        if next_job.is_none() {
            job.update(|j| j.progress_text = Some("finishing".into()));
            match self
                .send_code(remote, &format!("M98 P\"{QUEUE_END_MACRO}\""))
                .await
            {
                Ok(()) => info!(printer = %self.printer.name(), "print queue complete"),
                Err(e) if e.is_shutdown() => return Err(e),
                Err(e) => error!(printer = %self.printer.name(), error = %e, "failed to end print queue"),
            }
            *was_printing = false;
        }

        if let Err(e) = self.guarded(remote.delete(&remote_path)).await {
            if e.is_shutdown() {
                return Err(e);
            }
            warn!(printer = %self.printer.name(), file = %filename, error = %e, "could not delete finished job");
        }

        info!(
            printer = %self.printer.name(),
            file = %filename,
            last = next_job.is_none(),
            "finished print job"
        );
        self.detach();
        self.queue.print_finished(job);
        Ok(())
    }

    // -- Remote helpers ------------------------------------------------------

    /// Run `op` unless the session is disposed or the printer drops offline
    /// first.
    async fn guarded<T>(&self, op: impl Future<Output = Result<T>>) -> Result<T> {
        let offline = self.offline_token();
        tokio::select! {
            result = op => result,
            _ = self.disposed.cancelled() => Err(FarmError::Shutdown),
            _ = offline.cancelled() => Err(FarmError::Offline("printer went offline".into())),
        }
    }

    /// Send `code` and log the reply.  A reply starting with `Error:` fails.
    async fn send_code(&self, remote: &dyn RemoteSession, code: &str) -> Result<()> {
        let reply = self.guarded(remote.send_code(code)).await?;
        let reply = reply.trim_end();
        let printer = self.printer.name();

        if reply.starts_with("Error:") {
            error!(%printer, %code, %reply, "code failed");
            return Err(FarmError::RemoteCommand {
                code: code.to_string(),
                reply: reply.to_string(),
            });
        }
        if reply.starts_with("Warning:") {
            warn!(%printer, %code, %reply, "code warning");
        } else if !reply.trim().is_empty() {
            info!(%printer, %code, %reply, "code reply");
        }
        Ok(())
    }

    /// Send an operator command unless the printer is already in one of the
    /// `done` states.
    async fn remote_command(&self, code: &str, done: &[MachineStatus]) -> bool {
        let remote = lock(&self.remote).clone();
        let Some(remote) = remote else {
            warn!(printer = %self.printer.name(), %code, "printer is not connected");
            return false;
        };

        let status = *self.status.borrow();
        if done.contains(&status) {
            return true;
        }
        self.send_code(remote.as_ref(), code).await.is_ok()
    }

    // -- Waiting -------------------------------------------------------------

    async fn wait_until_active(&self) -> Result<()> {
        let mut active = self.active.subscribe();
        tokio::select! {
            ok = async { active.wait_for(|a| *a).await.is_ok() } => {
                if ok { Ok(()) } else { Err(FarmError::Shutdown) }
            }
            _ = self.disposed.cancelled() => Err(FarmError::Shutdown),
        }
    }

    /// Wait for the remote status to become `wanted`.  With `watch_offline`
    /// the wait also ends when the printer drops offline.
    async fn wait_for_status(&self, wanted: MachineStatus, watch_offline: bool) -> Result<()> {
        let mut status = self.status.subscribe();
        let offline = if watch_offline {
            self.offline_token()
        } else {
            CancellationToken::new()
        };

        tokio::select! {
            ok = async { status.wait_for(|s| *s == wanted).await.is_ok() } => {
                if ok { Ok(()) } else { Err(FarmError::Shutdown) }
            }
            _ = self.disposed.cancelled() => Err(FarmError::Shutdown),
            _ = offline.cancelled() => {
                Err(FarmError::Offline(format!("lost printer while waiting for {wanted}")))
            }
        }
    }

    /// Sleep for `delay`.  Returns false if the session was disposed first.
    async fn sleep(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = self.disposed.cancelled() => false,
        }
    }

    // -- Job attachment ------------------------------------------------------

    fn attach(&self, job: &SharedJob) {
        *lock(&self.current_job) = Some(Arc::clone(job));
        let filename = job.filename();
        self.printer.update(|p| p.job_file = Some(filename));
    }

    fn detach(&self) {
        *lock(&self.current_job) = None;
    }

    fn update_current_job(&self, f: impl FnOnce(&mut Job)) {
        let job = lock(&self.current_job).clone();
        if let Some(job) = job {
            job.update(f);
        }
    }

    fn offline_token(&self) -> CancellationToken {
        lock(&self.offline).clone()
    }

    fn renew_offline_token(&self) {
        *lock(&self.offline) = CancellationToken::new();
    }
}
