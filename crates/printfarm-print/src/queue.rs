// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Shared print job queue.
//
// One ordered list of jobs is shared by every printer session.  Pending
// jobs sit at the front in FIFO order, terminal (completed or cancelled)
// jobs collect at the back until an operator cleans them up.  The list is
// persisted as a JSON array so that in-flight claims survive a restart.
//
// Locking: the list lock is always taken before a job lock and neither is
// ever held across an `.await`.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Local;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use printfarm_core::error::{FarmError, Result};
use printfarm_core::shared::{JobHandle, SharedJob};
use printfarm_core::types::Job;

// ---------------------------------------------------------------------------
// Operator commands
// ---------------------------------------------------------------------------

/// Remote action requested for a job that a printer is working on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobAction {
    Pause,
    Resume,
    Cancel,
}

impl std::fmt::Display for JobAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Cancel => "cancel",
        })
    }
}

/// Message from the queue to whoever owns the printer sessions.
///
/// The receiver performs the action on the session that has claimed `job`
/// and reports whether the printer accepted it through `reply`.
#[derive(Debug)]
pub struct JobCommand {
    pub action: JobAction,
    pub job: SharedJob,
    pub reply: oneshot::Sender<bool>,
}

// ---------------------------------------------------------------------------
// JobQueue
// ---------------------------------------------------------------------------

/// Ordered, shared list of print jobs.
pub struct JobQueue {
    /// Jobs in display order.
    jobs: Mutex<Vec<SharedJob>>,
    /// Woken whenever a job may have become ready to print.
    ready: Notify,
    /// Outgoing pause/resume/cancel requests.
    commands: mpsc::UnboundedSender<JobCommand>,
    /// Receiving end of `commands`, handed out once.
    command_rx: Mutex<Option<mpsc::UnboundedReceiver<JobCommand>>>,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue {
    pub fn new() -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        Self {
            jobs: Mutex::new(Vec::new()),
            ready: Notify::new(),
            commands,
            command_rx: Mutex::new(Some(command_rx)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<SharedJob>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the receiver for pause/resume/cancel commands.
    ///
    /// Returns `None` after the first call.
    pub fn take_commands(&self) -> Option<mpsc::UnboundedReceiver<JobCommand>> {
        self.command_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    // -- Inspection ----------------------------------------------------------

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Handle of the job at `index`.
    pub fn get(&self, index: usize) -> Option<SharedJob> {
        self.lock().get(index).cloned()
    }

    /// Position of `job` in the list.
    pub fn position(&self, job: &SharedJob) -> Option<usize> {
        self.lock().iter().position(|j| j.id() == job.id())
    }

    /// Consistent copy of every job, in order.
    pub fn snapshot(&self) -> Vec<Job> {
        self.lock().iter().map(|job| job.snapshot()).collect()
    }

    /// The queue as a JSON array.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.snapshot())?)
    }

    // -- Persistence ---------------------------------------------------------

    /// Write the queue to `path` as a JSON array.
    #[instrument(skip(self), fields(path = %path.display()))]
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec(&self.snapshot())?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, json)?;
        debug!("job queue saved");
        Ok(())
    }

    /// Replace the queue with the jobs stored in `path`.
    ///
    /// Unclaimed, non-terminal jobs are reset.  Claimed jobs keep their
    /// hostname so the owning printer can pick them up again.
    #[instrument(skip(self), fields(path = %path.display()))]
    pub fn load_from_file(&self, path: &Path) -> Result<()> {
        let data = std::fs::read(path)?;
        let loaded: Vec<Job> = serde_json::from_slice(&data)?;

        let jobs: Vec<SharedJob> = loaded
            .into_iter()
            .map(|mut job| {
                if job.filename.is_empty() {
                    job.refresh_filename();
                }
                if job.hostname.is_none() && job.time_completed.is_none() {
                    job.reset();
                }
                JobHandle::new(job)
            })
            .collect();

        let count = jobs.len();
        *self.lock() = jobs;
        self.ready.notify_waiters();
        info!(count, "job queue loaded");
        Ok(())
    }

    // -- Scheduling ----------------------------------------------------------

    /// Create a job record for `job` and enqueue it.
    pub fn add(&self, job: Job) -> SharedJob {
        let handle = JobHandle::new(job);
        self.enqueue(&handle);
        handle
    }

    /// Reset `job` and place it in the queue.
    ///
    /// A job already in the list (a repeat or a requeue after a failure)
    /// moves in front of the first unclaimed or terminal entry.  A new job
    /// goes in front of the first terminal entry, or to the end.
    pub fn enqueue(&self, job: &SharedJob) {
        job.update(Job::reset);
        let filename = job.filename();

        let mut jobs = self.lock();
        if let Some(current) = jobs.iter().position(|j| j.id() == job.id()) {
            if jobs.len() > 1 {
                let existing = jobs.remove(current);
                let at = jobs
                    .iter()
                    .position(|j| j.update(|j| j.hostname.is_none() || j.is_terminal()))
                    .unwrap_or(0);
                jobs.insert(at, existing);
            }
            info!(file = %filename, "existing job enqueued");
        } else {
            let at = jobs
                .iter()
                .position(|j| j.update(|j| j.is_terminal()))
                .unwrap_or(jobs.len());
            jobs.insert(at, Arc::clone(job));
            info!(file = %filename, "new job enqueued");
        }
        drop(jobs);

        self.ready.notify_waiters();
    }

    /// First job that is ready to print, without claiming it.
    pub fn try_dequeue(&self) -> Option<SharedJob> {
        self.lock()
            .iter()
            .find(|job| job.update(|j| j.is_ready_to_print()))
            .cloned()
    }

    /// Claim the first ready job for `hostname`.
    ///
    /// The readiness check and the claim happen under the list lock, so two
    /// printers can never claim the same job.
    pub fn try_claim(&self, hostname: &str) -> Option<SharedJob> {
        let jobs = self.lock();
        jobs.iter()
            .find(|job| {
                job.update(|j| {
                    if j.is_ready_to_print() {
                        j.hostname = Some(hostname.to_string());
                        true
                    } else {
                        false
                    }
                })
            })
            .cloned()
    }

    /// Wait for a ready job and claim it for `hostname`.
    ///
    /// Returns [`FarmError::Shutdown`] if `cancel` fires first; no job is
    /// claimed in that case.
    pub async fn dequeue(&self, hostname: &str, cancel: &CancellationToken) -> Result<SharedJob> {
        loop {
            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(job) = self.try_claim(hostname) {
                return Ok(job);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => return Err(FarmError::Shutdown),
            }
        }
    }

    /// The job `hostname` was working on before a restart, if any.
    pub fn find_job(&self, hostname: &str) -> Option<SharedJob> {
        self.lock()
            .iter()
            .find(|job| {
                job.update(|j| {
                    j.hostname.as_deref() == Some(hostname)
                        && !j.paused
                        && !j.cancelled
                        && !j.is_terminal()
                })
            })
            .cloned()
    }

    /// Mark `job` as finished and move it to the end of the list.
    pub fn print_finished(&self, job: &SharedJob) {
        job.update(|j| {
            j.progress_text = None;
            j.progress = Some(1.0);
            j.time_left = None;
            j.time_completed = Some(Local::now());
        });

        let mut jobs = self.lock();
        if let Some(current) = jobs.iter().position(|j| j.id() == job.id()) {
            let finished = jobs.remove(current);
            jobs.push(finished);
        }
        drop(jobs);

        self.ready.notify_waiters();
    }

    // -- Operator requests ---------------------------------------------------

    /// Ask the printer working on job `index` to pause it.
    ///
    /// The job must be in progress and not terminal.  On success the returned
    /// receiver yields whether the printer accepted the pause.
    pub fn pause(&self, index: usize) -> Result<oneshot::Receiver<bool>> {
        let job = self.job_matching(index, |j| !j.is_terminal() && j.progress.is_some())?;
        self.send_command(JobAction::Pause, job, index)
    }

    /// Ask the printer to resume paused job `index`.
    pub fn resume(&self, index: usize) -> Result<oneshot::Receiver<bool>> {
        let job = self.job_matching(index, |j| j.paused)?;
        self.send_command(JobAction::Resume, job, index)
    }

    /// Ask the printer to cancel paused job `index`.
    pub fn cancel(&self, index: usize) -> Result<oneshot::Receiver<bool>> {
        let job = self.job_matching(index, |j| j.paused)?;
        self.send_command(JobAction::Cancel, job, index)
    }

    /// Put terminal job `index` back into the queue.
    pub fn repeat(&self, index: usize) -> Result<()> {
        let job = self.job_matching(index, Job::is_terminal)?;
        self.enqueue(&job);
        info!(index, "repeating job");
        Ok(())
    }

    /// Remove job `index` and delete its file if nothing else needs it.
    pub fn remove(&self, index: usize) -> Result<()> {
        let mut jobs = self.lock();
        if index >= jobs.len() {
            warn!(index, "failed to remove job");
            return Err(FarmError::Rejected(format!("no job at index {index}")));
        }
        let removed = jobs.remove(index);
        try_remove_job_file(&jobs, &removed.absolute_filename());
        drop(jobs);

        info!(index, "removed job");
        Ok(())
    }

    /// Remove the first job whose plain filename is `filename`.
    pub fn remove_by_filename(&self, filename: &str) -> Result<()> {
        let mut jobs = self.lock();
        let Some(index) = jobs.iter().position(|j| j.filename() == filename) else {
            warn!(file = %filename, "failed to remove job");
            return Err(FarmError::Rejected(format!("no job named {filename}")));
        };
        let removed = jobs.remove(index);
        try_remove_job_file(&jobs, &removed.absolute_filename());
        drop(jobs);

        info!(file = %filename, "removed job");
        Ok(())
    }

    /// Drop every terminal job, deleting files nothing else needs.
    pub fn clean(&self) {
        let mut jobs = self.lock();
        let mut removed = 0usize;
        for index in (0..jobs.len()).rev() {
            if jobs[index].update(|j| j.is_terminal()) {
                let job = jobs.remove(index);
                try_remove_job_file(&jobs, &job.absolute_filename());
                removed += 1;
            }
        }
        info!(removed, "finished jobs cleaned up");
    }

    // -- Helpers -------------------------------------------------------------

    fn job_matching(&self, index: usize, check: impl FnOnce(&Job) -> bool) -> Result<SharedJob> {
        self.lock()
            .get(index)
            .filter(|job| job.update(|j| check(&*j)))
            .cloned()
            .ok_or_else(|| FarmError::Rejected(format!("job #{index} is not eligible")))
    }

    fn send_command(
        &self,
        action: JobAction,
        job: SharedJob,
        index: usize,
    ) -> Result<oneshot::Receiver<bool>> {
        let (reply, outcome) = oneshot::channel();
        self.commands
            .send(JobCommand { action, job, reply })
            .map_err(|_| FarmError::Shutdown)?;
        info!(index, %action, "job command issued");
        Ok(outcome)
    }
}

/// Delete `path` unless a remaining terminal job still refers to it.
fn try_remove_job_file(remaining: &[SharedJob], path: &str) {
    let still_needed = remaining
        .iter()
        .any(|job| job.update(|j| j.is_terminal() && j.absolute_filename == path));
    if still_needed {
        return;
    }
    match std::fs::remove_file(path) {
        Ok(()) => debug!(file = %path, "job file deleted"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(file = %path, error = %e, "failed to delete job file"),
    }
}
