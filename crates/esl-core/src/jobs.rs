//! Background job correlation
//!
//! `bgapi` commands are acknowledged immediately and their output arrives
//! later as a `BACKGROUND_JOB` event carrying the same `Job-UUID`. The
//! [`JobTable`] maps each job id to the completion handle of the caller that
//! issued it. Every entry leaves the table exactly once: completed by the
//! dispatcher, cancelled by the caller on timeout, or purged past its
//! deadline. A completion for an id that is no longer present is discarded.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{debug, warn};

#[derive(Debug)]
struct PendingJob {
    command: String,
    completion: oneshot::Sender<String>,
    deadline: Instant,
}

/// Job id to pending completion handle
#[derive(Debug, Default)]
pub struct JobTable {
    jobs: DashMap<String, PendingJob>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job before its command is written to the socket
    pub fn register(
        &self,
        job_id: impl Into<String>,
        command: impl Into<String>,
        timeout: Duration,
    ) -> oneshot::Receiver<String> {
        let (completion, rx) = oneshot::channel();
        let job_id = job_id.into();
        let pending = PendingJob {
            command: command.into(),
            completion,
            deadline: Instant::now() + timeout,
        };
        if self.jobs.insert(job_id.clone(), pending).is_some() {
            warn!(job_id = %job_id, "Replaced a pending job with the same id");
        }
        rx
    }

    /// Deliver a job result. Returns `false` when the job is unknown, already
    /// completed or abandoned by its caller.
    pub fn complete(&self, job_id: &str, body: impl Into<String>) -> bool {
        match self.jobs.remove(job_id) {
            Some((_, job)) => {
                debug!(job_id = %job_id, command = %job.command, "Background job completed");
                job.completion.send(body.into()).is_ok()
            }
            None => {
                debug!(job_id = %job_id, "Discarding result for unknown or expired job");
                false
            }
        }
    }

    /// Release a job slot; later results for it are discarded
    pub fn cancel(&self, job_id: &str) -> bool {
        self.jobs.remove(job_id).is_some()
    }

    /// Drop every job past its deadline, returns how many were removed
    pub fn purge_expired(&self, now: Instant) -> usize {
        let before = self.jobs.len();
        self.jobs.retain(|job_id, job| {
            let keep = job.deadline > now;
            if !keep {
                warn!(job_id = %job_id, command = %job.command, "Purging expired background job");
            }
            keep
        });
        before.saturating_sub(self.jobs.len())
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.jobs.contains_key(job_id)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
