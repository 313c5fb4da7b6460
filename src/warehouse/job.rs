use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use super::Warehouse;
use crate::error::{IngestError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Done,
    Failed(String),
}

/// Shared cancellation flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Bounds for waiting on a remote job.
#[derive(Debug, Clone)]
pub struct JobWait {
    /// `None` waits indefinitely (still observing cancellation).
    pub timeout: Option<Duration>,
    pub poll_interval: Duration,
    pub cancel: CancelToken,
}

impl Default for JobWait {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(600)),
            poll_interval: Duration::from_millis(200),
            cancel: CancelToken::default(),
        }
    }
}

/// Polls `job` until it finishes, fails, times out or the token is cancelled.
///
/// The state is read before cancellation is honoured, so a job that already
/// finished is reported as such. On timeout or cancellation of an unfinished
/// job the job is asked to stop before the error is returned.
pub fn wait_for_job(warehouse: &mut dyn Warehouse, job: &JobId, wait: &JobWait) -> Result<()> {
    let started = Instant::now();
    loop {
        match warehouse.job_state(job)? {
            JobState::Done => {
                debug!("Job {job} done after {:?}", started.elapsed());
                return Ok(());
            }
            JobState::Failed(message) => {
                return Err(IngestError::JobFailed {
                    job: job.clone(),
                    message,
                });
            }
            JobState::Pending | JobState::Running => {}
        }
        if wait.cancel.is_cancelled() {
            abandon(warehouse, job);
            return Err(IngestError::Cancelled { job: job.clone() });
        }
        let mut pause = wait.poll_interval;
        if let Some(timeout) = wait.timeout {
            let elapsed = started.elapsed();
            if elapsed >= timeout {
                abandon(warehouse, job);
                return Err(IngestError::JobTimedOut {
                    job: job.clone(),
                    timeout,
                });
            }
            pause = pause.min(timeout - elapsed);
        }
        thread::sleep(pause);
    }
}

fn abandon(warehouse: &mut dyn Warehouse, job: &JobId) {
    if let Err(err) = warehouse.cancel_job(job) {
        warn!("Failed to cancel job {job}: {err}");
    }
}
