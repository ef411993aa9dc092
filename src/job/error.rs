use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use itertools::Itertools;
use thiserror::Error;

use super::types::{JobId, JobKind, JobScope};

/// Why a job ended Errored or Cancelled.
#[derive(Debug, Clone)]
pub enum FailureReason {
    /// The payload returned an error.
    Execution(Arc<anyhow::Error>),
    /// A dependency failed, so the payload never ran.
    Dependency(JobId),
    /// The payload panicked.
    Panicked(String),
    /// The session shut down before the job finished.
    Cancelled,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Execution(err) => write!(f, "failed: {err:#}"),
            FailureReason::Dependency(id) => write!(f, "skipped because job {id} failed"),
            FailureReason::Panicked(message) => write!(f, "panicked: {message}"),
            FailureReason::Cancelled => f.write_str("was cancelled"),
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("job {id} ({kind} in {scope}) {reason}")]
pub struct JobFailure {
    pub id: JobId,
    pub kind: JobKind,
    pub scope: JobScope,
    pub reason: FailureReason,
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("job {0} not found")]
    NotFound(JobId),
    #[error("job depends on unknown job {0}")]
    UnknownDependency(JobId),
    #[error("depending on job {dependency} would make job {job} part of a cycle")]
    DependencyCycle { job: JobId, dependency: JobId },
    #[error("job store has been shut down")]
    ShutDown,
    #[error("job workers need a running tokio runtime")]
    NoRuntime,
    #[error("waiting for jobs was cancelled")]
    WaitCancelled,
    #[error("timed out after {0:?} waiting for jobs")]
    WaitTimeout(Duration),
    #[error("{} job(s) failed: {}", .0.len(), .0.iter().join("; "))]
    Failed(Vec<JobFailure>),
    /// Jobs that failed and were collected before their details could be reported.
    #[error("job(s) {} failed earlier", .0.iter().join(", "))]
    FailedEarlier(Vec<JobId>),
}

impl JobError {
    /// The individual failures behind [`JobError::Failed`], empty otherwise.
    pub fn failures(&self) -> &[JobFailure] {
        match self {
            JobError::Failed(failures) => failures,
            _ => &[],
        }
    }
}
