use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use super::error::FailureReason;
use crate::handle::{DirHandle, DocumentHandle};

/// Identifier assigned by [`JobStore::enqueue`](super::JobStore::enqueue).
///
/// IDs are issued in submission order and never reused within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub(crate) u64);

impl JobId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque tag naming the derivation a job performs.
///
/// The scheduler only compares kinds when coalescing duplicate jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobKind(&'static str);

impl JobKind {
    pub const fn new(name: &'static str) -> JobKind {
        JobKind(name)
    }

    pub fn as_str(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// What a job operates on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum JobScope {
    Dir(DirHandle),
    Document(DocumentHandle),
}

impl JobScope {
    /// The directory the scope belongs to.
    pub fn dir(&self) -> &DirHandle {
        match self {
            JobScope::Dir(dir) => dir,
            JobScope::Document(document) => document.dir(),
        }
    }
}

impl fmt::Display for JobScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobScope::Dir(dir) => write!(f, "{dir}"),
            JobScope::Document(document) => write!(f, "{document}"),
        }
    }
}

/// Ready jobs run highest priority first; ties run in submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum JobPriority {
    High,
    #[default]
    Normal,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Queued,
    Running,
    Done,
    Errored,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Done | JobState::Errored | JobState::Cancelled)
    }

    pub fn is_failed(self) -> bool {
        matches!(self, JobState::Errored | JobState::Cancelled)
    }
}

pub(crate) type JobFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
pub(crate) type JobFn = Box<dyn FnOnce(JobContext) -> JobFuture + Send>;

/// A unit of deferred work submitted to the [`JobStore`](super::JobStore).
///
/// The payload is an async closure the scheduler runs without interpreting.
/// Its `Err` outcome marks the job Errored.
///
/// ```ignore
/// let job = Job::new(PARSE, JobScope::Dir(dir.clone()), move |_ctx| async move {
///     parse_module(&dir)
/// })
/// .with_priority(JobPriority::High)
/// .depends_on([load]);
/// ```
pub struct Job {
    pub kind: JobKind,
    pub scope: JobScope,
    pub priority: JobPriority,
    pub depends_on: Vec<JobId>,
    pub(crate) func: JobFn,
}

impl Job {
    pub fn new<F, Fut>(kind: JobKind, scope: JobScope, func: F) -> Job
    where
        F: FnOnce(JobContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Job {
            kind,
            scope,
            priority: JobPriority::default(),
            depends_on: vec![],
            func: Box::new(move |ctx| Box::pin(func(ctx))),
        }
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Job {
        self.priority = priority;
        self
    }

    pub fn depends_on(mut self, ids: impl IntoIterator<Item = JobId>) -> Job {
        self.depends_on.extend(ids);
        self
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("kind", &self.kind)
            .field("scope", &self.scope)
            .field("priority", &self.priority)
            .field("depends_on", &self.depends_on)
            .finish_non_exhaustive()
    }
}

/// Handed to a payload when it starts running.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub id: JobId,
    pub kind: JobKind,
    pub scope: JobScope,
    cancel: CancellationToken,
}

impl JobContext {
    pub(crate) fn new(id: JobId, kind: JobKind, scope: JobScope, cancel: CancellationToken) -> Self {
        JobContext {
            id,
            kind,
            scope,
            cancel,
        }
    }

    /// Cancelled when the session shuts down; long payloads may poll it to stop early.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Point-in-time view of a job.
#[derive(Debug, Clone)]
pub struct JobSnapshot {
    pub id: JobId,
    pub kind: JobKind,
    pub scope: JobScope,
    pub priority: JobPriority,
    pub state: JobState,
    pub depends_on: Vec<JobId>,
    pub queued_at: Instant,
    pub started_at: Option<Instant>,
    pub finished_at: Option<Instant>,
    pub failure: Option<FailureReason>,
}
