//! Dependency-aware asynchronous job scheduling.
//!
//! The [`JobStore`] runs opaque payloads on a fixed pool of tokio worker
//! tasks. A job only starts once every job it depends on is Done; if a
//! dependency fails, the dependent is marked Errored without running.
//!
//! # Job lifecycle
//!
//! | From | To | When |
//! |------|----|------|
//! | Queued | Running | claimed by a worker, all dependencies Done |
//! | Running | Done / Errored | payload returned `Ok` / `Err` or panicked |
//! | Queued | Errored | a dependency ended Errored or Cancelled |
//! | Queued, Running | Cancelled | [`JobStore::shutdown`] |
//!
//! # Waiting
//!
//! [`JobStore::wait_for_jobs`] blocks until the named jobs and everything
//! they depend on are terminal. Cancelling the caller's token ends the wait
//! only; the jobs keep running. Execution itself is cancelled only by
//! [`JobStore::shutdown`].

mod error;
mod scheduler;
mod types;


pub use error::{FailureReason, JobError, JobFailure};
pub use types::{Job, JobContext, JobId, JobKind, JobPriority, JobScope, JobSnapshot, JobState};

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use scheduler::{ClaimedJob, Scheduler};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobStoreOptions {
    /// Number of concurrently running payloads.
    pub workers: usize,
}

impl Default for JobStoreOptions {
    fn default() -> Self {
        JobStoreOptions { workers: 4 }
    }
}

struct Shared {
    scheduler: Mutex<Scheduler>,
    /// Signalled whenever a job becomes ready, and on shutdown.
    work: Notify,
    /// Parent of every payload's cancellation token.
    teardown: CancellationToken,
}

/// Handle to the session's scheduler. Clones share the same jobs and workers.
#[derive(Clone)]
pub struct JobStore {
    shared: Arc<Shared>,
}

impl fmt::Debug for JobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobStore")
            .field("pending", &self.pending_jobs().len())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

impl JobStore {
    /// Creates the store and spawns its workers on the current tokio runtime.
    pub fn new(options: JobStoreOptions) -> Result<JobStore, JobError> {
        let runtime = Handle::try_current().map_err(|_| JobError::NoRuntime)?;

        let shared = Arc::new(Shared {
            scheduler: Mutex::new(Scheduler::new()),
            work: Notify::new(),
            teardown: CancellationToken::new(),
        });

        let workers = options.workers.max(1);
        for worker in 0..workers {
            runtime.spawn(run_worker(shared.clone(), worker));
        }
        debug!(workers, "job store started");

        Ok(JobStore { shared })
    }

    /// Schedules `job` and returns its ID without waiting for it to run.
    ///
    /// A job with the same kind and scope as one still Queued is coalesced
    /// into it and the existing ID is returned. One matching a Running job
    /// starts only after that job is terminal. On error nothing is scheduled.
    pub fn enqueue(&self, job: Job) -> Result<JobId, JobError> {
        let enqueued = {
            let mut scheduler = self.shared.scheduler.lock();
            scheduler.collect_garbage();
            scheduler.enqueue(job, Instant::now())?
        };

        if enqueued.ready {
            self.shared.work.notify_one();
        }
        Ok(enqueued.id)
    }

    /// Waits until every job in `ids`, and every job they transitively depend
    /// on, is terminal.
    ///
    /// Returns [`JobError::Failed`] listing each watched job that ended
    /// Errored or Cancelled, or [`JobError::WaitCancelled`] as soon as `token`
    /// is cancelled. Collected jobs count as Done unless they failed, in
    /// which case the failure is still reported.
    pub async fn wait_for_jobs(
        &self,
        token: &CancellationToken,
        ids: &[JobId],
    ) -> Result<(), JobError> {
        let mut watch = self.watch(ids)?;

        tokio::select! {
            biased;
            _ = token.cancelled() => Err(JobError::WaitCancelled),
            _ = watch.finished() => self.shared.scheduler.lock().outcome(&watch.ids),
        }
    }

    /// [`JobStore::wait_for_jobs`] bounded by `timeout`.
    pub async fn wait_for_jobs_timeout(
        &self,
        ids: &[JobId],
        timeout: Duration,
    ) -> Result<(), JobError> {
        let token = CancellationToken::new();
        match tokio::time::timeout(timeout, self.wait_for_jobs(&token, ids)).await {
            Ok(result) => result,
            Err(_) => Err(JobError::WaitTimeout(timeout)),
        }
    }

    pub fn job(&self, id: JobId) -> Result<JobSnapshot, JobError> {
        self.shared.scheduler.lock().snapshot(id)
    }

    /// Tracked jobs for `scope`, oldest first.
    pub fn jobs_for_scope(&self, scope: &JobScope) -> Vec<JobSnapshot> {
        self.shared.scheduler.lock().scope_snapshots(scope)
    }

    /// IDs of every Queued or Running job.
    pub fn pending_jobs(&self) -> Vec<JobId> {
        self.shared.scheduler.lock().pending_ids()
    }

    /// Drops finished jobs nobody references any more. Also runs on every enqueue.
    pub fn collect_garbage(&self) -> usize {
        self.shared.scheduler.lock().collect_garbage()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.scheduler.lock().is_shut_down()
    }

    /// Cancels queued jobs, discards the results of running ones and
    /// releases all waiters. Later enqueues fail with [`JobError::ShutDown`].
    pub fn shutdown(&self) {
        let cancelled = self.shared.scheduler.lock().shutdown(Instant::now());
        self.shared.teardown.cancel();
        self.shared.work.notify_waiters();

        if cancelled > 0 {
            info!(cancelled, "job store shut down");
        }
    }

    fn watch(&self, ids: &[JobId]) -> Result<Watch, JobError> {
        let mut scheduler = self.shared.scheduler.lock();
        let closure = scheduler.closure(ids)?;
        let receivers = scheduler.subscribe(&closure);

        Ok(Watch {
            shared: self.shared.clone(),
            ids: closure,
            receivers,
        })
    }
}

/// Waiter registration for one `wait_for_jobs` call; releases it on drop.
struct Watch {
    shared: Arc<Shared>,
    ids: Vec<JobId>,
    receivers: Vec<(JobId, watch::Receiver<JobState>)>,
}

impl Watch {
    async fn finished(&mut self) {
        for (_, receiver) in &mut self.receivers {
            // A closed channel means the job was dropped at teardown.
            let _ = receiver.wait_for(|state| state.is_terminal()).await;
        }
    }
}

impl Drop for Watch {
    fn drop(&mut self) {
        let subscribed = self.receivers.iter().map(|(id, _)| *id).collect::<Vec<_>>();
        self.shared.scheduler.lock().release(&subscribed);
    }
}

impl Shared {
    async fn next_job(&self) -> Option<ClaimedJob> {
        loop {
            let notified = self.work.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut scheduler = self.scheduler.lock();
                if scheduler.is_shut_down() {
                    return None;
                }
                if let Some(job) = scheduler.claim_next(Instant::now()) {
                    return Some(job);
                }
            }

            notified.await;
        }
    }
}

async fn run_worker(shared: Arc<Shared>, worker: usize) {
    while let Some(ClaimedJob {
        id,
        kind,
        scope,
        func,
    }) = shared.next_job().await
    {
        debug!(worker, job = %id, kind = %kind, scope = %scope, "running job");

        let context = JobContext::new(id, kind, scope, shared.teardown.child_token());
        let outcome = match tokio::spawn(func(context)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(FailureReason::Execution(Arc::new(err))),
            Err(err) if err.is_panic() => Err(FailureReason::Panicked(panic_message(err.into_panic()))),
            Err(err) => Err(FailureReason::Panicked(err.to_string())),
        };

        if let Err(reason) = &outcome {
            error!(job = %id, kind = %kind, %reason, "job failed");
        }

        let released = shared
            .scheduler
            .lock()
            .complete(id, outcome, Instant::now());
        for _ in 0..released {
            shared.work.notify_one();
        }
    }

    debug!(worker, "job worker stopped");
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "job panicked".to_string())
}
