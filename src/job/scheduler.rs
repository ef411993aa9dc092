//! Bookkeeping behind the [`JobStore`](super::JobStore).
//!
//! The job table, the dependency graph and the ready queue live here. All of
//! it is synchronous and guarded by the store's mutex; payloads never run
//! while that mutex is held.
//!
//! # Dependency graph
//!
//! Jobs are nodes of a `petgraph::DiGraphMap` with an edge from every
//! dependency to its dependent, so "who is waiting on this job" is an
//! outgoing-neighbor query and cycle detection is a reachability query.
//!
//! # Duplicates
//!
//! At most one job per kind and scope is Queued and at most one is Running.
//! A duplicate of a Queued job is folded into it. A duplicate of a Running
//! job is parked: it stays Queued until the Running one is terminal, whatever
//! its outcome, so jobs of one kind and scope never overlap.
//!
//! # Collection
//!
//! Terminal jobs are dropped once nothing references them. Failed IDs are
//! remembered in a set, and the newest failure per kind and scope keeps its
//! details, so a late wait still reports it.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::time::Instant;

use itertools::Itertools;
use petgraph::algo::has_path_connecting;
use petgraph::graphmap::DiGraphMap;
use petgraph::Direction;
use tokio::sync::watch;
use tracing::{debug, trace};

use super::error::{FailureReason, JobError, JobFailure};
use super::types::{Job, JobFn, JobId, JobKind, JobPriority, JobScope, JobSnapshot, JobState};

/// A job popped off the ready queue, now Running.
pub(crate) struct ClaimedJob {
    pub id: JobId,
    pub kind: JobKind,
    pub scope: JobScope,
    pub func: JobFn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Enqueued {
    pub id: JobId,
    /// The job went straight onto the ready queue.
    pub ready: bool,
}

struct Entry {
    kind: JobKind,
    scope: JobScope,
    priority: JobPriority,
    depends_on: Vec<JobId>,
    state: JobState,
    func: Option<JobFn>,
    /// Dependencies not yet Done.
    pending: usize,
    queued_at: Instant,
    started_at: Option<Instant>,
    finished_at: Option<Instant>,
    failure: Option<FailureReason>,
    state_tx: watch::Sender<JobState>,
    /// Active `wait_for_jobs` calls watching this job.
    waiters: usize,
}

impl Entry {
    fn set_state(&mut self, state: JobState) {
        self.state = state;
        self.state_tx.send_replace(state);
    }

    fn failure(&self, id: JobId) -> JobFailure {
        JobFailure {
            id,
            kind: self.kind,
            scope: self.scope.clone(),
            reason: self.failure.clone().unwrap_or(FailureReason::Cancelled),
        }
    }

    fn snapshot(&self, id: JobId) -> JobSnapshot {
        JobSnapshot {
            id,
            kind: self.kind,
            scope: self.scope.clone(),
            priority: self.priority,
            state: self.state,
            depends_on: self.depends_on.clone(),
            queued_at: self.queued_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            failure: self.failure.clone(),
        }
    }
}

pub(crate) struct Scheduler {
    next_id: u64,
    entries: HashMap<JobId, Entry>,
    graph: DiGraphMap<JobId, ()>,
    ready: BTreeSet<(JobPriority, JobId)>,
    /// Queued (not yet Running) job per kind and scope, the coalescing index.
    queued: HashMap<(JobKind, JobScope), JobId>,
    running: HashMap<(JobKind, JobScope), JobId>,
    /// Running job to the duplicate parked behind it.
    parked: HashMap<JobId, JobId>,
    /// Failed jobs that were collected.
    collected_failures: HashSet<JobId>,
    /// Newest collected failure per kind and scope.
    last_failures: HashMap<(JobKind, JobScope), JobFailure>,
    shut_down: bool,
}

impl Scheduler {
    pub fn new() -> Scheduler {
        Scheduler {
            next_id: 1,
            entries: HashMap::new(),
            graph: DiGraphMap::new(),
            ready: BTreeSet::new(),
            queued: HashMap::new(),
            running: HashMap::new(),
            parked: HashMap::new(),
            collected_failures: HashSet::new(),
            last_failures: HashMap::new(),
            shut_down: false,
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    /// IDs that were handed out. An issued ID missing from the table was
    /// collected, and finished Done unless it is in `collected_failures`.
    fn is_issued(&self, id: JobId) -> bool {
        (1..self.next_id).contains(&id.0)
    }

    fn is_failed(&self, id: JobId) -> bool {
        match self.entries.get(&id) {
            Some(entry) => entry.state.is_failed(),
            None => self.collected_failures.contains(&id),
        }
    }

    pub fn enqueue(&mut self, job: Job, now: Instant) -> Result<Enqueued, JobError> {
        if self.shut_down {
            return Err(JobError::ShutDown);
        }

        let Job {
            kind,
            scope,
            priority,
            depends_on,
            func,
        } = job;
        let depends_on = depends_on.into_iter().unique().collect_vec();

        if let Some(unknown) = depends_on.iter().find(|dep| !self.is_issued(**dep)) {
            return Err(JobError::UnknownDependency(*unknown));
        }

        let key = (kind, scope);
        if let Some(&existing) = self.queued.get(&key) {
            if !depends_on.iter().any(|dep| self.is_failed(*dep)) {
                return self.coalesce(existing, priority, depends_on, func);
            }
        }
        let (kind, scope) = key;

        let id = JobId(self.next_id);
        self.next_id += 1;
        self.graph.add_node(id);

        let mut pending = 0;
        let mut failed_dependency = None;
        for dep in &depends_on {
            let Some(dependency) = self.entries.get(dep) else {
                if self.collected_failures.contains(dep) {
                    failed_dependency.get_or_insert(*dep);
                }
                continue;
            };
            self.graph.add_edge(*dep, id, ());
            match dependency.state {
                JobState::Done => {}
                state if state.is_failed() => {
                    failed_dependency.get_or_insert(*dep);
                }
                _ => pending += 1,
            }
        }

        let behind = match failed_dependency {
            Some(_) => None,
            None => self.running.get(&(kind, scope.clone())).copied(),
        };
        if behind.is_some() {
            pending += 1;
        }

        let (state_tx, _) = watch::channel(JobState::Queued);
        self.entries.insert(
            id,
            Entry {
                kind,
                scope: scope.clone(),
                priority,
                depends_on,
                state: JobState::Queued,
                func: Some(func),
                pending,
                queued_at: now,
                started_at: None,
                finished_at: None,
                failure: None,
                state_tx,
                waiters: 0,
            },
        );

        if let Some(dep) = failed_dependency {
            self.fail(id, FailureReason::Dependency(dep), now);
            return Ok(Enqueued { id, ready: false });
        }

        if let Some(running) = behind {
            self.parked.insert(running, id);
        }

        debug!(job = %id, kind = %kind, scope = %scope, ?priority, pending, ?behind, "job queued");
        self.queued.insert((kind, scope), id);

        let ready = pending == 0;
        if ready {
            self.ready.insert((priority, id));
        }
        Ok(Enqueued { id, ready })
    }

    /// Folds a duplicate submission into the queued job `existing`.
    ///
    /// The newer payload replaces the queued one, dependencies are merged and
    /// the higher of the two priorities wins.
    fn coalesce(
        &mut self,
        existing: JobId,
        priority: JobPriority,
        depends_on: Vec<JobId>,
        func: JobFn,
    ) -> Result<Enqueued, JobError> {
        let Some(entry) = self.entries.get(&existing) else {
            return Err(JobError::NotFound(existing));
        };
        let added = depends_on
            .into_iter()
            .filter(|dep| !entry.depends_on.contains(dep))
            .collect_vec();

        for dep in &added {
            let closes_cycle = *dep == existing
                || (self.graph.contains_node(*dep)
                    && has_path_connecting(&self.graph, existing, *dep, None));
            if closes_cycle {
                return Err(JobError::DependencyCycle {
                    job: existing,
                    dependency: *dep,
                });
            }
        }

        let mut added_pending = 0;
        for dep in &added {
            if let Some(dependency) = self.entries.get(dep) {
                self.graph.add_edge(*dep, existing, ());
                if dependency.state != JobState::Done {
                    added_pending += 1;
                }
            }
        }

        let Some(entry) = self.entries.get_mut(&existing) else {
            return Err(JobError::NotFound(existing));
        };
        entry.depends_on.extend(added);
        entry.pending += added_pending;
        entry.func = Some(func);

        let was_ready = self.ready.remove(&(entry.priority, existing));
        entry.priority = entry.priority.min(priority);
        let ready = entry.pending == 0;
        if ready {
            self.ready.insert((entry.priority, existing));
        }

        debug!(job = %existing, kind = %entry.kind, scope = %entry.scope, "coalesced duplicate job");
        Ok(Enqueued {
            id: existing,
            ready: ready && !was_ready,
        })
    }

    /// Pops the highest-priority ready job and marks it Running.
    pub fn claim_next(&mut self, now: Instant) -> Option<ClaimedJob> {
        while let Some((_, id)) = self.ready.pop_first() {
            let Some(entry) = self.entries.get_mut(&id) else {
                continue;
            };
            let Some(func) = entry.func.take() else {
                continue;
            };

            entry.started_at = Some(now);
            entry.set_state(JobState::Running);

            let key = (entry.kind, entry.scope.clone());
            if self.queued.get(&key) == Some(&id) {
                self.queued.remove(&key);
            }
            self.running.insert(key, id);

            trace!(job = %id, kind = %entry.kind, "job claimed");
            return Some(ClaimedJob {
                id,
                kind: entry.kind,
                scope: entry.scope.clone(),
                func,
            });
        }
        None
    }

    /// Records the outcome of a Running job. Returns how many jobs became ready.
    pub fn complete(
        &mut self,
        id: JobId,
        outcome: Result<(), FailureReason>,
        now: Instant,
    ) -> usize {
        let Some(entry) = self.entries.get(&id) else {
            return 0;
        };
        if entry.state != JobState::Running {
            // Cancelled by shutdown while the payload ran.
            debug!(job = %id, state = ?entry.state, "discarding result of finished job");
            return 0;
        }

        let key = (entry.kind, entry.scope.clone());
        let mut released = self.stop_running(id, &key);

        if let Err(reason) = outcome {
            self.fail(id, reason, now);
            return released;
        }

        let Some(entry) = self.entries.get_mut(&id) else {
            return released;
        };
        entry.finished_at = Some(now);
        entry.set_state(JobState::Done);
        debug!(job = %id, kind = %entry.kind, scope = %entry.scope, "job done");

        for dependent in self
            .graph
            .neighbors_directed(id, Direction::Outgoing)
            .collect_vec()
        {
            let Some(entry) = self.entries.get_mut(&dependent) else {
                continue;
            };
            if entry.state != JobState::Queued {
                continue;
            }
            entry.pending = entry.pending.saturating_sub(1);
            if entry.pending == 0 {
                self.ready.insert((entry.priority, dependent));
                released += 1;
            }
        }
        released
    }

    /// Drops `id` from the running index and releases the duplicate parked
    /// behind it. Returns 1 if that duplicate became ready.
    fn stop_running(&mut self, id: JobId, key: &(JobKind, JobScope)) -> usize {
        if self.running.get(key) == Some(&id) {
            self.running.remove(key);
        }

        let Some(parked) = self.parked.remove(&id) else {
            return 0;
        };
        let Some(entry) = self.entries.get_mut(&parked) else {
            return 0;
        };
        if entry.state != JobState::Queued {
            return 0;
        }
        entry.pending = entry.pending.saturating_sub(1);
        if entry.pending > 0 {
            return 0;
        }
        self.ready.insert((entry.priority, parked));
        trace!(job = %parked, after = %id, "released parked duplicate");
        1
    }

    /// Marks `id` failed and propagates Errored to every transitive dependent.
    fn fail(&mut self, id: JobId, reason: FailureReason, now: Instant) {
        let mut worklist = VecDeque::from([(id, reason)]);

        while let Some((id, reason)) = worklist.pop_front() {
            let Some(entry) = self.entries.get_mut(&id) else {
                continue;
            };
            if entry.state.is_terminal() {
                continue;
            }

            let state = match reason {
                FailureReason::Cancelled => JobState::Cancelled,
                _ => JobState::Errored,
            };
            debug!(job = %id, kind = %entry.kind, scope = %entry.scope, %reason, "job failed");

            self.ready.remove(&(entry.priority, id));
            let key = (entry.kind, entry.scope.clone());
            if self.queued.get(&key) == Some(&id) {
                self.queued.remove(&key);
            }

            entry.func = None;
            entry.finished_at = Some(now);
            entry.failure = Some(reason);
            entry.set_state(state);

            worklist.extend(
                self.graph
                    .neighbors_directed(id, Direction::Outgoing)
                    .map(|dependent| (dependent, FailureReason::Dependency(id))),
            );
        }
    }

    /// Cancels every unfinished job and refuses new ones. Returns the number cancelled.
    pub fn shutdown(&mut self, now: Instant) -> usize {
        if self.shut_down {
            return 0;
        }
        self.shut_down = true;

        let mut cancelled = 0;
        for entry in self.entries.values_mut() {
            if entry.state.is_terminal() {
                continue;
            }
            entry.func = None;
            entry.finished_at = Some(now);
            entry.failure = Some(FailureReason::Cancelled);
            entry.set_state(JobState::Cancelled);
            cancelled += 1;
        }

        self.ready.clear();
        self.queued.clear();
        self.running.clear();
        self.parked.clear();
        cancelled
    }

    /// Drops terminal jobs that no waiter watches and no unfinished job depends on.
    pub fn collect_garbage(&mut self) -> usize {
        let collectable = self
            .entries
            .iter()
            .filter(|(id, entry)| {
                entry.state.is_terminal()
                    && entry.waiters == 0
                    && self
                        .graph
                        .neighbors_directed(**id, Direction::Outgoing)
                        .all(|dependent| {
                            self.entries
                                .get(&dependent)
                                .map_or(true, |entry| entry.state.is_terminal())
                        })
            })
            .map(|(id, _)| *id)
            .collect_vec();

        for id in &collectable {
            self.graph.remove_node(*id);
            let Some(entry) = self.entries.remove(id) else {
                continue;
            };
            if !entry.state.is_failed() {
                continue;
            }

            self.collected_failures.insert(*id);
            let key = (entry.kind, entry.scope.clone());
            let newer = self
                .last_failures
                .get(&key)
                .map_or(true, |failure| failure.id < *id);
            if newer {
                self.last_failures.insert(key, entry.failure(*id));
            }
        }

        if !collectable.is_empty() {
            trace!(collected = collectable.len(), "collected finished jobs");
        }
        collectable.len()
    }

    /// `ids` plus everything they transitively depend on that is still
    /// tracked or failed.
    pub fn closure(&self, ids: &[JobId]) -> Result<Vec<JobId>, JobError> {
        if let Some(unknown) = ids.iter().find(|id| !self.is_issued(**id)) {
            return Err(JobError::NotFound(*unknown));
        }

        let mut seen = HashSet::new();
        let mut closure = vec![];
        let mut stack = ids.to_vec();
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            let Some(entry) = self.entries.get(&id) else {
                if self.collected_failures.contains(&id) {
                    closure.push(id);
                }
                continue;
            };
            closure.push(id);
            stack.extend(entry.depends_on.iter().copied());
        }

        closure.sort();
        Ok(closure)
    }

    /// Registers a waiter on each tracked job in `ids`.
    pub fn subscribe(&mut self, ids: &[JobId]) -> Vec<(JobId, watch::Receiver<JobState>)> {
        ids.iter()
            .filter_map(|id| {
                let entry = self.entries.get_mut(id)?;
                entry.waiters += 1;
                Some((*id, entry.state_tx.subscribe()))
            })
            .collect()
    }

    pub fn release(&mut self, ids: &[JobId]) {
        for id in ids {
            if let Some(entry) = self.entries.get_mut(id) {
                entry.waiters = entry.waiters.saturating_sub(1);
            }
        }
    }

    /// Whether every job in `ids` ended Done.
    ///
    /// Failures with known details are reported as [`JobError::Failed`].
    /// Collected failures whose details were superseded only have their IDs.
    pub fn outcome(&self, ids: &[JobId]) -> Result<(), JobError> {
        let mut failures = vec![];
        let mut forgotten = vec![];

        for id in ids {
            if let Some(entry) = self.entries.get(id) {
                if entry.state.is_failed() {
                    failures.push(entry.failure(*id));
                }
                continue;
            }
            if !self.collected_failures.contains(id) {
                continue;
            }
            match self.last_failures.values().find(|failure| failure.id == *id) {
                Some(failure) => failures.push(failure.clone()),
                None => forgotten.push(*id),
            }
        }

        if !failures.is_empty() {
            Err(JobError::Failed(failures))
        } else if !forgotten.is_empty() {
            Err(JobError::FailedEarlier(forgotten))
        } else {
            Ok(())
        }
    }

    pub fn snapshot(&self, id: JobId) -> Result<JobSnapshot, JobError> {
        self.entries
            .get(&id)
            .map(|entry| entry.snapshot(id))
            .ok_or(JobError::NotFound(id))
    }

    pub fn scope_snapshots(&self, scope: &JobScope) -> Vec<JobSnapshot> {
        self.entries
            .iter()
            .filter(|(_, entry)| &entry.scope == scope)
            .map(|(id, entry)| entry.snapshot(*id))
            .sorted_by_key(|snapshot| snapshot.id)
            .collect()
    }

    pub fn pending_ids(&self) -> Vec<JobId> {
        self.entries
            .iter()
            .filter(|(_, entry)| !entry.state.is_terminal())
            .map(|(id, _)| *id)
            .sorted()
            .collect()
    }
}
