//! Per-session state handed to every handler.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::document::DocumentStore;
use crate::handle::DirHandle;
use crate::indexer::{Analyzer, Indexer, NoopAnalyzer};
use crate::job::{JobError, JobId, JobStore, JobStoreOptions};
use crate::walker::{IndexingVisitor, WalkSummary, WalkVisitor, Walker};

/// Everything one editor session shares.
///
/// Built once per session and passed to handlers behind an `Arc`; there is no
/// global instance. Dropping it shuts the job store down.
pub struct StateStore {
    pub documents: Arc<DocumentStore>,
    pub jobs: JobStore,
    pub indexer: Indexer,
    pub walker: Walker,
    settings: Settings,
}

impl StateStore {
    /// Must be called from within a tokio runtime.
    pub fn new(settings: &Settings) -> Result<StateStore, JobError> {
        StateStore::with_analyzer(settings, Arc::new(NoopAnalyzer))
    }

    pub fn with_analyzer(settings: &Settings, analyzer: Arc<dyn Analyzer>) -> Result<StateStore, JobError> {
        let documents = Arc::new(DocumentStore::new());
        let jobs = JobStore::new(JobStoreOptions {
            workers: settings.workers,
        })?;
        let indexer = Indexer::new(documents.clone(), jobs.clone(), analyzer)
            .with_extensions(&settings.file_extensions);
        let walker = Walker::new(
            Arc::new(IndexingVisitor::new(indexer.clone())),
            &settings.file_extensions,
        );

        Ok(StateStore {
            documents,
            jobs,
            indexer,
            walker,
            settings: settings.clone(),
        })
    }

    /// Replaces the walker's sink.
    pub fn with_visitor(mut self, visitor: Arc<dyn WalkVisitor>) -> StateStore {
        self.walker = Walker::new(visitor, &self.settings.file_extensions);
        self
    }

    /// A fresh indexing sink, for wrapping in another visitor.
    pub fn indexing_visitor(&self) -> Arc<dyn WalkVisitor> {
        Arc::new(IndexingVisitor::new(self.indexer.clone()))
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Walks `root` with the configured ignore list.
    pub fn walk(&self, root: &DirHandle) -> WalkSummary {
        self.walker.walk(root, &self.settings.ignore_directory_names)
    }

    /// [`JobStore::wait_for_jobs`] bounded by the configured wait timeout.
    pub async fn wait_for_jobs(&self, token: &CancellationToken, ids: &[JobId]) -> Result<(), JobError> {
        let timeout = self.settings.wait_timeout();
        match tokio::time::timeout(timeout, self.jobs.wait_for_jobs(token, ids)).await {
            Ok(result) => result,
            Err(_) => Err(JobError::WaitTimeout(timeout)),
        }
    }

    pub fn shutdown(&self) {
        self.jobs.shutdown();
    }
}

impl Drop for StateStore {
    fn drop(&mut self) {
        self.shutdown();
    }
}
