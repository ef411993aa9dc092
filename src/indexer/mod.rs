//! Policy layer mapping document events to job pipelines.
//!
//! Every indexing request for a directory schedules the same three jobs:
//!
//! | Kind | Depends on | Does |
//! |------|------------|------|
//! | [`LOAD_MODULE`] | | snapshots the directory's sources, then parses them |
//! | [`VALIDATE_MODULE`] | `load_module` | runs [`Analyzer::validate`] on the snapshot |
//! | [`DECODE_REFERENCES`] | `load_module` | runs [`Analyzer::decode_references`] |
//!
//! Open documents take precedence over the files on disk, so a module always
//! reflects what the editor shows. What parsing, validation and reference
//! decoding actually compute is left to the [`Analyzer`].
//!
//! Repeated requests for a directory whose jobs are still queued coalesce in
//! the [`JobStore`], so a burst of edits or a walk that revisits a directory
//! does not multiply work.

mod modules;

pub use modules::{ModuleSnapshot, ModuleStore, SourceFile};

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use ropey::Rope;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::document::DocumentStore;
use crate::handle::DirHandle;
use crate::job::{Job, JobError, JobId, JobKind, JobPriority, JobScope, JobStore};
use crate::walker::is_recognized_file;

pub const LOAD_MODULE: JobKind = JobKind::new("load_module");
pub const VALIDATE_MODULE: JobKind = JobKind::new("validate_module");
pub const DECODE_REFERENCES: JobKind = JobKind::new("decode_references");

/// Language-specific analysis run by the indexing jobs.
///
/// All methods default to doing nothing.
pub trait Analyzer: Send + Sync {
    fn parse(&self, _module: &ModuleSnapshot) -> anyhow::Result<()> {
        Ok(())
    }

    fn validate(&self, _module: &ModuleSnapshot) -> anyhow::Result<()> {
        Ok(())
    }

    fn decode_references(&self, _module: &ModuleSnapshot) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAnalyzer;

impl Analyzer for NoopAnalyzer {}

type Analysis = fn(&dyn Analyzer, &ModuleSnapshot) -> anyhow::Result<()>;

/// What the job payloads need. Kept apart from [`Indexer`] so queued payloads
/// never hold the [`JobStore`] that owns them.
#[derive(Clone)]
struct Pipeline {
    documents: Arc<DocumentStore>,
    modules: Arc<ModuleStore>,
    analyzer: Arc<dyn Analyzer>,
    extensions: Arc<[String]>,
}

#[derive(Clone)]
pub struct Indexer {
    jobs: JobStore,
    pipeline: Pipeline,
}

impl Indexer {
    pub fn new(documents: Arc<DocumentStore>, jobs: JobStore, analyzer: Arc<dyn Analyzer>) -> Indexer {
        let extensions = crate::config::DEFAULT_FILE_EXTENSIONS
            .iter()
            .map(|extension| extension.to_string())
            .collect();

        Indexer {
            jobs,
            pipeline: Pipeline {
                documents,
                modules: Arc::new(ModuleStore::new()),
                analyzer,
                extensions,
            },
        }
    }

    /// Restricts module loading to files with these extensions.
    pub fn with_extensions(mut self, extensions: &[String]) -> Indexer {
        self.pipeline.extensions = extensions.into();
        self
    }

    pub fn extensions(&self) -> &[String] {
        &self.pipeline.extensions
    }

    pub fn documents(&self) -> &Arc<DocumentStore> {
        &self.pipeline.documents
    }

    pub fn modules(&self) -> &Arc<ModuleStore> {
        &self.pipeline.modules
    }

    /// The last loaded module of `dir`.
    pub fn module(&self, dir: &DirHandle) -> Option<Arc<ModuleSnapshot>> {
        self.pipeline.modules.get(dir)
    }

    /// Schedules re-indexing of `dir` after one of its documents changed.
    ///
    /// Returns the IDs of every scheduled job; a handler waits on all of
    /// them before answering. Nothing is scheduled once `token` is cancelled.
    pub fn document_changed(
        &self,
        token: &CancellationToken,
        dir: &DirHandle,
    ) -> Result<Vec<JobId>, JobError> {
        if token.is_cancelled() {
            return Err(JobError::WaitCancelled);
        }
        self.schedule(dir, JobPriority::High)
    }

    pub fn document_opened(
        &self,
        token: &CancellationToken,
        dir: &DirHandle,
    ) -> Result<Vec<JobId>, JobError> {
        self.document_changed(token, dir)
    }

    /// Reloads `dir` from disk once a document is no longer open.
    pub fn document_closed(&self, dir: &DirHandle) -> Result<Vec<JobId>, JobError> {
        self.schedule(dir, JobPriority::Normal)
    }

    /// Background indexing of a directory found by the walker.
    pub fn walked_dir(&self, dir: &DirHandle) -> Result<Vec<JobId>, JobError> {
        self.schedule(dir, JobPriority::Low)
    }

    fn schedule(&self, dir: &DirHandle, priority: JobPriority) -> Result<Vec<JobId>, JobError> {
        let load = {
            let pipeline = self.pipeline.clone();
            let dir = dir.clone();
            Job::new(LOAD_MODULE, JobScope::Dir(dir.clone()), move |_| {
                pipeline.load_module(dir)
            })
            .with_priority(priority)
        };
        let load = self.jobs.enqueue(load)?;

        let validate = self.jobs.enqueue(self.analysis(
            VALIDATE_MODULE,
            dir,
            priority,
            load,
            |analyzer, module| analyzer.validate(module),
        ))?;
        let decode = self.jobs.enqueue(self.analysis(
            DECODE_REFERENCES,
            dir,
            priority,
            load,
            |analyzer, module| analyzer.decode_references(module),
        ))?;

        debug!(dir = %dir, ?priority, %load, %validate, %decode, "scheduled module indexing");
        Ok(vec![load, validate, decode])
    }

    fn analysis(
        &self,
        kind: JobKind,
        dir: &DirHandle,
        priority: JobPriority,
        load: JobId,
        analyze: Analysis,
    ) -> Job {
        let pipeline = self.pipeline.clone();
        let module_dir = dir.clone();

        Job::new(kind, JobScope::Dir(dir.clone()), move |_| async move {
            let module = pipeline
                .modules
                .get(&module_dir)
                .ok_or_else(|| anyhow!("module {module_dir} has not been loaded"))?;
            analyze(pipeline.analyzer.as_ref(), &module)
        })
        .with_priority(priority)
        .depends_on([load])
    }
}

impl Pipeline {
    async fn load_module(self, dir: DirHandle) -> anyhow::Result<()> {
        let extensions = self.extensions.clone();
        let disk_dir = dir.clone();
        let mut files = tokio::task::spawn_blocking(move || read_sources(&disk_dir, &extensions))
            .await
            .context("reading module sources")??;

        for document in self.documents.list_documents(&dir) {
            if !is_recognized_file(&document.handle.path(), &self.extensions) {
                continue;
            }
            files.insert(
                document.handle.filename().to_string(),
                SourceFile {
                    text: document.text,
                    version: Some(document.version),
                },
            );
        }

        let module = self.modules.insert(dir, files);
        debug!(dir = %module.dir, files = module.files.len(), generation = module.generation, "loaded module");

        self.analyzer.parse(&module)
    }
}

/// Recognized files directly inside `dir`. A directory that no longer exists
/// yields an empty module.
fn read_sources(dir: &DirHandle, extensions: &[String]) -> anyhow::Result<BTreeMap<String, SourceFile>> {
    let entries = match std::fs::read_dir(dir.path()) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(err) => return Err(err).with_context(|| format!("reading directory {dir}")),
    };

    let mut files = BTreeMap::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("reading directory {dir}"))?;
        let path = entry.path();
        if !entry.file_type()?.is_file() || !is_recognized_file(&path, extensions) {
            continue;
        }
        let Some(filename) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };

        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        files.insert(
            filename.to_string(),
            SourceFile {
                text: Rope::from_str(&text),
                version: None,
            },
        );
    }

    Ok(files)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::bail;

    use super::*;
    use crate::job::{FailureReason, JobState, JobStoreOptions};
    use crate::test_utils::{create_test_workspace_dir, dir_handle, write_file};

    fn indexer(analyzer: Arc<dyn Analyzer>) -> Indexer {
        let jobs = JobStore::new(JobStoreOptions { workers: 2 }).unwrap();
        Indexer::new(Arc::new(DocumentStore::new()), jobs, analyzer)
    }

    struct FailingValidation;

    impl Analyzer for FailingValidation {
        fn validate(&self, module: &ModuleSnapshot) -> anyhow::Result<()> {
            bail!("invalid block in {}", module.dir)
        }
    }

    #[derive(Default)]
    struct CountingAnalyzer {
        parsed: AtomicUsize,
    }

    impl Analyzer for CountingAnalyzer {
        fn parse(&self, _module: &ModuleSnapshot) -> anyhow::Result<()> {
            self.parsed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn open_documents_take_precedence_over_disk() {
        let (_temp_dir, root) = create_test_workspace_dir();
        write_file(&root, "main.tf", "disk");
        write_file(&root, "vars.tf", "vars on disk");
        write_file(&root, "README.md", "not a module file");
        write_file(&root, "nested/child.tf", "other module");

        let indexer = indexer(Arc::new(NoopAnalyzer));
        let dir = dir_handle(&root);
        indexer
            .documents()
            .open_document(dir.document("main.tf").unwrap(), "terraform", "editor", 3);

        let token = CancellationToken::new();
        let ids = indexer.document_changed(&token, &dir).unwrap();
        assert_eq!(ids.len(), 3);
        indexer.jobs.wait_for_jobs(&token, &ids).await.unwrap();

        let module = indexer.module(&dir).unwrap();
        assert_eq!(module.filenames().collect::<Vec<_>>(), vec!["main.tf", "vars.tf"]);
        assert_eq!(module.text("main.tf").unwrap().to_string(), "editor");
        assert_eq!(module.version("main.tf"), Some(3));
        assert_eq!(module.version("vars.tf"), None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failing_validation_reports_exactly_one_failure() {
        let (_temp_dir, root) = create_test_workspace_dir();
        write_file(&root, "main.tf", "resource {}");

        let indexer = indexer(Arc::new(FailingValidation));
        let dir = dir_handle(&root);
        let token = CancellationToken::new();
        let ids = indexer.document_changed(&token, &dir).unwrap();

        let err = indexer.jobs.wait_for_jobs(&token, &ids).await.unwrap_err();

        let failures = err.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].kind, VALIDATE_MODULE);
        assert!(matches!(failures[0].reason, FailureReason::Execution(_)));
        assert_eq!(indexer.jobs.job(ids[2]).unwrap().state, JobState::Done);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancelled_token_schedules_nothing() {
        let indexer = indexer(Arc::new(NoopAnalyzer));
        let token = CancellationToken::new();
        token.cancel();

        let result = indexer.document_changed(&token, &dir_handle(std::path::Path::new("/ws/a")));

        assert!(matches!(result, Err(JobError::WaitCancelled)));
        assert!(indexer.jobs.pending_jobs().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_directory_loads_an_empty_module() {
        let (_temp_dir, root) = create_test_workspace_dir();
        let indexer = indexer(Arc::new(NoopAnalyzer));
        let dir = dir_handle(&root.join("gone"));

        let ids = indexer.document_closed(&dir).unwrap();
        indexer
            .jobs
            .wait_for_jobs(&CancellationToken::new(), &ids)
            .await
            .unwrap();

        assert!(indexer.module(&dir).unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn every_load_parses_a_new_generation() {
        let (_temp_dir, root) = create_test_workspace_dir();
        write_file(&root, "main.tf", "a");

        let analyzer = Arc::new(CountingAnalyzer::default());
        let indexer = indexer(analyzer.clone());
        let dir = dir_handle(&root);
        let token = CancellationToken::new();

        let first = indexer.walked_dir(&dir).unwrap();
        indexer.jobs.wait_for_jobs(&token, &first).await.unwrap();
        let generation = indexer.module(&dir).unwrap().generation;

        write_file(&root, "main.tf", "b");
        let second = indexer.document_closed(&dir).unwrap();
        indexer.jobs.wait_for_jobs(&token, &second).await.unwrap();

        let module = indexer.module(&dir).unwrap();
        assert!(module.generation > generation);
        assert_eq!(module.text("main.tf").unwrap().to_string(), "b");
        assert_eq!(analyzer.parsed.load(Ordering::SeqCst), 2);
    }
}
