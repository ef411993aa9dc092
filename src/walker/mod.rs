//! Workspace discovery.
//!
//! The [`Walker`] descends a workspace root, skipping ignored and hidden
//! directories, and reports every directory and recognized file to a
//! [`WalkVisitor`]. The sink is picked at construction: the server walks
//! into an [`IndexingVisitor`], tests walk into a [`WalkerCollector`].
//!
//! # Ignore policy
//!
//! A subdirectory is skipped when its base name exactly matches one of the
//! ignored names (case-sensitive) or starts with `.`. The root itself is
//! always walked.
//!
//! # Failures
//!
//! Unreadable subtrees and visitor errors are logged and counted in
//! [`WalkSummary::errors`]; the walk carries on with the siblings.

mod collector;
mod indexing;

pub use collector::{Visit, WalkerCollector};
pub use indexing::IndexingVisitor;

use std::cell::Cell;
use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;

use rayon::prelude::*;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use walkdir::{DirEntry, WalkDir};

use crate::handle::{DirHandle, DocumentHandle};

/// Receives what a [`Walker`] finds.
pub trait WalkVisitor: Send + Sync {
    fn visit_dir(&self, _dir: &DirHandle) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called once per recognized file.
    fn visit_file(&self, document: &DocumentHandle) -> anyhow::Result<()>;

    /// Called after the walk of `root` ended, successfully or not.
    fn walk_finished(&self, _root: &DirHandle) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkSummary {
    pub root: DirHandle,
    pub directories: usize,
    pub files: usize,
    /// Subdirectories left out by the ignore policy.
    pub skipped: usize,
    pub errors: usize,
}

impl WalkSummary {
    fn new(root: DirHandle) -> WalkSummary {
        WalkSummary {
            root,
            directories: 0,
            files: 0,
            skipped: 0,
            errors: 0,
        }
    }
}

/// Returns true if `path` has one of `extensions` (without the dot).
pub fn is_recognized_file(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(OsStr::to_str)
        .is_some_and(|extension| extensions.iter().any(|known| known == extension))
}

fn is_ignored_dir(entry: &DirEntry, ignore_directory_names: &[String]) -> bool {
    if entry.depth() == 0 || !entry.file_type().is_dir() {
        return false;
    }
    entry.file_name().to_str().is_some_and(|name| {
        name.starts_with('.') || ignore_directory_names.iter().any(|ignored| ignored == name)
    })
}

#[derive(Clone)]
pub struct Walker {
    visitor: Arc<dyn WalkVisitor>,
    extensions: Arc<[String]>,
}

impl Walker {
    pub fn new(visitor: Arc<dyn WalkVisitor>, extensions: &[String]) -> Walker {
        Walker {
            visitor,
            extensions: extensions.into(),
        }
    }

    pub fn visitor(&self) -> &Arc<dyn WalkVisitor> {
        &self.visitor
    }

    /// Walks `root` depth-first, directories before their contents.
    pub fn walk(&self, root: &DirHandle, ignore_directory_names: &[String]) -> WalkSummary {
        let mut summary = WalkSummary::new(root.clone());
        let skipped = Cell::new(0);

        let entries = WalkDir::new(root.path())
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                let ignored = is_ignored_dir(entry, ignore_directory_names);
                if ignored {
                    debug!(path = %entry.path().display(), "skipping ignored directory");
                    skipped.set(skipped.get() + 1);
                }
                !ignored
            });

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(root = %root, path = ?err.path(), error = %err, "failed to read workspace path");
                    summary.errors += 1;
                    continue;
                }
            };

            let visited = if entry.file_type().is_dir() {
                summary.directories += 1;
                DirHandle::from_path(entry.path())
                    .map_err(anyhow::Error::from)
                    .and_then(|dir| self.visitor.visit_dir(&dir))
            } else if entry.file_type().is_file() && is_recognized_file(entry.path(), &self.extensions) {
                summary.files += 1;
                DocumentHandle::from_path(entry.path())
                    .map_err(anyhow::Error::from)
                    .and_then(|document| self.visitor.visit_file(&document))
            } else {
                continue;
            };

            if let Err(err) = visited {
                warn!(path = %entry.path().display(), error = %err, "walk visitor failed");
                summary.errors += 1;
            }
        }

        summary.skipped = skipped.get();
        self.visitor.walk_finished(root);

        info!(
            root = %root,
            directories = summary.directories,
            files = summary.files,
            skipped = summary.skipped,
            errors = summary.errors,
            "finished walking workspace"
        );
        summary
    }

    /// Walks several roots in parallel.
    pub fn walk_roots(&self, roots: &[DirHandle], ignore_directory_names: &[String]) -> Vec<WalkSummary> {
        roots
            .par_iter()
            .map(|root| self.walk(root, ignore_directory_names))
            .collect()
    }

    /// Runs [`Walker::walk_roots`] on tokio's blocking pool.
    pub fn spawn_walk(
        &self,
        roots: Vec<DirHandle>,
        ignore_directory_names: Vec<String>,
    ) -> JoinHandle<Vec<WalkSummary>> {
        let walker = self.clone();
        tokio::task::spawn_blocking(move || walker.walk_roots(&roots, &ignore_directory_names))
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use anyhow::bail;
    use itertools::Itertools;

    use super::*;
    use crate::test_utils::{create_test_workspace_dir, dir_handle, write_file};

    fn extensions() -> Vec<String> {
        vec!["tf".to_string(), "retab".to_string()]
    }

    fn relative_files(collector: &WalkerCollector, root: &DirHandle) -> Vec<PathBuf> {
        collector
            .visited_files()
            .iter()
            .filter_map(|document| pathdiff::diff_paths(document.path(), root.path()))
            .collect()
    }

    #[test]
    fn ignored_directories_are_not_visited() {
        let (_temp_dir, root) = create_test_workspace_dir();
        write_file(&root, "plugin/main.tf", "");
        write_file(&root, "ignore/main.tf", "");

        let collector = Arc::new(WalkerCollector::new());
        let walker = Walker::new(collector.clone(), &extensions());
        let root = dir_handle(&root);

        let summary = walker.walk(&root, &["ignore".to_string()]);

        assert_eq!(relative_files(&collector, &root), vec![PathBuf::from("plugin/main.tf")]);
        assert_eq!(summary.files, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.errors, 0);
    }

    #[test]
    fn hidden_directories_and_unknown_extensions_are_skipped() {
        let (_temp_dir, root) = create_test_workspace_dir();
        write_file(&root, ".terraform/modules/cached.tf", "");
        write_file(&root, "notes.md", "");
        write_file(&root, "main.tf", "");
        write_file(&root, "config.retab", "");

        let collector = Arc::new(WalkerCollector::new());
        let walker = Walker::new(collector.clone(), &extensions());
        let root = dir_handle(&root);

        let summary = walker.walk(&root, &[]);

        assert_eq!(
            relative_files(&collector, &root),
            vec![PathBuf::from("config.retab"), PathBuf::from("main.tf")]
        );
        assert_eq!(summary.skipped, 1);
        assert_eq!(collector.visited_dirs(), vec![root]);
    }

    #[test]
    fn ignore_names_are_matched_exactly() {
        let (_temp_dir, root) = create_test_workspace_dir();
        write_file(&root, "Vendor/main.tf", "");
        write_file(&root, "vendored/main.tf", "");
        write_file(&root, "vendor/main.tf", "");

        let collector = Arc::new(WalkerCollector::new());
        let walker = Walker::new(collector.clone(), &extensions());
        let root = dir_handle(&root);

        walker.walk(&root, &["vendor".to_string()]);

        assert_eq!(
            relative_files(&collector, &root),
            vec![PathBuf::from("Vendor/main.tf"), PathBuf::from("vendored/main.tf")]
        );
    }

    #[test]
    fn ignored_root_is_still_walked() {
        let (_temp_dir, root) = create_test_workspace_dir();
        let root = root.join("ignore");
        write_file(&root, "main.tf", "");

        let collector = Arc::new(WalkerCollector::new());
        let walker = Walker::new(collector.clone(), &extensions());

        let summary = walker.walk(&dir_handle(&root), &["ignore".to_string()]);

        assert_eq!(summary.files, 1);
    }

    #[test]
    fn missing_root_is_reported_not_fatal() {
        let (_temp_dir, root) = create_test_workspace_dir();
        let collector = Arc::new(WalkerCollector::new());
        let walker = Walker::new(collector.clone(), &extensions());
        let missing = dir_handle(&root.join("missing"));

        let summary = walker.walk(&missing, &[]);

        assert_eq!(summary.errors, 1);
        assert!(collector.visited().is_empty());
        assert_eq!(collector.finished_roots(), vec![missing]);
    }

    struct RejectingVisitor;

    impl WalkVisitor for RejectingVisitor {
        fn visit_file(&self, document: &DocumentHandle) -> anyhow::Result<()> {
            if document.filename() == "bad.tf" {
                bail!("rejected {document}");
            }
            Ok(())
        }
    }

    #[test]
    fn visitor_errors_do_not_stop_the_walk() {
        let (_temp_dir, root) = create_test_workspace_dir();
        write_file(&root, "a/bad.tf", "");
        write_file(&root, "b/good.tf", "");

        let walker = Walker::new(Arc::new(RejectingVisitor), &extensions());
        let summary = walker.walk(&dir_handle(&root), &[]);

        assert_eq!(summary.files, 2);
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.directories, 3);
    }

    #[cfg(unix)]
    #[test]
    fn unreadable_directory_is_skipped_and_siblings_are_walked() {
        use std::fs::{self, Permissions};
        use std::os::unix::fs::PermissionsExt;

        let (_temp_dir, root) = create_test_workspace_dir();
        write_file(&root, "a/hidden.tf", "");
        write_file(&root, "b/main.tf", "");
        let locked = root.join("a");
        fs::set_permissions(&locked, Permissions::from_mode(0o000)).unwrap();

        if fs::read_dir(&locked).is_ok() {
            // Permission bits don't apply to this user, typically root.
            fs::set_permissions(&locked, Permissions::from_mode(0o755)).unwrap();
            return;
        }

        let collector = Arc::new(WalkerCollector::new());
        let walker = Walker::new(collector.clone(), &extensions());
        let root = dir_handle(&root);
        let summary = walker.walk(&root, &[]);

        fs::set_permissions(&locked, Permissions::from_mode(0o755)).unwrap();

        assert_eq!(summary.errors, 1);
        assert_eq!(relative_files(&collector, &root), vec![PathBuf::from("b/main.tf")]);
        assert_eq!(collector.finished_roots(), vec![root]);
    }

    #[test]
    fn walk_roots_walks_every_root() {
        let (_temp_dir, root) = create_test_workspace_dir();
        write_file(&root, "one/main.tf", "");
        write_file(&root, "two/main.tf", "");
        write_file(&root, "two/nested/vars.tf", "");

        let collector = Arc::new(WalkerCollector::new());
        let walker = Walker::new(collector.clone(), &extensions());
        let roots = vec![dir_handle(&root.join("one")), dir_handle(&root.join("two"))];

        let summaries = walker.walk_roots(&roots, &[]);

        assert_eq!(summaries.iter().map(|summary| summary.files).collect_vec(), vec![1, 2]);
        assert_eq!(collector.visited_files().len(), 3);
        assert_eq!(collector.finished_roots().into_iter().sorted().collect_vec(), roots);
    }

    #[test]
    fn recognizes_configured_extensions_only() {
        let extensions = extensions();
        assert!(is_recognized_file(Path::new("/ws/main.tf"), &extensions));
        assert!(!is_recognized_file(Path::new("/ws/main.TF"), &extensions));
        assert!(!is_recognized_file(Path::new("/ws/tf"), &extensions));
    }
}
