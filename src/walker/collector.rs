use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use parking_lot::Mutex;
use tokio::sync::watch;

use super::WalkVisitor;
use crate::handle::{DirHandle, DocumentHandle};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Visit {
    Dir(DirHandle),
    File(DocumentHandle),
}

/// A [`WalkVisitor`] that records what it is shown.
///
/// Optionally forwards every visit to another visitor, which lets a test
/// observe a walk that still indexes.
pub struct WalkerCollector {
    visits: Mutex<Vec<Visit>>,
    finished: watch::Sender<Vec<DirHandle>>,
    forward: Option<Arc<dyn WalkVisitor>>,
}

impl Default for WalkerCollector {
    fn default() -> Self {
        WalkerCollector::new()
    }
}

impl WalkerCollector {
    pub fn new() -> WalkerCollector {
        let (finished, _) = watch::channel(vec![]);
        WalkerCollector {
            visits: Mutex::new(vec![]),
            finished,
            forward: None,
        }
    }

    pub fn forwarding_to(visitor: Arc<dyn WalkVisitor>) -> WalkerCollector {
        WalkerCollector {
            forward: Some(visitor),
            ..WalkerCollector::new()
        }
    }

    /// Every visit in the order the walker made it.
    pub fn visited(&self) -> Vec<Visit> {
        self.visits.lock().clone()
    }

    pub fn visited_dirs(&self) -> Vec<DirHandle> {
        self.visits
            .lock()
            .iter()
            .filter_map(|visit| match visit {
                Visit::Dir(dir) => Some(dir.clone()),
                Visit::File(_) => None,
            })
            .collect()
    }

    pub fn visited_files(&self) -> Vec<DocumentHandle> {
        self.visits
            .lock()
            .iter()
            .filter_map(|visit| match visit {
                Visit::File(document) => Some(document.clone()),
                Visit::Dir(_) => None,
            })
            .collect()
    }

    /// Visited file paths relative to `root`; files outside it are left out.
    pub fn visited_relative(&self, root: &DirHandle) -> Vec<PathBuf> {
        self.visited_files()
            .iter()
            .filter(|document| document.dir().is_within(root))
            .filter_map(|document| pathdiff::diff_paths(document.path(), root.path()))
            .collect()
    }

    pub fn finished_roots(&self) -> Vec<DirHandle> {
        self.finished.borrow().clone()
    }

    /// Waits until a walk of `root` has finished.
    pub async fn wait_for_walk(&self, root: &DirHandle, timeout: Duration) -> anyhow::Result<()> {
        let mut finished = self.finished.subscribe();
        let walked = finished.wait_for(|roots| roots.contains(root));

        // Bound to a local so the borrowed `Ref` is dropped before `finished`.
        let result = match tokio::time::timeout(timeout, walked).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(anyhow!("collector dropped before {root} was walked")),
            Err(_) => Err(anyhow!("walk of {root} did not finish within {timeout:?}")),
        };
        result
    }
}

impl WalkVisitor for WalkerCollector {
    fn visit_dir(&self, dir: &DirHandle) -> anyhow::Result<()> {
        self.visits.lock().push(Visit::Dir(dir.clone()));
        match &self.forward {
            Some(visitor) => visitor.visit_dir(dir),
            None => Ok(()),
        }
    }

    fn visit_file(&self, document: &DocumentHandle) -> anyhow::Result<()> {
        self.visits.lock().push(Visit::File(document.clone()));
        match &self.forward {
            Some(visitor) => visitor.visit_file(document),
            None => Ok(()),
        }
    }

    fn walk_finished(&self, root: &DirHandle) {
        if let Some(visitor) = &self.forward {
            visitor.walk_finished(root);
        }
        self.finished.send_modify(|roots| roots.push(root.clone()));
    }
}
