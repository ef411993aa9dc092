use std::collections::HashSet;

use parking_lot::Mutex;
use tracing::trace;

use super::WalkVisitor;
use crate::handle::{DirHandle, DocumentHandle};
use crate::indexer::Indexer;

/// Schedules background indexing for every directory that holds a
/// recognized file.
///
/// Files already open in the editor are left alone: their directory was
/// indexed when they were opened and the editor's text wins anyway.
pub struct IndexingVisitor {
    indexer: Indexer,
    /// Directories scheduled by walks still in progress.
    scheduled: Mutex<HashSet<DirHandle>>,
}

impl IndexingVisitor {
    pub fn new(indexer: Indexer) -> IndexingVisitor {
        IndexingVisitor {
            indexer,
            scheduled: Mutex::new(HashSet::new()),
        }
    }
}

impl WalkVisitor for IndexingVisitor {
    fn visit_file(&self, document: &DocumentHandle) -> anyhow::Result<()> {
        if self.indexer.documents().is_open(document) {
            trace!(document = %document, "skipping open document");
            return Ok(());
        }
        if !self.scheduled.lock().insert(document.dir().clone()) {
            return Ok(());
        }

        if let Err(err) = self.indexer.walked_dir(document.dir()) {
            self.scheduled.lock().remove(document.dir());
            return Err(err.into());
        }
        Ok(())
    }

    fn walk_finished(&self, root: &DirHandle) {
        self.scheduled.lock().retain(|dir| !dir.is_within(root));
    }
}
