//! Versioned in-memory buffers for documents open in the editor.
//!
//! The [`DocumentStore`] holds the editor's view of every open document,
//! keyed by [`DocumentHandle`]. Versions strictly increase per document:
//! an update carrying a version at or below the stored one is treated as a
//! retransmitted or out-of-order notification and ignored.
//!
//! # Locking
//!
//! The map of documents sits behind one `RwLock` that is only held long
//! enough to find or insert an entry. Each document then has its own lock,
//! so an update serializes with other writers of the *same* document only.

mod changes;

pub use changes::apply_changes;

use std::collections::HashMap;
use std::sync::Arc;

use itertools::Itertools;
use parking_lot::RwLock;
use ropey::Rope;
use thiserror::Error;
use tower_lsp::lsp_types::{Range, Url};
use tracing::{debug, warn};

use crate::handle::{DirHandle, DocumentHandle};

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("document not found: {0}")]
    NotFound(Url),
    #[error("change range {range:?} is outside of a document with {lines} lines")]
    InvalidRange { range: Range, lines: usize },
}

/// A document as last reported by the editor.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub handle: DocumentHandle,
    pub language_id: String,
    pub version: i32,
    pub text: Rope,
}

#[derive(Debug, Default)]
pub struct DocumentStore {
    documents: RwLock<HashMap<DocumentHandle, Arc<RwLock<Document>>>>,
}

impl DocumentStore {
    pub fn new() -> DocumentStore {
        DocumentStore::default()
    }

    /// Creates the document, replacing any existing entry for the same handle.
    pub fn open_document(
        &self,
        handle: DocumentHandle,
        language_id: impl Into<String>,
        text: impl Into<Rope>,
        version: i32,
    ) {
        debug!(document = %handle, version, "opening document");

        let document = Document {
            handle: handle.clone(),
            language_id: language_id.into(),
            version,
            text: text.into(),
        };
        self.documents
            .write()
            .insert(handle, Arc::new(RwLock::new(document)));
    }

    pub fn get_document(&self, handle: &DocumentHandle) -> Result<Document, DocumentError> {
        let entry = self.entry(handle)?;
        let document = entry.read().clone();
        Ok(document)
    }

    /// Replaces the text of an open document if `version` is newer than the stored one.
    ///
    /// Stale versions are logged and ignored; they never surface as errors.
    pub fn update_document(
        &self,
        handle: &DocumentHandle,
        text: impl Into<Rope>,
        version: i32,
    ) -> Result<(), DocumentError> {
        let entry = self.entry(handle)?;
        let mut document = entry.write();

        if version <= document.version {
            warn!(
                document = %handle,
                received = version,
                current = document.version,
                "ignoring stale document version"
            );
            return Ok(());
        }

        document.text = text.into();
        document.version = version;
        debug!(document = %handle, version, "document updated");

        Ok(())
    }

    /// Removes the document. Closing a document that is not open is a no-op.
    pub fn close_document(&self, handle: &DocumentHandle) {
        if self.documents.write().remove(handle).is_some() {
            debug!(document = %handle, "closed document");
        }
    }

    pub fn is_open(&self, handle: &DocumentHandle) -> bool {
        self.documents.read().contains_key(handle)
    }

    /// All open documents directly inside `dir`, sorted by file name.
    pub fn list_documents(&self, dir: &DirHandle) -> Vec<Document> {
        let entries = self
            .documents
            .read()
            .iter()
            .filter(|(handle, _)| handle.dir() == dir)
            .map(|(_, entry)| entry.clone())
            .collect_vec();

        entries
            .iter()
            .map(|entry| entry.read().clone())
            .sorted_by(|a, b| a.handle.filename().cmp(b.handle.filename()))
            .collect()
    }

    pub fn has_open_documents(&self, dir: &DirHandle) -> bool {
        self.documents
            .read()
            .keys()
            .any(|handle| handle.dir() == dir)
    }

    fn entry(&self, handle: &DocumentHandle) -> Result<Arc<RwLock<Document>>, DocumentError> {
        self.documents
            .read()
            .get(handle)
            .cloned()
            .ok_or_else(|| DocumentError::NotFound(handle.uri().clone()))
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    fn handle(path: &str) -> DocumentHandle {
        DocumentHandle::from_path(path).unwrap()
    }

    #[test]
    fn stale_version_is_ignored() {
        let store = DocumentStore::new();
        let main = handle("/workspace/main.retab");

        store.open_document(main.clone(), "retab", "a", 0);
        store.update_document(&main, "b", 1).unwrap();
        store.update_document(&main, "c", 0).unwrap();

        let document = store.get_document(&main).unwrap();
        assert_eq!(document.version, 1);
        assert_eq!(document.text.to_string(), "b");
    }

    #[test]
    fn equal_version_is_ignored() {
        let store = DocumentStore::new();
        let main = handle("/workspace/main.retab");

        store.open_document(main.clone(), "retab", "a", 3);
        store.update_document(&main, "b", 3).unwrap();

        assert_eq!(store.get_document(&main).unwrap().text.to_string(), "a");
    }

    #[test]
    fn versions_need_not_be_consecutive() {
        let store = DocumentStore::new();
        let main = handle("/workspace/main.retab");

        store.open_document(main.clone(), "retab", "a", 1);
        store.update_document(&main, "b", 7).unwrap();

        assert_eq!(store.get_document(&main).unwrap().version, 7);
    }

    #[test]
    fn missing_document_is_not_found() {
        let store = DocumentStore::new();
        let missing = handle("/workspace/missing.retab");

        assert!(matches!(
            store.get_document(&missing),
            Err(DocumentError::NotFound(_))
        ));
        assert!(matches!(
            store.update_document(&missing, "x", 1),
            Err(DocumentError::NotFound(_))
        ));
    }

    #[test]
    fn reopening_replaces_content() {
        let store = DocumentStore::new();
        let main = handle("/workspace/main.retab");

        store.open_document(main.clone(), "retab", "first", 5);
        store.open_document(main.clone(), "retab", "second", 0);

        let document = store.get_document(&main).unwrap();
        assert_eq!(document.version, 0);
        assert_eq!(document.text.to_string(), "second");
    }

    #[test]
    fn closing_unknown_document_is_noop() {
        let store = DocumentStore::new();
        let main = handle("/workspace/main.retab");

        store.close_document(&main);
        store.open_document(main.clone(), "retab", "", 0);
        store.close_document(&main);

        assert!(!store.is_open(&main));
    }

    #[test]
    fn list_documents_is_scoped_to_directory() {
        let store = DocumentStore::new();
        let dir = DirHandle::from_path("/workspace").unwrap();

        store.open_document(handle("/workspace/z.tf"), "terraform", "", 0);
        store.open_document(handle("/workspace/a.retab"), "retab", "", 0);
        store.open_document(handle("/workspace/nested/b.retab"), "retab", "", 0);

        let names = store
            .list_documents(&dir)
            .into_iter()
            .map(|doc| doc.handle.filename().to_string())
            .collect_vec();

        assert_eq!(names, vec!["a.retab", "z.tf"]);
        assert!(store.has_open_documents(&dir));
        assert!(!store.has_open_documents(&DirHandle::from_path("/elsewhere").unwrap()));
    }

    #[test]
    fn concurrent_updates_keep_highest_version() {
        let store = Arc::new(DocumentStore::new());
        let main = handle("/workspace/main.retab");
        store.open_document(main.clone(), "retab", "v0", 0);

        let threads = (1..=8)
            .map(|worker| {
                let store = store.clone();
                let main = main.clone();
                thread::spawn(move || {
                    // Each thread submits an interleaved, partly descending sequence.
                    for round in (0..25).rev() {
                        let version = round * 8 + worker;
                        store
                            .update_document(&main, format!("v{version}"), version)
                            .unwrap();
                    }
                })
            })
            .collect_vec();

        for thread in threads {
            thread.join().unwrap();
        }

        let document = store.get_document(&main).unwrap();
        assert_eq!(document.version, 24 * 8 + 8);
        assert_eq!(document.text.to_string(), format!("v{}", 24 * 8 + 8));
    }
}
