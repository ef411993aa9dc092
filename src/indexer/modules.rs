use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use itertools::Itertools;
use parking_lot::RwLock;
use ropey::Rope;

use crate::handle::DirHandle;

/// One source file of a module as the indexer last read it.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceFile {
    pub text: Rope,
    /// Editor version for open documents, `None` when read from disk.
    pub version: Option<i32>,
}

/// Sources of a single directory, taken by one `load_module` job.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleSnapshot {
    pub dir: DirHandle,
    /// Keyed by file name.
    pub files: BTreeMap<String, SourceFile>,
    /// Increases every time any module is reloaded.
    pub generation: u64,
}

impl ModuleSnapshot {
    pub fn filenames(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    pub fn text(&self, filename: &str) -> Option<&Rope> {
        self.files.get(filename).map(|file| &file.text)
    }

    pub fn version(&self, filename: &str) -> Option<i32> {
        self.files.get(filename).and_then(|file| file.version)
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Latest [`ModuleSnapshot`] per directory.
#[derive(Debug, Default)]
pub struct ModuleStore {
    modules: RwLock<HashMap<DirHandle, Arc<ModuleSnapshot>>>,
    generation: AtomicU64,
}

impl ModuleStore {
    pub fn new() -> ModuleStore {
        ModuleStore::default()
    }

    /// Stores `files` as the module of `dir`, replacing the previous snapshot.
    pub fn insert(&self, dir: DirHandle, files: BTreeMap<String, SourceFile>) -> Arc<ModuleSnapshot> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshot = Arc::new(ModuleSnapshot {
            dir: dir.clone(),
            files,
            generation,
        });
        self.modules.write().insert(dir, snapshot.clone());
        snapshot
    }

    pub fn get(&self, dir: &DirHandle) -> Option<Arc<ModuleSnapshot>> {
        self.modules.read().get(dir).cloned()
    }

    /// Drops every module at or below `root`, returning how many went away.
    pub fn remove_within(&self, root: &DirHandle) -> usize {
        let mut modules = self.modules.write();
        let before = modules.len();
        modules.retain(|dir, _| !dir.is_within(root));
        before - modules.len()
    }

    /// Directories with a loaded module, sorted.
    pub fn list(&self) -> Vec<DirHandle> {
        self.modules.read().keys().cloned().sorted().collect()
    }

    pub fn len(&self) -> usize {
        self.modules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.read().is_empty()
    }
}
