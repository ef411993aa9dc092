//! Shared test utilities for retab-ls.
//!
//! This module provides common helpers used across multiple test modules.
//! It is only compiled when running tests.

use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use crate::handle::DirHandle;

/// Creates a temporary workspace directory for testing.
///
/// Returns a tuple of (TempDir, PathBuf) where:
/// - TempDir: The temp directory handle (must be kept alive for the test duration)
/// - PathBuf: The path to the workspace subdirectory
///
/// # Why this helper exists
///
/// The walker skips hidden directories (those starting with `.`). On some
/// systems temp directories are created under paths like `/tmp/.tmpXXXXX`.
/// The root of a walk is never skipped, but creating a non-hidden
/// subdirectory called "workspace" keeps nested fixtures and relative paths
/// in assertions independent of where the temp directory lives.
///
/// # Example
///
/// ```ignore
/// use crate::test_utils::create_test_workspace_dir;
///
/// let (_temp_dir, root) = create_test_workspace_dir();
/// write_file(&root, "plugin/main.tf", "");
/// ```
pub fn create_test_workspace_dir() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let workspace_dir = temp_dir.path().join("workspace");
    fs::create_dir(&workspace_dir).expect("Failed to create workspace subdirectory");
    (temp_dir, workspace_dir)
}

/// Writes `contents` to `relative` below `root`, creating parent directories.
pub fn write_file(root: &Path, relative: &str, contents: &str) -> PathBuf {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("Failed to create parent directories");
    }
    fs::write(&path, contents).expect("Failed to write test file");
    path
}

pub fn dir_handle(path: &Path) -> DirHandle {
    DirHandle::from_path(path).expect("Failed to build directory handle")
}
