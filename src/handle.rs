//! Normalized identities for workspace directories and documents.
//!
//! Every store in the crate is addressed by these handles rather than by raw
//! paths or URIs, so two spellings of the same location (`/a/./b/`, `/a/b`,
//! `file:///a/b`) always resolve to the same entry.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tower_lsp::lsp_types::Url;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandleError {
    #[error("path is not absolute: {}", .0.display())]
    NotAbsolute(PathBuf),
    #[error("not a file URI: {0}")]
    NotFileUri(Url),
    #[error("path has no file name: {}", .0.display())]
    NoFileName(PathBuf),
}

/// Identity of a workspace directory.
///
/// The path is absolute and lexically normalized: `.` components are dropped,
/// `..` components pop their parent, and trailing separators disappear.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DirHandle {
    path: PathBuf,
    uri: Url,
}

impl DirHandle {
    pub fn from_path(path: impl AsRef<Path>) -> Result<DirHandle, HandleError> {
        let path = normalize(path.as_ref())?;
        let uri = Url::from_directory_path(&path)
            .map_err(|_| HandleError::NotAbsolute(path.clone()))?;

        Ok(DirHandle { path, uri })
    }

    pub fn from_uri(uri: &Url) -> Result<DirHandle, HandleError> {
        DirHandle::from_path(uri_to_path(uri)?)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn uri(&self) -> &Url {
        &self.uri
    }

    /// Base name of the directory, `None` for a filesystem root.
    pub fn name(&self) -> Option<&str> {
        self.path.file_name()?.to_str()
    }

    /// Returns true if `self` is `other` or lies beneath it.
    pub fn is_within(&self, other: &DirHandle) -> bool {
        self.path.starts_with(&other.path)
    }

    pub fn document(&self, filename: &str) -> Result<DocumentHandle, HandleError> {
        DocumentHandle::from_path(self.path.join(filename))
    }
}

impl fmt::Display for DirHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

/// Identity of a single document: its containing directory plus file name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentHandle {
    dir: DirHandle,
    filename: String,
    uri: Url,
}

impl DocumentHandle {
    pub fn from_path(path: impl AsRef<Path>) -> Result<DocumentHandle, HandleError> {
        let path = normalize(path.as_ref())?;

        let filename = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| HandleError::NoFileName(path.clone()))?
            .to_string();
        let parent = path
            .parent()
            .ok_or_else(|| HandleError::NoFileName(path.clone()))?;
        let uri =
            Url::from_file_path(&path).map_err(|_| HandleError::NotAbsolute(path.clone()))?;

        Ok(DocumentHandle {
            dir: DirHandle::from_path(parent)?,
            filename,
            uri,
        })
    }

    pub fn from_uri(uri: &Url) -> Result<DocumentHandle, HandleError> {
        DocumentHandle::from_path(uri_to_path(uri)?)
    }

    pub fn dir(&self) -> &DirHandle {
        &self.dir
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn uri(&self) -> &Url {
        &self.uri
    }

    pub fn path(&self) -> PathBuf {
        self.dir.path.join(&self.filename)
    }
}

impl fmt::Display for DocumentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path().display())
    }
}

fn uri_to_path(uri: &Url) -> Result<PathBuf, HandleError> {
    if uri.scheme() != "file" {
        return Err(HandleError::NotFileUri(uri.clone()));
    }
    uri.to_file_path()
        .map_err(|_| HandleError::NotFileUri(uri.clone()))
}

fn normalize(path: &Path) -> Result<PathBuf, HandleError> {
    if !path.is_absolute() {
        return Err(HandleError::NotAbsolute(path.to_path_buf()));
    }

    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }

    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dir_handle_normalizes_path() {
        let a = DirHandle::from_path("/workspace/./modules/../modules/net/").unwrap();
        let b = DirHandle::from_path("/workspace/modules/net").unwrap();

        assert_eq!(a, b);
        assert_eq!(a.path(), Path::new("/workspace/modules/net"));
        assert_eq!(a.name(), Some("net"));
        assert_eq!(a.uri().as_str(), "file:///workspace/modules/net/");
    }

    #[test]
    fn dir_handle_rejects_relative_path() {
        let err = DirHandle::from_path("modules/net").unwrap_err();
        assert_eq!(err, HandleError::NotAbsolute(PathBuf::from("modules/net")));
    }

    #[test]
    fn dir_handle_from_uri_matches_path() {
        let uri = Url::parse("file:///workspace/modules").unwrap();
        let from_uri = DirHandle::from_uri(&uri).unwrap();

        assert_eq!(from_uri, DirHandle::from_path("/workspace/modules").unwrap());
    }

    #[test]
    fn non_file_uri_is_rejected() {
        let uri = Url::parse("untitled:Untitled-1").unwrap();

        assert!(matches!(
            DocumentHandle::from_uri(&uri),
            Err(HandleError::NotFileUri(_))
        ));
    }

    #[test]
    fn document_handle_splits_dir_and_filename() {
        let uri = Url::parse("file:///workspace/modules/main.retab").unwrap();
        let handle = DocumentHandle::from_uri(&uri).unwrap();

        assert_eq!(handle.filename(), "main.retab");
        assert_eq!(handle.dir().path(), Path::new("/workspace/modules"));
        assert_eq!(handle.path(), PathBuf::from("/workspace/modules/main.retab"));
        assert_eq!(handle.uri(), &uri);
    }

    #[test]
    fn document_from_dir_equals_document_from_uri() {
        let dir = DirHandle::from_path("/workspace").unwrap();
        let uri = Url::parse("file:///workspace/vars.tfvars").unwrap();

        assert_eq!(
            dir.document("vars.tfvars").unwrap(),
            DocumentHandle::from_uri(&uri).unwrap()
        );
    }

    #[test]
    fn is_within_checks_ancestry() {
        let root = DirHandle::from_path("/workspace").unwrap();
        let child = DirHandle::from_path("/workspace/modules").unwrap();
        let sibling = DirHandle::from_path("/workspace-other").unwrap();

        assert!(child.is_within(&root));
        assert!(root.is_within(&root));
        assert!(!sibling.is_within(&root));
    }
}
