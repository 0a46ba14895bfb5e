//! Store path resolution.
//!
//! The store file lives directly under a platform-provided persistent
//! documents root. The path is resolved once and cached for the life of the
//! process so a later change in what the provider reports can never point the
//! app at a different (empty) file.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use tracing::info;

use crate::error::OpenError;

pub const STORE_FILE_NAME: &str = "recipetuner.db";

/// Suffixes of files the storage engine keeps next to a store file.
pub const ARTIFACT_SUFFIXES: &[&str] = &[".lock", "-journal", "-wal", "-shm"];

/// Source of the persistent documents directory.
pub trait StorageRoot: Send + Sync {
    /// `None` when the platform cannot provide a persistent location.
    fn documents_root(&self) -> Option<PathBuf>;
}

/// A root fixed at construction time.
#[derive(Debug, Clone)]
pub struct FixedRoot(pub Option<PathBuf>);

impl StorageRoot for FixedRoot {
    fn documents_root(&self) -> Option<PathBuf> {
        self.0.clone()
    }
}

pub struct StorePath {
    root: Arc<dyn StorageRoot>,
    resolved: OnceLock<PathBuf>,
}

impl StorePath {
    pub fn new(root: Arc<dyn StorageRoot>) -> Self {
        Self {
            root,
            resolved: OnceLock::new(),
        }
    }

    /// The store file path, computed on first success and cached.
    pub fn resolve(&self) -> Result<PathBuf, OpenError> {
        if let Some(path) = self.resolved.get() {
            return Ok(path.clone());
        }
        let root = self.root.documents_root().ok_or_else(|| {
            OpenError::PathUnavailable("no persistent documents root is available".to_string())
        })?;
        let path = self.resolved.get_or_init(|| {
            let path = root.join(STORE_FILE_NAME);
            info!(path = %path.display(), "store path resolved");
            path
        });
        Ok(path.clone())
    }

    /// The cached path, if it has been resolved.
    pub fn cached(&self) -> Option<&Path> {
        self.resolved.get().map(PathBuf::as_path)
    }

    /// Directory to inspect for store artifacts: the cached path's parent,
    /// falling back to whatever the provider reports now.
    pub fn root_dir(&self) -> Option<PathBuf> {
        match self.cached() {
            Some(path) => path.parent().map(Path::to_path_buf),
            None => self.root.documents_root(),
        }
    }
}

fn with_suffix(store: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = store.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

pub fn lock_path(store: &Path) -> PathBuf {
    with_suffix(store, ".lock")
}

/// For an artifact file name such as `recipetuner.db-wal`, the store file
/// name it belongs to.
pub fn owning_store_name(file_name: &str) -> Option<&str> {
    ARTIFACT_SUFFIXES
        .iter()
        .find_map(|suffix| file_name.strip_suffix(suffix))
        .filter(|stem| !stem.is_empty())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    struct ChangingRoot(Mutex<Vec<PathBuf>>);

    impl StorageRoot for ChangingRoot {
        fn documents_root(&self) -> Option<PathBuf> {
            self.0.lock().unwrap().pop()
        }
    }

    #[test]
    fn test_resolve_joins_file_name() {
        let paths = StorePath::new(Arc::new(FixedRoot(Some(PathBuf::from("/data/app")))));
        assert!(paths.cached().is_none());
        assert_eq!(
            paths.resolve().unwrap(),
            PathBuf::from("/data/app/recipetuner.db")
        );
        assert_eq!(paths.root_dir(), Some(PathBuf::from("/data/app")));
    }

    #[test]
    fn test_resolve_is_cached() {
        let root = ChangingRoot(Mutex::new(vec![
            PathBuf::from("/second"),
            PathBuf::from("/first"),
        ]));
        let paths = StorePath::new(Arc::new(root));
        let first = paths.resolve().unwrap();
        let second = paths.resolve().unwrap();
        assert_eq!(first, PathBuf::from("/first/recipetuner.db"));
        assert_eq!(first, second);
    }

    #[test]
    fn test_missing_root_is_path_unavailable() {
        let paths = StorePath::new(Arc::new(FixedRoot(None)));
        assert!(matches!(
            paths.resolve(),
            Err(OpenError::PathUnavailable(_))
        ));
        assert!(paths.cached().is_none());
    }

    #[test]
    fn test_artifact_names() {
        assert_eq!(
            lock_path(Path::new("/d/recipetuner.db")),
            PathBuf::from("/d/recipetuner.db.lock")
        );
        assert_eq!(owning_store_name("recipetuner.db-wal"), Some("recipetuner.db"));
        assert_eq!(owning_store_name("recipetuner.db.lock"), Some("recipetuner.db"));
        assert_eq!(owning_store_name("recipetuner.db"), None);
        assert_eq!(owning_store_name(".lock"), None);
    }
}
