//! Filesystem-backed code store.
//!
//! Sources live at `source_root/<school_id>/<project_id>`; a run works on a copy
//! at `workspace_root/<project_id>`, which is what the sandbox mounts.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::{debug, warn};
use uuid::Uuid;

use super::{CodeStore, StoreError, StoreResult};

#[derive(Debug, Clone)]
pub struct LocalCodeStore {
    source_root: PathBuf,
    workspace_root: PathBuf,
}

impl LocalCodeStore {
    pub fn new(source_root: impl Into<PathBuf>, workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            source_root: source_root.into(),
            workspace_root: workspace_root.into(),
        }
    }

    pub fn source_dir(&self, project_id: &str, school_id: &str) -> StoreResult<PathBuf> {
        Ok(self
            .source_root
            .join(path_component(school_id)?)
            .join(path_component(project_id)?))
    }

    pub fn workspace_dir(&self, project_id: &str) -> StoreResult<PathBuf> {
        Ok(self.workspace_root.join(path_component(project_id)?))
    }
}

#[async_trait]
impl CodeStore for LocalCodeStore {
    async fn clone_code(&self, project_id: &str, school_id: &str) -> StoreResult<()> {
        let source = self.source_dir(project_id, school_id)?;
        let workspace = self.workspace_dir(project_id)?;

        if !tokio::fs::metadata(&source)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
        {
            return Err(StoreError::NotFound(source.display().to_string()));
        }

        debug!(
            "cloning {} into workspace {}",
            source.display(),
            workspace.display()
        );
        tokio::task::spawn_blocking(move || replace_dir(&source, &workspace)).await??;
        Ok(())
    }

    async fn save_changes(&self, project_id: &str, school_id: &str) -> StoreResult<()> {
        let source = self.source_dir(project_id, school_id)?;
        let workspace = self.workspace_dir(project_id)?;

        if tokio::fs::metadata(&workspace).await.is_err() {
            return Err(StoreError::NotFound(workspace.display().to_string()));
        }

        debug!(
            "saving workspace {} back to {}",
            workspace.display(),
            source.display()
        );
        tokio::task::spawn_blocking(move || replace_dir(&workspace, &source)).await??;
        Ok(())
    }
}

/// Reject identifiers that would escape their root directory.
fn path_component(id: &str) -> StoreResult<&str> {
    if id.is_empty() || id == "." || id == ".." || id.contains(['/', '\\', '\0']) {
        return Err(StoreError::InvalidId(id.to_string()));
    }
    Ok(id)
}

/// Replace `dst` with a fresh copy of `src`.
///
/// The copy is staged in a sibling directory and renamed into place, so a
/// failed copy leaves `dst` as it was.
fn replace_dir(src: &Path, dst: &Path) -> std::io::Result<()> {
    let staging = sibling(dst, "incoming");
    if let Err(e) = copy_dir_recursive(src, &staging) {
        let _ = std::fs::remove_dir_all(&staging);
        return Err(e);
    }

    let retired = sibling(dst, "previous");
    let had_previous = dst.exists();
    if had_previous && let Err(e) = std::fs::rename(dst, &retired) {
        let _ = std::fs::remove_dir_all(&staging);
        return Err(e);
    }

    if let Err(e) = std::fs::rename(&staging, dst) {
        if had_previous {
            let _ = std::fs::rename(&retired, dst);
        }
        let _ = std::fs::remove_dir_all(&staging);
        return Err(e);
    }

    if had_previous && let Err(e) = std::fs::remove_dir_all(&retired) {
        warn!("leaving old tree {} behind: {}", retired.display(), e);
    }
    Ok(())
}

/// Hidden, uniquely named directory next to `path`.
fn sibling(path: &Path, tag: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}-{}", name, tag, Uuid::new_v4().simple()))
}

/// Recursively copy a directory. Symlinks are not followed.
fn copy_dir_recursive(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());

        if file_type.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
        } else if file_type.is_file() {
            std::fs::copy(&src_path, &dst_path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn store_with_project() -> (tempfile::TempDir, LocalCodeStore) {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join("src/s1/abc");
        fs::create_dir_all(project.join("lib")).unwrap();
        fs::write(project.join("main.py"), "print('hi')\n").unwrap();
        fs::write(project.join("lib/util.py"), "X = 1\n").unwrap();

        let store = LocalCodeStore::new(dir.path().join("src"), dir.path().join("ws"));
        (dir, store)
    }

    #[tokio::test]
    async fn test_clone_copies_tree() {
        let (dir, store) = store_with_project();
        store.clone_code("abc", "s1").await.unwrap();

        let ws = dir.path().join("ws/abc");
        assert_eq!(fs::read_to_string(ws.join("main.py")).unwrap(), "print('hi')\n");
        assert_eq!(fs::read_to_string(ws.join("lib/util.py")).unwrap(), "X = 1\n");
    }

    #[tokio::test]
    async fn test_clone_replaces_stale_workspace() {
        let (dir, store) = store_with_project();
        let ws = dir.path().join("ws/abc");
        fs::create_dir_all(&ws).unwrap();
        fs::write(ws.join("stale.txt"), "old").unwrap();

        store.clone_code("abc", "s1").await.unwrap();
        assert!(!ws.join("stale.txt").exists());
        assert!(ws.join("main.py").exists());
    }

    #[tokio::test]
    async fn test_clone_missing_project_is_not_found() {
        let (_dir, store) = store_with_project();
        let err = store.clone_code("missing", "s1").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_rejects_traversal() {
        let (_dir, store) = store_with_project();
        let err = store.clone_code("..", "s1").await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidId(_)));
        let err = store.clone_code("abc", "../s1").await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidId(_)));
    }

    #[tokio::test]
    async fn test_failed_save_keeps_source() {
        let (dir, store) = store_with_project();
        fs::create_dir_all(dir.path().join("ws")).unwrap();
        // Reading a file as a directory fails even for root.
        fs::write(dir.path().join("ws/abc"), "not a directory").unwrap();

        assert!(store.save_changes("abc", "s1").await.is_err());

        let school = dir.path().join("src/s1");
        assert_eq!(
            fs::read_to_string(school.join("abc/main.py")).unwrap(),
            "print('hi')\n"
        );
        assert_eq!(
            fs::read_to_string(school.join("abc/lib/util.py")).unwrap(),
            "X = 1\n"
        );
        let entries: Vec<_> = fs::read_dir(&school)
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("abc")]);
    }

    #[tokio::test]
    async fn test_save_writes_back() {
        let (dir, store) = store_with_project();
        store.clone_code("abc", "s1").await.unwrap();
        fs::write(dir.path().join("ws/abc/output.txt"), "42").unwrap();

        store.save_changes("abc", "s1").await.unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join("src/s1/abc/output.txt")).unwrap(),
            "42"
        );
    }
}
