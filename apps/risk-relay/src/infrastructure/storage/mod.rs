//! Local File Store
//!
//! Risk files on disk, laid out as `<root>/<userId>/<filename>`.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::application::ports::{FileStore, FileStoreError};
use crate::domain::market::UserId;

/// Reject names that are empty, hidden, or could escape the user directory.
///
/// # Errors
///
/// Returns `FileStoreError::InvalidName` for such names.
pub fn check_file_name(name: &str) -> Result<(), FileStoreError> {
    let bad = name.is_empty()
        || name.starts_with('.')
        || name.contains("..")
        || name.contains(['/', '\\', '\0']);
    if bad {
        Err(FileStoreError::InvalidName(name.to_string()))
    } else {
        Ok(())
    }
}

fn io_error(e: &std::io::Error) -> FileStoreError {
    FileStoreError::Io(e.to_string())
}

/// File store backed by a local directory.
#[derive(Debug, Clone)]
pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    /// Create a store rooted at `root`. Directories are created on first write.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Store root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn file_path(&self, user: UserId, name: &str) -> Result<PathBuf, FileStoreError> {
        check_file_name(name)?;
        Ok(self.user_dir(user).join(name))
    }
}

#[async_trait]
impl FileStore for LocalFileStore {
    async fn list(&self, user: UserId) -> Result<BTreeMap<String, String>, FileStoreError> {
        let mut files = BTreeMap::new();
        let mut entries = match tokio::fs::read_dir(self.user_dir(user)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(files),
            Err(e) => return Err(io_error(&e)),
        };

        while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(&e))? {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if check_file_name(&name).is_err() {
                continue;
            }
            if !entry.file_type().await.map_err(|e| io_error(&e))?.is_file() {
                continue;
            }
            match tokio::fs::read_to_string(entry.path()).await {
                Ok(content) => {
                    files.insert(name, content);
                }
                Err(e) => {
                    tracing::warn!(user, file = %name, error = %e, "Skipping unreadable risk file");
                }
            }
        }
        Ok(files)
    }

    async fn get(&self, user: UserId, name: &str) -> Result<String, FileStoreError> {
        let path = self.file_path(user, name)?;
        tokio::fs::read_to_string(&path).await.map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                FileStoreError::NotFound(name.to_string())
            } else {
                io_error(&e)
            }
        })
    }

    async fn put(&self, user: UserId, name: &str, content: &str) -> Result<(), FileStoreError> {
        let path = self.file_path(user, name)?;
        tokio::fs::create_dir_all(self.user_dir(user))
            .await
            .map_err(|e| io_error(&e))?;
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| io_error(&e))
    }

    async fn delete(&self, user: UserId, name: &str) -> Result<(), FileStoreError> {
        let path = self.file_path(user, name)?;
        tokio::fs::remove_file(&path).await.map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                FileStoreError::NotFound(name.to_string())
            } else {
                io_error(&e)
            }
        })
    }

    async fn users(&self) -> Result<Vec<UserId>, FileStoreError> {
        let mut users = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(users),
            Err(e) => return Err(io_error(&e)),
        };
        while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(&e))? {
            let is_dir = entry.file_type().await.map_err(|e| io_error(&e))?.is_dir();
            let user = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<UserId>().ok());
            if let (true, Some(user)) = (is_dir, user) {
                users.push(user);
            }
        }
        users.sort_unstable();
        Ok(users)
    }

    fn user_dir(&self, user: UserId) -> PathBuf {
        self.root.join(user.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_names_are_checked() {
        assert!(check_file_name("main.ini").is_ok());
        assert!(check_file_name("model.py").is_ok());
        for bad in ["", ".hidden", "../x.ini", "a/b.ini", "a\\b.py", "x..ini"] {
            assert!(
                matches!(check_file_name(bad), Err(FileStoreError::InvalidName(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn put_get_list_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFileStore::new(dir.path());

        assert!(store.list(7).await.unwrap().is_empty());
        store.put(7, "b.ini", "[B]\n").await.unwrap();
        store.put(7, "a.py", "def f(p): return 1\n").await.unwrap();

        assert_eq!(store.get(7, "b.ini").await.unwrap(), "[B]\n");
        let names: Vec<_> = store.list(7).await.unwrap().into_keys().collect();
        assert_eq!(names, vec!["a.py", "b.ini"]);
        assert_eq!(store.users().await.unwrap(), vec![7]);

        store.delete(7, "b.ini").await.unwrap();
        assert!(matches!(
            store.get(7, "b.ini").await,
            Err(FileStoreError::NotFound(_))
        ));
        assert!(matches!(
            store.delete(7, "b.ini").await,
            Err(FileStoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn rejects_escaping_names_without_touching_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFileStore::new(dir.path().join("store"));
        assert!(store.put(1, "../evil.ini", "x").await.is_err());
        assert!(!dir.path().join("store").exists());
    }

    #[tokio::test]
    async fn users_ignores_non_numeric_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("12")).unwrap();
        std::fs::create_dir_all(dir.path().join("tmp")).unwrap();
        std::fs::write(dir.path().join("3"), "not a dir").unwrap();
        let store = LocalFileStore::new(dir.path());
        assert_eq!(store.users().await.unwrap(), vec![12]);
    }

    #[test]
    fn user_dir_layout() {
        let store = LocalFileStore::new("/data");
        assert_eq!(store.user_dir(5), PathBuf::from("/data/5"));
        assert_eq!(store.root(), Path::new("/data"));
    }
}
