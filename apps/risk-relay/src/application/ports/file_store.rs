//! File Store Port (Driven Port)
//!
//! Best-effort persistence of named risk files, one directory per user.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;

use crate::domain::market::UserId;

/// File store errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FileStoreError {
    /// No file with that name.
    #[error("file not found: {0}")]
    NotFound(String),

    /// Name is empty, hidden or contains a path component.
    #[error("invalid file name: {0}")]
    InvalidName(String),

    /// Underlying I/O failure.
    #[error("{0}")]
    Io(String),
}

/// Port for per-user risk files.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FileStore: Send + Sync {
    /// All files of a user as `name -> content`, sorted by name.
    async fn list(&self, user: UserId) -> Result<BTreeMap<String, String>, FileStoreError>;

    /// Read one file.
    async fn get(&self, user: UserId, name: &str) -> Result<String, FileStoreError>;

    /// Create or replace one file.
    async fn put(&self, user: UserId, name: &str, content: &str) -> Result<(), FileStoreError>;

    /// Delete one file.
    async fn delete(&self, user: UserId, name: &str) -> Result<(), FileStoreError>;

    /// Users that have a directory in the store.
    async fn users(&self) -> Result<Vec<UserId>, FileStoreError>;

    /// Directory holding a user's files (script modules are imported from here).
    fn user_dir(&self, user: UserId) -> PathBuf;
}
