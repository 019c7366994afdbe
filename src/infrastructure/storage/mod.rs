use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

pub mod multipart;
pub mod s3;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object '{key}' does not exist")]
    NotFound { key: String },

    #[error("{operation} '{key}' failed: {reason}")]
    Request {
        operation: &'static str,
        key: String,
        reason: String,
    },

    #[error("local file error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    pub fn request(operation: &'static str, key: &str, reason: impl ToString) -> Self {
        Self::Request {
            operation,
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Object storage as the worker needs it. Every operation is safe to
/// repeat with the same arguments, which redelivery depends on.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetches `key` completely into `dest` and returns the byte count.
    async fn download(&self, key: &str, dest: &Path) -> Result<u64, StorageError>;

    /// Stores the file at `src` under `key` and returns the key. Callers
    /// resolve keys to URLs themselves.
    async fn upload(&self, src: &Path, key: &str, content_type: &str) -> Result<String, StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}
