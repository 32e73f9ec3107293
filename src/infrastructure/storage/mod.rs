use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

#[cfg(test)]
pub mod memory;
pub mod s3;

/// Failure of a single remote storage call. `transient` drives the retry policy.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct StoreError {
    pub message: String,
    pub transient: bool,
}

impl StoreError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self { message: message.into(), transient: true }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self { message: message.into(), transient: false }
    }
}

/// Headers attached to an uploaded object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectMeta {
    pub content_type: &'static str,
    pub cache_control: &'static str,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Uploads a local file, overwriting any object already stored at `key`.
    async fn put_file(&self, key: &str, path: &Path, meta: &ObjectMeta) -> Result<(), StoreError>;

    /// Deletes every object under `prefix`, returning how many were removed.
    /// Deleting an empty prefix is not an error.
    async fn delete_prefix(&self, prefix: &str) -> Result<usize, StoreError>;

    /// Public URL under which `key` is served.
    fn public_url(&self, key: &str) -> String;
}
