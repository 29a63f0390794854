//! Archive of raw report payloads
//!
//! Payloads live at `ENVIRONMENT/fqdn/<timestamp>.yaml` relative to the
//! store root, so retention can decide what to delete from the path alone.

mod local;
mod s3;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use local::LocalBlobStore;
pub use s3::S3BlobStore;

use crate::error::StoreError;
use crate::model::BlobLocator;

#[async_trait]
pub trait BlobStore: Send + Sync {
    fn name(&self) -> &'static str;

    /// Write `data` at `locator` once. Saving identical bytes again succeeds,
    /// different bytes at an occupied locator fail with `DuplicateRecord`.
    async fn save_file(&self, locator: &BlobLocator, data: &[u8]) -> Result<(), StoreError>;

    async fn download_file(&self, locator: &BlobLocator) -> Result<Vec<u8>, StoreError>;

    async fn delete_file(&self, locator: &BlobLocator) -> Result<(), StoreError>;

    /// Delete every payload whose encoded time is strictly before `cutoff`.
    /// A file name that does not decode to a timestamp aborts the purge.
    async fn purge(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// Blob store selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BlobKind {
    Local,
    S3,
}

impl fmt::Display for BlobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::S3 => write!(f, "s3"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BlobConfig {
    pub kind: BlobKind,
    pub root: PathBuf,
    pub bucket: Option<String>,
    pub prefix: String,
}

pub struct BlobStoreFactory;

impl BlobStoreFactory {
    pub async fn create(config: &BlobConfig) -> Result<Arc<dyn BlobStore>, StoreError> {
        match config.kind {
            BlobKind::Local => Ok(Arc::new(LocalBlobStore::new(config.root.clone()))),
            BlobKind::S3 => {
                let bucket = config
                    .bucket
                    .clone()
                    .filter(|b| !b.is_empty())
                    .ok_or_else(|| StoreError::validation("S3 blob store requires a bucket"))?;
                Ok(Arc::new(
                    S3BlobStore::from_env(bucket, config.prefix.clone()).await,
                ))
            }
        }
    }
}

/// Split a locator into its path segments, rejecting anything that could
/// escape the store root.
pub(crate) fn locator_segments(locator: &BlobLocator) -> Result<Vec<&str>, StoreError> {
    let path = locator.as_str();
    if path.is_empty() {
        return Err(StoreError::validation("blob path must not be empty"));
    }
    if path.starts_with('/') || path.starts_with('\\') {
        return Err(StoreError::validation(format!(
            "blob path '{}' must be relative",
            path
        )));
    }

    let segments: Vec<&str> = path.split('/').collect();
    for segment in &segments {
        if segment.is_empty() || *segment == "." || *segment == ".." || segment.contains('\\') {
            return Err(StoreError::validation(format!(
                "blob path '{}' contains an invalid segment",
                path
            )));
        }
    }
    Ok(segments)
}
