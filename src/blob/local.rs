use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use super::{BlobStore, locator_segments};
use crate::error::StoreError;
use crate::model::BlobLocator;

/// Times a write recreates its node directory after a concurrent purge
/// pruned it
const STAGE_ATTEMPTS: u32 = 3;

/// Blob store rooted at a local directory
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, locator: &BlobLocator) -> Result<PathBuf, StoreError> {
        let mut path = self.root.clone();
        for segment in locator_segments(locator)? {
            path.push(segment);
        }
        Ok(path)
    }
}

fn io_error(op: &str, path: &Path, err: io::Error) -> StoreError {
    if err.kind() == io::ErrorKind::NotFound {
        StoreError::not_found(format!("{} {}", op, path.display()))
    } else {
        StoreError::blob(format!("{} {}: {}", op, path.display(), err))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn save_file(&self, locator: &BlobLocator, data: &[u8]) -> Result<(), StoreError> {
        let path = self.resolve(locator)?;
        let target = path.clone();
        let payload = data.to_vec();
        let outcome = tokio::task::spawn_blocking(move || write_once(&target, &payload)).await??;

        match outcome {
            WriteOutcome::Created => {
                debug!(path = %path.display(), size_bytes = data.len(), "Blob saved")
            }
            WriteOutcome::Unchanged => {
                debug!(path = %path.display(), "Blob already archived with identical content")
            }
        }
        Ok(())
    }

    async fn download_file(&self, locator: &BlobLocator) -> Result<Vec<u8>, StoreError> {
        let path = self.resolve(locator)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| io_error("read", &path, e))
    }

    async fn delete_file(&self, locator: &BlobLocator) -> Result<(), StoreError> {
        let path = self.resolve(locator)?;
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| io_error("delete", &path, e))?;
        debug!(path = %path.display(), "Blob deleted");
        Ok(())
    }

    async fn purge(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let root = self.root.clone();
        let removed = tokio::task::spawn_blocking(move || purge_tree(&root, cutoff)).await??;
        info!(
            root = %self.root.display(),
            cutoff = %cutoff,
            removed,
            "Purged blobs from local store"
        );
        Ok(removed)
    }
}

enum WriteOutcome {
    Created,
    Unchanged,
}

/// Publish `data` at `path` unless a payload is already there. Identical
/// content is accepted, different content fails with `DuplicateRecord`.
fn write_once(path: &Path, data: &[u8]) -> Result<WriteOutcome, StoreError> {
    let file_name = path.file_name().and_then(|n| n.to_str());
    let (Some(parent), Some(file_name)) = (path.parent(), file_name) else {
        return Err(StoreError::validation(format!(
            "blob path {} has no file name",
            path.display()
        )));
    };

    let staged = stage(parent, file_name, data)?;
    match staged.persist_noclobber(path) {
        Ok(_) => Ok(WriteOutcome::Created),
        Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
            let existing = fs::read(path).map_err(|e| io_error("read", path, e))?;
            if existing == data {
                Ok(WriteOutcome::Unchanged)
            } else {
                Err(StoreError::duplicate(format!(
                    "{} already holds a different payload",
                    path.display()
                )))
            }
        }
        Err(e) => Err(io_error("publish", path, e.error)),
    }
}

/// Write `data` to a unique hidden file in `parent`. The staged file keeps
/// the directory non-empty, so purge cannot prune it until it is published.
fn stage(parent: &Path, file_name: &str, data: &[u8]) -> Result<NamedTempFile, StoreError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match try_stage(parent, file_name, data) {
            Ok(staged) => return Ok(staged),
            Err(e) if e.kind() == io::ErrorKind::NotFound && attempt < STAGE_ATTEMPTS => {
                debug!(
                    path = %parent.display(),
                    attempt,
                    "Blob directory pruned while writing, recreating"
                );
            }
            Err(e) => return Err(io_error("stage", parent, e)),
        }
    }
}

fn try_stage(parent: &Path, file_name: &str, data: &[u8]) -> io::Result<NamedTempFile> {
    fs::create_dir_all(parent)?;
    let mut staged = tempfile::Builder::new()
        .prefix(&format!(".{}.", file_name))
        .suffix(".tmp")
        .tempfile_in(parent)?;
    staged.write_all(data)?;
    Ok(staged)
}

fn is_staging_file(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(".tmp")
}

/// Walk `root/ENV/fqdn/*.yaml`, deleting payloads older than `cutoff` and
/// removing directories left empty.
fn purge_tree(root: &Path, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
    if !root.exists() {
        debug!(root = %root.display(), "Blob root missing, nothing to purge");
        return Ok(0);
    }

    let mut removed = 0;
    for env_dir in read_dir(root)? {
        if !env_dir.is_dir() {
            return Err(StoreError::blob(format!(
                "unexpected file at environment level: {}",
                env_dir.display()
            )));
        }

        for node_dir in read_dir(&env_dir)? {
            if !node_dir.is_dir() {
                return Err(StoreError::blob(format!(
                    "unexpected file at node level: {}",
                    node_dir.display()
                )));
            }

            for file in read_dir(&node_dir)? {
                let name = file
                    .file_name()
                    .and_then(|n| n.to_str())
                    .ok_or_else(|| {
                        StoreError::blob(format!("unreadable file name: {}", file.display()))
                    })?;
                if is_staging_file(name) {
                    continue;
                }
                if !file.is_file() {
                    return Err(StoreError::blob(format!(
                        "unexpected directory at payload level: {}",
                        file.display()
                    )));
                }

                let executed_at = BlobLocator::timestamp_of(name)?;
                if executed_at < cutoff {
                    fs::remove_file(&file).map_err(|e| io_error("delete", &file, e))?;
                    debug!(path = %file.display(), "Removed expired blob");
                    removed += 1;
                }
            }

            remove_if_empty(&node_dir)?;
        }

        remove_if_empty(&env_dir)?;
    }

    remove_if_empty(root)?;
    Ok(removed)
}

fn read_dir(dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
    let mut entries = fs::read_dir(dir)
        .map_err(|e| io_error("list", dir, e))?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| io_error("list", dir, e))?;
    entries.sort();
    Ok(entries)
}

fn remove_if_empty(dir: &Path) -> Result<(), StoreError> {
    let is_empty = fs::read_dir(dir)
        .map_err(|e| io_error("list", dir, e))?
        .next()
        .is_none();
    if is_empty {
        match fs::remove_dir(dir) {
            Ok(()) => debug!(path = %dir.display(), "Removed empty directory"),
            // A concurrent write staged a file after the emptiness check
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::NotFound | io::ErrorKind::DirectoryNotEmpty
                ) => {}
            Err(e) => return Err(io_error("remove directory", dir, e)),
        }
    }
    Ok(())
}
