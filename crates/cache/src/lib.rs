mod git;

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use mod_connect_core::{
    models::{RepoId, RepositoryDescriptor, WorkingCopy},
    retry::ErrorClass,
    util::{join_normalized, sanitize_component},
};
use thiserror::Error;
use time::OffsetDateTime;

use crate::git::GitFailure;

#[derive(Debug, Error)]
pub enum CacheError {
    /// Network or auth failure at the VCS layer. Retryable.
    #[error("{command} failed: {detail}")]
    Clone { command: String, detail: String },
    /// Local state unrecoverable even after deleting and recloning.
    #[error("working copy corrupt: {0}")]
    Corrupt(String),
    #[error("out of disk space: {0}")]
    DiskSpace(String),
    #[error("cache I/O error: {0}")]
    Io(String),
}

impl CacheError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Clone { .. } => ErrorClass::Retryable,
            Self::Corrupt(_) | Self::DiskSpace(_) | Self::Io(_) => ErrorClass::Terminal,
        }
    }
}

/// Seam between the pipeline and the on-disk cache, so orchestration tests
/// can run against in-memory fakes.
#[async_trait]
pub trait WorkspaceSync: Send + Sync {
    async fn sync(&self, descriptor: &RepositoryDescriptor) -> Result<WorkingCopy, CacheError>;
}

/// On-disk mapping from repository identity to a working copy under a single
/// cache root. All filesystem writes stay inside the root.
pub struct RepoCache {
    root: PathBuf,
    /// Per-identity locks, created lazily. At most one in-flight sync per
    /// identity; unrelated identities sync concurrently.
    locks: Mutex<HashMap<RepoId, Arc<tokio::sync::Mutex<()>>>>,
}

impl RepoCache {
    pub fn new(root: PathBuf) -> Self { Self { root, locks: Mutex::new(HashMap::new()) } }

    pub fn path_for(&self, id: &RepoId) -> PathBuf {
        let relative = Path::new(&sanitize_component(&id.provider))
            .join(sanitize_component(&id.organization))
            .join(sanitize_component(&id.name));
        join_normalized(&self.root, relative)
    }

    fn lock_for(&self, id: &RepoId) -> Arc<tokio::sync::Mutex<()>> {
        self.locks.lock().unwrap().entry(id.clone()).or_default().clone()
    }

    async fn clone_fresh(
        &self,
        path: &Path,
        descriptor: &RepositoryDescriptor,
    ) -> Result<WorkingCopy, CacheError> {
        if path.exists() {
            tokio::fs::remove_dir_all(path).await.map_err(map_io)?;
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(map_io)?;
        }
        git::clone(descriptor.clone_url.as_str(), descriptor.branch(), path)
            .await
            .map_err(classify)?;
        tracing::info!("Cloned {} into {}", descriptor.id, path.display());
        working_copy(path, descriptor).await
    }

    async fn update(
        &self,
        path: &Path,
        descriptor: &RepositoryDescriptor,
    ) -> Result<WorkingCopy, CacheError> {
        git::fetch(path, descriptor.branch()).await.map_err(classify)?;
        git::reset_to_fetched(path).await.map_err(classify)?;
        tracing::debug!("Updated {} at {}", descriptor.id, path.display());
        working_copy(path, descriptor).await
    }
}

#[async_trait]
impl WorkspaceSync for RepoCache {
    async fn sync(&self, descriptor: &RepositoryDescriptor) -> Result<WorkingCopy, CacheError> {
        let lock = self.lock_for(&descriptor.id);
        let _guard = lock.lock().await;

        let path = self.path_for(&descriptor.id);
        if path.join(".git").exists() {
            match self.update(&path, descriptor).await {
                Err(CacheError::Corrupt(detail)) => {
                    // One recovery attempt: drop the copy and clone from
                    // scratch. A second corruption surfaces to the caller.
                    tracing::warn!(
                        "Working copy for {} is corrupt ({detail}), recloning",
                        descriptor.id
                    );
                    tokio::fs::remove_dir_all(&path).await.map_err(map_io)?;
                }
                other => return other,
            }
        }
        self.clone_fresh(&path, descriptor).await
    }
}

async fn working_copy(
    path: &Path,
    descriptor: &RepositoryDescriptor,
) -> Result<WorkingCopy, CacheError> {
    let revision = git::head_revision(path).await.map_err(classify)?;
    Ok(WorkingCopy {
        descriptor: descriptor.clone(),
        local_path: path.to_path_buf(),
        revision,
        last_synced_at: OffsetDateTime::now_utc(),
    })
}

const CORRUPT_MARKERS: &[&str] =
    &["not a git repository", "corrupt", "bad object", "invalid gitfile", "unable to read"];

fn classify(failure: GitFailure) -> CacheError {
    let detail = failure.detail.to_lowercase();
    if detail.contains("no space left on device") {
        CacheError::DiskSpace(failure.detail)
    } else if CORRUPT_MARKERS.iter().any(|marker| detail.contains(marker)) {
        CacheError::Corrupt(failure.detail)
    } else {
        CacheError::Clone { command: failure.command, detail: failure.detail }
    }
}

fn map_io(err: std::io::Error) -> CacheError {
    if err.kind() == std::io::ErrorKind::StorageFull {
        CacheError::DiskSpace(err.to_string())
    } else {
        CacheError::Io(err.to_string())
    }
}
