//! Directory synchronization seam.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use grani_batch::{BatchConfig, BatchResult, remote};

/// Synchronization of job directories between the execution host and the
/// input directory.
///
/// The lifecycle controller talks to this trait instead of rsync directly
/// so the copy-runtime-files-first ordering is observable under test.
#[async_trait]
pub trait DirSync: Send + Sync {
    /// Copy everything from `src` into `dest` except the excluded paths
    /// (relative to `src`). Never removes files from `dest`.
    async fn copy_all(
        &self,
        src: &Path,
        dest: &Path,
        src_host: Option<&str>,
        exclude: &[PathBuf],
    ) -> BatchResult<()>;

    /// Copy only the selected paths (relative to `src`) from `src` into
    /// `dest`.
    async fn copy_selected(
        &self,
        src: &Path,
        dest: &Path,
        src_host: Option<&str>,
        include: &[PathBuf],
    ) -> BatchResult<()>;

    /// Recursively delete a directory; succeeds when it is already gone.
    async fn remove_dir(&self, host: Option<&str>, dir: &Path) -> BatchResult<()>;
}

/// Production synchronizer delegating to rsync/ssh.
pub struct RsyncSync {
    config: BatchConfig,
}

impl RsyncSync {
    /// Create a synchronizer with the given transport configuration.
    pub fn new(config: BatchConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl DirSync for RsyncSync {
    async fn copy_all(
        &self,
        src: &Path,
        dest: &Path,
        src_host: Option<&str>,
        exclude: &[PathBuf],
    ) -> BatchResult<()> {
        remote::sync_with_exclusions(&self.config, src, dest, src_host, None, exclude).await
    }

    async fn copy_selected(
        &self,
        src: &Path,
        dest: &Path,
        src_host: Option<&str>,
        include: &[PathBuf],
    ) -> BatchResult<()> {
        remote::sync_selected(&self.config, src, dest, src_host, None, include).await
    }

    async fn remove_dir(&self, host: Option<&str>, dir: &Path) -> BatchResult<()> {
        remote::remove_dir_all(&self.config, host, dir).await
    }
}
