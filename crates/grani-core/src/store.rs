//! Per-job info file persistence.

use std::path::{Path, PathBuf};

use rustc_hash::FxHashMap;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::debug;

use grani_types::{INFO_SUFFIX, JobRecord};

use crate::error::{CoreError, CoreResult};

/// Store for per-job info records.
///
/// Each job is one pretty-printed JSON file colocated with the job's input
/// directory, written once at submission and rewritten at each lifecycle
/// transition. Records are the source of truth for all commands operating
/// on a job and must stay forward compatible: unknown fields are ignored on
/// read and missing optional fields resolve to defaults.
pub struct InfoStore {
    /// In-memory cache of records, keyed by info file path.
    cache: RwLock<FxHashMap<PathBuf, JobRecord>>,
}

impl InfoStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            cache: RwLock::new(FxHashMap::default()),
        }
    }

    /// Write a record to its info file and update the cache.
    pub async fn save(&self, record: &JobRecord) -> CoreResult<PathBuf> {
        let path = record.info_path();
        let json = serde_json::to_string_pretty(record).map_err(|source| CoreError::InfoParse {
            path: path.clone(),
            source,
        })?;
        fs::write(&path, json).await?;

        let mut cache = self.cache.write().await;
        cache.insert(path.clone(), record.clone());

        Ok(path)
    }

    /// Load a record, preferring the cache.
    pub async fn load(&self, path: &Path) -> CoreResult<JobRecord> {
        {
            let cache = self.cache.read().await;
            if let Some(record) = cache.get(path) {
                return Ok(record.clone());
            }
        }
        self.reload(path).await
    }

    /// Load a record from disk, bypassing the cache. Used where a stale
    /// record could mask an externally written state (e.g. a kill).
    pub async fn reload(&self, path: &Path) -> CoreResult<JobRecord> {
        debug!(?path, "loading job info");
        let content = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CoreError::MissingInfoFile(path.to_path_buf()));
            }
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                return Err(CoreError::Permission(path.to_path_buf()));
            }
            Err(e) => return Err(CoreError::Io(e)),
        };

        let record: JobRecord =
            serde_json::from_str(&content).map_err(|source| CoreError::InfoParse {
                path: path.to_path_buf(),
                source,
            })?;

        let mut cache = self.cache.write().await;
        cache.insert(path.to_path_buf(), record.clone());
        Ok(record)
    }

    /// Load, mutate, and persist a record in one step.
    pub async fn update<F>(&self, path: &Path, mutate: F) -> CoreResult<JobRecord>
    where
        F: FnOnce(&mut JobRecord),
    {
        let mut record = self.reload(path).await?;
        mutate(&mut record);
        self.save(&record).await?;
        Ok(record)
    }

    /// Remove write permissions from an info file so a booting runner
    /// cannot overwrite an externally recorded state.
    pub async fn lock(&self, path: &Path) -> CoreResult<()> {
        let metadata = fs::metadata(path).await?;
        let mut permissions = metadata.permissions();
        permissions.set_readonly(true);
        fs::set_permissions(path, permissions).await?;
        Ok(())
    }

    /// Find the single info file in a directory.
    ///
    /// Returns `Ok(None)` when there is none and an error when there is
    /// more than one: a directory hosts at most one job family.
    pub async fn find_info_file(dir: &Path) -> CoreResult<Option<PathBuf>> {
        let mut found = None;
        let mut entries = fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(INFO_SUFFIX))
            {
                if found.is_some() {
                    return Err(CoreError::NotSuitable(format!(
                        "multiple job info files found in '{}'",
                        dir.display()
                    )));
                }
                found = Some(path);
            }
        }
        Ok(found)
    }
}

impl Default for InfoStore {
    fn default() -> Self {
        Self::new()
    }
}
