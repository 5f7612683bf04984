//! Durable job records, one JSON file per fingerprint
//!
//! Layout under a destination directory:
//!
//! ```text
//! <dest>/.video-jobs/<fingerprint>.json
//! <dest>/.video-jobs/archive/<fingerprint>.json
//! ```
//!
//! Records are written to a temp file and renamed into place, so a record is
//! either the previous version or the new one after an unclean shutdown.

use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::core::error_handling::{errors, DownloadError, DownloadResult};
use crate::core::models::{JobState, TransferJob};

pub const JOBS_DIR: &str = ".video-jobs";
const ARCHIVE_DIR: &str = "archive";

#[derive(Clone)]
pub struct JobStore {
    root: PathBuf,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl JobStore {
    /// Store for jobs whose files live in `dest_dir`
    pub fn for_destination(dest_dir: &Path) -> Self {
        Self::at(dest_dir.join(JOBS_DIR))
    }

    pub fn at(root: PathBuf) -> Self {
        Self {
            root,
            locks: Arc::new(DashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, fingerprint: &str) -> PathBuf {
        self.root.join(format!("{}.json", fingerprint))
    }

    fn archive_path(&self, fingerprint: &str) -> PathBuf {
        self.root
            .join(ARCHIVE_DIR)
            .join(format!("{}.json", fingerprint))
    }

    fn lock_for(&self, fingerprint: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(fingerprint.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn load(&self, fingerprint: &str) -> DownloadResult<TransferJob> {
        let path = self.record_path(fingerprint);
        let content = match tokio::fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DownloadError::JobNotFound(fingerprint.to_string()))
            }
            Err(e) => return Err(errors::store(format!("read {:?}: {}", path, e))),
        };
        serde_json::from_slice(&content)
            .map_err(|e| errors::store(format!("corrupt record {:?}: {}", path, e)))
    }

    /// Persist `job`; writes for the same fingerprint are serialized
    pub async fn save(&self, job: &TransferJob) -> DownloadResult<()> {
        let lock = self.lock_for(&job.fingerprint);
        let _guard = lock.lock().await;

        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| errors::store(format!("create {:?}: {}", self.root, e)))?;

        let content = serde_json::to_vec_pretty(job)
            .map_err(|e| errors::store(format!("serialize job: {}", e)))?;
        let path = self.record_path(&job.fingerprint);
        write_atomic(&path, &content).await?;
        debug!("Saved job {} ({})", short(&job.fingerprint), job.state);
        Ok(())
    }

    pub async fn delete(&self, fingerprint: &str) -> DownloadResult<()> {
        let lock = self.lock_for(fingerprint);
        let _guard = lock.lock().await;

        match tokio::fs::remove_file(self.record_path(fingerprint)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(errors::store(format!("delete {}: {}", fingerprint, e))),
        }
    }

    /// Move a finished job out of the active set
    pub async fn archive(&self, job: &TransferJob) -> DownloadResult<()> {
        if job.state != JobState::Done {
            return Err(errors::store(format!(
                "only finished jobs can be archived, {} is {}",
                short(&job.fingerprint),
                job.state
            )));
        }
        let lock = self.lock_for(&job.fingerprint);
        let _guard = lock.lock().await;

        let archive_path = self.archive_path(&job.fingerprint);
        if let Some(parent) = archive_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| errors::store(format!("create {:?}: {}", parent, e)))?;
        }
        let content = serde_json::to_vec_pretty(job)
            .map_err(|e| errors::store(format!("serialize job: {}", e)))?;
        write_atomic(&archive_path, &content).await?;

        match tokio::fs::remove_file(self.record_path(&job.fingerprint)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(errors::store(format!("archive {}: {}", short(&job.fingerprint), e))),
        }
    }

    pub async fn load_archived(&self, fingerprint: &str) -> DownloadResult<TransferJob> {
        let path = self.archive_path(fingerprint);
        let content = match tokio::fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DownloadError::JobNotFound(fingerprint.to_string()))
            }
            Err(e) => return Err(errors::store(format!("read {:?}: {}", path, e))),
        };
        serde_json::from_slice(&content)
            .map_err(|e| errors::store(format!("corrupt record {:?}: {}", path, e)))
    }

    /// All readable active records. Unreadable ones are skipped with a warning.
    pub async fn list(&self) -> DownloadResult<Vec<TransferJob>> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(errors::store(format!("list {:?}: {}", self.root, e))),
        };

        let mut jobs = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| errors::store(format!("list {:?}: {}", self.root, e)))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = tokio::fs::read(&path)
                .await
                .map_err(|e| e.to_string())
                .and_then(|bytes| {
                    serde_json::from_slice::<TransferJob>(&bytes).map_err(|e| e.to_string())
                });
            match parsed {
                Ok(job) => jobs.push(job),
                Err(e) => warn!("Skipping unreadable job record {:?}: {}", path, e),
            }
        }
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(jobs)
    }
}

/// The temp file is synced before the rename so the new name never points at
/// unwritten data
async fn write_atomic(path: &Path, content: &[u8]) -> DownloadResult<()> {
    let tmp = path.with_extension("json.tmp");
    let written = async {
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(content).await?;
        file.sync_all().await
    }
    .await;
    written.map_err(|e| errors::store(format!("write {:?}: {}", tmp, e)))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| errors::store(format!("rename {:?}: {}", tmp, e)))
}

pub(crate) fn short(fingerprint: &str) -> &str {
    &fingerprint[..fingerprint.len().min(12)]
}
