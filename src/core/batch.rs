//! Batch downloads and their summary report
//!
//! A batch starts one job per URL, waits for all of them and condenses the
//! outcomes into a [`BatchReport`] that can be written next to the videos as
//! `download_report_<unix-seconds>.json`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::core::error_handling::{errors, DownloadError, DownloadResult};
use crate::core::models::{JobHandle, JobProgress, JobState};
use crate::utils::file_utils::unique_output_path_with;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Success,
    Failed,
}

/// Outcome of one URL in a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchEntry {
    pub url: String,
    /// Extractor that handled the URL, if any did
    pub site: Option<String>,
    pub status: BatchStatus,
    pub handle: Option<JobHandle>,
    pub output_path: Option<PathBuf>,
    pub file_size: u64,
    /// Seconds from start to settle
    pub download_time: f64,
    pub error_message: Option<String>,
}

impl BatchEntry {
    pub fn from_outcome(
        url: &str,
        site: Option<String>,
        outcome: DownloadResult<(JobHandle, JobProgress)>,
        elapsed: Duration,
    ) -> Self {
        let download_time = elapsed.as_secs_f64();
        match outcome {
            Ok((handle, progress)) => {
                let done = progress.state == JobState::Done;
                let error_message = match (&progress.last_error, done) {
                    (Some(err), _) => Some(err.to_string()),
                    (None, false) => Some(format!("job ended {}", progress.state)),
                    (None, true) => None,
                };
                let file_size = if done {
                    std::fs::metadata(&progress.output_path)
                        .map(|m| m.len())
                        .unwrap_or(progress.bytes_done)
                } else {
                    0
                };
                Self {
                    url: url.to_string(),
                    site,
                    status: if done {
                        BatchStatus::Success
                    } else {
                        BatchStatus::Failed
                    },
                    handle: Some(handle),
                    output_path: done.then_some(progress.output_path),
                    file_size,
                    download_time,
                    error_message,
                }
            }
            Err(err) => Self::failed(url, site, &err, elapsed),
        }
    }

    fn failed(url: &str, site: Option<String>, err: &DownloadError, elapsed: Duration) -> Self {
        Self {
            url: url.to_string(),
            site,
            status: BatchStatus::Failed,
            handle: None,
            output_path: None,
            file_size: 0,
            download_time: elapsed.as_secs_f64(),
            error_message: Some(err.to_string()),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == BatchStatus::Success
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub total_videos: usize,
    pub success_count: usize,
    pub failed_count: usize,
    /// Percentage, 0 for an empty batch
    pub success_rate: f64,
    /// Seconds for the whole batch
    pub total_time: f64,
    pub finished_at: DateTime<Utc>,
    pub results: Vec<BatchEntry>,
}

impl BatchReport {
    pub fn summarize(results: Vec<BatchEntry>, total_time: Duration) -> Self {
        let total_videos = results.len();
        let success_count = results.iter().filter(|r| r.succeeded()).count();
        let success_rate = if total_videos == 0 {
            0.0
        } else {
            success_count as f64 / total_videos as f64 * 100.0
        };
        Self {
            total_videos,
            success_count,
            failed_count: total_videos - success_count,
            success_rate,
            total_time: total_time.as_secs_f64(),
            finished_at: Utc::now(),
            results,
        }
    }

    pub fn log_summary(&self) {
        info!(
            "📊 Batch finished: {}/{} succeeded ({:.1}%) in {:.2}s",
            self.success_count, self.total_videos, self.success_rate, self.total_time
        );
        for entry in &self.results {
            let site = entry.site.as_deref().unwrap_or("unknown");
            match (&entry.status, &entry.error_message) {
                (BatchStatus::Success, _) => {
                    info!("✅ {}: {} ({} bytes)", site, entry.url, entry.file_size)
                }
                (BatchStatus::Failed, Some(message)) => {
                    warn!("❌ {}: {} - {}", site, entry.url, message)
                }
                (BatchStatus::Failed, None) => warn!("❌ {}: {}", site, entry.url),
            }
        }
    }

    /// Write the report into `dir` without overwriting an earlier one
    pub async fn save(&self, dir: &Path) -> DownloadResult<PathBuf> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| errors::store(format!("create {:?}: {}", dir, e)))?;
        let stem = format!("download_report_{}", self.finished_at.timestamp());
        let path = unique_output_path_with(dir, &stem, "json", |p| p.exists());
        let content = serde_json::to_vec_pretty(self)
            .map_err(|e| errors::store(format!("serialize report: {}", e)))?;
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| errors::store(format!("write {:?}: {}", path, e)))?;
        info!("📝 Batch report saved to {:?}", path);
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(url: &str, status: BatchStatus) -> BatchEntry {
        BatchEntry {
            url: url.to_string(),
            site: Some("bilibili".to_string()),
            status,
            handle: None,
            output_path: None,
            file_size: 0,
            download_time: 1.5,
            error_message: None,
        }
    }

    #[test]
    fn test_summary_counts_and_rate() {
        let report = BatchReport::summarize(
            vec![
                entry("https://a", BatchStatus::Success),
                entry("https://b", BatchStatus::Failed),
                entry("https://c", BatchStatus::Success),
                entry("https://d", BatchStatus::Success),
            ],
            Duration::from_millis(2500),
        );
        assert_eq!(report.total_videos, 4);
        assert_eq!(report.success_count, 3);
        assert_eq!(report.failed_count, 1);
        assert!((report.success_rate - 75.0).abs() < f64::EPSILON);
        assert!((report.total_time - 2.5).abs() < 1e-9);

        let empty = BatchReport::summarize(Vec::new(), Duration::ZERO);
        assert_eq!(empty.success_rate, 0.0);
    }

    #[test]
    fn test_unsupported_url_becomes_a_failed_entry() {
        let err = DownloadError::NotSupported {
            url: "https://unknown.example/v".to_string(),
        };
        let entry = BatchEntry::from_outcome(
            "https://unknown.example/v",
            None,
            Err(err),
            Duration::from_millis(10),
        );
        assert_eq!(entry.status, BatchStatus::Failed);
        assert!(entry.error_message.unwrap().contains("No extractor supports"));
        assert!(entry.handle.is_none());
    }

    #[tokio::test]
    async fn test_reports_never_overwrite_each_other() {
        let dir = TempDir::new().unwrap();
        let report = BatchReport::summarize(
            vec![entry("https://a", BatchStatus::Success)],
            Duration::from_secs(1),
        );
        let first = report.save(dir.path()).await.unwrap();
        let second = report.save(dir.path()).await.unwrap();
        assert_ne!(first, second);

        let name = first.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("download_report_") && name.ends_with(".json"));
        let parsed: BatchReport =
            serde_json::from_slice(&std::fs::read(&second).unwrap()).unwrap();
        assert_eq!(parsed, report);
    }
}
