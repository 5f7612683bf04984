//! Download runtime command router.
//!
//! A thin async command queue in front of the [`TransferCoordinator`]. Front
//! ends (CLI, GUI bridge) hold a cloneable [`DownloadRuntimeHandle`] and never
//! touch the coordinator directly.

use std::path::PathBuf;

use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, instrument};

use crate::core::batch::BatchReport;
use crate::core::coordinator::TransferCoordinator;
use crate::core::error_handling::{DownloadError, DownloadResult};
use crate::core::models::{JobHandle, JobProgress, QualityPreference};

/// Commands understood by the runtime router.
#[derive(Debug)]
pub enum RuntimeCommand {
    /// `None` falls back to the configured output directory and quality
    Start {
        url: String,
        dest_dir: Option<PathBuf>,
        quality: Option<QualityPreference>,
        respond_to: oneshot::Sender<DownloadResult<JobHandle>>,
    },
    /// Download several URLs, then save the summary report into the destination
    Batch {
        urls: Vec<String>,
        dest_dir: Option<PathBuf>,
        quality: Option<QualityPreference>,
        respond_to: oneshot::Sender<DownloadResult<(BatchReport, PathBuf)>>,
    },
    Progress {
        handle: JobHandle,
        respond_to: oneshot::Sender<DownloadResult<JobProgress>>,
    },
    Cancel {
        handle: JobHandle,
        respond_to: oneshot::Sender<DownloadResult<()>>,
    },
    Retry {
        handle: JobHandle,
        respond_to: oneshot::Sender<DownloadResult<()>>,
    },
    ResumePending {
        dest_dir: PathBuf,
        respond_to: oneshot::Sender<DownloadResult<Vec<JobHandle>>>,
    },
}

#[derive(Clone)]
pub struct DownloadRuntimeHandle {
    sender: mpsc::Sender<RuntimeCommand>,
}

impl DownloadRuntimeHandle {
    pub fn new(sender: mpsc::Sender<RuntimeCommand>) -> Self {
        Self { sender }
    }

    async fn send_command<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<DownloadResult<T>>) -> RuntimeCommand,
    ) -> DownloadResult<T> {
        let (tx, rx) = oneshot::channel();
        self.sender.send(build(tx)).await.map_err(|e| {
            DownloadError::Configuration(format!("Download runtime unavailable: {}", e))
        })?;
        rx.await.map_err(|_| {
            DownloadError::Configuration("Download runtime dropped response".into())
        })?
    }

    pub async fn start(
        &self,
        url: impl Into<String>,
        dest_dir: impl Into<PathBuf>,
        quality: QualityPreference,
    ) -> DownloadResult<JobHandle> {
        let (url, dest_dir) = (url.into(), dest_dir.into());
        self.send_command(|tx| RuntimeCommand::Start {
            url,
            dest_dir: Some(dest_dir),
            quality: Some(quality),
            respond_to: tx,
        })
        .await
    }

    /// Start with the configured output directory and quality
    pub async fn start_default(&self, url: impl Into<String>) -> DownloadResult<JobHandle> {
        let url = url.into();
        self.send_command(|tx| RuntimeCommand::Start {
            url,
            dest_dir: None,
            quality: None,
            respond_to: tx,
        })
        .await
    }

    /// Returns the report and where it was saved
    pub async fn batch(
        &self,
        urls: Vec<String>,
        dest_dir: Option<PathBuf>,
        quality: Option<QualityPreference>,
    ) -> DownloadResult<(BatchReport, PathBuf)> {
        self.send_command(|tx| RuntimeCommand::Batch {
            urls,
            dest_dir,
            quality,
            respond_to: tx,
        })
        .await
    }

    pub async fn progress(&self, handle: JobHandle) -> DownloadResult<JobProgress> {
        self.send_command(|tx| RuntimeCommand::Progress {
            handle,
            respond_to: tx,
        })
        .await
    }

    pub async fn cancel(&self, handle: JobHandle) -> DownloadResult<()> {
        self.send_command(|tx| RuntimeCommand::Cancel {
            handle,
            respond_to: tx,
        })
        .await
    }

    pub async fn retry(&self, handle: JobHandle) -> DownloadResult<()> {
        self.send_command(|tx| RuntimeCommand::Retry {
            handle,
            respond_to: tx,
        })
        .await
    }

    pub async fn resume_pending(
        &self,
        dest_dir: impl Into<PathBuf>,
    ) -> DownloadResult<Vec<JobHandle>> {
        let dest_dir = dest_dir.into();
        self.send_command(|tx| RuntimeCommand::ResumePending {
            dest_dir,
            respond_to: tx,
        })
        .await
    }
}

/// Spawn the router loop on the current tokio runtime.
pub fn spawn_download_runtime(
    coordinator: TransferCoordinator,
) -> DownloadResult<DownloadRuntimeHandle> {
    let handle = Handle::try_current().map_err(|_| {
        DownloadError::Configuration("download runtime needs a running tokio runtime".into())
    })?;
    let (tx, rx) = mpsc::channel(256);
    handle.spawn(router_loop(coordinator, rx));
    tracing::info!("[RUNTIME] Download router spawned");
    Ok(DownloadRuntimeHandle::new(tx))
}

async fn router_loop(coordinator: TransferCoordinator, mut rx: mpsc::Receiver<RuntimeCommand>) {
    while let Some(cmd) = rx.recv().await {
        debug!("[RUNTIME] Processing command: {:?}", cmd);
        // 每条命令单独起任务，长时间的提取不会阻塞进度查询
        let coordinator = coordinator.clone();
        tokio::spawn(async move { handle_command(&coordinator, cmd).await });
    }
    debug!("Download runtime channel closed, exiting router loop");
}

#[instrument(skip(coordinator, command))]
async fn handle_command(coordinator: &TransferCoordinator, command: RuntimeCommand) {
    match command {
        RuntimeCommand::Start {
            url,
            dest_dir,
            quality,
            respond_to,
        } => {
            let dest_dir = dest_dir.unwrap_or_else(|| coordinator.default_destination());
            let quality = quality.unwrap_or_else(|| coordinator.default_quality());
            let result = coordinator.start_download(&url, &dest_dir, quality).await;
            debug!("[RUNTIME_CMD] Start {} -> ok: {}", url, result.is_ok());
            let _ = respond_to.send(result);
        }
        RuntimeCommand::Batch {
            urls,
            dest_dir,
            quality,
            respond_to,
        } => {
            let dest_dir = dest_dir.unwrap_or_else(|| coordinator.default_destination());
            let quality = quality.unwrap_or_else(|| coordinator.default_quality());
            let report = coordinator.download_batch(&urls, &dest_dir, quality).await;
            let saved = report.save(&dest_dir).await;
            let result = saved.map(|path| (report, path));
            debug!("[RUNTIME_CMD] Batch of {} -> ok: {}", urls.len(), result.is_ok());
            let _ = respond_to.send(result);
        }
        RuntimeCommand::Progress { handle, respond_to } => {
            let _ = respond_to.send(coordinator.get_progress(&handle).await);
        }
        RuntimeCommand::Cancel { handle, respond_to } => {
            let _ = respond_to.send(coordinator.cancel_download(&handle).await);
        }
        RuntimeCommand::Retry { handle, respond_to } => {
            let _ = respond_to.send(coordinator.retry(&handle).await);
        }
        RuntimeCommand::ResumePending {
            dest_dir,
            respond_to,
        } => {
            let _ = respond_to.send(coordinator.resume_pending(&dest_dir).await);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_requires_runtime() {
        let coordinator = TransferCoordinator::from_config(Default::default());
        // ffmpeg/reqwest wiring does not touch the network at build time
        let coordinator = coordinator.unwrap();
        assert!(spawn_download_runtime(coordinator).is_err());
    }

    #[tokio::test]
    async fn test_dropped_router_is_reported() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let handle = DownloadRuntimeHandle::new(tx);
        let err = handle
            .cancel(JobHandle {
                fingerprint: "ab".into(),
                dest_dir: PathBuf::from("/tmp"),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Configuration(_)));
    }
}
