//! Resumable single-stream transfer
//!
//! A [`StreamFetcher`] moves one remote resource into a partial file. The
//! partial's on-disk length is the resume point: it only grows after a
//! successful `write_all`, and the file is flushed and synced on every exit,
//! including cancellation, so whatever is on disk is a valid prefix.
//!
//! - `Range: bytes=<n>-` resumes; a `200` answer means the source ignored the
//!   range and the partial is restarted from zero.
//! - Network errors, idle reads, premature EOF and 5xx/408/429 are retried
//!   with exponential backoff; other 4xx fail at once.
//! - A completed partial whose size contradicts the advertised size is deleted
//!   and reported as an integrity mismatch.

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::core::bandwidth::BandwidthController;
use crate::core::config::FetchConfig;
use crate::core::error_handling::{
    errors, DownloadError, DownloadResult, FetchFailure, RetryPolicy,
};
use crate::core::models::{StreamDescriptor, StreamSlot};
use crate::core::transport::{HttpTransport, TransportResponse};

/// Progress and lifecycle notifications emitted while fetching
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum FetchEvent {
    Progress {
        slot: StreamSlot,
        delta: u64,
        bytes_done: u64,
    },
    TotalKnown {
        slot: StreamSlot,
        total: u64,
    },
    /// The partial was discarded and the transfer starts over
    Restarted {
        slot: StreamSlot,
    },
    Retrying {
        slot: StreamSlot,
        attempt: u32,
        error: String,
    },
}

pub type FetchEventSender = mpsc::UnboundedSender<FetchEvent>;

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub retry: RetryPolicy,
    pub read_timeout: Duration,
    pub progress_interval: Duration,
    pub cancel_poll_interval: Duration,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self::from(&FetchConfig::default())
    }
}

impl From<&FetchConfig> for FetcherConfig {
    fn from(config: &FetchConfig) -> Self {
        Self {
            retry: config.retry_policy(),
            read_timeout: Duration::from_secs(config.read_timeout_seconds),
            progress_interval: Duration::from_millis(config.progress_interval_ms),
            cancel_poll_interval: Duration::from_millis(config.cancel_poll_interval_ms.max(1)),
        }
    }
}

/// The on-disk prefix of one stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialFile {
    pub path: PathBuf,
    pub expected_size: Option<u64>,
    pub bytes_written: u64,
}

impl PartialFile {
    /// Read the current length from disk; a missing file is an empty partial
    pub async fn probe(path: &Path, expected_size: Option<u64>) -> std::io::Result<Self> {
        let bytes_written = match tokio::fs::metadata(path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e),
        };
        Ok(Self {
            path: path.to_path_buf(),
            expected_size,
            bytes_written,
        })
    }

    pub async fn truncate(&mut self) -> std::io::Result<()> {
        File::create(&self.path).await?;
        self.bytes_written = 0;
        Ok(())
    }

    pub async fn remove(&mut self) -> std::io::Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        self.bytes_written = 0;
        Ok(())
    }

    /// Make the file on disk agree with `bytes_written`. A write that failed
    /// halfway can leave bytes that were never counted; they are cut off so the
    /// next append starts at the recorded offset.
    pub async fn reconcile(&mut self) -> std::io::Result<()> {
        let on_disk = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e),
        };
        if on_disk > self.bytes_written {
            let file = OpenOptions::new().write(true).open(&self.path).await?;
            file.set_len(self.bytes_written).await?;
            file.sync_all().await?;
        } else if on_disk < self.bytes_written {
            self.bytes_written = on_disk;
        }
        Ok(())
    }
}

/// Inputs for one fetch
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub slot: StreamSlot,
    pub descriptor: StreamDescriptor,
    pub dest: PathBuf,
    /// Caller's belief about the partial length; the file on disk wins
    pub resume_from: u64,
    pub stop: Arc<AtomicBool>,
    pub events: Option<FetchEventSender>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResult {
    pub bytes_written: u64,
    pub total_bytes: u64,
    pub attempts: u32,
    pub resumed_from: u64,
}

/// Coalesces byte deltas into at most one event per interval
struct ProgressGate {
    interval: Duration,
    last_emit: Instant,
    pending: u64,
    /// Every byte seen through this gate
    recorded: u64,
}

impl ProgressGate {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emit: Instant::now(),
            pending: 0,
            recorded: 0,
        }
    }

    fn record(&mut self, delta: u64) -> Option<u64> {
        self.pending += delta;
        self.recorded += delta;
        if self.last_emit.elapsed() >= self.interval {
            self.take()
        } else {
            None
        }
    }

    fn take(&mut self) -> Option<u64> {
        if self.pending == 0 {
            return None;
        }
        self.last_emit = Instant::now();
        Some(std::mem::take(&mut self.pending))
    }
}

#[derive(Clone)]
pub struct StreamFetcher {
    transport: Arc<dyn HttpTransport>,
    bandwidth: BandwidthController,
    config: FetcherConfig,
}

impl StreamFetcher {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        bandwidth: BandwidthController,
        config: FetcherConfig,
    ) -> Self {
        Self {
            transport,
            bandwidth,
            config,
        }
    }

    pub fn config(&self) -> &FetcherConfig {
        &self.config
    }

    /// Transfer `descriptor` into `dest`, resuming from what is already there
    pub async fn fetch(&self, request: FetchRequest) -> DownloadResult<FetchResult> {
        let slot = request.slot;
        let mut partial = PartialFile::probe(&request.dest, request.descriptor.size_hint)
            .await
            .map_err(|e| errors::io("probe partial", e))?;

        if partial.bytes_written != request.resume_from {
            debug!(
                "[{}] recorded offset {} differs from partial on disk ({} bytes), using disk",
                slot, request.resume_from, partial.bytes_written
            );
        }

        if let Some(expected) = partial.expected_size {
            if partial.bytes_written > expected {
                warn!(
                    "[{}] partial {:?} is larger than the advertised size, starting over",
                    slot, partial.path
                );
                partial
                    .truncate()
                    .await
                    .map_err(|e| errors::io("truncate partial", e))?;
                emit(&request.events, FetchEvent::Restarted { slot });
            }
        }

        let resumed_from = partial.bytes_written;
        let mut gate = ProgressGate::new(self.config.progress_interval);
        let mut attempt = 0;

        loop {
            if is_stopped(&request.stop) {
                return Err(DownloadError::Cancelled);
            }
            attempt += 1;

            let outcome = self.attempt(&request, &mut partial, &mut gate).await;
            if let Some(delta) = gate.take() {
                emit(
                    &request.events,
                    FetchEvent::Progress {
                        slot,
                        delta,
                        bytes_done: partial.bytes_written,
                    },
                );
            }

            match outcome {
                Ok(()) => {
                    if let Some(expected) = partial.expected_size {
                        if expected != partial.bytes_written {
                            let written = partial.bytes_written;
                            partial
                                .remove()
                                .await
                                .map_err(|e| errors::io("remove partial", e))?;
                            emit(&request.events, FetchEvent::Restarted { slot });
                            return Err(errors::fetch(
                                FetchFailure::IntegrityMismatch,
                                format!(
                                    "expected {} bytes for {} stream, got {}",
                                    expected, slot, written
                                ),
                            ));
                        }
                    }
                    info!(
                        "✅ [{}] stream complete: {} bytes after {} attempt(s)",
                        slot, partial.bytes_written, attempt
                    );
                    return Ok(FetchResult {
                        bytes_written: gate.recorded,
                        total_bytes: partial.bytes_written,
                        attempts: attempt,
                        resumed_from,
                    });
                }
                Err(DownloadError::Cancelled) => return Err(DownloadError::Cancelled),
                Err(err) if err.is_retryable() && attempt < self.config.retry.max_attempts => {
                    let delay = self.config.retry.delay_for_attempt(attempt);
                    warn!(
                        "[{}] attempt {}/{} failed at {} bytes: {}. Retrying in {:?}",
                        slot,
                        attempt,
                        self.config.retry.max_attempts,
                        partial.bytes_written,
                        err,
                        delay
                    );
                    emit(
                        &request.events,
                        FetchEvent::Retrying {
                            slot,
                            attempt,
                            error: err.to_string(),
                        },
                    );
                    if !self.sleep_unless_stopped(delay, &request.stop).await {
                        return Err(DownloadError::Cancelled);
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn attempt(
        &self,
        request: &FetchRequest,
        partial: &mut PartialFile,
        gate: &mut ProgressGate,
    ) -> DownloadResult<()> {
        let slot = request.slot;
        partial
            .reconcile()
            .await
            .map_err(|e| errors::io("reconcile partial", e))?;
        let offset = partial.bytes_written;
        let headers = request.descriptor.headers();

        let response = tokio::select! {
            opened = self.transport.open(&request.descriptor.url, &headers, offset) => opened?,
            _ = wait_for_stop(&request.stop, self.config.cancel_poll_interval) => {
                return Err(DownloadError::Cancelled);
            }
        };

        let TransportResponse {
            status,
            range_start,
            total_length,
            mut body,
        } = response;

        match status {
            206 => {
                if let Some(start) = range_start {
                    if start != offset {
                        return Err(errors::fetch(
                            FetchFailure::Network,
                            format!("asked for offset {} but body starts at {}", offset, start),
                        ));
                    }
                }
            }
            416 if offset > 0 => {
                // 服务器认为范围越界：本地分片已是完整文件
                debug!("[{}] range {} not satisfiable, partial already complete", slot, offset);
                return Ok(());
            }
            s if (200..300).contains(&s) => {
                if offset > 0 {
                    warn!(
                        "[{}] source ignored range request at {} bytes, restarting from zero",
                        slot, offset
                    );
                    partial
                        .truncate()
                        .await
                        .map_err(|e| errors::io("truncate partial", e))?;
                    emit(&request.events, FetchEvent::Restarted { slot });
                }
            }
            s => return Err(errors::fetch_status(s, &request.descriptor.url)),
        }

        if let Some(total) = total_length {
            emit(&request.events, FetchEvent::TotalKnown { slot, total });
            if partial.expected_size.is_none() {
                partial.expected_size = Some(total);
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&partial.path)
            .await
            .map_err(|e| errors::io("open partial", e))?;

        let pumped = self
            .pump(request, &mut file, &mut body, partial, gate)
            .await;

        // 无论成功、失败还是取消，都先落盘
        let synced = async {
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        pumped?;
        synced.map_err(|e| errors::io("sync partial", e))?;

        if let Some(total) = total_length {
            if partial.bytes_written < total {
                return Err(errors::fetch(
                    FetchFailure::Network,
                    format!(
                        "connection closed at {} of {} bytes",
                        partial.bytes_written, total
                    ),
                ));
            }
        }
        Ok(())
    }

    async fn pump(
        &self,
        request: &FetchRequest,
        file: &mut File,
        body: &mut crate::core::transport::ByteStream,
        partial: &mut PartialFile,
        gate: &mut ProgressGate,
    ) -> DownloadResult<()> {
        let mut last_data = Instant::now();
        loop {
            if is_stopped(&request.stop) {
                return Err(DownloadError::Cancelled);
            }

            match timeout(self.config.cancel_poll_interval, body.next()).await {
                Err(_) => {
                    if last_data.elapsed() >= self.config.read_timeout {
                        return Err(errors::fetch(
                            FetchFailure::Timeout,
                            format!("no data for {:?}", self.config.read_timeout),
                        ));
                    }
                }
                Ok(None) => return Ok(()),
                Ok(Some(Err(err))) => return Err(err),
                Ok(Some(Ok(chunk))) => {
                    last_data = Instant::now();
                    file.write_all(&chunk)
                        .await
                        .map_err(|e| errors::io("write partial", e))?;
                    let len = chunk.len() as u64;
                    partial.bytes_written += len;

                    if let Some(delta) = gate.record(len) {
                        emit(
                            &request.events,
                            FetchEvent::Progress {
                                slot: request.slot,
                                delta,
                                bytes_done: partial.bytes_written,
                            },
                        );
                    }
                    self.bandwidth.throttle(len).await;
                }
            }
        }
    }

    /// Sleep in slices; returns false if the stop flag was raised meanwhile
    async fn sleep_unless_stopped(&self, delay: Duration, stop: &AtomicBool) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            if is_stopped(stop) {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            sleep((deadline - now).min(self.config.cancel_poll_interval)).await;
        }
    }
}

fn is_stopped(stop: &AtomicBool) -> bool {
    stop.load(Ordering::SeqCst)
}

pub(crate) async fn wait_for_stop(stop: &AtomicBool, poll: Duration) {
    while !is_stopped(stop) {
        sleep(poll).await;
    }
}

fn emit(events: &Option<FetchEventSender>, event: FetchEvent) {
    if let Some(tx) = events {
        let _ = tx.send(event);
    }
}
