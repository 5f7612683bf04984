//! Transfer coordinator
//!
//! Owns every job's lifecycle: extraction, candidate selection, concurrent
//! stream fetching, merging and persistence. Each running job is one tokio
//! task; its streams are fetched concurrently inside that task and report
//! back over a per-job channel. Callers observe a job through a `watch`
//! read model, so readers never touch the fetch path.
//!
//! ```text
//! Pending -> Fetching -> Merging -> Done
//!    |          |           |
//!    +----------+-----------+--> Failed / Cancelled -> (retry) -> Fetching
//! ```

use dashmap::{DashMap, DashSet};
use futures::future::join_all;
use futures::stream::FuturesUnordered;
use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::core::bandwidth::BandwidthController;
use crate::core::batch::{BatchEntry, BatchReport};
use crate::core::config::AppConfig;
use crate::core::error_handling::{errors, DownloadError, DownloadResult};
use crate::core::extractors::ExtractionService;
use crate::core::format_selector::FormatSelector;
use crate::core::job_store::{short, JobStore};
use crate::core::models::{
    compute_fingerprint, JobHandle, JobProgress, JobState, QualityPreference, StreamDescriptor,
    StreamSlot, TransferJob,
};
use crate::core::muxer::{FfmpegProcessor, MediaProcessor, Muxer};
use crate::core::progress_tracker::SpeedTracker;
use crate::core::stream_fetcher::{
    wait_for_stop, FetchEvent, FetchRequest, FetchResult, FetcherConfig, PartialFile,
    StreamFetcher,
};
use crate::core::transport::{HttpTransport, ReqwestTransport};
use crate::utils::file_utils::{ensure_dir_exists, sanitize_filename, unique_output_path_with};
use crate::utils::validation::validate_url;

/// In-memory registration of a job known to this coordinator
#[derive(Clone)]
struct ActiveJob {
    stop: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    progress: Arc<watch::Sender<JobProgress>>,
}

impl ActiveJob {
    fn new(progress: JobProgress) -> Self {
        let (tx, _rx) = watch::channel(progress);
        Self {
            stop: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
            progress: Arc::new(tx),
        }
    }

    fn snapshot(&self) -> JobProgress {
        self.progress.borrow().clone()
    }
}

struct Shared {
    config: AppConfig,
    extraction: ExtractionService,
    transport: Arc<dyn HttpTransport>,
    bandwidth: BandwidthController,
    fetcher: StreamFetcher,
    muxer: Muxer,
    slots: Arc<Semaphore>,
    jobs: DashMap<JobHandle, ActiveJob>,
    stores: DashMap<PathBuf, JobStore>,
    /// Serializes start/retry/resume decisions per job
    claims: DashMap<JobHandle, Arc<Mutex<()>>>,
    /// Output files promised to jobs of this coordinator
    outputs: DashSet<PathBuf>,
}

impl Shared {
    fn store_for(&self, dest_dir: &Path) -> JobStore {
        self.stores
            .entry(dest_dir.to_path_buf())
            .or_insert_with(|| JobStore::for_destination(dest_dir))
            .clone()
    }

    fn claim(&self, handle: &JobHandle) -> Arc<Mutex<()>> {
        self.claims
            .entry(handle.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn active(&self, handle: &JobHandle) -> Option<ActiveJob> {
        self.jobs.get(handle).map(|entry| entry.value().clone())
    }

    /// Pick a free output name for `title` and claim it in one step, so two
    /// jobs starting at once never share a file
    fn reserve_output(&self, dest_dir: &Path, title: &str, streams: &[StreamDescriptor]) -> PathBuf {
        let extension = output_extension(streams);
        unique_output_path_with(dest_dir, &sanitize_filename(title), &extension, |p| {
            // 插入成功即占用该路径
            p.exists() || !self.outputs.insert(p.to_path_buf())
        })
    }
}

pub struct CoordinatorBuilder {
    config: AppConfig,
    transport: Option<Arc<dyn HttpTransport>>,
    extraction: Option<ExtractionService>,
    processor: Option<Arc<dyn MediaProcessor>>,
}

impl CoordinatorBuilder {
    pub fn transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn extraction(mut self, extraction: ExtractionService) -> Self {
        self.extraction = Some(extraction);
        self
    }

    pub fn processor(mut self, processor: Arc<dyn MediaProcessor>) -> Self {
        self.processor = Some(processor);
        self
    }

    pub fn build(self) -> DownloadResult<TransferCoordinator> {
        let config = self.config;
        config
            .validate()
            .map_err(|e| DownloadError::Configuration(e.to_string()))?;

        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new(
                &config.download.user_agent,
                Duration::from_secs(config.fetch.connect_timeout_seconds),
            )?),
        };
        let extraction = match self.extraction {
            Some(extraction) => extraction,
            None => ExtractionService::from_config(&config)?,
        };
        let processor = self
            .processor
            .unwrap_or_else(|| Arc::new(FfmpegProcessor::from_config(&config.mux)));

        let bandwidth = BandwidthController::new(config.download.rate_limit_bytes_per_sec);
        let fetcher = StreamFetcher::new(
            transport.clone(),
            bandwidth.clone(),
            FetcherConfig::from(&config.fetch),
        );

        info!(
            "🚀 Transfer coordinator ready ({} concurrent job(s), {} site(s))",
            config.download.max_concurrent_jobs,
            extraction.registry().len()
        );

        Ok(TransferCoordinator {
            shared: Arc::new(Shared {
                slots: Arc::new(Semaphore::new(config.download.max_concurrent_jobs.max(1))),
                config,
                extraction,
                transport,
                bandwidth,
                fetcher,
                muxer: Muxer::new(processor),
                jobs: DashMap::new(),
                stores: DashMap::new(),
                claims: DashMap::new(),
                outputs: DashSet::new(),
            }),
        })
    }
}

/// Drives download jobs; cheap to clone
#[derive(Clone)]
pub struct TransferCoordinator {
    shared: Arc<Shared>,
}

fn handle_of(job: &TransferJob) -> JobHandle {
    JobHandle {
        fingerprint: job.fingerprint.clone(),
        dest_dir: job.dest_dir.clone(),
    }
}

fn output_extension(streams: &[StreamDescriptor]) -> String {
    match streams {
        [single] => single
            .container
            .clone()
            .filter(|c| c != "m4s")
            .unwrap_or_else(|| "mp4".to_string()),
        _ => "mp4".to_string(),
    }
}

impl TransferCoordinator {
    pub fn builder(config: AppConfig) -> CoordinatorBuilder {
        CoordinatorBuilder {
            config,
            transport: None,
            extraction: None,
            processor: None,
        }
    }

    /// Production wiring: reqwest transport, default sites, ffmpeg
    pub fn from_config(config: AppConfig) -> DownloadResult<Self> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &AppConfig {
        &self.shared.config
    }

    /// `download.output_directory` from the configuration
    pub fn default_destination(&self) -> PathBuf {
        self.shared.config.download.output_dir()
    }

    /// `download.quality` from the configuration
    pub fn default_quality(&self) -> QualityPreference {
        self.shared.config.download.quality
    }

    /// The job store the coordinator uses for `dest_dir`
    pub fn job_store(&self, dest_dir: &Path) -> JobStore {
        self.shared.store_for(dest_dir)
    }

    pub async fn set_rate_limit(&self, bytes_per_sec: Option<u64>) {
        self.shared.bandwidth.set_limit(bytes_per_sec).await;
    }

    /// Resolve `url`, pick streams and start (or adopt) the matching job.
    ///
    /// Unsupported URLs fail before anything is written. Calling this again for
    /// a page whose job is already known returns the same handle.
    pub async fn start_download(
        &self,
        url: &str,
        dest_dir: &Path,
        quality: QualityPreference,
    ) -> DownloadResult<JobHandle> {
        validate_url(url).map_err(|_| DownloadError::NotSupported {
            url: url.to_string(),
        })?;
        let extractor = self.shared.extraction.resolve(url)?;
        debug!("{} handled by {}", url, extractor.name());

        let manifest = self
            .shared
            .extraction
            .extract(url, self.shared.config.extraction.page_timeout())
            .await?;
        let streams = FormatSelector::new(self.shared.transport.clone())
            .select(&manifest, quality)
            .await?
            .into_streams();
        let refs: Vec<&StreamDescriptor> = streams.iter().collect();
        let handle = JobHandle {
            fingerprint: compute_fingerprint(&manifest.page_url, &refs),
            dest_dir: dest_dir.to_path_buf(),
        };

        let claim = self.shared.claim(&handle);
        let _guard = claim.lock().await;

        ensure_dir_exists(dest_dir).map_err(|e| DownloadError::Configuration(e.to_string()))?;
        let store = self.shared.store_for(dest_dir);

        if let Some(active) = self.shared.active(&handle) {
            debug!("Job {} already known, reusing it", short(&handle.fingerprint));
            if !active.running.load(Ordering::SeqCst) {
                // 签名过期的地址换成刚提取到的，供之后的 retry 使用
                match store.load(&handle.fingerprint).await {
                    Ok(mut job) => {
                        if job.refresh_sources(&streams) {
                            store.save(&job).await?;
                            info!("🔗 Refreshed stream URLs of job {}", short(&job.fingerprint));
                        }
                    }
                    Err(DownloadError::JobNotFound(_)) => {}
                    Err(e) => return Err(e),
                }
            }
            return Ok(handle);
        }

        match store.load(&handle.fingerprint).await {
            Ok(mut job) => {
                if job.refresh_sources(&streams) {
                    store.save(&job).await?;
                    info!("🔗 Refreshed stream URLs of job {}", short(&job.fingerprint));
                }
                self.adopt(job, store);
                return Ok(handle);
            }
            Err(DownloadError::JobNotFound(_)) => {}
            Err(e) => return Err(e),
        }

        if let Ok(done) = store.load_archived(&handle.fingerprint).await {
            if done.output_path.exists() {
                info!(
                    "✅ {} was already downloaded to {:?}",
                    manifest.title, done.output_path
                );
                self.register(&done);
                return Ok(handle);
            }
        }

        let output = self.shared.reserve_output(dest_dir, &manifest.title, &streams);
        let job = match TransferJob::new(&manifest, quality, streams, dest_dir, output.clone()) {
            Ok(job) => job,
            Err(e) => {
                self.shared.outputs.remove(&output);
                return Err(e);
            }
        };
        if let Err(e) = store.save(&job).await {
            self.shared.outputs.remove(&output);
            return Err(e);
        }
        info!(
            "📥 Queued \"{}\" as job {} ({} stream(s))",
            job.title,
            short(&job.fingerprint),
            job.streams.len()
        );
        self.launch(job, store);
        Ok(handle)
    }

    pub async fn get_progress(&self, handle: &JobHandle) -> DownloadResult<JobProgress> {
        if let Some(active) = self.shared.active(handle) {
            return Ok(active.snapshot());
        }
        let store = self.shared.store_for(&handle.dest_dir);
        match store.load(&handle.fingerprint).await {
            Ok(job) => return Ok(JobProgress::from_job(&job)),
            Err(DownloadError::JobNotFound(_)) => {}
            Err(e) => return Err(e),
        }
        store
            .load_archived(&handle.fingerprint)
            .await
            .map(|job| JobProgress::from_job(&job))
    }

    /// Ask a running job to stop. Fetchers flush their partials and exit; the
    /// job ends `Cancelled`. A job that is already merging finishes.
    pub async fn cancel_download(&self, handle: &JobHandle) -> DownloadResult<()> {
        if let Some(active) = self.shared.active(handle) {
            if active.running.load(Ordering::SeqCst) {
                info!("⏹️ Cancelling job {}", short(&handle.fingerprint));
                active.stop.store(true, Ordering::SeqCst);
            }
            return Ok(());
        }
        self.get_progress(handle).await.map(|_| ())
    }

    /// Restart a failed or cancelled job; finished streams are kept
    pub async fn retry(&self, handle: &JobHandle) -> DownloadResult<()> {
        let claim = self.shared.claim(handle);
        let _guard = claim.lock().await;

        if let Some(active) = self.shared.active(handle) {
            if active.running.load(Ordering::SeqCst) {
                return Err(DownloadError::InvalidTransition {
                    from: active.snapshot().state.to_string(),
                    to: JobState::Fetching.to_string(),
                });
            }
        }

        let store = self.shared.store_for(&handle.dest_dir);
        let mut job = match store.load(&handle.fingerprint).await {
            Ok(job) => job,
            // 已归档的任务只用于给出准确的状态错误
            Err(DownloadError::JobNotFound(_)) => store.load_archived(&handle.fingerprint).await?,
            Err(e) => return Err(e),
        };
        job.transition(JobState::Fetching)?;
        job.last_error = None;
        match self.refresh_from_page(&mut job).await {
            Ok(true) => info!("🔗 Refreshed stream URLs of job {}", short(&job.fingerprint)),
            Ok(false) => {}
            Err(e) => warn!(
                "Could not re-extract {} for job {}, keeping recorded URLs: {}",
                job.page_url,
                short(&job.fingerprint),
                e
            ),
        }
        store.save(&job).await?;
        info!("🔁 Retrying job {} (\"{}\")", short(&job.fingerprint), job.title);
        self.launch(job, store);
        Ok(())
    }

    /// Re-extract the job's page and take over fresh URLs if it still offers
    /// the same streams
    async fn refresh_from_page(&self, job: &mut TransferJob) -> DownloadResult<bool> {
        let manifest = self
            .shared
            .extraction
            .extract(&job.page_url, self.shared.config.extraction.page_timeout())
            .await?;
        let streams = FormatSelector::new(self.shared.transport.clone())
            .select(&manifest, job.quality)
            .await?
            .into_streams();
        let refs: Vec<&StreamDescriptor> = streams.iter().collect();
        if compute_fingerprint(&manifest.page_url, &refs) != job.fingerprint {
            warn!(
                "{} now offers different streams than job {}, keeping recorded URLs",
                job.page_url,
                short(&job.fingerprint)
            );
            return Ok(false);
        }
        Ok(job.refresh_sources(&streams))
    }

    /// Download every URL into `dest_dir` and summarize the outcomes. A URL
    /// that cannot be started counts as a failed entry; the batch goes on.
    pub async fn download_batch(
        &self,
        urls: &[String],
        dest_dir: &Path,
        quality: QualityPreference,
    ) -> BatchReport {
        info!("📋 Starting batch of {} URL(s) into {:?}", urls.len(), dest_dir);
        let started = Instant::now();
        let results = join_all(
            urls.iter()
                .map(|url| self.batch_entry(url, dest_dir, quality)),
        )
        .await;
        let report = BatchReport::summarize(results, started.elapsed());
        report.log_summary();
        report
    }

    async fn batch_entry(&self, url: &str, dest_dir: &Path, quality: QualityPreference) -> BatchEntry {
        let started = Instant::now();
        let site = self
            .shared
            .extraction
            .resolve(url)
            .ok()
            .map(|extractor| extractor.name().to_string());
        let outcome = match self.start_download(url, dest_dir, quality).await {
            Ok(handle) => self.wait(&handle).await.map(|progress| (handle, progress)),
            Err(e) => Err(e),
        };
        BatchEntry::from_outcome(url, site, outcome, started.elapsed())
    }

    /// Pick up jobs left unfinished in `dest_dir`, typically after a restart
    pub async fn resume_pending(&self, dest_dir: &Path) -> DownloadResult<Vec<JobHandle>> {
        let store = self.shared.store_for(dest_dir);
        let mut resumed = Vec::new();

        for job in store.list().await? {
            let handle = handle_of(&job);
            let claim = self.shared.claim(&handle);
            let _guard = claim.lock().await;
            if self.shared.jobs.contains_key(&handle) {
                continue;
            }
            if self.adopt(job, store.clone()) {
                resumed.push(handle);
            }
        }

        if !resumed.is_empty() {
            info!("♻️ Resumed {} job(s) in {:?}", resumed.len(), dest_dir);
        }
        Ok(resumed)
    }

    /// Wait until the job reaches a terminal state
    pub async fn wait(&self, handle: &JobHandle) -> DownloadResult<JobProgress> {
        let Some(active) = self.shared.active(handle) else {
            return self.get_progress(handle).await;
        };
        let mut rx = active.progress.subscribe();
        loop {
            {
                let current = rx.borrow_and_update();
                if current.state.is_terminal() && !active.running.load(Ordering::SeqCst) {
                    return Ok(current.clone());
                }
            }
            if rx.changed().await.is_err() {
                return self.get_progress(handle).await;
            }
        }
    }

    /// Register a persisted job; in-flight ones are restarted. Failed and
    /// cancelled jobs wait for `retry`.
    fn adopt(&self, mut job: TransferJob, store: JobStore) -> bool {
        if job.recover() {
            info!(
                "♻️ Job {} was interrupted, resuming from its partial files",
                short(&job.fingerprint)
            );
        }
        if job.state == JobState::Pending {
            self.launch(job, store);
            true
        } else {
            debug!("Job {} registered in state {}", short(&job.fingerprint), job.state);
            self.register(&job);
            false
        }
    }

    fn register(&self, job: &TransferJob) -> ActiveJob {
        self.shared.outputs.insert(job.output_path.clone());
        let progress = JobProgress::from_job(job);
        let mut entry = self
            .shared
            .jobs
            .entry(handle_of(job))
            .or_insert_with(|| ActiveJob::new(progress.clone()));
        entry.stop = Arc::new(AtomicBool::new(false));
        entry.progress.send_replace(progress);
        entry.value().clone()
    }

    fn launch(&self, job: TransferJob, store: JobStore) {
        let active = self.register(&job);
        active.running.store(true, Ordering::SeqCst);

        let run = JobRun {
            shared: self.shared.clone(),
            speed: SpeedTracker::new(job.bytes_done()),
            job,
            store,
            active,
            dirty: false,
        };
        tokio::spawn(run.execute());
    }
}

/// One execution of a job, from slot acquisition to a terminal state
struct JobRun {
    shared: Arc<Shared>,
    job: TransferJob,
    store: JobStore,
    active: ActiveJob,
    speed: SpeedTracker,
    dirty: bool,
}

impl JobRun {
    async fn execute(mut self) {
        match self.drive().await {
            Ok(()) => {}
            Err(DownloadError::Cancelled) => {
                info!("⏹️ Job {} cancelled", short(&self.job.fingerprint));
                if let Err(e) = self.job.transition(JobState::Cancelled) {
                    warn!("Job {}: {}", short(&self.job.fingerprint), e);
                }
                self.finish().await;
            }
            Err(err) => {
                error!(
                    "❌ Job {} (\"{}\") failed during {}: {}",
                    short(&self.job.fingerprint),
                    self.job.title,
                    err.stage(),
                    err
                );
                self.job.last_error = Some(err);
                if let Err(e) = self.job.transition(JobState::Failed) {
                    warn!("Job {}: {}", short(&self.job.fingerprint), e);
                }
                self.finish().await;
            }
        }
    }

    async fn drive(&mut self) -> DownloadResult<()> {
        let permit = self.wait_for_slot().await?;

        if self.job.state != JobState::Fetching {
            self.job.transition(JobState::Fetching)?;
        }
        self.persist().await;
        self.publish();

        self.reconcile_partials().await?;
        self.speed = SpeedTracker::new(self.job.bytes_done());
        self.fetch_streams().await?;
        drop(permit);

        if self.active.stop.load(Ordering::SeqCst) {
            return Err(DownloadError::Cancelled);
        }
        if !self.job.all_streams_completed() {
            return Err(errors::store(format!(
                "job {} reached merging with unfinished streams",
                short(&self.job.fingerprint)
            )));
        }

        self.job.transition(JobState::Merging)?;
        self.persist().await;
        self.publish();
        self.produce_output().await?;

        self.job.transition(JobState::Done)?;
        self.job.last_error = None;
        if let Err(e) = self.store.archive(&self.job).await {
            warn!("Failed to archive job {}: {}", short(&self.job.fingerprint), e);
            self.persist().await;
        }
        info!("✅ \"{}\" saved to {:?}", self.job.title, self.job.output_path);
        self.active.running.store(false, Ordering::SeqCst);
        self.publish();
        Ok(())
    }

    async fn finish(&mut self) {
        self.persist().await;
        self.active.running.store(false, Ordering::SeqCst);
        self.publish();
    }

    async fn wait_for_slot(&self) -> DownloadResult<OwnedSemaphorePermit> {
        let poll = self.shared.fetcher.config().cancel_poll_interval;
        tokio::select! {
            permit = self.shared.slots.clone().acquire_owned() => {
                permit.map_err(|_| DownloadError::Configuration("job scheduler closed".into()))
            }
            _ = wait_for_stop(&self.active.stop, poll) => Err(DownloadError::Cancelled),
        }
    }

    /// Persisted byte counts are advisory; the partial files decide
    async fn reconcile_partials(&mut self) -> DownloadResult<()> {
        let output_exists = self.job.output_path.exists();
        for stream in &mut self.job.streams {
            if stream.completed {
                if !stream.partial_path.exists() && !output_exists {
                    warn!(
                        "[{}] completed partial {:?} is gone, fetching it again",
                        stream.slot, stream.partial_path
                    );
                    stream.completed = false;
                    stream.bytes_done = 0;
                }
                continue;
            }
            let partial = PartialFile::probe(&stream.partial_path, stream.bytes_total)
                .await
                .map_err(|e| errors::io("probe partial", e))?;
            if partial.bytes_written != stream.bytes_done {
                debug!(
                    "[{}] record says {} bytes, partial has {}",
                    stream.slot, stream.bytes_done, partial.bytes_written
                );
            }
            stream.bytes_done = partial.bytes_written;
        }
        Ok(())
    }

    async fn fetch_streams(&mut self) -> DownloadResult<()> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let stop = self.active.stop.clone();

        let mut pending = FuturesUnordered::new();
        for stream in self.job.streams.iter().filter(|s| !s.completed) {
            let request = FetchRequest {
                slot: stream.slot,
                descriptor: stream.descriptor.clone(),
                dest: stream.partial_path.clone(),
                resume_from: stream.bytes_done,
                stop: stop.clone(),
                events: Some(tx.clone()),
            };
            let fetcher = self.shared.fetcher.clone();
            pending.push(async move {
                let slot = request.slot;
                (slot, fetcher.fetch(request).await)
            });
        }
        drop(tx);

        let interval = Duration::from_millis(self.shared.config.download.persist_interval_ms.max(1));
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        let mut failure: Option<DownloadError> = None;
        while !pending.is_empty() {
            tokio::select! {
                Some(event) = rx.recv() => self.apply_event(event),
                Some((slot, result)) = pending.next() => match result {
                    Ok(done) => {
                        self.complete_stream(slot, &done);
                        self.persist().await;
                        self.publish();
                    }
                    Err(DownloadError::Cancelled) => {
                        debug!("[{}] stream stopped", slot);
                    }
                    Err(err) => {
                        if failure.is_none() {
                            warn!("[{}] stream failed, stopping the other streams: {}", slot, err);
                            stop.store(true, Ordering::SeqCst);
                            failure = Some(err);
                        }
                    }
                },
                _ = ticker.tick() => {
                    if self.dirty {
                        self.persist().await;
                    }
                    self.publish();
                }
            }
        }
        while let Ok(event) = rx.try_recv() {
            self.apply_event(event);
        }

        match failure {
            Some(err) => Err(err),
            None if stop.load(Ordering::SeqCst) => Err(DownloadError::Cancelled),
            None => Ok(()),
        }
    }

    fn apply_event(&mut self, event: FetchEvent) {
        let slot = match &event {
            FetchEvent::Progress { slot, .. }
            | FetchEvent::TotalKnown { slot, .. }
            | FetchEvent::Restarted { slot }
            | FetchEvent::Retrying { slot, .. } => *slot,
        };
        let Some(stream) = self.job.stream_mut(slot) else {
            return;
        };
        if stream.completed {
            return;
        }
        match event {
            FetchEvent::Progress { bytes_done, .. } => stream.bytes_done = bytes_done,
            FetchEvent::TotalKnown { total, .. } => stream.bytes_total = Some(total),
            FetchEvent::Restarted { .. } => stream.bytes_done = 0,
            FetchEvent::Retrying { attempt, error, .. } => {
                stream.attempts += 1;
                debug!("[{}] retry #{} after: {}", slot, attempt, error);
            }
        }
        self.dirty = true;
    }

    fn complete_stream(&mut self, slot: StreamSlot, done: &FetchResult) {
        if let Some(stream) = self.job.stream_mut(slot) {
            stream.completed = true;
            stream.bytes_done = done.total_bytes;
            stream.bytes_total = Some(done.total_bytes);
            stream.attempts += 1;
        }
        info!(
            "📦 [{}] stream of job {} done ({} bytes, resumed at {})",
            slot,
            short(&self.job.fingerprint),
            done.total_bytes,
            done.resumed_from
        );
    }

    async fn produce_output(&self) -> DownloadResult<()> {
        let output = &self.job.output_path;
        if self.job.needs_merge() {
            let audio = self
                .job
                .stream(StreamSlot::Audio)
                .ok_or_else(|| errors::store("job has no audio stream to merge"))?;
            let video = self
                .job
                .stream(StreamSlot::Video)
                .ok_or_else(|| errors::store("job has no video stream to merge"))?;
            self.shared
                .muxer
                .merge(&audio.partial_path, &video.partial_path, output)
                .await
        } else {
            let single = self
                .job
                .streams
                .first()
                .ok_or_else(|| errors::store("job has no streams"))?;
            self.shared
                .muxer
                .finalize_single(&single.partial_path, output)
                .await
        }
    }

    async fn persist(&mut self) {
        self.job.touch();
        match self.store.save(&self.job).await {
            Ok(()) => self.dirty = false,
            Err(e) => warn!("Failed to persist job {}: {}", short(&self.job.fingerprint), e),
        }
    }

    fn publish(&mut self) {
        let mut progress = JobProgress::from_job(&self.job);
        progress.speed = self.speed.update(progress.bytes_done);
        progress.eta_seconds = self.speed.eta(progress.bytes_total);
        self.active.progress.send_replace(progress);
    }
}
