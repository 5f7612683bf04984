//! Core data models for the download pipeline

use crate::core::error_handling::{DownloadError, DownloadResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// What a stream carries

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Video,

    Audio,

    /// Picture and sound in one container
    Muxed,
}

/// One fetchable media stream advertised by a page

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamDescriptor {
    pub kind: StreamKind,

    pub url: String,

    /// Comparable quality ordinal: picture height for video, kbps for audio
    pub quality: u32,

    pub label: String,

    pub size_hint: Option<u64>,

    /// Extra headers the source insists on (referer, cookies)
    pub request_headers: Option<BTreeMap<String, String>>,

    /// File extension of the container, e.g. "mp4", "m4s", "flv"
    pub container: Option<String>,
}

impl StreamDescriptor {
    pub fn new(kind: StreamKind, url: impl Into<String>, quality: u32) -> Self {
        Self {
            kind,
            url: url.into(),
            quality,
            label: String::new(),
            size_hint: None,
            request_headers: None,
            container: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_size_hint(mut self, size: Option<u64>) -> Self {
        self.size_hint = size;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.request_headers
            .get_or_insert_with(BTreeMap::new)
            .insert(name.into(), value.into());
        self
    }

    pub fn with_container(mut self, container: impl Into<String>) -> Self {
        self.container = Some(container.into());
        self
    }

    pub fn headers(&self) -> BTreeMap<String, String> {
        self.request_headers.clone().unwrap_or_default()
    }

    pub fn slot(&self) -> StreamSlot {
        match self.kind {
            StreamKind::Video => StreamSlot::Video,
            StreamKind::Audio => StreamSlot::Audio,
            StreamKind::Muxed => StreamSlot::Muxed,
        }
    }
}

/// Result of extracting a page: a title plus the candidate streams, best first

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaManifest {
    pub title: String,

    pub candidates: Vec<StreamDescriptor>,

    pub page_url: String,
}

impl MediaManifest {
    /// Build a manifest; candidates are stably ordered by descending quality
    pub fn new(
        title: impl Into<String>,
        mut candidates: Vec<StreamDescriptor>,
        page_url: impl Into<String>,
    ) -> Self {
        candidates.sort_by(|a, b| b.quality.cmp(&a.quality));
        Self {
            title: title.into(),
            candidates,
            page_url: page_url.into(),
        }
    }

    pub fn candidates_of(&self, kind: StreamKind) -> impl Iterator<Item = &StreamDescriptor> {
        self.candidates.iter().filter(move |c| c.kind == kind)
    }
}

/// How the caller wants candidates ranked

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum QualityPreference {
    #[default]
    Best,
    /// Highest quality not above the given ordinal
    AtMost(u32),
    Lowest,
}

/// The slot a selected stream fills in the final file

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum StreamSlot {
    Video,
    Audio,
    Muxed,
}

impl StreamSlot {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Muxed => "muxed",
        }
    }
}

impl fmt::Display for StreamSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job lifecycle status

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum JobState {
    Pending,

    Fetching,

    Merging,

    Done,

    Failed,

    Cancelled,
}

impl JobState {
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, Fetching)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Fetching, Merging)
                | (Fetching, Failed)
                | (Fetching, Cancelled)
                | (Merging, Done)
                | (Merging, Failed)
                | (Failed, Fetching)
                | (Cancelled, Fetching)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Done | JobState::Failed | JobState::Cancelled)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            JobState::Pending => "pending",
            JobState::Fetching => "fetching",
            JobState::Merging => "merging",
            JobState::Done => "done",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// Per-stream transfer state inside a job

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobStream {
    pub slot: StreamSlot,

    pub descriptor: StreamDescriptor,

    pub partial_path: PathBuf,

    /// Advisory: the partial file's on-disk length is authoritative
    pub bytes_done: u64,

    pub bytes_total: Option<u64>,

    pub attempts: u32,

    pub completed: bool,
}

/// One requested download, persisted by the job store

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransferJob {
    pub fingerprint: String,

    pub page_url: String,

    pub title: String,

    pub quality: QualityPreference,

    pub streams: Vec<JobStream>,

    pub state: JobState,

    pub dest_dir: PathBuf,

    pub output_path: PathBuf,

    pub last_error: Option<DownloadError>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl TransferJob {
    /// Create a pending job. Streams must be one muxed stream or a video plus an audio stream.
    pub fn new(
        manifest: &MediaManifest,
        quality: QualityPreference,
        selected: Vec<StreamDescriptor>,
        dest_dir: &Path,
        output_path: PathBuf,
    ) -> DownloadResult<Self> {
        validate_stream_set(&selected)?;

        let refs: Vec<&StreamDescriptor> = selected.iter().collect();
        let fingerprint = compute_fingerprint(&manifest.page_url, &refs);
        let streams = selected
            .into_iter()
            .map(|descriptor| {
                let slot = descriptor.slot();
                JobStream {
                    slot,
                    partial_path: partial_path_for(dest_dir, &fingerprint, slot),
                    bytes_total: descriptor.size_hint,
                    descriptor,
                    bytes_done: 0,
                    attempts: 0,
                    completed: false,
                }
            })
            .collect();

        let now = Utc::now();
        Ok(Self {
            fingerprint,
            page_url: manifest.page_url.clone(),
            title: manifest.title.clone(),
            quality,
            streams,
            state: JobState::Pending,
            dest_dir: dest_dir.to_path_buf(),
            output_path,
            last_error: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow
    pub fn transition(&mut self, next: JobState) -> DownloadResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(DownloadError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Reset a job found in an in-flight state after the process died
    pub fn recover(&mut self) -> bool {
        if matches!(self.state, JobState::Fetching | JobState::Merging) {
            self.state = JobState::Pending;
            self.updated_at = Utc::now();
            true
        } else {
            false
        }
    }

    pub fn needs_merge(&self) -> bool {
        self.streams.len() == 2
    }

    pub fn stream(&self, slot: StreamSlot) -> Option<&JobStream> {
        self.streams.iter().find(|s| s.slot == slot)
    }

    pub fn stream_mut(&mut self, slot: StreamSlot) -> Option<&mut JobStream> {
        self.streams.iter_mut().find(|s| s.slot == slot)
    }

    pub fn bytes_done(&self) -> u64 {
        self.streams.iter().map(|s| s.bytes_done).sum()
    }

    /// Sum of known totals, `None` while any stream size is unknown
    pub fn bytes_total(&self) -> Option<u64> {
        self.streams
            .iter()
            .map(|s| s.bytes_total)
            .sum::<Option<u64>>()
    }

    pub fn all_streams_completed(&self) -> bool {
        self.streams.iter().all(|s| s.completed)
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Take over URLs and headers from a fresh extraction of the same streams.
    /// Offsets stay: the fingerprint ignores signatures, so the bytes already on
    /// disk belong to the same resource. Returns whether anything changed.
    pub fn refresh_sources(&mut self, fresh: &[StreamDescriptor]) -> bool {
        let mut changed = false;
        for descriptor in fresh {
            let Some(stream) = self.stream_mut(descriptor.slot()) else {
                continue;
            };
            let current = &mut stream.descriptor;
            if current.url != descriptor.url || current.request_headers != descriptor.request_headers
            {
                current.url = descriptor.url.clone();
                current.request_headers = descriptor.request_headers.clone();
                changed = true;
            }
        }
        if changed {
            self.touch();
        }
        changed
    }
}

fn validate_stream_set(selected: &[StreamDescriptor]) -> DownloadResult<()> {
    let kinds: Vec<StreamKind> = selected.iter().map(|s| s.kind).collect();
    let valid = match kinds.as_slice() {
        [StreamKind::Muxed] => true,
        [StreamKind::Video, StreamKind::Audio] | [StreamKind::Audio, StreamKind::Video] => true,
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(DownloadError::Store(format!(
            "a job needs one muxed stream or one video and one audio stream, got {:?}",
            kinds
        )))
    }
}

/// Stable identity of (page, selected streams).
///
/// Query strings and fragments are dropped from stream URLs since CDNs sign
/// them per request; the page URL is used as given.
pub fn compute_fingerprint(page_url: &str, streams: &[&StreamDescriptor]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(page_url.trim().as_bytes());
    for stream in streams {
        hasher.update(b"\n");
        hasher.update(stream.slot().as_str().as_bytes());
        hasher.update(b":");
        hasher.update(strip_volatile_parts(&stream.url).as_bytes());
    }
    hex::encode(hasher.finalize())
}

fn strip_volatile_parts(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut parsed) => {
            parsed.set_query(None);
            parsed.set_fragment(None);
            parsed.to_string()
        }
        Err(_) => raw.split(['?', '#']).next().unwrap_or(raw).to_string(),
    }
}

/// Partial file location for one stream of a job
pub fn partial_path_for(dest_dir: &Path, fingerprint: &str, slot: StreamSlot) -> PathBuf {
    let short = &fingerprint[..fingerprint.len().min(16)];
    dest_dir.join(format!("{}.{}.part", short, slot.as_str()))
}

/// Read model returned by progress queries

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamProgress {
    pub slot: StreamSlot,
    pub bytes_done: u64,
    pub bytes_total: Option<u64>,
    pub completed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobProgress {
    pub fingerprint: String,

    pub state: JobState,

    pub bytes_done: u64,

    pub bytes_total: Option<u64>,

    pub streams: Vec<StreamProgress>,

    /// Bytes per second, smoothed
    pub speed: f64,

    pub eta_seconds: Option<u64>,

    pub last_error: Option<DownloadError>,

    pub output_path: PathBuf,
}

impl JobProgress {
    pub fn from_job(job: &TransferJob) -> Self {
        Self {
            fingerprint: job.fingerprint.clone(),
            state: job.state,
            bytes_done: job.bytes_done(),
            bytes_total: job.bytes_total(),
            streams: job
                .streams
                .iter()
                .map(|s| StreamProgress {
                    slot: s.slot,
                    bytes_done: s.bytes_done,
                    bytes_total: s.bytes_total,
                    completed: s.completed,
                })
                .collect(),
            speed: 0.0,
            eta_seconds: None,
            last_error: job.last_error.clone(),
            output_path: job.output_path.clone(),
        }
    }

    pub fn percent(&self) -> Option<f64> {
        self.bytes_total
            .filter(|total| *total > 0)
            .map(|total| self.bytes_done as f64 / total as f64 * 100.0)
    }
}

/// Caller-side reference to a job

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct JobHandle {
    pub fingerprint: String,
    pub dest_dir: PathBuf,
}
