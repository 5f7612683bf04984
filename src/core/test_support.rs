//! In-memory stand-ins for the network, the muxing tool and page loading

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use futures_util::StreamExt;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::core::error_handling::{errors, DownloadResult, ExtractionFailure, FetchFailure, MuxFailure};
use crate::core::extractors::{Extractor, PageSnapshot, PageSource};
use crate::core::models::{MediaManifest, StreamDescriptor};
use crate::core::muxer::MediaProcessor;
use crate::core::transport::{HttpTransport, ProbeInfo, TransportResponse};

/// Deterministic payload of `len` bytes
pub fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

/// Injected behaviour for one `open` call, consumed in order
#[derive(Debug, Clone)]
pub enum Fault {
    /// Deliver this many body bytes, then fail with a connection reset
    DropAfter(u64),
    /// Answer with this status and no body
    Status(u16),
    /// Deliver this many bytes, then stall forever
    HangAfter(u64),
}

struct Resource {
    data: Bytes,
    ranges: bool,
    probe_status: Option<u16>,
    faults: VecDeque<Fault>,
}

#[derive(Default)]
pub struct MemoryTransport {
    resources: Mutex<HashMap<String, Resource>>,
    opens: Mutex<Vec<(String, u64)>>,
    probes: AtomicUsize,
    chunk_size: usize,
    chunk_delay: Option<Duration>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            chunk_size: 8 * 1024,
            ..Self::default()
        }
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    pub fn insert(&self, url: &str, data: Vec<u8>) {
        self.insert_with(url, data, true);
    }

    pub fn insert_with(&self, url: &str, data: Vec<u8>, ranges: bool) {
        self.resources.lock().unwrap().insert(
            url.to_string(),
            Resource {
                data: Bytes::from(data),
                ranges,
                probe_status: None,
                faults: VecDeque::new(),
            },
        );
    }

    pub fn fail_probe(&self, url: &str, status: u16) {
        if let Some(res) = self.resources.lock().unwrap().get_mut(url) {
            res.probe_status = Some(status);
        }
    }

    pub fn push_fault(&self, url: &str, fault: Fault) {
        if let Some(res) = self.resources.lock().unwrap().get_mut(url) {
            res.faults.push_back(fault);
        }
    }

    /// (url, offset) of every `open` so far
    pub fn opens(&self) -> Vec<(String, u64)> {
        self.opens.lock().unwrap().clone()
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    fn body(&self, data: Bytes, limit: Option<(u64, bool)>) -> crate::core::transport::ByteStream {
        let chunk_size = self.chunk_size;
        let mut chunks: Vec<DownloadResult<Bytes>> = Vec::new();
        let deliver = match limit {
            Some((n, _)) => (n as usize).min(data.len()),
            None => data.len(),
        };
        let mut pos = 0;
        while pos < deliver {
            let end = (pos + chunk_size).min(deliver);
            chunks.push(Ok(data.slice(pos..end)));
            pos = end;
        }

        let delay = self.chunk_delay;
        let base = stream::iter(chunks).then(move |chunk| async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            chunk
        });

        match limit {
            Some((_, false)) => base
                .chain(stream::once(async {
                    Err(errors::fetch(FetchFailure::Network, "connection reset by peer"))
                }))
                .boxed(),
            Some((_, true)) => base.chain(stream::pending()).boxed(),
            None => base.boxed(),
        }
    }
}

#[async_trait]
impl HttpTransport for MemoryTransport {
    async fn probe(
        &self,
        url: &str,
        _headers: &BTreeMap<String, String>,
    ) -> DownloadResult<ProbeInfo> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        let resources = self.resources.lock().unwrap();
        let res = resources
            .get(url)
            .ok_or_else(|| errors::fetch_status(404, url))?;
        if let Some(status) = res.probe_status {
            return Err(errors::fetch_status(status, url));
        }
        Ok(ProbeInfo {
            content_length: Some(res.data.len() as u64),
            accepts_ranges: res.ranges,
        })
    }

    async fn open(
        &self,
        url: &str,
        _headers: &BTreeMap<String, String>,
        offset: u64,
    ) -> DownloadResult<TransportResponse> {
        self.opens.lock().unwrap().push((url.to_string(), offset));

        let (data, ranges, fault) = {
            let mut resources = self.resources.lock().unwrap();
            let res = resources
                .get_mut(url)
                .ok_or_else(|| errors::fetch_status(404, url))?;
            (res.data.clone(), res.ranges, res.faults.pop_front())
        };
        let len = data.len() as u64;

        if let Some(Fault::Status(status)) = fault {
            return Ok(TransportResponse {
                status,
                range_start: None,
                total_length: None,
                body: stream::empty().boxed(),
            });
        }
        let limit = match fault {
            Some(Fault::DropAfter(n)) => Some((n, false)),
            Some(Fault::HangAfter(n)) => Some((n, true)),
            _ => None,
        };

        if ranges && offset > 0 {
            if offset >= len {
                return Ok(TransportResponse {
                    status: 416,
                    range_start: None,
                    total_length: Some(len),
                    body: stream::empty().boxed(),
                });
            }
            return Ok(TransportResponse {
                status: 206,
                range_start: Some(offset),
                total_length: Some(len),
                body: self.body(data.slice(offset as usize..), limit),
            });
        }

        Ok(TransportResponse {
            status: 200,
            range_start: None,
            total_length: Some(len),
            body: self.body(data, limit),
        })
    }
}

/// Writes video bytes followed by audio bytes, so output is a pure function of inputs
#[derive(Default)]
pub struct ConcatProcessor {
    pub calls: AtomicUsize,
}

#[async_trait]
impl MediaProcessor for ConcatProcessor {
    async fn mux_streams(&self, audio: &Path, video: &Path, output: &Path) -> DownloadResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut merged = tokio::fs::read(video)
            .await
            .map_err(|e| errors::mux(MuxFailure::IoError, e.to_string()))?;
        let audio = tokio::fs::read(audio)
            .await
            .map_err(|e| errors::mux(MuxFailure::IoError, e.to_string()))?;
        merged.extend_from_slice(&audio);
        tokio::fs::write(output, merged)
            .await
            .map_err(|e| errors::mux(MuxFailure::IoError, e.to_string()))
    }
}

pub struct FailingProcessor(pub MuxFailure);

#[async_trait]
impl MediaProcessor for FailingProcessor {
    async fn mux_streams(&self, _audio: &Path, _video: &Path, output: &Path) -> DownloadResult<()> {
        // 留下半成品，验证调用方会清理
        let _ = tokio::fs::write(output, b"partial").await;
        Err(errors::mux(self.0, "simulated failure"))
    }
}

/// Serves the same markup for every URL
pub struct StaticPageSource {
    pub html: String,
    pub loads: AtomicUsize,
}

impl StaticPageSource {
    pub fn new(html: impl Into<String>) -> Self {
        Self {
            html: html.into(),
            loads: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl PageSource for StaticPageSource {
    async fn load(&self, url: &str, _timeout: Duration) -> DownloadResult<PageSnapshot> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(PageSnapshot::new(url, self.html.clone()))
    }
}

/// Fails with `PageUnreachable` a fixed number of times, then serves markup
pub struct FlakyPageSource {
    pub failures_left: AtomicUsize,
    pub html: String,
}

#[async_trait]
impl PageSource for FlakyPageSource {
    async fn load(&self, url: &str, _timeout: Duration) -> DownloadResult<PageSnapshot> {
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(errors::extraction(
                ExtractionFailure::PageUnreachable,
                "connection refused",
            ));
        }
        Ok(PageSnapshot::new(url, self.html.clone()))
    }
}

/// Extractor for `*.video.test` pages that returns canned manifests keyed by URL
pub struct FixtureExtractor {
    manifests: Mutex<HashMap<String, (String, Vec<StreamDescriptor>)>>,
}

impl FixtureExtractor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            manifests: Mutex::new(HashMap::new()),
        })
    }

    pub fn add(&self, page_url: &str, title: &str, candidates: Vec<StreamDescriptor>) {
        self.manifests
            .lock()
            .unwrap()
            .insert(page_url.to_string(), (title.to_string(), candidates));
    }
}

impl Extractor for FixtureExtractor {
    fn name(&self) -> &'static str {
        "fixture"
    }

    fn parse(&self, page: &PageSnapshot) -> DownloadResult<MediaManifest> {
        let manifests = self.manifests.lock().unwrap();
        let (title, candidates) = manifests
            .get(&page.url)
            .cloned()
            .ok_or_else(|| errors::no_streams(format!("no fixture for {}", page.url)))?;
        Ok(MediaManifest::new(title, candidates, page.url.clone()))
    }
}
