//! Site extractors and the page loading they depend on
//!
//! An [`Extractor`] is pure: it receives an already loaded [`PageSnapshot`]
//! and returns a [`MediaManifest`]. Loading is done by [`ExtractionService`],
//! either with a plain HTTP GET or, for sites that assemble their player in
//! script, through a [`DomRenderer`].

pub mod baidu;
pub mod bilibili;
pub mod kan360;
pub mod markup;
pub mod pinshan;
pub mod sohu;

use async_trait::async_trait;
use reqwest::Client;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::core::config::{AppConfig, RenderingConfig};
use crate::core::error_handling::{
    errors, DownloadError, DownloadResult, ExtractionFailure, RetryPolicy,
};
use crate::core::models::MediaManifest;
use crate::core::registry::ExtractorRegistry;

pub use baidu::BaiduBaikeExtractor;
pub use bilibili::BilibiliExtractor;
pub use kan360::Kan360Extractor;
pub use pinshan::PinshanExtractor;
pub use sohu::SohuExtractor;

/// Loaded page content handed to an extractor
#[derive(Debug, Clone, PartialEq)]
pub struct PageSnapshot {
    pub url: String,
    pub html: String,
    /// Follow-up documents requested by the extractor, keyed by URL
    pub extras: BTreeMap<String, String>,
}

impl PageSnapshot {
    pub fn new(url: impl Into<String>, html: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            html: html.into(),
            extras: BTreeMap::new(),
        }
    }

    pub fn with_extra(mut self, url: impl Into<String>, body: impl Into<String>) -> Self {
        self.extras.insert(url.into(), body.into());
        self
    }
}

pub trait Extractor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the page must be rendered by a browser before parsing
    fn needs_rendered_dom(&self) -> bool {
        false
    }

    /// Extra documents (APIs, embedded frames) worth loading after the page
    fn follow_up_urls(&self, _page: &PageSnapshot) -> Vec<String> {
        Vec::new()
    }

    fn parse(&self, page: &PageSnapshot) -> DownloadResult<MediaManifest>;
}

/// Plain page loading
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn load(&self, url: &str, timeout: Duration) -> DownloadResult<PageSnapshot>;
}

/// Browser-backed page loading; returns the serialized DOM after scripts ran
#[async_trait]
pub trait DomRenderer: Send + Sync {
    async fn render(&self, url: &str, timeout: Duration) -> DownloadResult<String>;
}

pub struct HttpPageSource {
    client: Client,
}

impl HttpPageSource {
    pub fn new(user_agent: &str) -> DownloadResult<Self> {
        let client = Client::builder()
            .user_agent(user_agent)
            .build()
            .map_err(|e| DownloadError::Configuration(format!("HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

fn unreachable(message: impl Into<String>) -> DownloadError {
    errors::extraction(ExtractionFailure::PageUnreachable, message)
}

#[async_trait]
impl PageSource for HttpPageSource {
    async fn load(&self, url: &str, timeout: Duration) -> DownloadResult<PageSnapshot> {
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| unreachable(format!("{}: {}", url, e)))?;

        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(errors::extraction(
                ExtractionFailure::AuthRequired,
                format!("{} answered {}", url, status),
            ));
        }
        if !status.is_success() {
            return Err(unreachable(format!("{} answered {}", url, status)));
        }

        let final_url = response.url().to_string();
        let html = response
            .text()
            .await
            .map_err(|e| unreachable(format!("reading {}: {}", url, e)))?;
        if final_url != url {
            debug!("{} redirected to {}", url, final_url);
        }
        Ok(PageSnapshot::new(url, html))
    }
}

/// Runs a Chromium-compatible binary with `--dump-dom`
pub struct HeadlessBrowserRenderer {
    binary: PathBuf,
    /// Upper bound for one browser run, whatever the page budget
    max_runtime: Duration,
}

impl HeadlessBrowserRenderer {
    pub fn new(binary: impl Into<PathBuf>, max_runtime: Duration) -> Self {
        Self {
            binary: binary.into(),
            max_runtime,
        }
    }

    pub fn from_config(config: &RenderingConfig) -> Option<Self> {
        config
            .browser_binary
            .as_ref()
            .map(|binary| Self::new(binary, config.timeout()))
    }
}

/// No usable browser: retrying cannot help until the setup changes
fn renderer_unavailable(message: impl Into<String>) -> DownloadError {
    DownloadError::Configuration(message.into())
}

#[async_trait]
impl DomRenderer for HeadlessBrowserRenderer {
    async fn render(&self, url: &str, timeout: Duration) -> DownloadResult<String> {
        let timeout = timeout.min(self.max_runtime);
        let child = Command::new(&self.binary)
            .args([
                "--headless",
                "--disable-gpu",
                "--no-sandbox",
                "--mute-audio",
                "--dump-dom",
                url,
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                renderer_unavailable(format!("renderer {:?} unavailable: {}", self.binary, e))
            })?;

        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| unreachable(format!("rendering {} exceeded {:?}", url, timeout)))?
            .map_err(|e| unreachable(format!("renderer failed: {}", e)))?;

        if !output.status.success() {
            return Err(unreachable(format!(
                "renderer exited with {} for {}",
                output.status, url
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Resolve, load and parse: URL in, manifest out
#[derive(Clone)]
pub struct ExtractionService {
    registry: Arc<ExtractorRegistry>,
    pages: Arc<dyn PageSource>,
    renderer: Option<Arc<dyn DomRenderer>>,
    retry: RetryPolicy,
}

impl ExtractionService {
    pub fn new(
        registry: Arc<ExtractorRegistry>,
        pages: Arc<dyn PageSource>,
        renderer: Option<Arc<dyn DomRenderer>>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            registry,
            pages,
            renderer,
            retry,
        }
    }

    /// Default site set, reqwest page loading and the configured browser, if any
    pub fn from_config(config: &AppConfig) -> DownloadResult<Self> {
        let pages = Arc::new(HttpPageSource::new(&config.download.user_agent)?);
        let renderer = HeadlessBrowserRenderer::from_config(&config.rendering)
            .map(|r| Arc::new(r) as Arc<dyn DomRenderer>);
        Ok(Self::new(
            Arc::new(ExtractorRegistry::with_default_sites()),
            pages,
            renderer,
            config.extraction.retry_policy(),
        ))
    }

    pub fn registry(&self) -> &ExtractorRegistry {
        &self.registry
    }

    /// Check a URL is supported without touching the network
    pub fn resolve(&self, url: &str) -> DownloadResult<Arc<dyn Extractor>> {
        self.registry.resolve(url)
    }

    pub async fn extract(&self, url: &str, timeout: Duration) -> DownloadResult<MediaManifest> {
        let extractor = self.registry.resolve(url)?;
        info!("🔍 Extracting {} with {}", url, extractor.name());

        let manifest = self
            .retry
            .run(&format!("extract {}", url), |_| {
                let extractor = extractor.clone();
                async move {
                    let page = self.load_with_follow_ups(extractor.as_ref(), url, timeout).await?;
                    extractor.parse(&page)
                }
            })
            .await?;

        if manifest.candidates.is_empty() {
            return Err(errors::no_streams(format!("{} advertises no streams", url)));
        }
        debug!(
            "{} produced {} candidate(s) for \"{}\"",
            extractor.name(),
            manifest.candidates.len(),
            manifest.title
        );
        Ok(manifest)
    }

    async fn load(
        &self,
        extractor: &dyn Extractor,
        url: &str,
        timeout: Duration,
    ) -> DownloadResult<PageSnapshot> {
        if extractor.needs_rendered_dom() {
            let renderer = self.renderer.as_ref().ok_or_else(|| {
                renderer_unavailable(format!(
                    "{} pages need a rendered DOM but no browser is configured",
                    extractor.name()
                ))
            })?;
            let html = renderer.render(url, timeout).await?;
            Ok(PageSnapshot::new(url, html))
        } else {
            self.pages.load(url, timeout).await
        }
    }

    async fn load_with_follow_ups(
        &self,
        extractor: &dyn Extractor,
        url: &str,
        timeout: Duration,
    ) -> DownloadResult<PageSnapshot> {
        let mut page = self.load(extractor, url, timeout).await?;
        for extra_url in extractor.follow_up_urls(&page) {
            // 附加文档只是补充来源，失败不影响主页面解析
            match self.pages.load(&extra_url, timeout).await {
                Ok(extra) => {
                    page.extras.insert(extra_url, extra.html);
                }
                Err(e) => warn!("Follow-up {} for {} failed: {}", extra_url, url, e),
            }
        }
        Ok(page)
    }
}
