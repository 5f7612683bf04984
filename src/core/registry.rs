//! URL to extractor resolution

use regex::Regex;
use std::sync::Arc;
use url::Url;

use crate::core::error_handling::{DownloadError, DownloadResult};
use crate::core::extractors::{
    BaiduBaikeExtractor, BilibiliExtractor, Extractor, Kan360Extractor, PinshanExtractor,
    SohuExtractor,
};

/// Host suffix plus an optional path pattern
#[derive(Debug, Clone)]
pub struct HostPattern {
    domain: String,
    path: Option<Regex>,
}

impl HostPattern {
    /// Matches `domain` and any of its subdomains
    pub fn domain(domain: &str) -> Self {
        Self {
            domain: domain.trim_start_matches('.').to_ascii_lowercase(),
            path: None,
        }
    }

    pub fn with_path(mut self, pattern: Regex) -> Self {
        self.path = Some(pattern);
        self
    }

    pub fn matches(&self, url: &Url) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        let host = host.to_ascii_lowercase();
        let host_ok = host == self.domain || host.ends_with(&format!(".{}", self.domain));
        host_ok
            && self
                .path
                .as_ref()
                .map_or(true, |re| re.is_match(url.path()))
    }
}

/// Ordered list of (pattern, extractor); the first match wins.
/// Read-only once built and shared behind an `Arc`.
#[derive(Default)]
pub struct ExtractorRegistry {
    entries: Vec<(HostPattern, Arc<dyn Extractor>)>,
}

impl ExtractorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The supported sites, most specific patterns first
    pub fn with_default_sites() -> Self {
        let mut registry = Self::new();
        if let Ok(video_path) = Regex::new(r"^/(?:video|bangumi/play)/") {
            registry.register(
                HostPattern::domain("bilibili.com").with_path(video_path),
                Arc::new(BilibiliExtractor),
            );
        }
        registry.register(
            HostPattern::domain("baike.baidu.com"),
            Arc::new(BaiduBaikeExtractor),
        );
        registry.register(HostPattern::domain("pinshan.com"), Arc::new(PinshanExtractor));
        registry.register(HostPattern::domain("sohu.com"), Arc::new(SohuExtractor));
        registry.register(HostPattern::domain("360kan.com"), Arc::new(Kan360Extractor));
        registry
    }

    pub fn register(&mut self, pattern: HostPattern, extractor: Arc<dyn Extractor>) {
        self.entries.push((pattern, extractor));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn resolve(&self, raw_url: &str) -> DownloadResult<Arc<dyn Extractor>> {
        let not_supported = || DownloadError::NotSupported {
            url: raw_url.to_string(),
        };
        let url = Url::parse(raw_url.trim()).map_err(|_| not_supported())?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(not_supported());
        }
        self.entries
            .iter()
            .find(|(pattern, _)| pattern.matches(&url))
            .map(|(_, extractor)| extractor.clone())
            .ok_or_else(not_supported)
    }
}
