//! Sohu TV. The player is built in script, so the page is parsed after rendering.

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use regex::Regex;
use std::sync::OnceLock;

use super::markup;
use super::{Extractor, PageSnapshot};
use crate::core::error_handling::{errors, DownloadResult};
use crate::core::models::MediaManifest;

pub struct SohuExtractor;

/// Share links look like `/v/<base64 of the original .shtml url>.html`
pub fn video_id(page_url: &str) -> Option<String> {
    let parsed = url::Url::parse(page_url).ok()?;
    let segment = parsed.path_segments()?.last()?;
    let encoded = segment.strip_suffix(".html")?;

    let decoded = [STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD]
        .iter()
        .find_map(|engine| engine.decode(encoded).ok())?;
    let original = String::from_utf8(decoded).ok()?;

    static RE: OnceLock<Regex> = OnceLock::new();
    markup::cached(&RE, r"/(\d+)\.shtml")
        .captures(&original)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

impl Extractor for SohuExtractor {
    fn name(&self) -> &'static str {
        "sohu"
    }

    fn needs_rendered_dom(&self) -> bool {
        true
    }

    fn parse(&self, page: &PageSnapshot) -> DownloadResult<MediaManifest> {
        let mut raw = markup::video_tag_sources(&page.html);
        if raw.is_empty() {
            raw = markup::bare_media_urls(&page.html);
        }
        let candidates = markup::muxed_candidates(&page.url, raw);
        if candidates.is_empty() {
            return Err(errors::no_streams("rendered page has no playable video"));
        }

        let title = markup::page_title(&page.html)
            .map(|t| t.split(" - 搜狐视频").next().map(str::trim).unwrap_or("").to_string())
            .filter(|t| !t.is_empty())
            .or_else(|| video_id(&page.url).map(|id| format!("sohu_{}", id)))
            .unwrap_or_else(|| "sohu_video".to_string());
        Ok(MediaManifest::new(title, candidates, page.url.clone()))
    }
}
