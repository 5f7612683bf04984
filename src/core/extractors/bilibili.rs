//! bilibili video pages: the player config is embedded as `window.__playinfo__`

use serde::Deserialize;
use tracing::warn;

use super::markup;
use super::{Extractor, PageSnapshot};
use crate::core::error_handling::{errors, DownloadResult, ExtractionFailure};
use crate::core::models::{MediaManifest, StreamDescriptor, StreamKind};

const REFERER: &str = "https://www.bilibili.com/";
const TITLE_SUFFIX: &str = "_哔哩哔哩_bilibili";

pub struct BilibiliExtractor;

#[derive(Debug, Deserialize)]
struct PlayInfo {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
    data: Option<PlayData>,
}

#[derive(Debug, Deserialize)]
struct PlayData {
    #[serde(default)]
    quality: u32,
    dash: Option<Dash>,
    #[serde(default)]
    durl: Vec<Durl>,
}

#[derive(Debug, Deserialize)]
struct Dash {
    #[serde(default)]
    video: Vec<DashStream>,
    #[serde(default)]
    audio: Option<Vec<DashStream>>,
}

#[derive(Debug, Deserialize)]
struct DashStream {
    #[serde(alias = "base_url", rename = "baseUrl")]
    base_url: String,
    #[serde(default)]
    bandwidth: u64,
    #[serde(default)]
    height: u32,
    #[serde(default)]
    codecs: String,
}

#[derive(Debug, Deserialize)]
struct Durl {
    url: String,
    #[serde(default)]
    size: Option<u64>,
}

/// bilibili quality codes (`qn`) to picture height
fn height_for_qn(qn: u32) -> u32 {
    match qn {
        127 => 4320,
        120 | 125 | 126 => 2160,
        116 | 112 | 80 => 1080,
        74 | 64 => 720,
        32 => 480,
        16 => 360,
        6 => 240,
        _ => 0,
    }
}

fn title_of(page: &PageSnapshot) -> Option<String> {
    markup::window_json(&page.html, "__INITIAL_STATE__")
        .and_then(|state| {
            state
                .pointer("/videoData/title")
                .and_then(|v| v.as_str())
                .map(str::to_string)
        })
        .or_else(|| {
            markup::page_title(&page.html)
                .map(|t| t.trim_end_matches(TITLE_SUFFIX).trim().to_string())
        })
        .filter(|t| !t.is_empty())
}

fn stream(kind: StreamKind, url: String, quality: u32, label: String) -> StreamDescriptor {
    StreamDescriptor::new(kind, url, quality)
        .with_label(label)
        .with_header("Referer", REFERER)
}

impl Extractor for BilibiliExtractor {
    fn name(&self) -> &'static str {
        "bilibili"
    }

    fn parse(&self, page: &PageSnapshot) -> DownloadResult<MediaManifest> {
        let raw = markup::window_json(&page.html, "__playinfo__")
            .ok_or_else(|| errors::markup_changed("window.__playinfo__ not found"))?;
        let info: PlayInfo = serde_json::from_value(raw)
            .map_err(|e| errors::markup_changed(format!("unexpected __playinfo__ shape: {}", e)))?;

        match info.code {
            0 => {}
            -101 => {
                return Err(errors::extraction(
                    ExtractionFailure::AuthRequired,
                    format!("login required: {}", info.message),
                ))
            }
            -404 | 62002 | 62004 => {
                return Err(errors::no_streams(format!(
                    "video unavailable ({}): {}",
                    info.code, info.message
                )))
            }
            code => {
                return Err(errors::markup_changed(format!(
                    "player returned code {}: {}",
                    code, info.message
                )))
            }
        }

        let data = info
            .data
            .ok_or_else(|| errors::markup_changed("__playinfo__ has no data"))?;

        let mut candidates = Vec::new();
        if let Some(dash) = data.dash {
            for v in dash.video {
                let label = if v.codecs.is_empty() {
                    format!("{}p", v.height)
                } else {
                    format!("{}p {}", v.height, v.codecs)
                };
                candidates.push(
                    stream(StreamKind::Video, v.base_url, v.height, label).with_container("m4s"),
                );
            }
            for a in dash.audio.unwrap_or_default() {
                let kbps = (a.bandwidth / 1000) as u32;
                candidates.push(
                    stream(StreamKind::Audio, a.base_url, kbps, format!("{}kbps", kbps))
                        .with_container("m4s"),
                );
            }
        }
        let height = height_for_qn(data.quality);
        if data.durl.len() > 1 {
            // 分段拼接不在支持范围内，只取第一段
            warn!(
                "{} is split into {} durl segments, only the first is downloaded",
                page.url,
                data.durl.len()
            );
        }
        if let Some(d) = data.durl.into_iter().next() {
            let container = markup::extension_of(&d.url).unwrap_or_else(|| "flv".to_string());
            candidates.push(
                stream(StreamKind::Muxed, d.url, height, format!("{}p", height))
                    .with_size_hint(d.size)
                    .with_container(container),
            );
        }

        if candidates.is_empty() {
            return Err(errors::no_streams("__playinfo__ lists no streams"));
        }

        let title = title_of(page).unwrap_or_else(|| "bilibili_video".to_string());
        Ok(MediaManifest::new(title, candidates, page.url.clone()))
    }
}
