//! 360kan. The player lives in a partner iframe (le.com), which is loaded as a follow-up.

use std::collections::HashSet;

use super::markup;
use super::{Extractor, PageSnapshot};
use crate::core::error_handling::{errors, DownloadResult};
use crate::core::models::MediaManifest;

const PLAYER_HOSTS: &[&str] = &["le.com", "letv.com"];

pub struct Kan360Extractor;

/// The `id` query parameter of a play page
pub fn video_id(page_url: &str) -> Option<String> {
    url::Url::parse(page_url)
        .ok()?
        .query_pairs()
        .find(|(k, _)| k == "id")
        .map(|(_, v)| v.into_owned())
        .filter(|v| !v.is_empty())
}

fn is_player_frame(url: &str) -> bool {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
        .map_or(false, |host| {
            PLAYER_HOSTS
                .iter()
                .any(|h| host == *h || host.ends_with(&format!(".{}", h)))
        })
}

impl Extractor for Kan360Extractor {
    fn name(&self) -> &'static str {
        "360kan"
    }

    fn needs_rendered_dom(&self) -> bool {
        true
    }

    fn follow_up_urls(&self, page: &PageSnapshot) -> Vec<String> {
        markup::iframe_sources(&page.html)
            .into_iter()
            .filter_map(|src| markup::absolutize(&page.url, &src))
            .filter(|src| is_player_frame(src))
            .collect()
    }

    fn parse(&self, page: &PageSnapshot) -> DownloadResult<MediaManifest> {
        let documents: Vec<(&str, &str)> = std::iter::once((page.url.as_str(), page.html.as_str()))
            .chain(page.extras.iter().map(|(u, b)| (u.as_str(), b.as_str())))
            .collect();

        let mut candidates = Vec::new();
        for (base, body) in &documents {
            candidates.extend(markup::muxed_candidates(base, markup::video_tag_sources(body)));
        }
        if candidates.is_empty() {
            for (base, body) in &documents {
                candidates.extend(markup::muxed_candidates(base, markup::bare_media_urls(body)));
            }
        }
        let mut seen = HashSet::new();
        candidates.retain(|c| seen.insert(c.url.clone()));
        if candidates.is_empty() {
            return Err(errors::no_streams("no playable video in page or player frame"));
        }

        let title = markup::page_title(&page.html)
            .map(|t| t.split(" - 360").next().map(str::trim).unwrap_or("").to_string())
            .filter(|t| !t.is_empty())
            .or_else(|| video_id(&page.url).map(|id| format!("360kan_{}", id)))
            .unwrap_or_else(|| "360kan_video".to_string());
        Ok(MediaManifest::new(title, candidates, page.url.clone()))
    }
}
