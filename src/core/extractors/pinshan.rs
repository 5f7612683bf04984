//! pinshan.com video pages

use super::markup;
use super::{Extractor, PageSnapshot};
use crate::core::error_handling::{errors, DownloadResult};
use crate::core::models::MediaManifest;

pub struct PinshanExtractor;

impl Extractor for PinshanExtractor {
    fn name(&self) -> &'static str {
        "pinshan"
    }

    fn parse(&self, page: &PageSnapshot) -> DownloadResult<MediaManifest> {
        let mut raw = markup::video_tag_sources(&page.html);
        for key in ["src", "url", "file"] {
            raw.extend(markup::script_assignments(&page.html, key));
        }
        raw.extend(markup::bare_media_urls(&page.html));

        // muxed_candidates drops anything that is not a direct media file
        let candidates = markup::muxed_candidates(&page.url, raw);
        if candidates.is_empty() {
            return Err(errors::no_streams("no video source on the page"));
        }

        let title = markup::page_title(&page.html).unwrap_or_else(|| "pinshan_video".to_string());
        Ok(MediaManifest::new(title, candidates, page.url.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::StreamKind;

    #[test]
    fn test_collects_all_sources() {
        let page = PageSnapshot::new(
            "https://www.pinshan.com/video/88.html",
            r#"<html><head><title>品善 讲堂</title></head><body>
            <video><source src="/upload/v/88_480p.mp4"></video>
            <script>
              var conf = { url: 'https://cdn.pinshan.test/88_720p.mp4', cover: '/img/88.jpg', src: '/js/player.js' };
              var live = "https://cdn.pinshan.test/88.m3u8";
            </script></body></html>"#,
        );
        let manifest = PinshanExtractor.parse(&page).unwrap();
        assert_eq!(manifest.title, "品善 讲堂");
        let urls: Vec<&str> = manifest.candidates.iter().map(|c| c.url.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "https://cdn.pinshan.test/88_720p.mp4",
                "https://www.pinshan.com/upload/v/88_480p.mp4"
            ]
        );
        assert!(manifest.candidates.iter().all(|c| c.kind == StreamKind::Muxed));
    }

    #[test]
    fn test_page_without_video() {
        let page = PageSnapshot::new("https://www.pinshan.com/about", "<title>关于</title>");
        assert!(PinshanExtractor.parse(&page).is_err());
    }
}
