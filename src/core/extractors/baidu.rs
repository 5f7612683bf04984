//! Baidu Baike video pages

use super::markup;
use super::{Extractor, PageSnapshot};
use crate::core::error_handling::{errors, DownloadResult};
use crate::core::models::MediaManifest;

const ERROR_PAGE_MARKER: &str = "你找的视频出错啦";
const VIDEO_INFO_API: &str = "https://baike.baidu.com/api/videoinfo";

pub struct BaiduBaikeExtractor;

fn api_url(page: &PageSnapshot) -> Option<String> {
    let data = markup::window_json(&page.html, "PAGE_DATA")?;
    let id = |key: &str| match data.get(key)? {
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    };
    Some(format!(
        "{}?secondId={}&lemmaId={}",
        VIDEO_INFO_API,
        id("secondId")?,
        id("lemmaId")?
    ))
}

impl Extractor for BaiduBaikeExtractor {
    fn name(&self) -> &'static str {
        "baidu-baike"
    }

    fn follow_up_urls(&self, page: &PageSnapshot) -> Vec<String> {
        api_url(page).into_iter().collect()
    }

    fn parse(&self, page: &PageSnapshot) -> DownloadResult<MediaManifest> {
        if page.html.contains(ERROR_PAGE_MARKER) {
            return Err(errors::no_streams("video was removed or never existed"));
        }

        let mut raw: Vec<String> = Vec::new();
        // 接口返回的地址最可靠，放在最前面
        for body in page.extras.values() {
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
                if let Some(url) = value.pointer("/data/videoUrl").and_then(|v| v.as_str()) {
                    raw.push(url.to_string());
                }
            }
        }
        raw.extend(markup::video_tag_sources(&page.html));
        raw.extend(markup::script_assignments(&page.html, "videoUrl"));
        raw.extend(markup::bare_media_urls(&page.html));

        let candidates = markup::muxed_candidates(&page.url, raw);
        if candidates.is_empty() {
            return Err(errors::no_streams("no video source on the page"));
        }

        let title = markup::page_title(&page.html)
            .map(|t| t.trim_end_matches("_百度百科").trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| "baidu_video".to_string());
        Ok(MediaManifest::new(title, candidates, page.url.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error_handling::{DownloadError, ExtractionFailure};

    const PAGE: &str = "https://baike.baidu.com/item/熊猫/34935";

    #[test]
    fn test_follow_up_from_page_data() {
        let page = PageSnapshot::new(
            PAGE,
            r#"<script>window.PAGE_DATA = {"lemmaId": 34935, "secondId": "8a1b"};</script>"#,
        );
        assert_eq!(
            BaiduBaikeExtractor.follow_up_urls(&page),
            vec!["https://baike.baidu.com/api/videoinfo?secondId=8a1b&lemmaId=34935".to_string()]
        );
        assert!(BaiduBaikeExtractor
            .follow_up_urls(&PageSnapshot::new(PAGE, "<html></html>"))
            .is_empty());
    }

    #[test]
    fn test_api_result_comes_first() {
        let page = PageSnapshot::new(
            PAGE,
            r#"<title>大熊猫_百度百科</title><video src="https://bkimg.test/page.mp4"></video>"#,
        )
        .with_extra(
            "https://baike.baidu.com/api/videoinfo?secondId=1&lemmaId=2",
            r#"{"errno":0,"data":{"videoUrl":"https://baikevideo.test/api.mp4"}}"#,
        );
        let manifest = BaiduBaikeExtractor.parse(&page).unwrap();
        assert_eq!(manifest.title, "大熊猫");
        let urls: Vec<&str> = manifest.candidates.iter().map(|c| c.url.as_str()).collect();
        assert_eq!(urls, vec!["https://baikevideo.test/api.mp4", "https://bkimg.test/page.mp4"]);
    }

    #[test]
    fn test_error_page() {
        let page = PageSnapshot::new(PAGE, "<div>你找的视频出错啦</div>");
        assert!(matches!(
            BaiduBaikeExtractor.parse(&page),
            Err(DownloadError::Extraction { reason: ExtractionFailure::NoStreamsFound, .. })
        ));
    }

    #[test]
    fn test_script_sources() {
        let page = PageSnapshot::new(
            PAGE,
            r#"<script>var player = {videoUrl: "https:\/\/baikevideo.test\/s_720p.mp4"};</script>"#,
        );
        let manifest = BaiduBaikeExtractor.parse(&page).unwrap();
        assert_eq!(manifest.title, "baidu_video");
        assert_eq!(manifest.candidates[0].quality, 720);
        assert_eq!(manifest.candidates.len(), 1);
    }
}
