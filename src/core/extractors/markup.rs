//! Markup scanning shared by the site extractors

use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

use crate::core::models::{StreamDescriptor, StreamKind};

/// Containers a bare URL scan accepts. HLS playlists are not fetchable streams.
pub const DIRECT_MEDIA_EXTENSIONS: &[&str] = &["mp4", "flv", "m4v", "webm", "mov"];

pub(super) fn cached(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("hard-coded pattern must compile"))
}

/// `<title>` text with whitespace collapsed and common entities decoded
pub fn page_title(html: &str) -> Option<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = cached(&RE, r"(?is)<title[^>]*>(.*?)</title>");
    re.captures(html)
        .and_then(|c| c.get(1))
        .map(|m| {
            decode_entities(m.as_str())
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ")
        })
        .filter(|t| !t.is_empty())
}

/// `src` attributes of `<video>` and `<source>` tags, in document order
pub fn video_tag_sources(html: &str) -> Vec<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = cached(
        &RE,
        r#"(?is)<(?:video|source)\b[^>]*?\ssrc\s*=\s*["']([^"']+)["']"#,
    );
    re.captures_iter(html)
        .filter_map(|c| c.get(1))
        .map(|m| decode_entities(m.as_str()))
        .collect()
}

/// `src` attributes of `<iframe>` tags
pub fn iframe_sources(html: &str) -> Vec<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = cached(&RE, r#"(?is)<iframe\b[^>]*?\ssrc\s*=\s*["']([^"']+)["']"#);
    re.captures_iter(html)
        .filter_map(|c| c.get(1))
        .map(|m| decode_entities(m.as_str()))
        .collect()
}

/// Absolute media URLs anywhere in the text (scripts, JSON blobs, attributes)
pub fn bare_media_urls(text: &str) -> Vec<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = cached(
        &RE,
        r#"(?i)https?://[^\s"'<>\\]+?\.(?:mp4|flv|m4v|webm|mov)(?:\?[^\s"'<>\\]*)?"#,
    );
    let unescaped = text.replace("\\/", "/");
    re.find_iter(&unescaped)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Values assigned to `key` in inline script, e.g. `videoUrl: "..."` or `"src":"..."`
pub fn script_assignments(text: &str, key: &str) -> Vec<String> {
    let pattern = format!(
        r#"(?i)["']?\b{}["']?\s*[:=]\s*["']([^"']+)["']"#,
        regex::escape(key)
    );
    let Ok(re) = Regex::new(&pattern) else {
        return Vec::new();
    };
    let unescaped = text.replace("\\/", "/");
    re.captures_iter(&unescaped)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Extract the object literal assigned to `window.<name>` and parse it as JSON
pub fn window_json(html: &str, name: &str) -> Option<serde_json::Value> {
    let marker = format!("window.{}", name);
    let start = html.find(&marker)?;
    let rest = &html[start + marker.len()..];
    let eq = rest.find('=')?;
    let body = rest[eq + 1..].trim_start();
    let object = balanced_object(body)?;
    serde_json::from_str(object).ok()
}

/// Longest prefix of `text` that is a brace-balanced `{...}`, honoring strings
fn balanced_object(text: &str) -> Option<&str> {
    if !text.starts_with('{') {
        return None;
    }
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, ch) in text.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

pub fn decode_entities(raw: &str) -> String {
    raw.replace("&amp;", "&")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&nbsp;", " ")
        .trim()
        .to_string()
}

/// Resolve `candidate` against the page; only http(s) results are kept
pub fn absolutize(page_url: &str, candidate: &str) -> Option<String> {
    let candidate = candidate.trim();
    if candidate.is_empty() || candidate.starts_with("blob:") || candidate.starts_with("data:") {
        return None;
    }
    let base = url::Url::parse(page_url).ok()?;
    let joined = base.join(candidate).ok()?;
    matches!(joined.scheme(), "http" | "https").then(|| joined.to_string())
}

/// Lower-cased extension of the URL path, if any
pub fn extension_of(raw: &str) -> Option<String> {
    let path = match url::Url::parse(raw) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => raw.split(['?', '#']).next().unwrap_or(raw).to_string(),
    };
    let file = path.rsplit('/').next()?;
    let (_, ext) = file.rsplit_once('.')?;
    Some(ext.to_ascii_lowercase())
}

/// Picture height hinted by the URL (`..._720p.mp4`), 0 when absent
pub fn quality_hint(raw: &str) -> u32 {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = cached(&RE, r"(?:^|[^0-9])(\d{3,4})[pP](?:[^0-9a-zA-Z]|$)");
    re.captures(raw)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0)
}

/// Turn raw URLs into muxed candidates: absolutized, deduplicated, HLS dropped
pub fn muxed_candidates<I, S>(page_url: &str, raw_urls: I) -> Vec<StreamDescriptor>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for raw in raw_urls {
        let Some(url) = absolutize(page_url, raw.as_ref()) else {
            continue;
        };
        let ext = extension_of(&url);
        match ext.as_deref() {
            Some(e) if DIRECT_MEDIA_EXTENSIONS.contains(&e) => {}
            Some("m3u8") => continue,
            // 无扩展名的直链（例如 CDN 签名地址）也保留
            None => {}
            Some(_) => continue,
        }
        if !seen.insert(url.clone()) {
            continue;
        }
        let quality = quality_hint(&url);
        let container = ext.unwrap_or_else(|| "mp4".to_string());
        let label = if quality > 0 {
            format!("{}p", quality)
        } else {
            container.clone()
        };
        out.push(
            StreamDescriptor::new(StreamKind::Muxed, url, quality)
                .with_label(label)
                .with_container(container),
        );
    }
    out
}
