//! URL and input validation utilities

use anyhow::{anyhow, Result};
use url::Url;

/// Parse a page URL; only http(s) with a host is accepted
pub fn validate_url(url: &str) -> Result<Url> {
    let parsed = Url::parse(url.trim()).map_err(|e| anyhow!("Invalid URL format: {}", e))?;
    match parsed.scheme() {
        "http" | "https" => {}
        other => return Err(anyhow!("Unsupported URL scheme: {}", other)),
    }
    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(anyhow!("URL has no host: {}", url));
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_url() {
        assert!(validate_url("https://www.bilibili.com/video/BV1xx").is_ok());
        assert!(validate_url("  http://tv.sohu.com/v/x.html ").is_ok());
        assert!(validate_url("ftp://example.com/a.mp4").is_err());
        assert!(validate_url("not a url").is_err());
        assert!(validate_url("file:///tmp/a.mp4").is_err());
    }
}
