//! HTTP access used by the fetcher and by candidate probing

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::{Client, StatusCode};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::core::error_handling::{errors, DownloadError, DownloadResult, FetchFailure};

pub type ByteStream = BoxStream<'static, DownloadResult<Bytes>>;

/// What a HEAD-style probe learned about a resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeInfo {
    pub content_length: Option<u64>,
    pub accepts_ranges: bool,
}

/// An opened body. Status interpretation is left to the caller.
pub struct TransportResponse {
    pub status: u16,
    /// First byte offset of the body when the source answered a range
    pub range_start: Option<u64>,
    /// Full size of the resource if the source said so
    pub total_length: Option<u64>,
    pub body: ByteStream,
}

impl std::fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportResponse")
            .field("status", &self.status)
            .field("range_start", &self.range_start)
            .field("total_length", &self.total_length)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Check the resource is reachable and learn its size and range support
    async fn probe(&self, url: &str, headers: &BTreeMap<String, String>)
        -> DownloadResult<ProbeInfo>;

    /// Open the body starting at `offset` (a `Range` request when non-zero)
    async fn open(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
        offset: u64,
    ) -> DownloadResult<TransportResponse>;
}

/// Production transport on top of reqwest
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(user_agent: &str, connect_timeout: Duration) -> DownloadResult<Self> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| DownloadError::Configuration(format!("HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    fn header_map(headers: &BTreeMap<String, String>) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    map.insert(name, value);
                }
                _ => tracing::warn!("Skipping malformed request header {}", name),
            }
        }
        map
    }
}

pub(crate) fn map_reqwest_error(err: reqwest::Error) -> DownloadError {
    if err.is_timeout() {
        errors::fetch(FetchFailure::Timeout, err.to_string())
    } else {
        errors::fetch(FetchFailure::Network, err.to_string())
    }
}

/// Parse `bytes <start>-<end>/<total>`
pub(crate) fn parse_content_range(value: &str) -> Option<(u64, Option<u64>)> {
    let spec = value.trim().strip_prefix("bytes")?.trim();
    let (range, total) = spec.split_once('/')?;
    let start = range.split_once('-')?.0.trim().parse().ok()?;
    let total = total.trim().parse().ok();
    Some((start, total))
}

fn header_u64(headers: &HeaderMap, name: HeaderName) -> Option<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn probe(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
    ) -> DownloadResult<ProbeInfo> {
        let header_map = Self::header_map(headers);

        // 先用HEAD检测，部分CDN不支持HEAD时退回到 0-0 的范围请求
        let head = self
            .client
            .head(url)
            .headers(header_map.clone())
            .send()
            .await
            .map_err(map_reqwest_error)?;

        if head.status().is_success() {
            let accepts_ranges = head
                .headers()
                .get("accept-ranges")
                .and_then(|v| v.to_str().ok())
                .map(|v| v.to_lowercase().contains("bytes"))
                .unwrap_or(false);
            return Ok(ProbeInfo {
                content_length: header_u64(head.headers(), CONTENT_LENGTH),
                accepts_ranges,
            });
        }

        tracing::debug!(
            "HEAD {} answered {}, retrying probe with a ranged GET",
            url,
            head.status()
        );

        let response = self
            .client
            .get(url)
            .headers(header_map)
            .header(RANGE, "bytes=0-0")
            .send()
            .await
            .map_err(map_reqwest_error)?;

        match response.status() {
            StatusCode::PARTIAL_CONTENT => {
                let total = response
                    .headers()
                    .get(CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_content_range)
                    .and_then(|(_, total)| total);
                Ok(ProbeInfo {
                    content_length: total,
                    accepts_ranges: true,
                })
            }
            status if status.is_success() => Ok(ProbeInfo {
                content_length: header_u64(response.headers(), CONTENT_LENGTH),
                accepts_ranges: false,
            }),
            status => Err(errors::fetch_status(status.as_u16(), url)),
        }
    }

    async fn open(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
        offset: u64,
    ) -> DownloadResult<TransportResponse> {
        let mut request = self.client.get(url).headers(Self::header_map(headers));
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={}-", offset));
        }

        let response = request.send().await.map_err(map_reqwest_error)?;
        let status = response.status().as_u16();

        let (range_start, total_length) = if status == 206 {
            response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range)
                .map(|(start, total)| (Some(start), total))
                .unwrap_or((None, None))
        } else if response.status().is_success() {
            (None, response.content_length())
        } else {
            (None, None)
        };

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(map_reqwest_error))
            .boxed();

        Ok(TransportResponse {
            status,
            range_start,
            total_length,
            body,
        })
    }
}
